//! Recovery and verification bookkeeping for the primary master.
//!
//! During `RECOVERING` the primary collects last-id answers from every
//! identified storage to find the most advanced partition table and id
//! floor. During `VERIFYING` it collects unfinished-transaction reports and
//! decides, per pending commit, whether a majority of its replicas observed
//! the lock: those are finalized, the rest discarded.

use crate::types::{NodeId, Oid, Ptid, Tid};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct RecoveryManager {
    /// `AskLastIds` answers, per storage.
    last_ids: HashMap<NodeId, (Tid, Ptid, Oid)>,
    /// `AskUnfinishedTransactions` answers, per storage.
    unfinished: HashMap<NodeId, Vec<Tid>>,
    /// Storages still expected to answer in the current phase.
    waiting: HashSet<NodeId>,
}

impl RecoveryManager {
    pub fn new() -> RecoveryManager {
        RecoveryManager::default()
    }

    /// Start collecting a phase over the given storages.
    pub fn start(&mut self, storages: impl Iterator<Item = NodeId>) {
        self.last_ids.clear();
        self.unfinished.clear();
        self.waiting = storages.collect();
    }

    /// A storage joined mid-phase; expect an answer from it too.
    pub fn expect(&mut self, storage: NodeId) {
        self.waiting.insert(storage);
    }

    /// A storage left; stop waiting on it.
    pub fn forget(&mut self, storage: NodeId) {
        self.waiting.remove(&storage);
        self.last_ids.remove(&storage);
        self.unfinished.remove(&storage);
    }

    pub fn record_last_ids(&mut self, storage: NodeId, ltid: Tid, lptid: Ptid, loid: Oid) -> bool {
        self.last_ids.insert(storage, (ltid, lptid, loid));
        self.waiting.remove(&storage);
        self.waiting.is_empty()
    }

    pub fn record_unfinished(&mut self, storage: NodeId, tids: Vec<Tid>) -> bool {
        self.unfinished.insert(storage, tids);
        self.waiting.remove(&storage);
        self.waiting.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Whether at least one storage answered the current phase.
    pub fn has_answers(&self) -> bool {
        !self.last_ids.is_empty() || !self.unfinished.is_empty()
    }

    /// Highest ids observed across storages: `(ltid, loid)` floor for the
    /// allocators.
    pub fn id_floor(&self) -> (Tid, Oid) {
        let ltid = self
            .last_ids
            .values()
            .map(|(t, _, _)| *t)
            .max()
            .unwrap_or(Tid::ZERO);
        let loid = self
            .last_ids
            .values()
            .map(|(_, _, o)| *o)
            .max()
            .unwrap_or(Oid::ZERO);
        (ltid, loid)
    }

    /// Storage holding the most recent partition table, if any storage has
    /// one at all.
    pub fn most_advanced_table(&self) -> Option<(NodeId, Ptid)> {
        self.last_ids
            .iter()
            .map(|(node, (_, ptid, _))| (*node, *ptid))
            .max_by_key(|(_, ptid)| *ptid)
            .filter(|(_, ptid)| !ptid.is_zero())
    }

    /// Split pending transactions into those to finalize (a majority of the
    /// expected copies reported them) and those to discard. Each entry maps
    /// to the storages that reported the tid.
    pub fn verification_verdict(
        &self,
        expected_copies: u32,
    ) -> (Vec<(Tid, Vec<NodeId>)>, Vec<(Tid, Vec<NodeId>)>) {
        let mut by_tid: HashMap<Tid, Vec<NodeId>> = HashMap::new();
        for (node, tids) in &self.unfinished {
            for tid in tids {
                by_tid.entry(*tid).or_default().push(*node);
            }
        }
        let majority = (expected_copies / 2 + 1) as usize;
        let mut commit = Vec::new();
        let mut discard = Vec::new();
        for (tid, nodes) in by_tid {
            if nodes.len() >= majority {
                commit.push((tid, nodes));
            } else {
                discard.push((tid, nodes));
            }
        }
        commit.sort_by_key(|(tid, _)| *tid);
        discard.sort_by_key(|(tid, _)| *tid);
        (commit, discard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_drains_when_every_storage_answered() {
        let mut rm = RecoveryManager::new();
        let (s1, s2) = (NodeId::new(1), NodeId::new(2));
        rm.start([s1, s2].into_iter());
        assert!(!rm.record_last_ids(s1, Tid::new(9), Ptid::new(2), Oid::new(4)));
        assert!(rm.record_last_ids(s2, Tid::new(5), Ptid::new(3), Oid::new(7)));
        assert_eq!(rm.id_floor(), (Tid::new(9), Oid::new(7)));
        assert_eq!(rm.most_advanced_table(), Some((s2, Ptid::new(3))));
    }

    #[test]
    fn fresh_cluster_has_no_table_to_adopt() {
        let mut rm = RecoveryManager::new();
        let s1 = NodeId::new(1);
        rm.start([s1].into_iter());
        rm.record_last_ids(s1, Tid::ZERO, Ptid::ZERO, Oid::ZERO);
        assert_eq!(rm.most_advanced_table(), None);
    }

    #[test]
    fn majority_of_replicas_decides_verification() {
        let mut rm = RecoveryManager::new();
        let (s1, s2) = (NodeId::new(1), NodeId::new(2));
        rm.start([s1, s2].into_iter());
        let seen_by_both = Tid::new(10);
        let seen_by_one = Tid::new(11);
        rm.record_unfinished(s1, vec![seen_by_both, seen_by_one]);
        rm.record_unfinished(s2, vec![seen_by_both]);
        // Two expected copies per partition: majority is 2.
        let (commit, discard) = rm.verification_verdict(2);
        assert_eq!(commit.len(), 1);
        assert_eq!(commit[0].0, seen_by_both);
        assert_eq!(discard.len(), 1);
        assert_eq!(discard[0].0, seen_by_one);
    }
}
