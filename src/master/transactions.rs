//! Master-side transaction table.
//!
//! One entry per in-flight commit, created on `AskBeginTransaction` and
//! removed when every touched storage acknowledged its lock, or on abort.

use crate::net::MsgId;
use crate::types::{NodeId, Oid, Tid};
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct MasterTransaction {
    pub tid: Tid,
    /// Connection id of the initiating client.
    pub client_cid: u64,
    pub oids: Vec<Oid>,
    /// Storages sent a `LockInformation` for this commit.
    pub touched: HashSet<NodeId>,
    /// Subset of `touched` that answered `AnswerInformationLocked`.
    pub locked: HashSet<NodeId>,
    /// Message id of the client's `AskFinishTransaction`, answered once all
    /// locks are in.
    pub finish_msg_id: Option<MsgId>,
}

impl MasterTransaction {
    fn new(tid: Tid, client_cid: u64) -> MasterTransaction {
        MasterTransaction {
            tid,
            client_cid,
            oids: Vec::new(),
            touched: HashSet::new(),
            locked: HashSet::new(),
            finish_msg_id: None,
        }
    }

    pub fn fully_locked(&self) -> bool {
        self.finish_msg_id.is_some() && self.locked.is_superset(&self.touched)
    }
}

#[derive(Debug, Default)]
pub struct TransactionManager {
    txns: HashMap<Tid, MasterTransaction>,
}

impl TransactionManager {
    pub fn new() -> TransactionManager {
        TransactionManager::default()
    }

    pub fn begin(&mut self, tid: Tid, client_cid: u64) {
        self.txns.insert(tid, MasterTransaction::new(tid, client_cid));
    }

    pub fn get(&self, tid: Tid) -> Option<&MasterTransaction> {
        self.txns.get(&tid)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut MasterTransaction> {
        self.txns.get_mut(&tid)
    }

    /// Record the finish request: the commit's object set, the storages to
    /// lock, and where to send the final answer.
    pub fn start_finish(
        &mut self,
        tid: Tid,
        oids: Vec<Oid>,
        touched: HashSet<NodeId>,
        finish_msg_id: MsgId,
    ) -> bool {
        match self.txns.get_mut(&tid) {
            Some(txn) => {
                txn.oids = oids;
                txn.touched = touched;
                txn.finish_msg_id = Some(finish_msg_id);
                true
            }
            None => false,
        }
    }

    /// Record a lock acknowledgement. Returns true when the transaction
    /// became fully locked with this answer.
    pub fn lock(&mut self, tid: Tid, storage: NodeId) -> bool {
        match self.txns.get_mut(&tid) {
            Some(txn) => {
                txn.locked.insert(storage);
                txn.fully_locked()
            }
            None => false,
        }
    }

    pub fn remove(&mut self, tid: Tid) -> Option<MasterTransaction> {
        self.txns.remove(&tid)
    }

    pub fn pending_tids(&self) -> Vec<Tid> {
        self.txns.keys().copied().collect()
    }

    /// Transactions initiated over the given client connection.
    pub fn of_client(&self, client_cid: u64) -> Vec<Tid> {
        self.txns
            .values()
            .filter(|t| t.client_cid == client_cid)
            .map(|t| t.tid)
            .collect()
    }

    /// In-flight commits waiting on the given storage.
    pub fn touching(&self, storage: NodeId) -> Vec<Tid> {
        self.txns
            .values()
            .filter(|t| t.touched.contains(&storage) && !t.locked.contains(&storage))
            .map(|t| t.tid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_completes_when_all_touched_storages_lock() {
        let mut tm = TransactionManager::new();
        let tid = Tid::new(5);
        let (s1, s2) = (NodeId::new(1), NodeId::new(2));
        tm.begin(tid, 77);
        assert!(tm.start_finish(
            tid,
            vec![Oid::new(9)],
            [s1, s2].into_iter().collect(),
            3
        ));
        assert!(!tm.lock(tid, s1));
        assert!(tm.lock(tid, s2));
        let txn = tm.remove(tid).unwrap();
        assert_eq!(txn.client_cid, 77);
        assert_eq!(txn.finish_msg_id, Some(3));
    }

    #[test]
    fn lock_before_finish_does_not_complete() {
        let mut tm = TransactionManager::new();
        let tid = Tid::new(5);
        tm.begin(tid, 1);
        // A storage could answer before the client asked to finish only by
        // protocol violation, but the table must stay consistent.
        assert!(!tm.lock(tid, NodeId::new(1)));
    }

    #[test]
    fn client_index_tracks_owned_transactions() {
        let mut tm = TransactionManager::new();
        tm.begin(Tid::new(1), 10);
        tm.begin(Tid::new(2), 10);
        tm.begin(Tid::new(3), 11);
        let mut owned = tm.of_client(10);
        owned.sort();
        assert_eq!(owned, vec![Tid::new(1), Tid::new(2)]);
    }
}
