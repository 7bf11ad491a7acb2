//! Client-side MVCC cache with revision and invalidation indexing.
//!
//! Entries are keyed by `(oid, start_tid)` and carry the revision's end tid
//! once a later commit supersedes it. The revision index answers "which
//! cached serial satisfies this lookup" and the invalidated index records
//! commits seen only as invalidation broadcasts, which make a cached
//! "latest" unanswerable until storage is consulted again.

use crate::types::{Oid, Tid};
use std::collections::{HashMap, VecDeque};

/// Bound on cached revisions; FIFO eviction keeps memory flat.
const CACHE_CAPACITY: usize = 10_000;

/// Per-object serial bookkeeping beside the cache map.
#[derive(Debug, Default)]
pub struct RevisionIndex {
    /// Cached serials per object, highest first.
    by_oid: HashMap<Oid, Vec<Tid>>,
    /// Invalidating tids per object, lowest first.
    invalidated: HashMap<Oid, Vec<Tid>>,
}

impl RevisionIndex {
    pub fn clear(&mut self) {
        self.by_oid.clear();
        self.invalidated.clear();
    }

    pub fn add(&mut self, oid: Oid, tid: Tid) {
        let serials = self.by_oid.entry(oid).or_default();
        debug_assert!(!serials.contains(&tid), "duplicate revision insert");
        match serials.first() {
            Some(first) if tid < *first => {
                serials.insert(0, tid);
                serials.sort_unstable_by(|a, b| b.cmp(a));
            }
            _ => serials.insert(0, tid),
        }
        // Knowing the revision again clears its invalidation mark.
        if let Some(invalidated) = self.invalidated.get_mut(&oid) {
            invalidated.retain(|t| *t != tid);
            if invalidated.is_empty() {
                self.invalidated.remove(&oid);
            }
        }
    }

    pub fn remove(&mut self, oid: Oid, tid: Tid) {
        if let Some(serials) = self.by_oid.get_mut(&oid) {
            serials.retain(|t| *t != tid);
            if serials.is_empty() {
                self.by_oid.remove(&oid);
                self.invalidated.remove(&oid);
            }
        }
    }

    /// Record an invalidating commit. Tids arrive in increasing order per
    /// the primary's broadcast order.
    pub fn invalidate(&mut self, oids: &[Oid], tid: Tid) {
        for oid in oids {
            if !self.by_oid.contains_key(oid) {
                continue;
            }
            let list = self.invalidated.entry(*oid).or_default();
            debug_assert!(list.last().is_none_or(|last| *last < tid));
            list.push(tid);
        }
    }

    /// Highest cached serial strictly below `tid`, unless an invalidation
    /// in `(candidate, tid)` proves a revision is missing from cache.
    pub fn serial_before(&self, oid: Oid, tid: Tid) -> Option<Tid> {
        let serials = self.by_oid.get(&oid)?;
        let candidate = serials.iter().copied().find(|s| *s < tid)?;
        if let Some(invalidated) = self.invalidated.get(&oid) {
            for inv in invalidated {
                if *inv >= tid {
                    break;
                }
                if candidate < *inv {
                    // A commit happened between the candidate and the
                    // requested bound; cache cannot answer.
                    return None;
                }
            }
        }
        Some(candidate)
    }

    /// Highest cached serial, unless a later invalidation was recorded.
    pub fn latest_serial(&self, oid: Oid) -> Option<Tid> {
        let latest = *self.by_oid.get(&oid)?.first()?;
        if let Some(invalidated) = self.invalidated.get(&oid) {
            if let Some(last) = invalidated.last() {
                if latest < *last {
                    return None;
                }
            }
        }
        Some(latest)
    }

    pub fn serials(&self, oid: Oid) -> Vec<Tid> {
        self.by_oid.get(&oid).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Vec<u8>,
    next_tid: Option<Tid>,
}

/// The cache proper: bounded map plus the indexes.
#[derive(Debug, Default)]
pub struct MvccCache {
    entries: HashMap<(Oid, Tid), CacheEntry>,
    order: VecDeque<(Oid, Tid)>,
    index: RevisionIndex,
}

impl MvccCache {
    pub fn new() -> MvccCache {
        MvccCache::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.index.clear();
    }

    pub fn insert(&mut self, oid: Oid, tid: Tid, data: Vec<u8>, next_tid: Option<Tid>) {
        if let Some(entry) = self.entries.get_mut(&(oid, tid)) {
            entry.data = data;
            entry.next_tid = next_tid;
            return;
        }
        if self.entries.len() >= CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
                self.index.remove(evicted.0, evicted.1);
            }
        }
        self.entries.insert((oid, tid), CacheEntry { data, next_tid });
        self.order.push_back((oid, tid));
        self.index.add(oid, tid);
    }

    /// Patch a cached revision's end tid when a commit supersedes it.
    pub fn set_next_tid(&mut self, oid: Oid, tid: Tid, next_tid: Tid) {
        if let Some(entry) = self.entries.get_mut(&(oid, tid)) {
            debug_assert!(entry.next_tid.is_none());
            entry.next_tid = Some(next_tid);
        }
    }

    pub fn invalidate(&mut self, oids: &[Oid], tid: Tid) {
        self.index.invalidate(oids, tid);
    }

    pub fn latest_serial(&self, oid: Oid) -> Option<Tid> {
        self.index.latest_serial(oid)
    }

    pub fn serial_before(&self, oid: Oid, tid: Tid) -> Option<Tid> {
        self.index.serial_before(oid, tid)
    }

    /// Cache lookup for the three load shapes: exact serial, before a
    /// bound, or latest known.
    pub fn load(
        &self,
        oid: Oid,
        at_tid: Option<Tid>,
        before_tid: Option<Tid>,
    ) -> Option<(Vec<u8>, Tid, Option<Tid>)> {
        let tid = match (at_tid, before_tid) {
            (Some(at), _) => at,
            (None, Some(before)) => self.serial_before(oid, before)?,
            (None, None) => self.latest_serial(oid)?,
        };
        let entry = self.entries.get(&(oid, tid))?;
        Some((entry.data.clone(), tid, entry.next_tid))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid() -> Oid {
        Oid::new(7)
    }

    #[test]
    fn revision_index_keeps_descending_order() {
        let mut index = RevisionIndex::default();
        index.add(oid(), Tid::new(10));
        index.add(oid(), Tid::new(30));
        index.add(oid(), Tid::new(20));
        assert_eq!(
            index.serials(oid()),
            vec![Tid::new(30), Tid::new(20), Tid::new(10)]
        );
        assert_eq!(index.latest_serial(oid()), Some(Tid::new(30)));
        assert_eq!(index.serial_before(oid(), Tid::new(30)), Some(Tid::new(20)));
        assert_eq!(index.serial_before(oid(), Tid::new(10)), None);
    }

    #[test]
    fn invalidation_blocks_latest_until_relearned() {
        let mut index = RevisionIndex::default();
        index.add(oid(), Tid::new(10));
        index.invalidate(&[oid()], Tid::new(20));
        assert_eq!(index.latest_serial(oid()), None);
        // Learning the invalidating revision clears the mark.
        index.add(oid(), Tid::new(20));
        assert_eq!(index.latest_serial(oid()), Some(Tid::new(20)));
    }

    #[test]
    fn invalidation_between_candidate_and_bound_is_a_miss() {
        let mut index = RevisionIndex::default();
        index.add(oid(), Tid::new(10));
        index.invalidate(&[oid()], Tid::new(15));
        // A revision exists in (10, 18) that cache does not hold.
        assert_eq!(index.serial_before(oid(), Tid::new(18)), None);
        // Bounds below the invalidation are still answerable.
        assert_eq!(index.serial_before(oid(), Tid::new(12)), Some(Tid::new(10)));
    }

    #[test]
    fn cache_revision_index_scenario() {
        // Cached: (oid, t1) -> (d1, t3), (oid, t3) -> (d2, nil).
        let (t1, t2, t3, t4) = (Tid::new(1), Tid::new(2), Tid::new(3), Tid::new(4));
        let mut cache = MvccCache::new();
        cache.insert(oid(), t1, b"d1".to_vec(), Some(t3));
        cache.insert(oid(), t3, b"d2".to_vec(), None);
        assert_eq!(cache.serial_before(oid(), t3), Some(t1));
        cache.invalidate(&[oid()], t4);
        assert_eq!(cache.latest_serial(oid()), None);
        assert_eq!(cache.serial_before(oid(), t2), Some(t1));
    }

    #[test]
    fn load_shapes() {
        let mut cache = MvccCache::new();
        cache.insert(oid(), Tid::new(5), b"v1".to_vec(), Some(Tid::new(9)));
        cache.insert(oid(), Tid::new(9), b"v2".to_vec(), None);
        let (data, tid, next) = cache.load(oid(), Some(Tid::new(5)), None).unwrap();
        assert_eq!((data.as_slice(), tid, next), (&b"v1"[..], Tid::new(5), Some(Tid::new(9))));
        let (data, tid, _) = cache.load(oid(), None, Some(Tid::new(9))).unwrap();
        assert_eq!((data.as_slice(), tid), (&b"v1"[..], Tid::new(5)));
        let (data, tid, _) = cache.load(oid(), None, None).unwrap();
        assert_eq!((data.as_slice(), tid), (&b"v2"[..], Tid::new(9)));
        assert!(cache.load(oid(), Some(Tid::new(6)), None).is_none());
    }

    #[test]
    fn eviction_keeps_index_consistent() {
        let mut cache = MvccCache::new();
        for i in 0..(CACHE_CAPACITY + 10) {
            cache.insert(Oid::new(i as u64), Tid::new(1), vec![0], None);
        }
        assert_eq!(cache.len(), CACHE_CAPACITY);
        // The first inserted entries are gone, index included.
        assert_eq!(cache.latest_serial(Oid::new(0)), None);
        assert!(cache.latest_serial(Oid::new(CACHE_CAPACITY as u64)).is_some());
    }
}
