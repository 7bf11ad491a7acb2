//! Per-object write locking with delayed writers.
//!
//! A store lock is held from the first accepted `AskStoreObject` until the
//! transaction is unlocked or aborted. A load lock is held between
//! `LockInformation` and `NotifyUnlockInformation`. A second writer to the
//! same object is delayed, not refused: its request is parked and replayed
//! when the first writer commits or aborts. A watchdog bounds how long a
//! request may stay parked.

use crate::net::{Connection, MsgId, Packet};
use crate::types::{Oid, Tid};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Parked requests older than this are answered as conflicts by the
/// watchdog, bounding store latency under a stuck writer.
pub const DELAY_TIMEOUT: Duration = Duration::from_secs(30);

/// A request parked until a lock is released.
#[derive(Debug)]
pub struct DelayedRequest {
    pub conn: Connection,
    pub msg_id: MsgId,
    pub packet: Packet,
    pub queued_at: Instant,
}

#[derive(Default)]
pub struct LockManager {
    store_locks: HashMap<Oid, Tid>,
    load_locks: HashMap<Oid, Tid>,
    oids_by_tid: HashMap<Tid, HashSet<Oid>>,
    waiting: HashMap<Oid, VecDeque<DelayedRequest>>,
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager::default()
    }

    /// Transaction whose lock on `oid` forces `tid` to wait, if any.
    pub fn delay_reason(&self, oid: Oid, tid: Tid) -> Option<Tid> {
        if let Some(&holder) = self.load_locks.get(&oid) {
            if holder != tid {
                return Some(holder);
            }
        }
        match self.store_locks.get(&oid) {
            Some(&holder) if holder != tid => Some(holder),
            _ => None,
        }
    }

    /// Take the store lock on `oid` for `tid`. Callers check
    /// [`LockManager::delay_reason`] first.
    pub fn lock(&mut self, oid: Oid, tid: Tid) {
        debug_assert!(self.delay_reason(oid, tid).is_none());
        self.store_locks.insert(oid, tid);
        self.oids_by_tid.entry(tid).or_default().insert(oid);
    }

    /// Park a request until the object's locks release.
    pub fn delay(&mut self, oid: Oid, conn: Connection, msg_id: MsgId, packet: Packet) {
        debug!(%oid, "delaying store until lock release");
        self.waiting.entry(oid).or_default().push_back(DelayedRequest {
            conn,
            msg_id,
            packet,
            queued_at: Instant::now(),
        });
    }

    /// Take load locks for a transaction entering its commit window.
    pub fn lock_transaction(&mut self, tid: Tid) {
        let oids = self.oids_by_tid.get(&tid).cloned().unwrap_or_default();
        for oid in oids {
            self.load_locks.insert(oid, tid);
        }
    }

    /// Release every lock held by `tid`, returning parked requests to
    /// replay. Used both on unlock (commit) and on abort; replaying makes
    /// a delayed writer observe either the released object (abort) or the
    /// freshly committed serial (commit, reported as a conflict).
    pub fn release(&mut self, tid: Tid) -> Vec<DelayedRequest> {
        let oids = self.oids_by_tid.remove(&tid).unwrap_or_default();
        let mut replay = Vec::new();
        for oid in oids {
            if self.store_locks.get(&oid) == Some(&tid) {
                self.store_locks.remove(&oid);
            }
            if self.load_locks.get(&oid) == Some(&tid) {
                self.load_locks.remove(&oid);
            }
            if let Some(mut queue) = self.waiting.remove(&oid) {
                replay.extend(queue.drain(..));
            }
        }
        replay
    }

    /// Whether a latest-revision read of `oid` must wait for an in-flight
    /// commit.
    pub fn load_locked(&self, oid: Oid) -> bool {
        self.load_locks.contains_key(&oid)
    }

    /// Lock holder for `oid`, if any.
    pub fn holder(&self, oid: Oid) -> Option<Tid> {
        self.store_locks.get(&oid).copied()
    }

    /// Drain parked requests that exceeded [`DELAY_TIMEOUT`]; the caller
    /// answers them as conflicts.
    pub fn expired(&mut self, now: Instant) -> Vec<(Option<Tid>, DelayedRequest)> {
        let mut out = Vec::new();
        for (oid, queue) in self.waiting.iter_mut() {
            while let Some(front) = queue.front() {
                if now.duration_since(front.queued_at) < DELAY_TIMEOUT {
                    break;
                }
                let holder = self.store_locks.get(oid).copied();
                out.push((holder, queue.pop_front().unwrap()));
            }
        }
        self.waiting.retain(|_, queue| !queue.is_empty());
        out
    }

    pub fn locked_oids(&self, tid: Tid) -> Vec<Oid> {
        self.oids_by_tid
            .get(&tid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_writer_is_delayed_not_refused() {
        let mut locks = LockManager::new();
        let oid = Oid::new(1);
        let t1 = Tid::new(10);
        let t2 = Tid::new(20);
        assert_eq!(locks.delay_reason(oid, t1), None);
        locks.lock(oid, t1);
        // Same transaction may store the object again.
        assert_eq!(locks.delay_reason(oid, t1), None);
        assert_eq!(locks.delay_reason(oid, t2), Some(t1));
    }

    #[test]
    fn release_frees_the_object() {
        let mut locks = LockManager::new();
        let oid = Oid::new(1);
        let t1 = Tid::new(10);
        locks.lock(oid, t1);
        assert!(locks.release(Tid::new(99)).is_empty());
        let replay = locks.release(t1);
        assert!(replay.is_empty());
        assert_eq!(locks.holder(oid), None);
        assert_eq!(locks.delay_reason(oid, Tid::new(20)), None);
    }

    #[test]
    fn load_lock_covers_commit_window() {
        let mut locks = LockManager::new();
        let oid = Oid::new(4);
        let t1 = Tid::new(10);
        locks.lock(oid, t1);
        assert!(!locks.load_locked(oid));
        locks.lock_transaction(t1);
        assert!(locks.load_locked(oid));
        locks.release(t1);
        assert!(!locks.load_locked(oid));
    }
}
