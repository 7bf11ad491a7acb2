//! Explicit per-transaction context.
//!
//! Every operation of the client API takes the context as a parameter; it
//! owns the reply queue its storage requests are answered on, so concurrent
//! transactions on one client never share wait state.

use crate::net::{ReplyEnvelope, ReplyQueue, UndoSerial};
use crate::types::{NodeId, Oid, Tid};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::mpsc;

pub struct TxnContext {
    pub(crate) tid: Option<Tid>,
    /// Pending payload per stored oid. `None` marks a serial check or an
    /// undo back-pointer: nothing to resolve on conflict, nothing to cache
    /// on finish.
    pub(crate) data: HashMap<Oid, Option<Vec<u8>>>,
    /// Stored oids in first-store order.
    pub(crate) data_list: Vec<Oid>,
    pub(crate) base_serials: HashMap<Oid, Tid>,
    /// Successful store acknowledgements per oid.
    pub(crate) stored_counts: HashMap<Oid, u32>,
    pub(crate) conflicts: HashMap<Oid, BTreeSet<Tid>>,
    pub(crate) resolved: HashMap<Oid, BTreeSet<Tid>>,
    pub(crate) undo_serials: HashMap<Oid, UndoSerial>,
    pub(crate) voted: bool,
    pub(crate) involved: HashSet<NodeId>,
    pub(crate) barrier_done: bool,
    pub(crate) user: String,
    pub(crate) description: String,
    pub(crate) extension: Vec<u8>,
    /// Requests sent but not yet answered on this context's queue.
    pub(crate) outstanding: usize,
    pub(crate) queue_tx: ReplyQueue,
    pub(crate) queue_rx: mpsc::UnboundedReceiver<ReplyEnvelope>,
}

impl TxnContext {
    pub fn new() -> TxnContext {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        TxnContext {
            tid: None,
            data: HashMap::new(),
            data_list: Vec::new(),
            base_serials: HashMap::new(),
            stored_counts: HashMap::new(),
            conflicts: HashMap::new(),
            resolved: HashMap::new(),
            undo_serials: HashMap::new(),
            voted: false,
            involved: HashSet::new(),
            barrier_done: false,
            user: String::new(),
            description: String::new(),
            extension: Vec::new(),
            outstanding: 0,
            queue_tx,
            queue_rx,
        }
    }

    pub fn tid(&self) -> Option<Tid> {
        self.tid
    }

    /// Transaction metadata persisted with the commit.
    pub fn set_metadata(
        &mut self,
        user: impl Into<String>,
        description: impl Into<String>,
        extension: Vec<u8>,
    ) {
        self.user = user.into();
        self.description = description.into();
        self.extension = extension;
    }

    pub fn is_active(&self) -> bool {
        self.tid.is_some()
    }

    /// Reset between transactions. The queue is reused; stale envelopes
    /// from an interrupted transaction are drained first.
    pub(crate) fn clear(&mut self) {
        while self.queue_rx.try_recv().is_ok() {}
        self.tid = None;
        self.data.clear();
        self.data_list.clear();
        self.base_serials.clear();
        self.stored_counts.clear();
        self.conflicts.clear();
        self.resolved.clear();
        self.undo_serials.clear();
        self.voted = false;
        self.involved.clear();
        self.barrier_done = false;
        self.user.clear();
        self.description.clear();
        self.extension.clear();
        self.outstanding = 0;
    }
}

impl Default for TxnContext {
    fn default() -> TxnContext {
        TxnContext::new()
    }
}
