//! Client node: per-transaction contexts, replica dispatch, MVCC cache,
//! and the two-phase commit API.

pub mod cache;
pub mod pool;
pub mod txn;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::{
    error_from_wire, ConnEvent, Connection, ConnectionOptions, NotificationHook, Packet, Reply,
    ReplyEnvelope,
};
use crate::node::NodeManager;
use crate::partition::{Cell, PartitionTable};
use crate::types::{Checksum, ClusterState, NodeId, NodeType, Oid, Tid};
use cache::MvccCache;
use pool::ConnectionPool;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashSet};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use txn::TxnContext;

/// Application hook merging a committed revision with a concurrent one.
pub trait ConflictResolver: Send + Sync {
    /// Merge `data` (based on `base_serial`) against the revision committed
    /// at `committed_serial`. `None` means unresolvable.
    fn resolve(
        &self,
        oid: Oid,
        committed_serial: Tid,
        base_serial: Tid,
        data: &[u8],
    ) -> Option<Vec<u8>>;

    /// Merge for undo: reconcile the data being restored with the current
    /// revision. `None` means the undo cannot proceed.
    fn resolve_undo(
        &self,
        _oid: Oid,
        _current_serial: Tid,
        _undone_tid: Tid,
        _undo_data: &[u8],
        _current_data: &[u8],
    ) -> Option<Vec<u8>> {
        None
    }
}

/// Default resolver: every conflict is fatal.
pub struct NoResolution;

impl ConflictResolver for NoResolution {
    fn resolve(&self, _: Oid, _: Tid, _: Tid, _: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionInfo {
    pub tid: Tid,
    pub user: String,
    pub description: String,
    pub extension: Vec<u8>,
    pub oids: Vec<Oid>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub tid: Tid,
    pub size: u32,
    pub user: String,
    pub description: String,
}

fn compress_payload(data: &[u8]) -> (Vec<u8>, bool) {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    let compressed = encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .unwrap_or_default();
    // Store raw when compression does not pay for itself.
    if !compressed.is_empty() && compressed.len() < data.len() {
        (compressed, true)
    } else {
        (data.to_vec(), false)
    }
}

fn decompress_payload(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Storage(format!("corrupt compressed payload: {e}")))?;
    Ok(out)
}

pub struct Client {
    config: Config,
    read_only: bool,
    id: Mutex<Option<NodeId>>,
    nm: Arc<Mutex<NodeManager>>,
    pt: Arc<Mutex<PartitionTable>>,
    cache: Arc<Mutex<MvccCache>>,
    cluster_state: Arc<Mutex<ClusterState>>,
    master_conn: Arc<Mutex<Option<Connection>>>,
    pool: tokio::sync::Mutex<ConnectionPool>,
    new_oids: Mutex<Vec<Oid>>,
    // Lock order: load_lock -> oid_lock -> cache -> master_lock. The node
    // manager lock is a leaf with no ordering relationship.
    load_lock: tokio::sync::Mutex<()>,
    oid_lock: tokio::sync::Mutex<()>,
    master_lock: tokio::sync::Mutex<()>,
    net_tx: crate::net::EventSink,
}

impl Client {
    pub fn new(config: Config) -> Client {
        Client::with_read_only(config, false)
    }

    pub fn with_read_only(config: Config, read_only: bool) -> Client {
        let (net_tx, mut net_rx) = mpsc::unbounded_channel();
        let master_conn: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));
        let watch = master_conn.clone();
        // Drain connection events; the only one that matters here is the
        // master link dying, which resets the client to re-bootstrap.
        tokio::spawn(async move {
            while let Some(event) = net_rx.recv().await {
                if let ConnEvent::Closed { conn } = event {
                    let mut master = watch.lock().unwrap();
                    if master.as_ref() == Some(&conn) {
                        warn!("connection to primary master lost");
                        *master = None;
                    }
                }
            }
        });
        let opts = ConnectionOptions {
            ping_delay: config.ping_delay,
            ping_timeout: config.ping_timeout,
            on_notification: None,
        };
        let pool = ConnectionPool::new(config.cluster_name.clone(), net_tx.clone(), opts);
        Client {
            id: Mutex::new(config.node_id),
            nm: Arc::new(Mutex::new(NodeManager::new())),
            pt: Arc::new(Mutex::new(PartitionTable::new(config.partitions))),
            cache: Arc::new(Mutex::new(MvccCache::new())),
            cluster_state: Arc::new(Mutex::new(ClusterState::Recovering)),
            master_conn,
            pool: tokio::sync::Mutex::new(pool),
            new_oids: Mutex::new(Vec::new()),
            load_lock: tokio::sync::Mutex::new(()),
            oid_lock: tokio::sync::Mutex::new(()),
            master_lock: tokio::sync::Mutex::new(()),
            net_tx,
            read_only,
            config,
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        *self.id.lock().unwrap()
    }

    // -- master connection -------------------------------------------------

    fn notification_hook(&self) -> NotificationHook {
        let cache = self.cache.clone();
        let pt = self.pt.clone();
        let nm = self.nm.clone();
        let cluster_state = self.cluster_state.clone();
        Arc::new(move |_conn, _msg_id, packet| match packet {
            Packet::InvalidateObjects { tid, oids } => {
                cache.lock().unwrap().invalidate(&oids, tid);
            }
            Packet::NotifyPartitionChanges { ptid, changes } => {
                let _ = pt.lock().unwrap().update(ptid, &changes);
            }
            Packet::SendPartitionTable { ptid, rows } => {
                let mut pt = pt.lock().unwrap();
                if ptid > pt.ptid() {
                    pt.load(ptid, &rows);
                }
            }
            Packet::NotifyNodeInformation { nodes } => {
                nm.lock().unwrap().update(&nodes);
            }
            Packet::NotifyClusterInformation { state } => {
                *cluster_state.lock().unwrap() = state;
            }
            Packet::NotifyLastOid { .. } => {}
            other => {
                debug!(kind = other.kind().name(), "unexpected master notification");
            }
        })
    }

    /// Connection to the primary master, established on demand.
    async fn master(&self) -> Result<Connection> {
        if let Some(conn) = self.master_conn.lock().unwrap().clone() {
            if !conn.is_closed() {
                return Ok(conn);
            }
        }
        let _guard = self.master_lock.lock().await;
        if let Some(conn) = self.master_conn.lock().unwrap().clone() {
            if !conn.is_closed() {
                return Ok(conn);
            }
        }
        self.new_oids.lock().unwrap().clear();
        let conn = self.connect_to_primary().await?;
        *self.master_conn.lock().unwrap() = Some(conn.clone());
        info!(conn = ?conn, "connected and ready");
        Ok(conn)
    }

    async fn connect_to_primary(&self) -> Result<Connection> {
        let opts = ConnectionOptions {
            ping_delay: self.config.ping_delay,
            ping_timeout: self.config.ping_timeout,
            on_notification: Some(self.notification_hook()),
        };
        let mut candidates = self.config.master_nodes.clone();
        loop {
            let mut next_candidates = Vec::new();
            for addr in &candidates {
                match self.try_primary(*addr, &opts).await {
                    Ok(Found::Primary(conn)) => {
                        if self.bootstrap(&conn).await.is_ok() {
                            return Ok(conn);
                        }
                        conn.close();
                    }
                    Ok(Found::Redirect(primary_addr)) => {
                        next_candidates = vec![primary_addr];
                        break;
                    }
                    Err(e) => {
                        debug!(%addr, error = %e, "master candidate failed");
                    }
                }
            }
            if next_candidates.is_empty() {
                next_candidates = self.config.master_nodes.clone();
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            candidates = next_candidates;
        }
    }

    async fn try_primary(&self, addr: SocketAddr, opts: &ConnectionOptions) -> Result<Found> {
        let conn = Connection::connect(addr, self.net_tx.clone(), opts.clone()).await?;
        let answer = conn
            .ask(Packet::RequestIdentification {
                node_type: NodeType::Client,
                id: self.node_id(),
                addr: None,
                cluster_name: self.config.cluster_name.clone(),
            })
            .await?;
        let (peer_id, your_id) = match answer {
            Packet::AcceptIdentification {
                id: Some(peer_id),
                your_id,
                ..
            } => (peer_id, your_id),
            other => {
                conn.close();
                return Err(Error::Protocol(format!(
                    "unexpected identification answer: {:?}",
                    other.kind()
                )));
            }
        };
        conn.set_peer_node(peer_id);
        if let Some(assigned) = your_id {
            *self.id.lock().unwrap() = Some(assigned);
        }
        let answer = conn.ask(Packet::AskPrimary).await?;
        let Packet::AnswerPrimary {
            primary,
            known_masters,
        } = answer
        else {
            conn.close();
            return Err(Error::Protocol("expected AnswerPrimary".into()));
        };
        match primary {
            Some(primary) if primary == peer_id => Ok(Found::Primary(conn)),
            Some(primary) => {
                conn.close();
                match known_masters.iter().find(|(_, id)| *id == Some(primary)) {
                    Some((addr, _)) => Ok(Found::Redirect(*addr)),
                    None => Err(Error::PrimaryFailure("primary address unknown".into())),
                }
            }
            None => {
                conn.close();
                Err(Error::NotReady("election not settled".into()))
            }
        }
    }

    /// Pull node and partition information until the cluster serves.
    async fn bootstrap(&self, conn: &Connection) -> Result<()> {
        if let Some(id) = self.node_id() {
            self.pool.lock().await.set_client_id(id);
        }
        for _ in 0..50 {
            conn.ask(Packet::AskNodeInformation).await?;
            let answer = conn.ask(Packet::AskPartitionTable).await?;
            let operational = if let Packet::AnswerPartitionTable { ptid, rows } = answer {
                let mut pt = self.pt.lock().unwrap();
                if ptid > pt.ptid() {
                    pt.load(ptid, &rows);
                }
                pt.operational()
            } else {
                false
            };
            if operational {
                if let Packet::AnswerClusterState { state } =
                    conn.ask(Packet::AskClusterState).await?
                {
                    *self.cluster_state.lock().unwrap() = state;
                    if state == ClusterState::Running {
                        return Ok(());
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Err(Error::NotReady("cluster never became operational".into()))
    }

    async fn ask_primary(&self, packet: Packet) -> Result<Packet> {
        let conn = self.master().await?;
        conn.ask(packet).await.map_err(|e| match e {
            Error::ConnectionClosed => {
                let mut master = self.master_conn.lock().unwrap();
                if master.as_ref().is_some_and(|c| c.is_closed()) {
                    *master = None;
                }
                Error::PrimaryFailure("connection to primary master lost".into())
            }
            e => e,
        })
    }

    /// Flush pending invalidations: by the time the answer arrives, every
    /// invalidation the primary sent before it has been applied.
    async fn invalidation_barrier(&self) -> Result<()> {
        self.ask_primary(Packet::AskBarrier).await?;
        Ok(())
    }

    // -- replica dispatch --------------------------------------------------

    /// Shuffle then rank cells so equally-ranked replicas spread load.
    async fn ordered_cells(&self, mut cells: Vec<Cell>) -> Vec<Cell> {
        cells.shuffle(&mut rand::thread_rng());
        let pool = self.pool.lock().await;
        cells.sort_by_key(|cell| pool.sort_key(cell.node));
        cells
    }

    fn addr_of(&self, node: NodeId) -> Option<SocketAddr> {
        self.nm.lock().unwrap().by_id(node).and_then(|n| n.addr)
    }

    async fn conn_for_cell(&self, node: NodeId) -> Result<Connection> {
        let addr = self
            .addr_of(node)
            .ok_or_else(|| Error::NotReady(format!("storage {node} has no known address")))?;
        self.pool.lock().await.conn_for(node, addr).await
    }

    // -- read path ---------------------------------------------------------

    /// Load the latest revision of an object.
    pub async fn load(&self, txn: &mut TxnContext, oid: Oid) -> Result<(Vec<u8>, Tid)> {
        let (data, tid, _) = self._load(txn, oid, None, None).await?;
        Ok((data, tid))
    }

    /// Load the revision written exactly at `serial`.
    pub async fn load_serial(&self, txn: &mut TxnContext, oid: Oid, serial: Tid) -> Result<Vec<u8>> {
        let (data, _, _) = self._load(txn, oid, Some(serial), None).await?;
        Ok(data)
    }

    /// Load the revision current just before `tid`.
    pub async fn load_before(
        &self,
        txn: &mut TxnContext,
        oid: Oid,
        tid: Tid,
    ) -> Result<(Vec<u8>, Tid, Option<Tid>)> {
        self._load(txn, oid, None, Some(tid)).await
    }

    async fn _load(
        &self,
        txn: &mut TxnContext,
        oid: Oid,
        at_tid: Option<Tid>,
        before_tid: Option<Tid>,
    ) -> Result<(Vec<u8>, Tid, Option<Tid>)> {
        let _guard = self.load_lock.lock().await;
        // Once per transaction, anchor the snapshot: process every pending
        // invalidation before the first read.
        if !txn.barrier_done {
            self.invalidation_barrier().await?;
            txn.barrier_done = true;
        }
        let cached = self.cache.lock().unwrap().load(oid, at_tid, before_tid);
        if let Some((data, tid, next_tid)) = cached {
            if data.is_empty() {
                return Err(Error::OidNotFound(format!("{oid} creation undone")));
            }
            return Ok((data, tid, next_tid));
        }
        let (data, tid, next_tid) = self.load_from_storage(oid, at_tid, before_tid).await?;
        self.cache
            .lock()
            .unwrap()
            .insert(oid, tid, data.clone(), next_tid);
        if data.is_empty() {
            return Err(Error::OidNotFound(format!("{oid} creation undone")));
        }
        Ok((data, tid, next_tid))
    }

    async fn load_from_storage(
        &self,
        oid: Oid,
        at_tid: Option<Tid>,
        before_tid: Option<Tid>,
    ) -> Result<(Vec<u8>, Tid, Option<Tid>)> {
        let cells = self.pt.lock().unwrap().readable_cells_for_oid(oid);
        if cells.is_empty() {
            return Err(Error::Storage(format!("no storage available for {oid}")));
        }
        let cells = self.ordered_cells(cells).await;
        let mut inconsistent = false;
        for cell in cells {
            debug!(%oid, node = %cell.node, ?at_tid, ?before_tid, "loading");
            let conn = match self.conn_for_cell(cell.node).await {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            let answer = conn
                .ask(Packet::AskObject {
                    oid,
                    at_tid,
                    before_tid,
                })
                .await;
            match answer {
                Ok(Packet::AnswerObject {
                    oid: answered_oid,
                    serial_start,
                    serial_end,
                    compression,
                    checksum,
                    data,
                    ..
                }) => {
                    if answered_oid != oid {
                        error!(node = %cell.node, "storage answered the wrong oid");
                        inconsistent = true;
                        continue;
                    }
                    if checksum != Checksum::of(&data) {
                        error!(node = %cell.node, %oid, "checksum mismatch");
                        inconsistent = true;
                        continue;
                    }
                    let data = if compression {
                        decompress_payload(&data)?
                    } else {
                        data
                    };
                    return Ok((data, serial_start, serial_end));
                }
                Ok(other) => {
                    error!(kind = other.kind().name(), "unexpected object answer");
                    inconsistent = true;
                }
                Err(e @ Error::OidNotFound(_)) => return Err(e),
                Err(e) => {
                    debug!(node = %cell.node, error = %e, "cell failed, trying next");
                }
            }
        }
        if inconsistent {
            Err(Error::Storage("inconsistent data".into()))
        } else {
            Err(Error::Storage("connection failure".into()))
        }
    }

    // -- identifiers -------------------------------------------------------

    /// Allocate a fresh OID, batching round-trips to the primary.
    pub async fn new_oid(&self) -> Result<Oid> {
        let _guard = self.oid_lock.lock().await;
        if let Some(oid) = self.pop_oid() {
            return Ok(oid);
        }
        let answer = self
            .ask_primary(Packet::AskNewOids {
                count: crate::master::OID_BATCH,
            })
            .await?;
        match answer {
            Packet::AnswerNewOids { oids } if !oids.is_empty() => {
                let mut batch = self.new_oids.lock().unwrap();
                *batch = oids;
                batch.reverse();
                Ok(batch.pop().expect("batch is non-empty"))
            }
            _ => Err(Error::Storage("new_oid failed".into())),
        }
    }

    fn pop_oid(&self) -> Option<Oid> {
        self.new_oids.lock().unwrap().pop()
    }

    pub async fn last_transaction(&self) -> Result<Tid> {
        match self.ask_primary(Packet::AskLastTransaction).await? {
            Packet::AnswerLastTransaction { tid } => Ok(tid),
            _ => Err(Error::Protocol("expected AnswerLastTransaction".into())),
        }
    }

    // -- two-phase commit --------------------------------------------------

    pub async fn tpc_begin(&self, txn: &mut TxnContext, tid: Option<Tid>) -> Result<Tid> {
        if txn.is_active() {
            return Err(Error::StorageTransaction("duplicate tpc_begin".into()));
        }
        let answer = self.ask_primary(Packet::AskBeginTransaction { tid }).await?;
        let Packet::AnswerBeginTransaction { tid: allocated } = answer else {
            return Err(Error::Protocol("expected AnswerBeginTransaction".into()));
        };
        debug_assert!(tid.is_none() || tid == Some(allocated));
        txn.tid = Some(allocated);
        Ok(allocated)
    }

    /// Store an object revision under the active transaction.
    pub async fn store(
        &self,
        txn: &mut TxnContext,
        oid: Oid,
        serial: Tid,
        data: Vec<u8>,
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if !txn.is_active() {
            return Err(Error::StorageTransaction("store outside transaction".into()));
        }
        debug!(%oid, %serial, "storing");
        self._store(txn, oid, serial, Some(data), None).await
    }

    async fn _store(
        &self,
        txn: &mut TxnContext,
        oid: Oid,
        serial: Tid,
        data: Option<Vec<u8>>,
        data_tid: Option<Tid>,
    ) -> Result<()> {
        let cells = self.pt.lock().unwrap().writable_cells_for_oid(oid);
        if cells.is_empty() {
            return Err(Error::Storage(format!("no writable storage for {oid}")));
        }
        let (payload, compression) = match &data {
            // Undo marker or back-pointer: no payload of its own.
            None => (Vec::new(), false),
            Some(data) if self.config.compress => compress_payload(data),
            Some(data) => (data.clone(), false),
        };
        let checksum = Checksum::of(&payload);
        let tid = txn.tid.expect("callers checked the transaction");
        if !txn.data.contains_key(&oid) {
            txn.data_list.push(oid);
        }
        txn.data.insert(oid, data);
        txn.base_serials.insert(oid, serial);
        txn.stored_counts.entry(oid).or_insert(0);
        let packet = Packet::AskStoreObject {
            oid,
            serial,
            compression,
            checksum,
            data: payload,
            data_tid,
            tid,
        };
        for cell in cells {
            let conn = match self.conn_for_cell(cell.node).await {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            if conn.ask_queue(packet.clone(), &txn.queue_tx).is_ok() {
                txn.outstanding += 1;
                txn.involved.insert(cell.node);
            }
        }
        // Pump without blocking so conflicts surface early.
        self.drain_replies(txn)?;
        Ok(())
    }

    /// Verify an object is still at `serial` at commit time without
    /// writing a new revision.
    pub async fn check_current_serial(
        &self,
        txn: &mut TxnContext,
        oid: Oid,
        serial: Tid,
    ) -> Result<()> {
        if !txn.is_active() {
            return Err(Error::StorageTransaction(
                "serial check outside transaction".into(),
            ));
        }
        let cells = self.pt.lock().unwrap().writable_cells_for_oid(oid);
        if cells.is_empty() {
            return Err(Error::Storage(format!("no writable storage for {oid}")));
        }
        let tid = txn.tid.expect("checked above");
        txn.base_serials.insert(oid, serial);
        txn.stored_counts.entry(oid).or_insert(0);
        if !txn.data.contains_key(&oid) {
            // Marker: suppress conflict resolution for this oid.
            txn.data.insert(oid, None);
            txn.data_list.push(oid);
        }
        let packet = Packet::AskCheckCurrentSerial { tid, serial, oid };
        for cell in cells {
            let conn = match self.conn_for_cell(cell.node).await {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            if conn.ask_queue(packet.clone(), &txn.queue_tx).is_ok() {
                txn.outstanding += 1;
                txn.involved.insert(cell.node);
            }
        }
        self.drain_replies(txn)?;
        Ok(())
    }

    fn on_reply(&self, txn: &mut TxnContext, envelope: ReplyEnvelope) -> Result<()> {
        match envelope.reply {
            Reply::Closed | Reply::Forgotten => Ok(()),
            Reply::Packet(Packet::AnswerStoreObject {
                conflicting,
                oid,
                serial,
            }) => {
                if conflicting {
                    txn.conflicts.entry(oid).or_default().insert(serial);
                } else {
                    *txn.stored_counts.entry(oid).or_insert(0) += 1;
                }
                Ok(())
            }
            Reply::Packet(Packet::AnswerObjectUndoSerial { serials }) => {
                for (oid, undo) in serials {
                    txn.undo_serials.insert(oid, undo);
                }
                Ok(())
            }
            Reply::Packet(Packet::Error { code, message }) => {
                match error_from_wire(code, &message) {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            Reply::Packet(other) => {
                debug!(kind = other.kind().name(), "ignoring reply");
                Ok(())
            }
        }
    }

    /// Consume already-arrived replies without blocking.
    fn drain_replies(&self, txn: &mut TxnContext) -> Result<()> {
        let mut result = Ok(());
        while let Ok(envelope) = txn.queue_rx.try_recv() {
            txn.outstanding = txn.outstanding.saturating_sub(1);
            if let Err(e) = self.on_reply(txn, envelope) {
                // Keep consuming; the first error wins.
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Block until every outstanding request on this context is answered.
    async fn wait_replies(&self, txn: &mut TxnContext) -> Result<()> {
        let mut result = Ok(());
        while txn.outstanding > 0 {
            let Some(envelope) = txn.queue_rx.recv().await else {
                return Err(Error::ConnectionClosed);
            };
            txn.outstanding -= 1;
            if let Err(e) = self.on_reply(txn, envelope) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// The conflict-resolution loop: wait for store answers, try to resolve
    /// reported conflicts, re-store resolutions, repeat until quiet.
    async fn wait_store_responses(
        &self,
        txn: &mut TxnContext,
        resolver: &dyn ConflictResolver,
    ) -> Result<()> {
        loop {
            self.wait_replies(txn).await?;
            if self.handle_conflicts(txn, resolver).await? == 0 && txn.outstanding == 0 {
                return Ok(());
            }
        }
    }

    async fn handle_conflicts(
        &self,
        txn: &mut TxnContext,
        resolver: &dyn ConflictResolver,
    ) -> Result<usize> {
        let mut resolutions = 0;
        let oids: Vec<Oid> = txn.conflicts.keys().copied().collect();
        for oid in oids {
            let conflict_set = txn.conflicts.remove(&oid).unwrap_or_default();
            let Some(conflict_serial) = conflict_set.iter().next_back().copied() else {
                continue;
            };
            let already_resolved = txn
                .resolved
                .get(&oid)
                .and_then(|set| set.iter().next_back().copied())
                .is_some_and(|max| conflict_serial <= max);
            if already_resolved {
                txn.resolved.entry(oid).or_default().extend(conflict_set);
                continue;
            }
            let serial = txn.base_serials.get(&oid).copied().unwrap_or(Tid::ZERO);
            let tid = txn.tid.expect("conflicts only arise inside a transaction");
            let data = txn.data.get(&oid).cloned().flatten();
            if let Some(data) = data {
                if conflict_serial <= tid {
                    if let Some(merged) =
                        resolver.resolve(oid, conflict_serial, serial, &data)
                    {
                        info!(%oid, %serial, %conflict_serial, "conflict resolved");
                        txn.resolved.entry(oid).or_default().extend(conflict_set);
                        self._store(txn, oid, conflict_serial, Some(merged), None).await?;
                        resolutions += 1;
                        continue;
                    }
                    info!(%oid, %serial, %conflict_serial, "conflict resolution failed");
                } else {
                    info!(%oid, %conflict_serial, "conflict with later transaction");
                }
                txn.data.remove(&oid);
                txn.data_list.retain(|o| *o != oid);
                return Err(Error::Conflict {
                    oid,
                    serials: (tid, serial),
                    data: Some(data),
                });
            }
            // Read-with-verify marker: never resolved.
            txn.data.remove(&oid);
            txn.data_list.retain(|o| *o != oid);
            return Err(Error::ReadConflict {
                oid,
                serials: (conflict_serial, serial),
            });
        }
        Ok(resolutions)
    }

    pub async fn tpc_vote(
        &self,
        txn: &mut TxnContext,
        resolver: &dyn ConflictResolver,
    ) -> Result<()> {
        if !txn.is_active() {
            return Err(Error::StorageTransaction("vote outside transaction".into()));
        }
        self.wait_store_responses(txn, resolver).await?;
        for oid in &txn.data_list {
            if txn.stored_counts.get(oid).copied().unwrap_or(0) == 0 {
                return Err(Error::Storage(format!("store of {oid} reached no cell")));
            }
        }
        let tid = txn.tid.expect("checked above");
        // Transaction metadata goes to every writable cell covering the
        // touched partitions; at least one must acknowledge.
        let nodes = {
            let pt = self.pt.lock().unwrap();
            let partitions: HashSet<u32> =
                txn.data_list.iter().map(|oid| pt.partition_of(*oid)).collect();
            let mut nodes: Vec<NodeId> = partitions
                .iter()
                .flat_map(|p| pt.writable_cells(*p))
                .map(|cell| cell.node)
                .collect();
            nodes.sort();
            nodes.dedup();
            nodes
        };
        let packet = Packet::AskStoreTransaction {
            tid,
            user: txn.user.clone(),
            description: txn.description.clone(),
            extension: txn.extension.clone(),
            oids: txn.data_list.clone(),
        };
        let mut acknowledged = 0;
        for node in nodes {
            let conn = match self.conn_for_cell(node).await {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            match conn.ask(packet.clone()).await {
                Ok(Packet::AnswerStoreTransaction { .. }) => {
                    acknowledged += 1;
                    txn.involved.insert(node);
                }
                Ok(_) | Err(Error::ConnectionClosed) => continue,
                Err(e) => return Err(e),
            }
        }
        if acknowledged == 0 {
            return Err(Error::Storage("tpc_vote failed: no storage accepted".into()));
        }
        // Surface a dead primary here rather than in tpc_finish.
        self.master().await?;
        txn.voted = true;
        Ok(())
    }

    pub async fn tpc_finish(
        &self,
        txn: &mut TxnContext,
        resolver: &dyn ConflictResolver,
    ) -> Result<Tid> {
        if !txn.is_active() {
            return Err(Error::StorageTransaction("finish outside transaction".into()));
        }
        if !txn.voted {
            self.tpc_vote(txn, resolver).await?;
        }
        let _guard = self.load_lock.lock().await;
        let tid = txn.tid.expect("checked above");
        let answer = self
            .ask_primary(Packet::AskFinishTransaction {
                tid,
                oids: txn.data_list.clone(),
            })
            .await?;
        let Packet::AnswerTransactionFinished { tid } = answer else {
            return Err(Error::Protocol("expected AnswerTransactionFinished".into()));
        };
        {
            let mut cache = self.cache.lock().unwrap();
            for oid in &txn.data_list {
                let Some(Some(data)) = txn.data.get(oid) else {
                    // Serial-check marker: nothing was written.
                    continue;
                };
                if let Some(base) = txn.base_serials.get(oid) {
                    cache.set_next_tid(*oid, *base, tid);
                }
                if data.is_empty() {
                    cache.invalidate(&[*oid], tid);
                } else {
                    cache.insert(*oid, tid, data.clone(), None);
                }
            }
        }
        txn.clear();
        Ok(tid)
    }

    pub async fn tpc_abort(&self, txn: &mut TxnContext) {
        let Some(tid) = txn.tid else { return };
        let involved: Vec<NodeId> = txn.involved.iter().copied().collect();
        for node in involved {
            if let Some(conn) = self.pool.lock().await.existing(node) {
                conn.notify(Packet::AbortTransaction { tid });
            }
        }
        if let Some(conn) = self.master_conn.lock().unwrap().clone() {
            conn.notify(Packet::AbortTransaction { tid });
        }
        // Eat every pending answer so the next transaction starts clean.
        while txn.outstanding > 0 {
            match txn.queue_rx.recv().await {
                Some(envelope) => {
                    txn.outstanding -= 1;
                    if let Err(e) = self.on_reply(txn, envelope) {
                        debug!(error = %e, "ignoring error while aborting");
                    }
                }
                None => break,
            }
        }
        txn.clear();
    }

    /// Process any pending answers without blocking.
    pub fn sync(&self, txn: &mut TxnContext) {
        if let Err(e) = self.drain_replies(txn) {
            debug!(error = %e, "ignoring error while syncing");
        }
    }

    // -- undo and history --------------------------------------------------

    pub async fn undo(
        &self,
        txn: &mut TxnContext,
        undone_tid: Tid,
        resolver: &dyn ConflictResolver,
    ) -> Result<Vec<Oid>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if !txn.is_active() {
            return Err(Error::StorageTransaction("undo outside transaction".into()));
        }
        let info = self.transaction_information(undone_tid).await.map_err(|e| {
            match e {
                Error::TidNotFound(m) => Error::Undo(format!("transaction not found: {m}")),
                e => e,
            }
        })?;
        let oids = info.oids;
        // One undo-serial query per partition keeps the storage set minimal.
        let mut by_partition: Vec<(u32, Vec<Oid>)> = Vec::new();
        {
            let pt = self.pt.lock().unwrap();
            for oid in &oids {
                let partition = pt.partition_of(*oid);
                match by_partition.iter_mut().find(|(p, _)| *p == partition) {
                    Some((_, list)) => list.push(*oid),
                    None => by_partition.push((partition, vec![*oid])),
                }
            }
        }
        let tid = txn.tid.expect("checked above");
        for (partition, oids) in by_partition {
            let cells = self.pt.lock().unwrap().readable_cells(partition);
            let cells = self.ordered_cells(cells).await;
            let mut sent = false;
            for cell in cells {
                if let Ok(conn) = self.conn_for_cell(cell.node).await {
                    let packet = Packet::AskObjectUndoSerial {
                        tid,
                        undone_tid,
                        oids: oids.clone(),
                    };
                    if conn.ask_queue(packet, &txn.queue_tx).is_ok() {
                        txn.outstanding += 1;
                        sent = true;
                        break;
                    }
                }
            }
            if !sent {
                return Err(Error::Storage("no storage answered undo query".into()));
            }
        }
        if let Err(e) = self.wait_replies(txn).await {
            // Objects from the undone transaction no longer exist, which is
            // the signature of a pack.
            return match e {
                Error::OidNotFound(_) => Err(Error::Undo("non-undoable transaction".into())),
                e => Err(e),
            };
        }
        for oid in &oids {
            let undo = txn.undo_serials.get(oid).copied().ok_or_else(|| {
                Error::Undo(format!("storage reported no undo serial for {oid}"))
            })?;
            if undo.is_current {
                // Target is the latest revision: write a back-pointer.
                self._store(txn, *oid, undo.current_serial, None, undo.undo_serial)
                    .await?;
            } else {
                let undo_serial = undo
                    .undo_serial
                    .ok_or_else(|| Error::Undo("object creation cannot be re-undone".into()))?;
                let current_data = self.load_serial(txn, *oid, undo.current_serial).await?;
                let undo_data = self.load_serial(txn, *oid, undo_serial).await?;
                let merged = resolver
                    .resolve_undo(*oid, undo.current_serial, undone_tid, &undo_data, &current_data)
                    .ok_or_else(|| {
                        Error::Undo("some data were modified by a later transaction".into())
                    })?;
                self._store(txn, *oid, undo.current_serial, Some(merged), None)
                    .await?;
            }
        }
        Ok(oids)
    }

    async fn transaction_information(&self, tid: Tid) -> Result<TransactionInfo> {
        let partition = self.pt.lock().unwrap().partition_of_tid(tid);
        let cells = self.pt.lock().unwrap().readable_cells(partition);
        let cells = self.ordered_cells(cells).await;
        let mut missing = false;
        for cell in cells {
            let Ok(conn) = self.conn_for_cell(cell.node).await else {
                continue;
            };
            match conn.ask(Packet::AskTransactionInformation { tid }).await {
                Ok(Packet::AnswerTransactionInformation {
                    tid,
                    user,
                    description,
                    extension,
                    oids,
                }) => {
                    return Ok(TransactionInfo {
                        tid,
                        user,
                        description,
                        extension,
                        oids,
                    });
                }
                Ok(_) => continue,
                Err(Error::TidNotFound(_)) => {
                    warn!(%tid, node = %cell.node, "transaction not on this node");
                    missing = true;
                }
                Err(_) => continue,
            }
        }
        if missing {
            Err(Error::TidNotFound(format!("{tid} not found")))
        } else {
            Err(Error::Storage("no storage answered".into()))
        }
    }

    /// Recent revisions of one object with their transaction metadata.
    pub async fn history(&self, oid: Oid, size: u64) -> Result<Vec<HistoryEntry>> {
        let cells = self.pt.lock().unwrap().readable_cells_for_oid(oid);
        let cells = self.ordered_cells(cells).await;
        let mut revisions = None;
        for cell in cells {
            let Ok(conn) = self.conn_for_cell(cell.node).await else {
                continue;
            };
            match conn
                .ask(Packet::AskObjectHistory {
                    oid,
                    first: 0,
                    last: size,
                })
                .await
            {
                Ok(Packet::AnswerObjectHistory {
                    oid: answered_oid,
                    history,
                }) => {
                    if answered_oid != oid {
                        return Err(Error::Storage("history for the wrong oid".into()));
                    }
                    revisions = Some(history);
                    break;
                }
                _ => continue,
            }
        }
        let revisions = revisions.ok_or_else(|| Error::Storage("history failed".into()))?;
        if revisions.is_empty() {
            return Err(Error::OidNotFound(format!("{oid} has no history")));
        }
        let mut entries = Vec::with_capacity(revisions.len());
        for (tid, size) in revisions {
            let info = self.transaction_information(tid).await?;
            entries.push(HistoryEntry {
                tid,
                size,
                user: info.user,
                description: info.description,
            });
        }
        Ok(entries)
    }

    /// Committed transactions, newest first, across all storages.
    pub async fn undo_log(&self, first: u64, last: u64) -> Result<Vec<TransactionInfo>> {
        self.master().await?;
        let storages: Vec<NodeId> = {
            let nm = self.nm.lock().unwrap();
            nm.storages()
                .filter(|n| n.is_running())
                .filter_map(|n| n.id)
                .collect()
        };
        let mut tids: BTreeSet<Tid> = BTreeSet::new();
        for node in storages {
            let Ok(conn) = self.conn_for_cell(node).await else {
                continue;
            };
            if let Ok(Packet::AnswerTids { tids: node_tids }) = conn
                .ask(Packet::AskTids {
                    first,
                    last,
                    partition: None,
                })
                .await
            {
                tids.extend(node_tids);
            }
        }
        let mut infos = Vec::new();
        for tid in tids.into_iter().rev() {
            if infos.len() as u64 >= last.saturating_sub(first) {
                break;
            }
            match self.transaction_information(tid).await {
                Ok(info) => infos.push(info),
                Err(Error::TidNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(infos)
    }

    /// Prune object history at or before `tid` cluster-wide.
    pub async fn pack(&self, tid: Tid) -> Result<()> {
        if tid.is_zero() {
            return Err(Error::Storage("invalid pack time".into()));
        }
        match self.ask_primary(Packet::AskPack { tid }).await? {
            Packet::AnswerPack { status: true } => {}
            Packet::AnswerPack { status: false } => {
                return Err(Error::Storage("pack failed on some storage".into()));
            }
            _ => return Err(Error::Protocol("expected AnswerPack".into())),
        }
        self.cache.lock().unwrap().clear();
        Ok(())
    }

    /// Latest serial cached or fetched for an oid; storage answers when the
    /// cache cannot.
    pub async fn last_serial(&self, txn: &mut TxnContext, oid: Oid) -> Result<Tid> {
        let (_, tid) = self.load(txn, oid).await?;
        Ok(tid)
    }
}

enum Found {
    Primary(Connection),
    Redirect(SocketAddr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_stores_raw_when_not_smaller() {
        // Tiny high-entropy payloads do not compress.
        let data = b"\x01\xfe\x02";
        let (payload, compressed) = compress_payload(data);
        assert!(!compressed);
        assert_eq!(payload, data);

        let repetitive = vec![b'a'; 4096];
        let (payload, compressed) = compress_payload(&repetitive);
        assert!(compressed);
        assert!(payload.len() < repetitive.len());
        assert_eq!(decompress_payload(&payload).unwrap(), repetitive);
    }
}
