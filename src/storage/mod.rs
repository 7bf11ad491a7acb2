//! Storage node: owns a subset of partitions, serves object reads, accepts
//! writes under locks, and restores consistency through verification and
//! replication.

pub mod database;
pub mod locking;
pub mod replicator;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::{
    accept_loop, error_to_wire, ConnEvent, Connection, ConnectionOptions, ErrorCode, LockStatus,
    MsgId, Packet, UndoSerial,
};
use crate::node::NodeManager;
use crate::partition::PartitionTable;
use crate::types::{CellState, ClusterState, NodeId, NodeType, Oid, Tid};
use database::{serial_mismatch, Database, ObjectRow, TransactionRow};
use locking::LockManager;
use replicator::{ReplicationJob, Replicator};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

enum StorageEvent {
    Net(ConnEvent),
    ReplicationFinished { partition: u32, ok: bool },
    Tick,
}

enum Found {
    Primary(Connection),
    Redirect(SocketAddr),
}

pub struct Storage {
    config: Config,
    db: Arc<dyn Database>,
    id: Option<NodeId>,
    addr: SocketAddr,
    listener: Option<TcpListener>,
    nm: NodeManager,
    pt: PartitionTable,
    cluster_state: ClusterState,
    operational: bool,
    locks: LockManager,
    replicator: Replicator,
    master_conn: Option<Connection>,
    peers: HashMap<u64, Connection>,
    events_tx: mpsc::UnboundedSender<StorageEvent>,
    events_rx: mpsc::UnboundedReceiver<StorageEvent>,
    net_tx: crate::net::EventSink,
}

impl Storage {
    pub async fn bind(config: Config, db: Arc<dyn Database>) -> Result<Storage> {
        let listener = TcpListener::bind(config.listen).await?;
        let addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (net_tx, mut net_rx) = mpsc::unbounded_channel();
        let forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = net_rx.recv().await {
                if forward.send(StorageEvent::Net(event)).is_err() {
                    break;
                }
            }
        });
        let partitions = config.partitions;
        Ok(Storage {
            id: config.node_id,
            addr,
            listener: Some(listener),
            nm: NodeManager::new(),
            pt: PartitionTable::new(partitions),
            cluster_state: ClusterState::Recovering,
            operational: false,
            locks: LockManager::new(),
            replicator: Replicator::new(),
            master_conn: None,
            peers: HashMap::new(),
            events_tx,
            events_rx,
            net_tx,
            config,
            db,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn conn_opts(&self) -> ConnectionOptions {
        ConnectionOptions {
            ping_delay: self.config.ping_delay,
            ping_timeout: self.config.ping_timeout,
            on_notification: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        // Restore persisted identity and table before talking to anyone.
        if self.id.is_none() {
            self.id = self.db.get_uuid()?;
        }
        let (ptid, cells) = self.db.get_partition_table()?;
        if !ptid.is_zero() {
            self.pt.restore(ptid, &cells);
        }
        info!(addr = %self.addr, id = ?self.id, "storage starting");
        let listener = self.listener.take().expect("bind() prepared the listener");
        accept_loop(listener, self.net_tx.clone(), self.conn_opts());
        let tick = self.events_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if tick.send(StorageEvent::Tick).is_err() {
                    break;
                }
            }
        });
        loop {
            let master = self.connect_and_bootstrap().await?;
            self.master_conn = Some(master);
            while let Some(event) = self.events_rx.recv().await {
                if !self.handle_event(event) {
                    break;
                }
            }
            // Primary lost: all client service stops until re-identified.
            warn!("connection to primary master lost");
            self.operational = false;
            self.master_conn = None;
            for conn in self.peers.values() {
                conn.close();
            }
            self.peers.clear();
            self.locks = LockManager::new();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Find the primary master, identify, and pull the bootstrap snapshot.
    async fn connect_and_bootstrap(&mut self) -> Result<Connection> {
        loop {
            let mut candidates = self.config.master_nodes.clone();
            let mut redirected = true;
            while redirected {
                redirected = false;
                for addr in candidates.clone() {
                    match self.try_master(addr).await {
                        Ok(Found::Primary(conn)) => match self.bootstrap(&conn).await {
                            Ok(()) => return Ok(conn),
                            Err(e) => {
                                debug!(error = %e, "bootstrap failed, retrying");
                                conn.close();
                            }
                        },
                        Ok(Found::Redirect(primary_addr)) => {
                            candidates = vec![primary_addr];
                            redirected = true;
                            break;
                        }
                        Err(e) => {
                            debug!(%addr, error = %e, "master candidate failed");
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn try_master(&mut self, addr: SocketAddr) -> Result<Found> {
        let conn = Connection::connect(addr, self.net_tx.clone(), self.conn_opts()).await?;
        let answer = conn
            .ask(Packet::RequestIdentification {
                node_type: NodeType::Storage,
                id: self.id,
                addr: Some(self.addr),
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
            if self.id != Some(assigned) {
                self.id = Some(assigned);
                self.db.set_uuid(assigned)?;
                info!(id = %assigned, "identity assigned by primary");
            }
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

    async fn bootstrap(&mut self, master: &Connection) -> Result<()> {
        master.ask(Packet::AskNodeInformation).await?;
        let answer = master.ask(Packet::AskPartitionTable).await?;
        if let Packet::AnswerPartitionTable { ptid, rows } = answer {
            if !ptid.is_zero() && ptid > self.pt.ptid() {
                self.pt.load(ptid, &rows);
                self.persist_table()?;
            }
        }
        info!(id = ?self.id, ptid = %self.pt.ptid(), "storage bootstrapped");
        Ok(())
    }

    fn persist_table(&self) -> Result<()> {
        let changes: Vec<crate::partition::CellChange> = self
            .pt
            .rows()
            .iter()
            .flat_map(|(partition, cells)| {
                cells.iter().map(|cell| crate::partition::CellChange {
                    partition: *partition,
                    node: cell.node,
                    state: cell.state,
                })
            })
            .collect();
        self.db.change_partition_table(self.pt.ptid(), &changes)
    }

    /// Returns false when the primary connection is gone and the outer loop
    /// must reconnect.
    fn handle_event(&mut self, event: StorageEvent) -> bool {
        match event {
            StorageEvent::Net(ConnEvent::Packet { conn, msg_id, packet }) => {
                self.handle_packet(conn, msg_id, packet);
            }
            StorageEvent::Net(ConnEvent::Closed { conn }) => {
                if self.master_conn.as_ref() == Some(&conn) {
                    return false;
                }
                self.peers.remove(&conn.cid());
            }
            StorageEvent::ReplicationFinished { partition, ok } => {
                self.replicator.finished(partition, ok);
                // Failures wait for the next tick before retrying.
                if ok {
                    self.maybe_replicate();
                }
            }
            StorageEvent::Tick => {
                self.expire_delayed();
                self.maybe_replicate();
            }
        }
        true
    }

    fn is_master(&self, conn: &Connection) -> bool {
        self.master_conn.as_ref() == Some(conn)
    }

    fn handle_packet(&mut self, conn: Connection, msg_id: MsgId, packet: Packet) {
        // Identification must be the first packet on every connection.
        if !matches!(packet, Packet::RequestIdentification { .. })
            && !self.is_master(&conn)
            && !self.peers.contains_key(&conn.cid())
        {
            error!(conn = ?conn, kind = packet.kind().name(), "packet before identification");
            conn.answer_error(msg_id, ErrorCode::ProtocolError, "identify first");
            conn.close();
            return;
        }
        match packet {
            // Error replies to requests this loop issued itself.
            Packet::Error { code, message } => {
                warn!(conn = ?conn, ?code, message, "peer reported an error");
            }
            Packet::RequestIdentification {
                node_type,
                cluster_name,
                ..
            } => {
                if cluster_name != self.config.cluster_name {
                    error!(conn = ?conn, "rejecting alien cluster");
                    conn.answer_error(msg_id, ErrorCode::ProtocolError, "invalid cluster name");
                    conn.close();
                    return;
                }
                if !self.operational && node_type == NodeType::Client {
                    conn.answer_error(msg_id, ErrorCode::NotReady, "storage not operational");
                    conn.close();
                    return;
                }
                self.peers.insert(conn.cid(), conn.clone());
                debug!(conn = ?conn, %node_type, "peer identified");
                conn.answer(
                    msg_id,
                    Packet::AcceptIdentification {
                        node_type: NodeType::Storage,
                        id: self.id,
                        partitions: self.config.partitions,
                        replicas: self.config.replicas,
                        your_id: None,
                    },
                );
            }

            // Master-driven control plane.
            Packet::AskLastIds if self.is_master(&conn) => match self.db.get_last_ids() {
                Ok((last_tid, ptid, last_oid)) => conn.answer(
                    msg_id,
                    Packet::AnswerLastIds {
                        last_oid,
                        last_tid,
                        ptid,
                    },
                ),
                Err(e) => self.answer_err(&conn, msg_id, &e),
            },
            Packet::AskUnfinishedTransactions if self.is_master(&conn) => {
                match self.db.get_unfinished_tids() {
                    Ok(tids) => conn.answer(msg_id, Packet::AnswerUnfinishedTransactions { tids }),
                    Err(e) => self.answer_err(&conn, msg_id, &e),
                }
            }
            Packet::AskPartitionTable => {
                conn.answer(
                    msg_id,
                    Packet::AnswerPartitionTable {
                        ptid: self.pt.ptid(),
                        rows: self.pt.rows(),
                    },
                );
            }
            Packet::LockInformation { tid } if self.is_master(&conn) => {
                self.locks.lock_transaction(tid);
                conn.answer(msg_id, Packet::AnswerInformationLocked { tid });
            }
            Packet::NotifyUnlockInformation { tid } if self.is_master(&conn) => {
                if let Err(e) = self.db.finish_transaction(tid) {
                    error!(%tid, error = %e, "finish failed");
                }
                self.replay_released(tid);
            }
            Packet::CommitTransaction { tid } if self.is_master(&conn) => {
                if let Err(e) = self.db.finish_transaction(tid) {
                    error!(%tid, error = %e, "commit during verification failed");
                }
            }
            Packet::DeleteTransaction { tid } if self.is_master(&conn) => {
                if let Err(e) = self.db.delete_transaction(tid) {
                    error!(%tid, error = %e, "delete during verification failed");
                }
            }
            Packet::SendPartitionTable { ptid, rows } if self.is_master(&conn) => {
                if ptid > self.pt.ptid() {
                    self.pt.load(ptid, &rows);
                    if let Err(e) = self.persist_table() {
                        error!(error = %e, "persisting partition table failed");
                    }
                    self.sync_replicator();
                }
            }
            Packet::NotifyPartitionChanges { ptid, changes } => {
                if self.pt.update(ptid, &changes).is_ok() {
                    if let Err(e) = self.db.change_partition_table(ptid, &changes) {
                        error!(error = %e, "persisting partition changes failed");
                    }
                    self.sync_replicator();
                } else {
                    debug!(%ptid, "ignoring stale partition changes");
                }
            }
            Packet::NotifyNodeInformation { nodes } => {
                self.nm.update(&nodes);
            }
            Packet::NotifyClusterInformation { state } => {
                info!(%state, "cluster state change");
                self.cluster_state = state;
                if state != ClusterState::Running {
                    self.operational = false;
                }
                self.maybe_replicate();
            }
            Packet::StartOperation if self.is_master(&conn) => {
                info!("entering operational state");
                self.operational = true;
                self.cluster_state = ClusterState::Running;
                self.sync_replicator();
            }
            Packet::StopOperation if self.is_master(&conn) => {
                warn!("leaving operational state");
                self.operational = false;
                for peer in self.peers.values() {
                    peer.close();
                }
                self.peers.clear();
            }
            Packet::NotifyLastOid { oid } => {
                if let Err(e) = self.db.set_last_oid(oid) {
                    error!(error = %e, "persisting last oid failed");
                }
            }
            Packet::AskPack { tid } if self.is_master(&conn) => {
                let status = match self.db.pack(tid) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(error = %e, "pack failed");
                        false
                    }
                };
                conn.answer(msg_id, Packet::AnswerPack { status });
            }

            // Client and replication-peer service.
            Packet::AskObject {
                oid,
                at_tid,
                before_tid,
            } => {
                if at_tid.is_none() && self.locks.load_locked(oid) {
                    self.locks.delay(
                        oid,
                        conn,
                        msg_id,
                        Packet::AskObject {
                            oid,
                            at_tid,
                            before_tid,
                        },
                    );
                    return;
                }
                match self.db.get_object(oid, at_tid, before_tid) {
                    Ok(Some(row)) => conn.answer(
                        msg_id,
                        Packet::AnswerObject {
                            oid: row.oid,
                            serial_start: row.tid,
                            serial_end: row.next_tid,
                            compression: row.compression,
                            checksum: row.checksum,
                            data: row.data,
                            data_tid: row.data_tid,
                        },
                    ),
                    Ok(None) => conn.answer_error(
                        msg_id,
                        ErrorCode::OidNotFound,
                        format!("{oid} at {at_tid:?} before {before_tid:?} does not exist"),
                    ),
                    Err(e) => self.answer_err(&conn, msg_id, &e),
                }
            }
            packet @ (Packet::AskStoreObject { .. } | Packet::AskCheckCurrentSerial { .. }) => {
                self.handle_store(conn, msg_id, packet);
            }
            Packet::AskStoreTransaction {
                tid,
                user,
                description,
                extension,
                oids,
            } => {
                let row = TransactionRow {
                    tid,
                    oids,
                    user,
                    description,
                    extension,
                };
                match self.db.store_transaction(tid, &[], Some(&row), true) {
                    Ok(()) => conn.answer(msg_id, Packet::AnswerStoreTransaction { tid }),
                    Err(e) => self.answer_err(&conn, msg_id, &e),
                }
            }
            Packet::AbortTransaction { tid } => {
                if let Err(e) = self.db.delete_transaction(tid) {
                    error!(%tid, error = %e, "abort cleanup failed");
                }
                self.replay_released(tid);
            }
            Packet::AskTids {
                first,
                last,
                partition,
            } => {
                let partitions = match partition {
                    Some(p) => vec![p],
                    None => self.readable_partitions(),
                };
                match self
                    .db
                    .get_tid_list(first, last, &partitions, self.config.partitions)
                {
                    Ok(tids) => conn.answer(msg_id, Packet::AnswerTids { tids }),
                    Err(e) => self.answer_err(&conn, msg_id, &e),
                }
            }
            Packet::AskTransactionInformation { tid } => {
                match self.db.get_transaction(tid, true) {
                    Ok(Some(row)) => conn.answer(
                        msg_id,
                        Packet::AnswerTransactionInformation {
                            tid: row.tid,
                            user: row.user,
                            description: row.description,
                            extension: row.extension,
                            oids: row.oids,
                        },
                    ),
                    Ok(None) => conn.answer_error(
                        msg_id,
                        ErrorCode::TidNotFound,
                        format!("{tid} does not exist"),
                    ),
                    Err(e) => self.answer_err(&conn, msg_id, &e),
                }
            }
            Packet::AskObjectHistory { oid, first, last } => {
                match self.db.get_object_history(oid, first, last) {
                    Ok(history) => {
                        conn.answer(msg_id, Packet::AnswerObjectHistory { oid, history })
                    }
                    Err(e) => self.answer_err(&conn, msg_id, &e),
                }
            }
            Packet::AskObjectUndoSerial {
                tid: _,
                undone_tid,
                oids,
            } => {
                self.handle_undo_serial(conn, msg_id, undone_tid, oids);
            }
            Packet::AskHasLock { tid, oid } => {
                let status = match self.locks.holder(oid) {
                    None => LockStatus::NotLocked,
                    Some(holder) if holder == tid => LockStatus::Granted,
                    Some(_) => LockStatus::GrantedToOther,
                };
                conn.answer(msg_id, Packet::AnswerHasLock { oid, status });
            }
            Packet::AskObjectPresent { oid, tid } => match self.db.object_present(oid, tid) {
                Ok(true) => conn.answer(msg_id, Packet::AnswerObjectPresent { oid, tid }),
                Ok(false) => conn.answer_error(
                    msg_id,
                    ErrorCode::OidNotFound,
                    format!("{oid}:{tid} do not exist"),
                ),
                Err(e) => self.answer_err(&conn, msg_id, &e),
            },

            other => {
                error!(conn = ?conn, kind = other.kind().name(), "unexpected packet");
                conn.answer_error(msg_id, ErrorCode::ProtocolError, "unexpected packet");
                conn.close();
            }
        }
    }

    fn handle_store(&mut self, conn: Connection, msg_id: MsgId, packet: Packet) {
        let (oid, serial, tid) = match &packet {
            Packet::AskStoreObject {
                oid, serial, tid, ..
            } => (*oid, *serial, *tid),
            Packet::AskCheckCurrentSerial { oid, serial, tid } => (*oid, *serial, *tid),
            _ => unreachable!("handle_store only sees store packets"),
        };
        if !self.operational {
            conn.answer_error(msg_id, ErrorCode::NotReady, "storage not operational");
            return;
        }
        if self.locks.delay_reason(oid, tid).is_some() {
            self.locks.delay(oid, conn, msg_id, packet);
            return;
        }
        let current = match self.db.get_object(oid, None, None) {
            Ok(current) => current,
            Err(e) => {
                self.answer_err(&conn, msg_id, &e);
                return;
            }
        };
        if let Some(conflict) = serial_mismatch(current.as_ref(), serial) {
            debug!(%oid, %serial, %conflict, "store conflict");
            conn.answer(
                msg_id,
                Packet::AnswerStoreObject {
                    conflicting: true,
                    oid,
                    serial: conflict,
                },
            );
            return;
        }
        self.locks.lock(oid, tid);
        if let Packet::AskStoreObject {
            compression,
            checksum,
            data,
            data_tid,
            ..
        } = packet
        {
            let row = ObjectRow {
                oid,
                tid,
                next_tid: None,
                compression,
                checksum,
                data,
                data_tid,
            };
            if let Err(e) = self.db.store_transaction(tid, &[row], None, true) {
                self.answer_err(&conn, msg_id, &e);
                return;
            }
        }
        conn.answer(
            msg_id,
            Packet::AnswerStoreObject {
                conflicting: false,
                oid,
                serial,
            },
        );
    }

    fn handle_undo_serial(
        &mut self,
        conn: Connection,
        msg_id: MsgId,
        undone_tid: Tid,
        oids: Vec<Oid>,
    ) {
        let mut serials = Vec::with_capacity(oids.len());
        for oid in oids {
            let undone = match self.db.get_object(oid, Some(undone_tid), None) {
                Ok(row) => row,
                Err(e) => return self.answer_err(&conn, msg_id, &e),
            };
            if undone.is_none() {
                conn.answer_error(
                    msg_id,
                    ErrorCode::OidNotFound,
                    format!("{oid} has no revision at {undone_tid}"),
                );
                return;
            }
            let current = match self.db.get_object(oid, None, None) {
                Ok(Some(row)) => row,
                Ok(None) => {
                    conn.answer_error(msg_id, ErrorCode::OidNotFound, format!("{oid} vanished"));
                    return;
                }
                Err(e) => return self.answer_err(&conn, msg_id, &e),
            };
            let previous = match self.db.get_object(oid, None, Some(undone_tid)) {
                Ok(row) => row,
                Err(e) => return self.answer_err(&conn, msg_id, &e),
            };
            serials.push((
                oid,
                UndoSerial {
                    current_serial: current.tid,
                    undo_serial: previous.map(|row| row.data_tid.unwrap_or(row.tid)),
                    is_current: current.tid == undone_tid,
                },
            ));
        }
        conn.answer(msg_id, Packet::AnswerObjectUndoSerial { serials });
    }

    /// Replay requests parked behind a transaction's locks.
    fn replay_released(&mut self, tid: Tid) {
        for delayed in self.locks.release(tid) {
            if delayed.conn.is_closed() {
                continue;
            }
            self.handle_packet(delayed.conn, delayed.msg_id, delayed.packet);
        }
    }

    /// Answer parked requests that waited too long.
    fn expire_delayed(&mut self) {
        for (holder, delayed) in self.locks.expired(Instant::now()) {
            match &delayed.packet {
                Packet::AskStoreObject { oid, .. } | Packet::AskCheckCurrentSerial { oid, .. } => {
                    warn!(oid = %oid, "delayed store expired, answering conflict");
                    delayed.conn.answer(
                        delayed.msg_id,
                        Packet::AnswerStoreObject {
                            conflicting: true,
                            oid: *oid,
                            serial: holder.unwrap_or(Tid::ZERO),
                        },
                    );
                }
                _ => {
                    delayed.conn.answer_error(
                        delayed.msg_id,
                        ErrorCode::NotReady,
                        "object locked for too long",
                    );
                }
            }
        }
    }

    fn readable_partitions(&self) -> Vec<u32> {
        let Some(id) = self.id else {
            return Vec::new();
        };
        let mut partitions = self.pt.partitions_in_state(id, CellState::UpToDate);
        partitions.extend(self.pt.partitions_in_state(id, CellState::Feeding));
        partitions.sort_unstable();
        partitions.dedup();
        partitions
    }

    fn sync_replicator(&mut self) {
        if let Some(id) = self.id {
            let outdated = self.pt.partitions_in_state(id, CellState::OutOfDate);
            self.replicator.update(outdated.into_iter());
        }
        self.maybe_replicate();
    }

    fn maybe_replicate(&mut self) {
        if self.cluster_state != ClusterState::Running {
            return;
        }
        let (Some(id), Some(master)) = (self.id, self.master_conn.clone()) else {
            return;
        };
        let Some(partition) = self.replicator.next_partition() else {
            return;
        };
        let sources: Vec<SocketAddr> = self
            .pt
            .cells(partition)
            .iter()
            .filter(|cell| cell.state == CellState::UpToDate && cell.node != id)
            .filter_map(|cell| self.nm.by_id(cell.node).and_then(|n| n.addr))
            .collect();
        if sources.is_empty() {
            debug!(partition, "no replication source available yet");
            self.replicator.finished(partition, false);
            return;
        }
        let job = ReplicationJob {
            partition,
            num_partitions: self.config.partitions,
            self_id: id,
            cluster_name: self.config.cluster_name.clone(),
            listen: self.addr,
            sources,
            master,
            db: self.db.clone(),
            opts: self.conn_opts(),
        };
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let partition = job.partition;
            let ok = match replicator::replicate(job).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(partition, error = %e, "replication attempt failed");
                    false
                }
            };
            let _ = events.send(StorageEvent::ReplicationFinished { partition, ok });
        });
    }

    fn answer_err(&self, conn: &Connection, msg_id: MsgId, err: &Error) {
        let (code, message) = error_to_wire(err);
        conn.answer_error(msg_id, code, message);
    }
}
