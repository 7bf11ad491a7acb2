//! Master node: election, cluster state machine, id allocation, and
//! two-phase commit orchestration.

pub mod election;
pub mod recovery;
pub mod transactions;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::{
    accept_loop, ConnEvent, Connection, ConnectionOptions, ErrorCode, MsgId, Packet,
};
use crate::node::{Node, NodeInfo, NodeManager};
use crate::partition::{CellChange, PartitionTable};
use crate::types::{
    ClusterState, NodeId, NodeState, NodeType, Oid, Ptid, Tid, TidClock,
};
use election::{Election, ElectionResult, ProbeOutcome};
use recovery::RecoveryManager;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use transactions::TransactionManager;

/// Default OID batch handed to clients per `AskNewOids`.
pub const OID_BATCH: u32 = 100;

enum MasterEvent {
    Net(ConnEvent),
    Probe(ProbeOutcome),
    RestartElection,
}

#[derive(Debug)]
enum Role {
    Electing(Election),
    Primary,
    Secondary { primary: NodeId, primary_cid: u64 },
}

struct PeerConn {
    conn: Connection,
    id: Option<NodeId>,
    node_type: Option<NodeType>,
}

struct PackState {
    client_cid: u64,
    msg_id: MsgId,
    waiting: HashSet<NodeId>,
    ok: bool,
}

pub struct Master {
    config: Config,
    id: NodeId,
    addr: SocketAddr,
    listener: Option<TcpListener>,
    nm: NodeManager,
    pt: PartitionTable,
    cluster_state: ClusterState,
    clock: TidClock,
    last_oid: Oid,
    tm: TransactionManager,
    rm: RecoveryManager,
    role: Role,
    conns: HashMap<u64, PeerConn>,
    /// Storage asked for its partition table during recovery, if any.
    recovering_pt_from: Option<NodeId>,
    pack: Option<PackState>,
    events_tx: mpsc::UnboundedSender<MasterEvent>,
    events_rx: mpsc::UnboundedReceiver<MasterEvent>,
    net_tx: crate::net::EventSink,
}

impl Master {
    /// Bind the listen socket. The master id comes from the config or is
    /// self-assigned; masters never wait for another node to name them.
    pub async fn bind(config: Config) -> Result<Master> {
        let listener = TcpListener::bind(config.listen).await?;
        let addr = listener.local_addr()?;
        let id = config
            .node_id
            .unwrap_or_else(|| NodeId::new(rand::random::<u64>() | 1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (net_tx, mut net_rx) = mpsc::unbounded_channel();
        let forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = net_rx.recv().await {
                if forward.send(MasterEvent::Net(event)).is_err() {
                    break;
                }
            }
        });
        let partitions = config.partitions;
        Ok(Master {
            id,
            addr,
            listener: Some(listener),
            nm: NodeManager::new(),
            pt: PartitionTable::new(partitions),
            cluster_state: ClusterState::Recovering,
            clock: TidClock::new(),
            last_oid: Oid::ZERO,
            tm: TransactionManager::new(),
            rm: RecoveryManager::new(),
            role: Role::Electing(Election::default()),
            conns: HashMap::new(),
            recovering_pt_from: None,
            pack: None,
            events_tx,
            events_rx,
            net_tx,
            config,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn conn_opts(&self) -> ConnectionOptions {
        ConnectionOptions {
            ping_delay: self.config.ping_delay,
            ping_timeout: self.config.ping_timeout,
            on_notification: None,
        }
    }

    /// Run the master until the task is cancelled or the listener dies.
    pub async fn run(mut self) -> Result<()> {
        info!(id = %self.id, addr = %self.addr, "master starting");
        let listener = self.listener.take().expect("bind() prepared the listener");
        accept_loop(listener, self.net_tx.clone(), self.conn_opts());
        self.nm.identify(NodeType::Master, self.id, Some(self.addr));
        self.nm.set_state(self.id, NodeState::Running);
        self.start_election();
        while let Some(event) = self.events_rx.recv().await {
            match event {
                MasterEvent::Net(ConnEvent::Packet { conn, msg_id, packet }) => {
                    self.handle_packet(conn, msg_id, packet);
                }
                MasterEvent::Net(ConnEvent::Closed { conn }) => {
                    self.handle_closed(conn);
                }
                MasterEvent::Probe(outcome) => {
                    self.handle_probe(outcome);
                }
                MasterEvent::RestartElection => {
                    self.start_election();
                }
            }
        }
        Ok(())
    }

    // -- election ----------------------------------------------------------

    fn start_election(&mut self) {
        info!(id = %self.id, "starting primary election");
        // Drop previous master peer links; their probes will rebuild them.
        for peer in self.conns.values() {
            if peer.node_type == Some(NodeType::Master) {
                peer.conn.close();
            }
        }
        let peers: Vec<SocketAddr> = self
            .config
            .master_nodes
            .iter()
            .copied()
            .filter(|addr| *addr != self.addr)
            .collect();
        let election = Election::start(peers.iter().copied());
        for addr in peers {
            let tx = self.events_tx.clone();
            let sink = self.net_tx.clone();
            let opts = self.conn_opts();
            let cluster_name = self.config.cluster_name.clone();
            let (self_id, listen) = (self.id, self.addr);
            tokio::spawn(async move {
                let outcome =
                    match election::probe_master(addr, cluster_name, self_id, listen, sink, opts)
                        .await
                    {
                        Ok((conn, id, claimed_primary, known_masters)) => {
                            ProbeOutcome::Identified {
                                addr,
                                id,
                                conn,
                                claimed_primary,
                                known_masters,
                            }
                        }
                        Err(e) => {
                            debug!(%addr, error = %e, "master probe failed");
                            ProbeOutcome::Unreachable { addr }
                        }
                    };
                let _ = tx.send(MasterEvent::Probe(outcome));
            });
        }
        self.role = Role::Electing(election);
        self.maybe_decide_election();
    }

    fn handle_probe(&mut self, outcome: ProbeOutcome) {
        if let ProbeOutcome::Identified {
            addr,
            id,
            ref conn,
            ..
        } = outcome
        {
            self.nm.identify(NodeType::Master, id, Some(addr));
            self.nm.set_state(id, NodeState::Running);
            self.conns.insert(
                conn.cid(),
                PeerConn {
                    conn: conn.clone(),
                    id: Some(id),
                    node_type: Some(NodeType::Master),
                },
            );
        }
        if let Role::Electing(election) = &mut self.role {
            election.record(outcome);
            self.maybe_decide_election();
        }
    }

    fn maybe_decide_election(&mut self) {
        let Role::Electing(election) = &self.role else {
            return;
        };
        if !election.is_settled() {
            return;
        }
        match election.decide(self.id) {
            ElectionResult::Primary => self.become_primary(),
            ElectionResult::Secondary { primary } => self.become_secondary(primary),
            ElectionResult::Conflict => {
                warn!("conflicting primary claims, forcing reelection");
                self.broadcast_masters(Packet::ReelectPrimary);
                self.schedule_reelection();
            }
        }
    }

    fn become_primary(&mut self) {
        info!(id = %self.id, "elected primary master");
        if let Role::Electing(election) = &self.role {
            for (_, peer) in election.peers() {
                peer.conn.notify(Packet::AnnouncePrimary);
            }
        }
        self.role = Role::Primary;
        self.cluster_state = ClusterState::Recovering;
        self.rm.start(std::iter::empty::<NodeId>());
        // Storages identified before the election settled take part in
        // recovery immediately.
        let storages: Vec<(NodeId, u64)> = self
            .conns
            .iter()
            .filter_map(|(cid, p)| match (p.node_type, p.id) {
                (Some(NodeType::Storage), Some(id)) => Some((id, *cid)),
                _ => None,
            })
            .collect();
        for (id, cid) in storages {
            self.rm.expect(id);
            if let Some(peer) = self.conns.get(&cid) {
                peer.conn.send_request(Packet::AskLastIds);
            }
        }
    }

    fn become_secondary(&mut self, primary: NodeId) {
        let primary_cid = match &self.role {
            Role::Electing(election) => election.peer(primary).map(|p| p.conn.cid()),
            _ => None,
        };
        match primary_cid {
            Some(primary_cid) => {
                info!(id = %self.id, %primary, "acting as secondary master");
                self.role = Role::Secondary {
                    primary,
                    primary_cid,
                };
            }
            None => {
                // The winner is known only by rumor; probe again until a
                // live connection to it exists.
                warn!(%primary, "primary not reachable, retrying election");
                self.schedule_reelection();
            }
        }
    }

    fn schedule_reelection(&mut self) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            let _ = tx.send(MasterEvent::RestartElection);
        });
    }

    fn current_primary(&self) -> Option<NodeId> {
        match &self.role {
            Role::Primary => Some(self.id),
            Role::Secondary { primary, .. } => Some(*primary),
            Role::Electing(_) => None,
        }
    }

    fn is_primary(&self) -> bool {
        matches!(self.role, Role::Primary)
    }

    // -- connection lifecycle ---------------------------------------------

    fn handle_closed(&mut self, conn: Connection) {
        let Some(peer) = self.conns.remove(&conn.cid()) else {
            if let Role::Secondary { primary_cid, .. } = self.role {
                if primary_cid == conn.cid() {
                    error!("primary master connection lost, reelecting");
                    self.start_election();
                }
            }
            return;
        };
        if let Role::Secondary { primary_cid, .. } = self.role {
            if primary_cid == conn.cid() {
                error!("primary master connection lost, reelecting");
                self.start_election();
                return;
            }
        }
        let (Some(id), Some(node_type)) = (peer.id, peer.node_type) else {
            return;
        };
        match node_type {
            NodeType::Storage => self.storage_lost(id),
            NodeType::Client => self.client_lost(id, conn.cid()),
            NodeType::Master | NodeType::Admin => {
                self.nm.set_state(id, NodeState::TemporarilyDown);
            }
        }
    }

    fn storage_lost(&mut self, id: NodeId) {
        warn!(storage = %id, "storage node lost");
        self.nm.set_state(id, NodeState::TemporarilyDown);
        if !self.is_primary() {
            return;
        }
        self.rm.forget(id);
        let changes = self.pt.outdate(id);
        if !changes.is_empty() {
            let ptid = self.pt.bump();
            self.broadcast_partition_changes(ptid, &changes);
        }
        self.broadcast_node_info();
        // In-flight commits waiting on this storage either proceed on the
        // surviving cells or abort.
        for tid in self.tm.touching(id) {
            let Some(txn) = self.tm.get_mut(tid) else { continue };
            txn.touched.remove(&id);
            let covered = {
                let txn = self.tm.get(tid).unwrap();
                txn.oids.iter().all(|oid| {
                    self.pt
                        .writable_cells_for_oid(*oid)
                        .iter()
                        .any(|cell| txn.touched.contains(&cell.node))
                })
            };
            if !covered {
                self.abort_transaction(tid, "storage lost mid-commit");
            } else if self.tm.get(tid).is_some_and(|t| t.fully_locked()) {
                self.finish_commit(tid);
            }
        }
        if self.cluster_state == ClusterState::Running && !self.pt.operational() {
            error!("partition table no longer operational");
            self.start_verification();
        }
        // Recovery or verification may have been waiting only on this node.
        self.advance_phase_if_drained();
    }

    fn client_lost(&mut self, id: NodeId, cid: u64) {
        debug!(client = %id, "client node lost");
        self.nm.set_state(id, NodeState::TemporarilyDown);
        for tid in self.tm.of_client(cid) {
            self.abort_transaction(tid, "client disconnected");
        }
    }

    /// Abort an in-flight commit: tell storages, then the waiting client if
    /// it still expects an answer.
    fn abort_transaction(&mut self, tid: Tid, reason: &str) {
        let Some(txn) = self.tm.remove(tid) else { return };
        warn!(%tid, reason, "aborting transaction");
        for peer in self.conns.values() {
            if peer.node_type == Some(NodeType::Storage)
                && peer.id.is_some_and(|id| {
                    txn.touched.is_empty() || txn.touched.contains(&id)
                })
            {
                peer.conn.notify(Packet::AbortTransaction { tid });
            }
        }
        if let (Some(msg_id), Some(peer)) = (txn.finish_msg_id, self.conns.get(&txn.client_cid)) {
            peer.conn
                .answer_error(msg_id, ErrorCode::NotReady, format!("aborted: {reason}"));
        }
    }

    // -- packet dispatch ---------------------------------------------------

    fn handle_packet(&mut self, conn: Connection, msg_id: MsgId, packet: Packet) {
        let packet = match packet {
            Packet::RequestIdentification {
                node_type,
                id,
                addr,
                cluster_name,
            } => {
                self.handle_identification(conn, msg_id, node_type, id, addr, cluster_name);
                return;
            }
            packet => packet,
        };
        let Some(peer_id) = self.conns.get(&conn.cid()).and_then(|p| p.id) else {
            error!(conn = ?conn, kind = packet.kind().name(), "packet before identification");
            conn.answer_error(msg_id, ErrorCode::ProtocolError, "identify first");
            conn.close();
            return;
        };
        let node_type = self
            .conns
            .get(&conn.cid())
            .and_then(|p| p.node_type)
            .unwrap_or(NodeType::Client);
        match packet {
            // Error replies to requests this loop issued itself.
            Packet::Error { code, message } => {
                warn!(peer = %peer_id, ?code, message, "peer reported an error");
            }

            // Election traffic.
            Packet::AskPrimary => {
                let known_masters = self
                    .nm
                    .masters()
                    .filter_map(|n| n.addr.map(|a| (a, n.id)))
                    .collect();
                conn.answer(
                    msg_id,
                    Packet::AnswerPrimary {
                        primary: self.current_primary(),
                        known_masters,
                    },
                );
            }
            Packet::AnnouncePrimary => {
                if self.is_primary() {
                    warn!(peer = %peer_id, "competing primary announcement");
                    self.broadcast_masters(Packet::ReelectPrimary);
                    self.schedule_reelection();
                } else {
                    info!(primary = %peer_id, "primary announced");
                    self.role = Role::Secondary {
                        primary: peer_id,
                        primary_cid: conn.cid(),
                    };
                }
            }
            Packet::ReelectPrimary => {
                warn!(peer = %peer_id, "reelection requested");
                self.start_election();
            }

            // Queries any master answers.
            Packet::AskClusterState => {
                conn.answer(
                    msg_id,
                    Packet::AnswerClusterState {
                        state: self.cluster_state,
                    },
                );
            }
            Packet::AskNodeInformation => {
                conn.notify(Packet::NotifyNodeInformation {
                    nodes: self.nm.snapshot(),
                });
                conn.answer(msg_id, Packet::AnswerNodeInformation);
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
            Packet::AskLastTransaction => {
                conn.answer(
                    msg_id,
                    Packet::AnswerLastTransaction {
                        tid: self.clock.last(),
                    },
                );
            }

            // Primary-only traffic below.
            _ if !self.is_primary() => {
                conn.answer_error(msg_id, ErrorCode::NotReady, "not the primary master");
            }

            // Queries served from the primary's authoritative state, used
            // by replicating storages to pin their critical TID.
            Packet::AskLastIds => {
                conn.answer(
                    msg_id,
                    Packet::AnswerLastIds {
                        last_oid: self.last_oid,
                        last_tid: self.clock.last(),
                        ptid: self.pt.ptid(),
                    },
                );
            }
            Packet::AskUnfinishedTransactions => {
                conn.answer(
                    msg_id,
                    Packet::AnswerUnfinishedTransactions {
                        tids: self.tm.pending_tids(),
                    },
                );
            }

            // Storage answers during recovery and verification.
            Packet::AnswerLastIds {
                last_oid,
                last_tid,
                ptid,
            } => {
                self.rm.record_last_ids(peer_id, last_tid, ptid, last_oid);
                self.advance_phase_if_drained();
            }
            Packet::AnswerUnfinishedTransactions { tids } => {
                self.rm.record_unfinished(peer_id, tids);
                self.advance_phase_if_drained();
            }
            Packet::AnswerPartitionTable { ptid, rows } => {
                if self.recovering_pt_from.take() == Some(peer_id) {
                    self.pt.load(ptid, &rows);
                    info!(%ptid, "partition table recovered from storage");
                    self.start_verification();
                }
            }

            // Commit protocol.
            Packet::AskBeginTransaction { tid } => {
                if self.cluster_state != ClusterState::Running {
                    conn.answer_error(msg_id, ErrorCode::NotReady, "cluster not running");
                    return;
                }
                let tid = match tid {
                    Some(requested) if requested > self.clock.last() => {
                        self.clock.observe(requested);
                        requested
                    }
                    _ => self.clock.next(),
                };
                self.tm.begin(tid, conn.cid());
                conn.answer(msg_id, Packet::AnswerBeginTransaction { tid });
            }
            Packet::AskNewOids { count } => {
                let count = if count == 0 { OID_BATCH } else { count.min(10_000) };
                let mut oids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    self.last_oid = self.last_oid.next();
                    oids.push(self.last_oid);
                }
                let last_oid = self.last_oid;
                self.broadcast_storages(Packet::NotifyLastOid { oid: last_oid });
                conn.answer(msg_id, Packet::AnswerNewOids { oids });
            }
            Packet::AskFinishTransaction { tid, oids } => {
                self.handle_finish(conn, msg_id, tid, oids);
            }
            Packet::AnswerInformationLocked { tid } => {
                if tid > self.clock.last() {
                    conn.answer_error(msg_id, ErrorCode::ProtocolError, "tid from the future");
                    conn.close();
                    return;
                }
                if self.tm.lock(tid, peer_id) {
                    self.finish_commit(tid);
                }
            }
            Packet::AbortTransaction { tid } => {
                let owned = self
                    .tm
                    .get(tid)
                    .is_some_and(|txn| txn.client_cid == conn.cid());
                if owned {
                    self.abort_transaction(tid, "client abort");
                }
            }
            Packet::AskBarrier => {
                // The answer itself is the barrier: every invalidation
                // queued before it was already written to this connection.
                conn.answer(msg_id, Packet::AnswerBarrier);
            }
            Packet::AskPack { tid } => {
                self.handle_pack(conn, msg_id, tid);
            }
            Packet::AnswerPack { status } => {
                let done = match self.pack.as_mut() {
                    Some(pack) => {
                        pack.ok &= status;
                        pack.waiting.remove(&peer_id);
                        pack.waiting.is_empty()
                    }
                    None => false,
                };
                if done {
                    let pack = self.pack.take().unwrap();
                    if let Some(peer) = self.conns.get(&pack.client_cid) {
                        peer.conn
                            .answer(pack.msg_id, Packet::AnswerPack { status: pack.ok });
                    }
                }
            }

            // Replication and partition management.
            Packet::NotifyReplicationDone { partition } => {
                self.handle_replication_done(conn, msg_id, peer_id, partition);
            }

            // Admin control plane.
            Packet::AskNodeList { node_type } => {
                let nodes = self
                    .nm
                    .iter()
                    .filter(|n| node_type.is_none() || node_type == Some(n.node_type))
                    .map(NodeInfo::from)
                    .collect();
                conn.answer(msg_id, Packet::AnswerNodeList { nodes });
            }
            Packet::AskPartitionList {
                min_offset,
                max_offset,
                node,
            } => {
                let rows = self
                    .pt
                    .rows()
                    .into_iter()
                    .filter(|(partition, cells)| {
                        *partition >= min_offset
                            && *partition <= max_offset
                            && node.map_or(true, |n| cells.iter().any(|c| c.node == n))
                    })
                    .collect();
                conn.answer(
                    msg_id,
                    Packet::AnswerPartitionList {
                        ptid: self.pt.ptid(),
                        rows,
                    },
                );
            }
            Packet::SetNodeState { node, state } => {
                self.nm.set_state(node, state);
                if state == NodeState::Down || state == NodeState::Broken {
                    let changes = self.pt.outdate(node);
                    if !changes.is_empty() {
                        let ptid = self.pt.bump();
                        self.broadcast_partition_changes(ptid, &changes);
                    }
                }
                self.broadcast_node_info();
                conn.answer(msg_id, Packet::AnswerNodeState { node, state });
            }
            Packet::AddPendingNodes { nodes } => {
                let mut added = Vec::new();
                for node in nodes {
                    if self.nm.by_id(node).is_some() {
                        self.assign_storage_cells(node);
                        added.push(node);
                    }
                }
                conn.answer(msg_id, Packet::AnswerNewNodes { nodes: added });
            }
            Packet::SetClusterState { state } => {
                info!(%state, "cluster state set by operator");
                match state {
                    ClusterState::Stopping => {
                        self.cluster_state = ClusterState::Stopping;
                        self.broadcast_all(Packet::NotifyClusterInformation { state });
                        self.broadcast_storages(Packet::StopOperation);
                    }
                    ClusterState::Running if self.cluster_state == ClusterState::Verifying => {
                        if self.pt.operational() && self.rm.is_drained() {
                            self.start_operation();
                        }
                    }
                    _ => {}
                }
                conn.answer(msg_id, Packet::ack("cluster state applied"));
            }

            other => {
                error!(
                    kind = other.kind().name(),
                    peer = %peer_id,
                    %node_type,
                    "unexpected packet"
                );
                conn.answer_error(msg_id, ErrorCode::ProtocolError, "unexpected packet");
                conn.close();
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_identification(
        &mut self,
        conn: Connection,
        msg_id: MsgId,
        node_type: NodeType,
        id: Option<NodeId>,
        addr: Option<SocketAddr>,
        cluster_name: String,
    ) {
        if cluster_name != self.config.cluster_name {
            error!(conn = ?conn, cluster_name, "rejecting alien cluster");
            conn.answer_error(msg_id, ErrorCode::ProtocolError, "invalid cluster name");
            conn.close();
            return;
        }
        let assigned = match node_type {
            // Masters bring their own identity.
            NodeType::Master => match id {
                Some(id) => id,
                None => {
                    conn.answer_error(msg_id, ErrorCode::ProtocolError, "master without id");
                    conn.close();
                    return;
                }
            },
            _ if !self.is_primary() => {
                // Secondary proxy: accept, but assign nothing; the peer will
                // ask for the primary and reconnect there.
                conn.answer(
                    msg_id,
                    Packet::AcceptIdentification {
                        node_type: NodeType::Master,
                        id: Some(self.id),
                        partitions: self.config.partitions,
                        replicas: self.config.replicas,
                        your_id: None,
                    },
                );
                self.conns.insert(
                    conn.cid(),
                    PeerConn {
                        conn,
                        id: Some(NodeId::ZERO),
                        node_type: Some(node_type),
                    },
                );
                return;
            }
            _ => id.unwrap_or_else(|| NodeId::new(rand::random::<u64>() | 1)),
        };
        self.nm.identify(node_type, assigned, addr);
        self.nm.set_state(assigned, NodeState::Running);
        conn.set_peer_node(assigned);
        self.conns.insert(
            conn.cid(),
            PeerConn {
                conn: conn.clone(),
                id: Some(assigned),
                node_type: Some(node_type),
            },
        );
        info!(node = %assigned, %node_type, "peer identified");
        conn.answer(
            msg_id,
            Packet::AcceptIdentification {
                node_type: NodeType::Master,
                id: Some(self.id),
                partitions: self.config.partitions,
                replicas: self.config.replicas,
                your_id: Some(assigned),
            },
        );
        if self.is_primary() {
            self.broadcast_node_info();
            if node_type == NodeType::Storage {
                self.storage_identified(assigned, &conn);
            }
        }
    }

    fn storage_identified(&mut self, id: NodeId, conn: &Connection) {
        match self.cluster_state {
            ClusterState::Recovering => {
                self.rm.expect(id);
                conn.send_request(Packet::AskLastIds);
            }
            _ => {
                if !self.pt.ptid().is_zero() {
                    conn.notify(Packet::SendPartitionTable {
                        ptid: self.pt.ptid(),
                        rows: self.pt.rows(),
                    });
                }
                self.assign_storage_cells(id);
                if self.cluster_state == ClusterState::Running {
                    conn.notify(Packet::NotifyLastOid { oid: self.last_oid });
                    conn.notify(Packet::StartOperation);
                }
            }
        }
    }

    fn assign_storage_cells(&mut self, id: NodeId) {
        let changes = self.pt.assign(id, self.config.replicas);
        if !changes.is_empty() {
            let ptid = self.pt.bump();
            info!(storage = %id, %ptid, "assigned out-of-date cells");
            self.broadcast_partition_changes(ptid, &changes);
        }
    }

    fn handle_finish(&mut self, conn: Connection, msg_id: MsgId, tid: Tid, oids: Vec<Oid>) {
        let owned = self
            .tm
            .get(tid)
            .is_some_and(|txn| txn.client_cid == conn.cid());
        if !owned {
            conn.answer_error(msg_id, ErrorCode::ProtocolError, "unknown transaction");
            conn.close();
            return;
        }
        // Storages holding a writable cell of any touched partition.
        let mut touched: HashSet<NodeId> = HashSet::new();
        for oid in &oids {
            let cells = self.pt.writable_cells_for_oid(*oid);
            let live: Vec<NodeId> = cells
                .iter()
                .map(|c| c.node)
                .filter(|n| self.nm.by_id(*n).is_some_and(Node::is_running))
                .collect();
            if live.is_empty() {
                self.abort_transaction(tid, "partition has no writable storage");
                conn.answer_error(msg_id, ErrorCode::NotReady, "partition unavailable");
                return;
            }
            touched.extend(live);
        }
        if touched.is_empty() {
            // Empty commit: nothing to lock anywhere.
            self.tm.remove(tid);
            conn.answer(msg_id, Packet::AnswerTransactionFinished { tid });
            return;
        }
        self.tm.start_finish(tid, oids, touched.clone(), msg_id);
        for peer in self.conns.values() {
            if peer.id.is_some_and(|id| touched.contains(&id)) {
                peer.conn.send_request(Packet::LockInformation { tid });
            }
        }
    }

    /// All touched storages acknowledged their locks: answer the client,
    /// invalidate everyone else, unlock the storages.
    fn finish_commit(&mut self, tid: Tid) {
        let Some(txn) = self.tm.remove(tid) else { return };
        debug!(%tid, oids = txn.oids.len(), "transaction finished");
        for (cid, peer) in &self.conns {
            match peer.node_type {
                Some(NodeType::Client) => {
                    if *cid == txn.client_cid {
                        if let Some(msg_id) = txn.finish_msg_id {
                            peer.conn
                                .answer(msg_id, Packet::AnswerTransactionFinished { tid });
                        }
                    } else {
                        peer.conn.notify(Packet::InvalidateObjects {
                            tid,
                            oids: txn.oids.clone(),
                        });
                    }
                }
                Some(NodeType::Storage) => {
                    if peer.id.is_some_and(|id| txn.touched.contains(&id)) {
                        peer.conn.notify(Packet::NotifyUnlockInformation { tid });
                    }
                }
                _ => {}
            }
        }
    }

    fn handle_pack(&mut self, conn: Connection, msg_id: MsgId, tid: Tid) {
        if self.pack.is_some() {
            conn.answer_error(msg_id, ErrorCode::NotReady, "pack already in progress");
            return;
        }
        let storages: HashSet<NodeId> = self
            .conns
            .values()
            .filter(|p| p.node_type == Some(NodeType::Storage))
            .filter_map(|p| p.id)
            .collect();
        if storages.is_empty() {
            conn.answer_error(msg_id, ErrorCode::NotReady, "no storage nodes");
            return;
        }
        for peer in self.conns.values() {
            if peer.node_type == Some(NodeType::Storage) {
                peer.conn.send_request(Packet::AskPack { tid });
            }
        }
        self.pack = Some(PackState {
            client_cid: conn.cid(),
            msg_id,
            waiting: storages,
            ok: true,
        });
    }

    fn handle_replication_done(
        &mut self,
        conn: Connection,
        msg_id: MsgId,
        storage: NodeId,
        partition: u32,
    ) {
        if partition >= self.pt.partitions() {
            conn.answer_error(msg_id, ErrorCode::ProtocolError, "no such partition");
            conn.close();
            return;
        }
        let cell = self
            .pt
            .cells(partition)
            .iter()
            .find(|c| c.node == storage)
            .copied();
        match cell {
            Some(cell) if cell.state == crate::types::CellState::OutOfDate => {
                info!(%storage, partition, "replication done, promoting cell");
                let changes = self.pt.promote(partition, storage);
                let ptid = self.pt.bump();
                self.broadcast_partition_changes(ptid, &changes);
            }
            Some(_) => {
                conn.answer_error(msg_id, ErrorCode::ProtocolError, "cell not out-of-date");
                conn.close();
            }
            None => {
                conn.answer_error(msg_id, ErrorCode::ProtocolError, "cell not assigned");
                conn.close();
            }
        }
    }

    // -- cluster phases ----------------------------------------------------

    /// Recovery and verification both drain on the same condition: every
    /// expected storage answered.
    fn advance_phase_if_drained(&mut self) {
        if !self.is_primary() || !self.rm.is_drained() {
            return;
        }
        match self.cluster_state {
            ClusterState::Recovering if self.rm.has_answers() => self.finish_recovery(),
            ClusterState::Verifying => self.finish_verification(),
            _ => {}
        }
    }

    fn finish_recovery(&mut self) {
        let (ltid, loid) = self.rm.id_floor();
        self.clock.observe(ltid);
        if loid > self.last_oid {
            self.last_oid = loid;
        }
        match self.rm.most_advanced_table() {
            Some((node, ptid)) => {
                // Adopt the most recent persisted table before verifying.
                info!(storage = %node, %ptid, "recovering partition table");
                self.recovering_pt_from = Some(node);
                if let Some(peer) = self
                    .conns
                    .values()
                    .find(|p| p.id == Some(node) && p.node_type == Some(NodeType::Storage))
                {
                    peer.conn.send_request(Packet::AskPartitionTable);
                } else {
                    self.recovering_pt_from = None;
                    self.start_verification();
                }
            }
            None => {
                // Fresh cluster: build the initial table over the storages
                // that answered recovery.
                let storages: Vec<NodeId> = self
                    .conns
                    .values()
                    .filter(|p| p.node_type == Some(NodeType::Storage))
                    .filter_map(|p| p.id)
                    .collect();
                self.pt.make(&storages, self.config.replicas);
                let ptid = self.pt.bump();
                info!(%ptid, storages = storages.len(), "built initial partition table");
                let rows = self.pt.rows();
                self.broadcast_storages(Packet::SendPartitionTable { ptid, rows });
                self.start_verification();
            }
        }
    }

    fn start_verification(&mut self) {
        info!("cluster verifying");
        self.cluster_state = ClusterState::Verifying;
        self.broadcast_all(Packet::NotifyClusterInformation {
            state: ClusterState::Verifying,
        });
        let storages: Vec<(NodeId, u64)> = self
            .conns
            .iter()
            .filter_map(|(cid, p)| match (p.node_type, p.id) {
                (Some(NodeType::Storage), Some(id)) => Some((id, *cid)),
                _ => None,
            })
            .collect();
        self.rm.start(storages.iter().map(|(id, _)| *id));
        for (_, cid) in &storages {
            if let Some(peer) = self.conns.get(cid) {
                peer.conn.send_request(Packet::AskUnfinishedTransactions);
            }
        }
        if storages.is_empty() {
            return;
        }
        // Answers drive the rest via advance_phase_if_drained.
    }

    fn finish_verification(&mut self) {
        let (commit, discard) = self
            .rm
            .verification_verdict(self.config.replicas + 1);
        for (tid, nodes) in commit {
            info!(%tid, "finalizing transaction seen by a majority");
            self.clock.observe(tid);
            for node in nodes {
                if let Some(peer) = self.conns.values().find(|p| p.id == Some(node)) {
                    peer.conn.notify(Packet::CommitTransaction { tid });
                }
            }
        }
        for (tid, nodes) in discard {
            info!(%tid, "discarding partial transaction");
            for node in nodes {
                if let Some(peer) = self.conns.values().find(|p| p.id == Some(node)) {
                    peer.conn.notify(Packet::DeleteTransaction { tid });
                }
            }
        }
        if self.pt.operational() {
            self.start_operation();
        } else {
            warn!("verification drained but table not operational, waiting for storages");
        }
    }

    fn start_operation(&mut self) {
        info!("cluster running");
        self.cluster_state = ClusterState::Running;
        self.broadcast_all(Packet::NotifyClusterInformation {
            state: ClusterState::Running,
        });
        let last_oid = self.last_oid;
        self.broadcast_storages(Packet::NotifyLastOid { oid: last_oid });
        self.broadcast_storages(Packet::StartOperation);
    }

    // -- broadcast helpers -------------------------------------------------

    fn broadcast_partition_changes(&self, ptid: Ptid, changes: &[CellChange]) {
        self.broadcast_all(Packet::NotifyPartitionChanges {
            ptid,
            changes: changes.to_vec(),
        });
    }

    fn broadcast_node_info(&self) {
        let nodes = self.nm.snapshot();
        self.broadcast_all(Packet::NotifyNodeInformation { nodes });
    }

    fn broadcast_all(&self, packet: Packet) {
        for peer in self.conns.values() {
            if peer.id.is_some() && peer.id != Some(NodeId::ZERO) {
                peer.conn.notify(packet.clone());
            }
        }
    }

    fn broadcast_storages(&self, packet: Packet) {
        for peer in self.conns.values() {
            if peer.node_type == Some(NodeType::Storage) && peer.id.is_some() {
                peer.conn.notify(packet.clone());
            }
        }
    }

    fn broadcast_masters(&self, packet: Packet) {
        for peer in self.conns.values() {
            if peer.node_type == Some(NodeType::Master) {
                peer.conn.notify(packet.clone());
            }
        }
    }
}
