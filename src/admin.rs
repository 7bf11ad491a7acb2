//! Admin node: a thin control plane between operator tools and the primary
//! master. Queries and actions are forwarded with request-id translation so
//! the original connection receives the primary's answer.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::{
    accept_loop, ConnEvent, Connection, ConnectionOptions, ErrorCode, MsgId, Packet,
};
use crate::types::{ClusterState, NodeType};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Admin {
    config: Config,
    addr: SocketAddr,
    listener: Option<TcpListener>,
    master_conn: Option<Connection>,
    cluster_state: ClusterState,
    operators: HashSet<u64>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    net_tx: crate::net::EventSink,
}

impl Admin {
    pub async fn bind(config: Config) -> Result<Admin> {
        let listener = TcpListener::bind(config.listen).await?;
        let addr = listener.local_addr()?;
        let (net_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Admin {
            addr,
            listener: Some(listener),
            master_conn: None,
            cluster_state: ClusterState::Recovering,
            operators: HashSet::new(),
            events_rx,
            net_tx,
            config,
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
        info!(addr = %self.addr, "admin starting");
        let listener = self.listener.take().expect("bind() prepared the listener");
        accept_loop(listener, self.net_tx.clone(), self.conn_opts());
        loop {
            let master = self.connect_to_primary().await?;
            self.master_conn = Some(master);
            while let Some(event) = self.events_rx.recv().await {
                match event {
                    ConnEvent::Packet { conn, msg_id, packet } => {
                        self.handle_packet(conn, msg_id, packet);
                    }
                    ConnEvent::Closed { conn } => {
                        if self.master_conn.as_ref() == Some(&conn) {
                            warn!("connection to primary master lost");
                            break;
                        }
                        self.operators.remove(&conn.cid());
                    }
                }
            }
            self.master_conn = None;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn connect_to_primary(&mut self) -> Result<Connection> {
        loop {
            for addr in self.config.master_nodes.clone() {
                match self.try_master(addr).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => debug!(%addr, error = %e, "master candidate failed"),
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn try_master(&mut self, addr: SocketAddr) -> Result<Connection> {
        let conn = Connection::connect(addr, self.net_tx.clone(), self.conn_opts()).await?;
        let answer = conn
            .ask(Packet::RequestIdentification {
                node_type: NodeType::Admin,
                id: self.config.node_id,
                addr: Some(self.addr),
                cluster_name: self.config.cluster_name.clone(),
            })
            .await?;
        let peer_id = match answer {
            Packet::AcceptIdentification {
                id: Some(peer_id), ..
            } => peer_id,
            other => {
                conn.close();
                return Err(Error::Protocol(format!(
                    "unexpected identification answer: {:?}",
                    other.kind()
                )));
            }
        };
        let answer = conn.ask(Packet::AskPrimary).await?;
        match answer {
            Packet::AnswerPrimary {
                primary: Some(primary),
                ..
            } if primary == peer_id => {
                if let Packet::AnswerClusterState { state } =
                    conn.ask(Packet::AskClusterState).await?
                {
                    self.cluster_state = state;
                }
                Ok(conn)
            }
            Packet::AnswerPrimary { .. } => {
                conn.close();
                Err(Error::NotReady("not the primary master".into()))
            }
            _ => {
                conn.close();
                Err(Error::Protocol("expected AnswerPrimary".into()))
            }
        }
    }

    fn handle_packet(&mut self, conn: Connection, msg_id: MsgId, packet: Packet) {
        match packet {
            Packet::Error { code, message } => {
                warn!(conn = ?conn, ?code, message, "peer reported an error");
            }
            Packet::RequestIdentification {
                node_type,
                cluster_name,
                ..
            } => {
                if cluster_name != self.config.cluster_name {
                    conn.answer_error(msg_id, ErrorCode::ProtocolError, "invalid cluster name");
                    conn.close();
                    return;
                }
                debug!(conn = ?conn, %node_type, "operator connected");
                self.operators.insert(conn.cid());
                conn.answer(
                    msg_id,
                    Packet::AcceptIdentification {
                        node_type: NodeType::Admin,
                        id: self.config.node_id,
                        partitions: self.config.partitions,
                        replicas: self.config.replicas,
                        your_id: None,
                    },
                );
            }

            // Notifications from the primary keep local monitoring state.
            Packet::NotifyClusterInformation { state } => {
                info!(%state, "cluster state change");
                self.cluster_state = state;
            }
            Packet::NotifyNodeInformation { .. } | Packet::NotifyPartitionChanges { .. } => {}

            // The cluster state is tracked locally from the primary's
            // notifications; everything else is proxied.
            Packet::AskClusterState => {
                if !self.operators.contains(&conn.cid()) {
                    conn.answer_error(msg_id, ErrorCode::ProtocolError, "identify first");
                    conn.close();
                    return;
                }
                conn.answer(
                    msg_id,
                    Packet::AnswerClusterState {
                        state: self.cluster_state,
                    },
                );
            }

            // Control-plane traffic from identified operators is proxied to
            // the primary; the answer comes back under the operator's
            // original message id.
            packet @ (Packet::SetClusterState { .. }
            | Packet::AskNodeList { .. }
            | Packet::AskPartitionList { .. }
            | Packet::SetNodeState { .. }
            | Packet::AddPendingNodes { .. }
            | Packet::AskLastIds
            | Packet::AskLastTransaction) => {
                if !self.operators.contains(&conn.cid()) {
                    conn.answer_error(msg_id, ErrorCode::ProtocolError, "identify first");
                    conn.close();
                    return;
                }
                let Some(master) = self.master_conn.clone() else {
                    conn.answer_error(msg_id, ErrorCode::NotReady, "primary unreachable");
                    return;
                };
                tokio::spawn(async move {
                    match master.ask(packet).await {
                        Ok(answer) => conn.answer(msg_id, answer),
                        Err(e) => {
                            let (code, message) = crate::net::error_to_wire(&e);
                            conn.answer_error(msg_id, code, message);
                        }
                    }
                });
            }

            other => {
                conn.answer_error(
                    msg_id,
                    ErrorCode::ProtocolError,
                    format!("unexpected packet {}", other.kind().name()),
                );
                conn.close();
            }
        }
    }
}
