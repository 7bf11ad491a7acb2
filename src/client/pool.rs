//! Storage connection pool and replica ordering.
//!
//! One connection per storage node with a soft cap. Cells are ranked by a
//! sort key preferring already-connected nodes and backing off from
//! recently failed ones; callers shuffle before sorting so equal ranks
//! spread load.

use crate::error::{Error, Result};
use crate::net::{Connection, ConnectionOptions, EventSink, Packet};
use crate::types::{NodeId, NodeType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Soft cap on pooled connections.
const MAX_POOLED: usize = 16;

/// How long a failed storage stays at the back of the sort order.
const FAILURE_BACKOFF: Duration = Duration::from_secs(2);

/// Rank for [`ConnectionPool::sort_key`]: connected first, untried next,
/// recently failed last.
pub const SORT_CONNECTED: u8 = 0;
pub const SORT_UNKNOWN: u8 = 1;
pub const SORT_FAILED: u8 = 2;

pub struct ConnectionPool {
    cluster_name: String,
    client_id: Option<NodeId>,
    conns: HashMap<NodeId, Connection>,
    failures: HashMap<NodeId, Instant>,
    sink: EventSink,
    opts: ConnectionOptions,
}

impl ConnectionPool {
    pub fn new(cluster_name: String, sink: EventSink, opts: ConnectionOptions) -> ConnectionPool {
        ConnectionPool {
            cluster_name,
            client_id: None,
            conns: HashMap::new(),
            failures: HashMap::new(),
            sink,
            opts,
        }
    }

    pub fn set_client_id(&mut self, id: NodeId) {
        self.client_id = Some(id);
    }

    pub fn sort_key(&self, node: NodeId) -> u8 {
        if self.conns.get(&node).is_some_and(|c| !c.is_closed()) {
            return SORT_CONNECTED;
        }
        match self.failures.get(&node) {
            Some(at) if at.elapsed() < FAILURE_BACKOFF => SORT_FAILED,
            _ => SORT_UNKNOWN,
        }
    }

    /// Existing live connection, if any.
    pub fn existing(&self, node: NodeId) -> Option<Connection> {
        self.conns
            .get(&node)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Connection to `node`, opening and identifying one if needed.
    pub async fn conn_for(&mut self, node: NodeId, addr: SocketAddr) -> Result<Connection> {
        if let Some(conn) = self.existing(node) {
            return Ok(conn);
        }
        if let Some(at) = self.failures.get(&node) {
            if at.elapsed() < FAILURE_BACKOFF {
                return Err(Error::NotReady(format!("storage {node} backing off")));
            }
        }
        match self.open(node, addr).await {
            Ok(conn) => {
                self.failures.remove(&node);
                self.evict_if_needed();
                self.conns.insert(node, conn.clone());
                Ok(conn)
            }
            Err(e) => {
                debug!(%node, %addr, error = %e, "storage connection failed");
                self.failures.insert(node, Instant::now());
                Err(e)
            }
        }
    }

    async fn open(&self, node: NodeId, addr: SocketAddr) -> Result<Connection> {
        let conn = Connection::connect(addr, self.sink.clone(), self.opts.clone()).await?;
        let answer = conn
            .ask(Packet::RequestIdentification {
                node_type: NodeType::Client,
                id: self.client_id,
                addr: None,
                cluster_name: self.cluster_name.clone(),
            })
            .await?;
        match answer {
            Packet::AcceptIdentification { .. } => {
                conn.set_peer_node(node);
                Ok(conn)
            }
            other => {
                conn.close();
                Err(Error::Protocol(format!(
                    "storage refused identification: {:?}",
                    other.kind()
                )))
            }
        }
    }

    /// Keep the pool under its cap, preferring to drop dead connections.
    fn evict_if_needed(&mut self) {
        self.conns.retain(|_, conn| !conn.is_closed());
        if self.conns.len() < MAX_POOLED {
            return;
        }
        if let Some(node) = self.conns.keys().next().copied() {
            if let Some(conn) = self.conns.remove(&node) {
                debug!(%node, "evicting pooled storage connection");
                conn.close();
            }
        }
    }

    /// Drop every pooled connection, e.g. on primary failure.
    pub fn flush(&mut self) {
        for (_, conn) in self.conns.drain() {
            conn.close();
        }
        self.failures.clear();
    }
}
