//! Cluster configuration consumed by every node role.

use crate::types::NodeId;
use std::net::SocketAddr;
use std::time::Duration;

/// Send a ping when a connection has seen no traffic for this long.
pub const DEFAULT_PING_DELAY: Duration = Duration::from_secs(5);

/// Drop a connection when a ping stays unanswered for this long.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket implementation used for peer links. The enum is the seam where an
/// encrypted connector plugs in; only plain TCP is built.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Connector {
    #[default]
    Tcp,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Peers identifying with a different name are rejected.
    pub cluster_name: String,
    /// Bootstrap list used to discover the primary master.
    pub master_nodes: Vec<SocketAddr>,
    /// Number of partitions, fixed per cluster before first run.
    pub partitions: u32,
    /// Target replica count per partition (0 means one cell per partition).
    pub replicas: u32,
    /// Node identity, persisted after the primary assigns one.
    pub node_id: Option<NodeId>,
    /// Bind address for inbound connections.
    pub listen: SocketAddr,
    pub connector: Connector,
    /// Client-side object payload compression.
    pub compress: bool,
    pub ping_delay: Duration,
    pub ping_timeout: Duration,
}

impl Config {
    pub fn new(cluster_name: impl Into<String>, listen: SocketAddr) -> Config {
        Config {
            cluster_name: cluster_name.into(),
            master_nodes: Vec::new(),
            partitions: 1,
            replicas: 0,
            node_id: None,
            listen,
            connector: Connector::Tcp,
            compress: true,
            ping_delay: DEFAULT_PING_DELAY,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn with_masters(mut self, masters: Vec<SocketAddr>) -> Config {
        self.master_nodes = masters;
        self
    }

    pub fn with_partitions(mut self, partitions: u32, replicas: u32) -> Config {
        self.partitions = partitions;
        self.replicas = replicas;
        self
    }
}
