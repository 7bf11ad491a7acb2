//! Directory of known peers, keyed by identity and by address.

use crate::types::{NodeId, NodeState, NodeType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// One known peer. `(id, addr)` is unique per cluster; the id is assigned by
/// the primary master on first identification.
#[derive(Clone, Debug)]
pub struct Node {
    pub node_type: NodeType,
    pub id: Option<NodeId>,
    pub addr: Option<SocketAddr>,
    pub state: NodeState,
}

impl Node {
    pub fn new(node_type: NodeType, addr: Option<SocketAddr>) -> Node {
        Node {
            node_type,
            id: None,
            addr,
            state: NodeState::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.id, self.addr) {
            (Some(id), Some(addr)) => write!(f, "{} {} at {}", self.node_type, id, addr),
            (Some(id), None) => write!(f, "{} {}", self.node_type, id),
            (None, Some(addr)) => write!(f, "{} at {}", self.node_type, addr),
            (None, None) => write!(f, "{} (unidentified)", self.node_type),
        }
    }
}

/// Node row as broadcast in `NotifyNodeInformation`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_type: NodeType,
    pub addr: Option<SocketAddr>,
    pub id: Option<NodeId>,
    pub state: NodeState,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> NodeInfo {
        NodeInfo {
            node_type: node.node_type,
            addr: node.addr,
            id: node.id,
            state: node.state,
        }
    }
}

/// Append-only directory of peers. State transitions happen only on
/// authoritative signal: a master notification, or local failure detection
/// on that specific peer's connection.
#[derive(Debug, Default)]
pub struct NodeManager {
    nodes: Vec<Node>,
}

impl NodeManager {
    pub fn new() -> NodeManager {
        NodeManager { nodes: Vec::new() }
    }

    pub fn add(&mut self, node: Node) -> usize {
        debug!(node = %node, "registering node");
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Register a master known only by address, during bootstrap.
    pub fn create_master(&mut self, addr: SocketAddr) -> usize {
        self.add(Node::new(NodeType::Master, Some(addr)))
    }

    pub fn by_id(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == Some(id))
    }

    pub fn by_id_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == Some(id))
    }

    pub fn by_addr(&self, addr: SocketAddr) -> Option<&Node> {
        self.nodes.iter().find(|n| n.addr == Some(addr))
    }

    pub fn by_addr_mut(&mut self, addr: SocketAddr) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.addr == Some(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn masters(&self) -> impl Iterator<Item = &Node> {
        self.of_type(NodeType::Master)
    }

    pub fn storages(&self) -> impl Iterator<Item = &Node> {
        self.of_type(NodeType::Storage)
    }

    pub fn clients(&self) -> impl Iterator<Item = &Node> {
        self.of_type(NodeType::Client)
    }

    pub fn admins(&self) -> impl Iterator<Item = &Node> {
        self.of_type(NodeType::Admin)
    }

    fn of_type(&self, node_type: NodeType) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }

    pub fn set_state(&mut self, id: NodeId, state: NodeState) {
        if let Some(node) = self.by_id_mut(id) {
            if node.state != state {
                debug!(node = %node, ?state, "node state change");
                node.state = state;
            }
        }
    }

    /// Register or refresh a peer during identification. Returns the node
    /// index. A node that reconnects from a new address keeps its identity.
    pub fn identify(
        &mut self,
        node_type: NodeType,
        id: NodeId,
        addr: Option<SocketAddr>,
    ) -> usize {
        if let Some(pos) = self.nodes.iter().position(|n| n.id == Some(id)) {
            let node = &mut self.nodes[pos];
            node.node_type = node_type;
            if addr.is_some() {
                node.addr = addr;
            }
            return pos;
        }
        if let Some(pos) = addr.and_then(|a| self.nodes.iter().position(|n| n.addr == Some(a))) {
            let node = &mut self.nodes[pos];
            node.node_type = node_type;
            node.id = Some(id);
            return pos;
        }
        let mut node = Node::new(node_type, addr);
        node.id = Some(id);
        self.add(node)
    }

    /// Apply a `NotifyNodeInformation` broadcast from the primary.
    pub fn update(&mut self, rows: &[NodeInfo]) {
        for info in rows {
            let pos = match (info.id, info.addr) {
                (Some(id), _) if self.by_id(id).is_some() => {
                    self.nodes.iter().position(|n| n.id == Some(id))
                }
                (_, Some(addr)) => self.nodes.iter().position(|n| n.addr == Some(addr)),
                _ => None,
            };
            match pos {
                Some(pos) => {
                    let node = &mut self.nodes[pos];
                    node.node_type = info.node_type;
                    if info.id.is_some() {
                        node.id = info.id;
                    }
                    if info.addr.is_some() {
                        node.addr = info.addr;
                    }
                    node.state = info.state;
                }
                None => {
                    self.add(Node {
                        node_type: info.node_type,
                        id: info.id,
                        addr: info.addr,
                        state: info.state,
                    });
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<NodeInfo> {
        self.nodes.iter().map(NodeInfo::from).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn identify_assigns_identity_to_known_address() {
        let mut nm = NodeManager::new();
        nm.create_master(addr(1000));
        let id = NodeId::new(7);
        nm.identify(NodeType::Master, id, Some(addr(1000)));
        assert_eq!(nm.len(), 1);
        assert_eq!(nm.by_id(id).unwrap().addr, Some(addr(1000)));
    }

    #[test]
    fn identify_keeps_identity_across_address_change() {
        let mut nm = NodeManager::new();
        let id = NodeId::new(9);
        nm.identify(NodeType::Storage, id, Some(addr(2000)));
        nm.identify(NodeType::Storage, id, Some(addr(2001)));
        assert_eq!(nm.len(), 1);
        assert_eq!(nm.by_id(id).unwrap().addr, Some(addr(2001)));
        assert!(nm.by_addr(addr(2000)).is_none());
    }

    #[test]
    fn update_applies_authoritative_rows() {
        let mut nm = NodeManager::new();
        let id = NodeId::new(3);
        nm.update(&[NodeInfo {
            node_type: NodeType::Storage,
            addr: Some(addr(3000)),
            id: Some(id),
            state: NodeState::Running,
        }]);
        assert!(nm.by_id(id).unwrap().is_running());
        nm.update(&[NodeInfo {
            node_type: NodeType::Storage,
            addr: Some(addr(3000)),
            id: Some(id),
            state: NodeState::TemporarilyDown,
        }]);
        assert_eq!(nm.len(), 1);
        assert!(!nm.by_id(id).unwrap().is_running());
    }
}
