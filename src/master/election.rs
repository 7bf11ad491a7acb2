//! Primary election between master nodes.
//!
//! Every master probes every other known master: identify, then
//! `AskPrimary`. An already-established primary advertised by any peer is
//! adopted; otherwise the lowest node id among identified running masters
//! wins. Conflicting claims force a `ReelectPrimary` broadcast, which resets
//! election state everywhere.

use crate::error::{Error, Result};
use crate::net::{Connection, ConnectionOptions, EventSink, Packet};
use crate::types::{NodeId, NodeType};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tracing::debug;

/// Result of probing one peer master.
#[derive(Debug)]
pub enum ProbeOutcome {
    Identified {
        addr: SocketAddr,
        id: NodeId,
        conn: Connection,
        claimed_primary: Option<NodeId>,
        known_masters: Vec<(SocketAddr, Option<NodeId>)>,
    },
    Unreachable {
        addr: SocketAddr,
    },
}

#[derive(Debug)]
pub enum ElectionResult {
    /// This node has the winning id (or a peer already advertises it as
    /// primary).
    Primary,
    Secondary { primary: NodeId },
    /// Running masters advertise different primaries.
    Conflict,
}

#[derive(Debug)]
pub struct ElectedPeer {
    pub addr: SocketAddr,
    pub conn: Connection,
    pub claimed_primary: Option<NodeId>,
}

/// Collects probe outcomes until every bootstrap master resolved.
#[derive(Debug, Default)]
pub struct Election {
    awaiting: HashSet<SocketAddr>,
    peers: HashMap<NodeId, ElectedPeer>,
}

impl Election {
    pub fn start(addrs: impl Iterator<Item = SocketAddr>) -> Election {
        Election {
            awaiting: addrs.collect(),
            peers: HashMap::new(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.awaiting.is_empty()
    }

    /// Record one probe outcome; returns true once all probes resolved.
    pub fn record(&mut self, outcome: ProbeOutcome) -> bool {
        match outcome {
            ProbeOutcome::Identified {
                addr,
                id,
                conn,
                claimed_primary,
                ..
            } => {
                self.awaiting.remove(&addr);
                self.peers.insert(
                    id,
                    ElectedPeer {
                        addr,
                        conn,
                        claimed_primary,
                    },
                );
            }
            ProbeOutcome::Unreachable { addr } => {
                self.awaiting.remove(&addr);
            }
        }
        self.awaiting.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = (&NodeId, &ElectedPeer)> {
        self.peers.iter()
    }

    pub fn peer(&self, id: NodeId) -> Option<&ElectedPeer> {
        self.peers.get(&id)
    }

    /// Decide the election once all probes resolved.
    pub fn decide(&self, self_id: NodeId) -> ElectionResult {
        let claims: HashSet<NodeId> = self
            .peers
            .values()
            .filter_map(|peer| peer.claimed_primary)
            .collect();
        match claims.len() {
            0 => {
                let lowest = self
                    .peers
                    .keys()
                    .copied()
                    .chain(std::iter::once(self_id))
                    .min()
                    .expect("at least self participates");
                if lowest == self_id {
                    ElectionResult::Primary
                } else {
                    ElectionResult::Secondary { primary: lowest }
                }
            }
            1 => {
                let claimed = *claims.iter().next().unwrap();
                if claimed == self_id {
                    ElectionResult::Primary
                } else {
                    ElectionResult::Secondary { primary: claimed }
                }
            }
            _ => ElectionResult::Conflict,
        }
    }
}

/// Probe one peer master: identify, then ask who the primary is. The
/// returned connection stays bound to the caller's event sink.
pub async fn probe_master(
    addr: SocketAddr,
    cluster_name: String,
    self_id: NodeId,
    listen: SocketAddr,
    sink: EventSink,
    opts: ConnectionOptions,
) -> Result<(Connection, NodeId, Option<NodeId>, Vec<(SocketAddr, Option<NodeId>)>)> {
    let conn = Connection::connect(addr, sink, opts).await?;
    let accepted = conn
        .ask(Packet::RequestIdentification {
            node_type: NodeType::Master,
            id: Some(self_id),
            addr: Some(listen),
            cluster_name,
        })
        .await?;
    let peer_id = match accepted {
        Packet::AcceptIdentification {
            node_type: NodeType::Master,
            id: Some(peer_id),
            ..
        } => peer_id,
        other => {
            conn.close();
            return Err(Error::Protocol(format!(
                "unexpected identification answer: {:?}",
                other.kind()
            )));
        }
    };
    conn.set_peer_node(peer_id);
    let answer = conn.ask(Packet::AskPrimary).await?;
    match answer {
        Packet::AnswerPrimary {
            primary,
            known_masters,
        } => {
            debug!(peer = %peer_id, ?primary, "probed master");
            Ok((conn, peer_id, primary, known_masters))
        }
        other => {
            conn.close();
            Err(Error::Protocol(format!(
                "unexpected primary answer: {:?}",
                other.kind()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(addr: SocketAddr, _id: NodeId) -> ProbeOutcome {
        ProbeOutcome::Unreachable { addr }
    }

    #[test]
    fn sole_master_wins_immediately() {
        let election = Election::start(std::iter::empty());
        assert!(election.is_settled());
        assert!(matches!(
            election.decide(NodeId::new(5)),
            ElectionResult::Primary
        ));
    }

    #[test]
    fn unreachable_peers_resolve_the_vote() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let mut election = Election::start([addr].into_iter());
        assert!(!election.is_settled());
        assert!(election.record(outcome(addr, NodeId::new(1))));
        assert!(matches!(
            election.decide(NodeId::new(9)),
            ElectionResult::Primary
        ));
    }
}
