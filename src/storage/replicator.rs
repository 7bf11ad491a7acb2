//! Partition replication from an up-to-date peer.
//!
//! Procedure, per out-of-date partition:
//!
//! 1. Pin the critical TID: ask the primary for its last TID. Everything at
//!    or below it must exist on an up-to-date source.
//! 2. Wait until no transaction at or below the critical TID is still
//!    pending on the primary.
//! 3. Pull from a peer holding an up-to-date cell: transaction metadata
//!    first, then the object rows each transaction touches in this
//!    partition. Only missing rows are fetched, so a restarted replication
//!    repeats no work.
//! 4. Tell the primary the partition is done; it promotes the cell.

use crate::error::{Error, Result};
use crate::net::{Connection, ConnectionOptions, Packet};
use crate::storage::database::{Database, ObjectRow, TransactionRow};
use crate::types::{NodeId, NodeType, Oid, Tid};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// TIDs fetched per `AskTids` batch.
const TID_CHUNK: u64 = 1000;

/// Poll interval while pending transactions block the critical TID.
const PENDING_POLL: Duration = Duration::from_millis(200);

/// Tracks which partitions still need replication and which one is being
/// pulled right now. The storage event loop drives it.
#[derive(Debug, Default)]
pub struct Replicator {
    pending: HashSet<u32>,
    active: Option<u32>,
}

impl Replicator {
    pub fn new() -> Replicator {
        Replicator::default()
    }

    /// Reconcile with the partition table: `outdated` is the current set of
    /// out-of-date partitions assigned to this storage. The active pull, if
    /// any, keeps running; a promoted partition simply stops being pending.
    pub fn update(&mut self, outdated: impl Iterator<Item = u32>) {
        self.pending = outdated.collect();
        if let Some(active) = self.active {
            self.pending.remove(&active);
        }
    }

    /// Pick the next partition to replicate, if idle.
    pub fn next_partition(&mut self) -> Option<u32> {
        if self.active.is_some() {
            return None;
        }
        let partition = self.pending.iter().min().copied()?;
        self.pending.remove(&partition);
        self.active = Some(partition);
        Some(partition)
    }

    /// The active pull finished; re-queue on failure.
    pub fn finished(&mut self, partition: u32, ok: bool) {
        if self.active == Some(partition) {
            self.active = None;
        }
        if !ok {
            self.pending.insert(partition);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }
}

/// Everything a replication pull needs, captured from the storage app.
pub struct ReplicationJob {
    pub partition: u32,
    pub num_partitions: u32,
    pub self_id: NodeId,
    pub cluster_name: String,
    pub listen: SocketAddr,
    /// Addresses of storages holding an up-to-date cell for the partition.
    pub sources: Vec<SocketAddr>,
    pub master: Connection,
    pub db: Arc<dyn Database>,
    pub opts: ConnectionOptions,
}

/// Run one partition pull to completion. On success the primary has been
/// notified with `NotifyReplicationDone`.
pub async fn replicate(job: ReplicationJob) -> Result<()> {
    let partition = job.partition;
    let critical_tid = ask_critical_tid(&job.master).await?;
    debug!(partition, %critical_tid, "replication critical tid pinned");
    wait_pending_drained(&job.master, critical_tid).await?;

    let mut sources = job.sources.clone();
    sources.shuffle(&mut rand::thread_rng());
    let source_addr = *sources
        .first()
        .ok_or_else(|| Error::NotReady("no up-to-date source for partition".into()))?;
    let source = connect_source(&job, source_addr).await?;

    // Transaction metadata is stored on every cell covering a commit's
    // partitions, so the source's full list is walked and filtered to this
    // partition's objects; per-object presence checks keep the pass
    // incremental.
    let mut first = 0;
    loop {
        let answer = source
            .ask(Packet::AskTids {
                first,
                last: first + TID_CHUNK,
                partition: None,
            })
            .await?;
        let Packet::AnswerTids { tids } = answer else {
            return Err(Error::Protocol("expected AnswerTids".into()));
        };
        let fetched = tids.len() as u64;
        for tid in tids {
            if tid > critical_tid {
                continue;
            }
            pull_transaction(&job, &source, tid).await?;
        }
        if fetched < TID_CHUNK {
            break;
        }
        first += TID_CHUNK;
    }
    source.close();

    info!(partition, "partition replicated");
    job.master.notify(Packet::NotifyReplicationDone { partition });
    Ok(())
}

async fn ask_critical_tid(master: &Connection) -> Result<Tid> {
    match master.ask(Packet::AskLastIds).await? {
        Packet::AnswerLastIds { last_tid, .. } => Ok(last_tid),
        _ => Err(Error::Protocol("expected AnswerLastIds".into())),
    }
}

/// Block until every transaction at or below the critical TID resolved.
async fn wait_pending_drained(master: &Connection, critical_tid: Tid) -> Result<()> {
    loop {
        let answer = master.ask(Packet::AskUnfinishedTransactions).await?;
        let Packet::AnswerUnfinishedTransactions { tids } = answer else {
            return Err(Error::Protocol("expected AnswerUnfinishedTransactions".into()));
        };
        if tids.iter().all(|tid| *tid > critical_tid) {
            return Ok(());
        }
        debug!(%critical_tid, "waiting for pending transactions to resolve");
        tokio::time::sleep(PENDING_POLL).await;
    }
}

async fn connect_source(job: &ReplicationJob, addr: SocketAddr) -> Result<Connection> {
    // The pull owns its sink; peer notifications are irrelevant here.
    let (sink, mut drain) = mpsc::unbounded_channel();
    tokio::spawn(async move { while drain.recv().await.is_some() {} });
    let conn = Connection::connect(addr, sink, job.opts.clone()).await?;
    let answer = conn
        .ask(Packet::RequestIdentification {
            node_type: NodeType::Storage,
            id: Some(job.self_id),
            addr: Some(job.listen),
            cluster_name: job.cluster_name.clone(),
        })
        .await?;
    match answer {
        Packet::AcceptIdentification { .. } => Ok(conn),
        other => {
            conn.close();
            Err(Error::Protocol(format!(
                "source refused identification: {:?}",
                other.kind()
            )))
        }
    }
}

/// Fetch one transaction: its metadata, then every missing object row this
/// partition owns. The metadata row is stored last so an interrupted pull
/// re-fetches the whole transaction.
async fn pull_transaction(job: &ReplicationJob, source: &Connection, tid: Tid) -> Result<()> {
    let answer = source.ask(Packet::AskTransactionInformation { tid }).await?;
    let Packet::AnswerTransactionInformation {
        tid,
        user,
        description,
        extension,
        oids,
    } = answer
    else {
        return Err(Error::Protocol("expected AnswerTransactionInformation".into()));
    };
    let mine: Vec<Oid> = oids
        .iter()
        .copied()
        .filter(|oid| (oid.raw() % job.num_partitions as u64) as u32 == job.partition)
        .collect();
    let mut rows = Vec::new();
    for oid in mine {
        if job.db.object_present(oid, tid)? {
            continue;
        }
        let answer = source
            .ask(Packet::AskObject {
                oid,
                at_tid: Some(tid),
                before_tid: None,
            })
            .await;
        match answer {
            Ok(Packet::AnswerObject {
                oid,
                serial_start,
                compression,
                checksum,
                data,
                data_tid,
                ..
            }) => {
                rows.push(ObjectRow {
                    oid,
                    tid: serial_start,
                    next_tid: None,
                    compression,
                    checksum,
                    data,
                    data_tid,
                });
            }
            Ok(other) => {
                return Err(Error::Protocol(format!(
                    "expected AnswerObject, got {:?}",
                    other.kind()
                )));
            }
            Err(Error::OidNotFound(_)) => {
                // The source packed this revision away; nothing to copy.
                warn!(%oid, %tid, "source no longer holds revision");
            }
            Err(e) => return Err(e),
        }
    }
    let txn = TransactionRow {
        tid,
        oids,
        user,
        description,
        extension,
    };
    job.db.store_transaction(tid, &rows, Some(&txn), false)?;
    debug!(%tid, rows = rows.len(), "transaction replicated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicator_serializes_partitions() {
        let mut rep = Replicator::new();
        rep.update([2u32, 0, 1].into_iter());
        assert_eq!(rep.next_partition(), Some(0));
        // One pull at a time.
        assert_eq!(rep.next_partition(), None);
        rep.finished(0, true);
        assert_eq!(rep.next_partition(), Some(1));
        rep.finished(1, false);
        // Failed pulls are retried.
        assert_eq!(rep.next_partition(), Some(1));
        rep.finished(1, true);
        assert_eq!(rep.next_partition(), Some(2));
        rep.finished(2, true);
        assert!(rep.is_idle());
    }

    #[test]
    fn update_reconciles_with_partition_table() {
        let mut rep = Replicator::new();
        rep.update([0u32, 1].into_iter());
        assert_eq!(rep.next_partition(), Some(0));
        // Partition 1 was promoted elsewhere; only 0 is still active.
        rep.update([0u32].into_iter());
        rep.finished(0, true);
        assert!(rep.is_idle());
    }
}
