//! End-to-end cluster tests.
//!
//! Every node runs on its own runtime so a storage can be killed abruptly,
//! sockets included, while clients drive the cluster from the test runtime.

use neo::net::{Connection, ConnectionOptions, Packet};
use neo::{
    CellState, Client, Config, ConflictResolver, Error, Master, MemoryDatabase, NoResolution,
    NodeType, Oid, Storage, Tid, TxnContext,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(30);

struct NodeHandle {
    rt: Option<tokio::runtime::Runtime>,
    addr: SocketAddr,
}

impl NodeHandle {
    fn kill(mut self) {
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

fn node_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Build a node's own runtime and drive `f` to completion on it.
///
/// Must run on a plain OS thread rather than the calling task: the caller is
/// itself an `async fn` driven by the test's own tokio runtime, and
/// `Runtime::block_on` panics if called from a thread that is already
/// driving another runtime.
fn bind_on_own_thread<F>(f: F) -> (tokio::runtime::Runtime, F::Output)
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    std::thread::spawn(move || {
        let rt = node_runtime();
        let output = rt.block_on(f);
        (rt, output)
    })
    .join()
    .unwrap()
}

fn config(cluster: &str, partitions: u32, replicas: u32, masters: Vec<SocketAddr>) -> Config {
    Config::new(cluster, "127.0.0.1:0".parse().unwrap())
        .with_masters(masters)
        .with_partitions(partitions, replicas)
}

fn start_master(cluster: &str, partitions: u32, replicas: u32) -> NodeHandle {
    let (rt, master) =
        bind_on_own_thread(Master::bind(config(cluster, partitions, replicas, Vec::new())));
    let master = master.unwrap();
    let addr = master.addr();
    rt.spawn(async move {
        let _ = master.run().await;
    });
    NodeHandle { rt: Some(rt), addr }
}

fn start_storage(cluster: &str, partitions: u32, replicas: u32, master: SocketAddr) -> NodeHandle {
    let (rt, storage) = bind_on_own_thread(Storage::bind(
        config(cluster, partitions, replicas, vec![master]),
        Arc::new(MemoryDatabase::new()),
    ));
    let storage = storage.unwrap();
    let addr = storage.addr();
    rt.spawn(async move {
        let _ = storage.run().await;
    });
    NodeHandle { rt: Some(rt), addr }
}

fn client(cluster: &str, partitions: u32, replicas: u32, master: SocketAddr) -> Client {
    Client::new(config(cluster, partitions, replicas, vec![master]))
}

/// Raw identified connection, used to inspect the cluster the way an
/// operator tool would.
async fn control_conn(addr: SocketAddr, cluster: &str, node_type: NodeType) -> Connection {
    let (sink, mut drain) = mpsc::unbounded_channel();
    tokio::spawn(async move { while drain.recv().await.is_some() {} });
    let conn = Connection::connect(addr, sink, ConnectionOptions::default())
        .await
        .unwrap();
    let answer = conn
        .ask(Packet::RequestIdentification {
            node_type,
            id: None,
            addr: None,
            cluster_name: cluster.to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(answer, Packet::AcceptIdentification { .. }));
    conn
}

/// Wait until every partition is fully replicated over `copies` cells.
async fn wait_fully_up_to_date(master: SocketAddr, cluster: &str, copies: usize) {
    let conn = control_conn(master, cluster, NodeType::Admin).await;
    timeout(WAIT, async {
        loop {
            let answer = conn
                .ask(Packet::AskPartitionList {
                    min_offset: 0,
                    max_offset: u32::MAX,
                    node: None,
                })
                .await
                .unwrap();
            if let Packet::AnswerPartitionList { rows, .. } = answer {
                let complete = !rows.is_empty()
                    && rows.iter().all(|(_, cells)| {
                        cells.len() == copies
                            && cells.iter().all(|c| c.state == CellState::UpToDate)
                    });
                if complete {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("partitions never became fully up-to-date");
    conn.close();
}

async fn commit_one(
    client: &Client,
    oid: Oid,
    serial: Tid,
    data: &[u8],
) -> Result<Tid, Error> {
    let mut txn = TxnContext::new();
    client.tpc_begin(&mut txn, None).await?;
    client.store(&mut txn, oid, serial, data.to_vec()).await?;
    client.tpc_vote(&mut txn, &NoResolution).await?;
    client.tpc_finish(&mut txn, &NoResolution).await
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_then_load_from_another_client() {
    let master = start_master("s1", 1, 0);
    let _storage = start_storage("s1", 1, 0, master.addr);

    timeout(WAIT, async {
        let c1 = client("s1", 1, 0, master.addr);
        let oid = c1.new_oid().await.unwrap();
        assert_eq!(oid, Oid::new(1));
        let tid = commit_one(&c1, oid, Tid::ZERO, b"hello").await.unwrap();

        let c2 = client("s1", 1, 0, master.addr);
        let mut txn = TxnContext::new();
        let (data, serial) = c2.load(&mut txn, oid).await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(serial, tid);
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn write_conflict_without_resolution() {
    let master = start_master("s2", 1, 0);
    let _storage = start_storage("s2", 1, 0, master.addr);

    timeout(WAIT, async {
        let c1 = client("s2", 1, 0, master.addr);
        let oid = c1.new_oid().await.unwrap();
        let base = commit_one(&c1, oid, Tid::ZERO, b"base").await.unwrap();

        // First writer wins.
        let t1 = commit_one(&c1, oid, base, b"first").await.unwrap();

        // Second writer stored against the stale base serial.
        let c2 = client("s2", 1, 0, master.addr);
        let mut txn = TxnContext::new();
        let t2 = c2.tpc_begin(&mut txn, None).await.unwrap();
        c2.store(&mut txn, oid, base, b"second".to_vec()).await.unwrap();
        let err = c2.tpc_vote(&mut txn, &NoResolution).await.unwrap_err();
        match err {
            Error::Conflict { oid: conflict_oid, serials, .. } => {
                assert_eq!(conflict_oid, oid);
                assert_eq!(serials, (t2, base));
            }
            other => panic!("expected a write conflict, got {other}"),
        }
        assert!(t2 > t1);
        c2.tpc_abort(&mut txn).await;
    })
    .await
    .expect("scenario timed out");
}

struct MergeResolver;

impl ConflictResolver for MergeResolver {
    fn resolve(&self, _: Oid, _: Tid, _: Tid, _: &[u8]) -> Option<Vec<u8>> {
        Some(b"merged".to_vec())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn write_conflict_with_resolution() {
    let master = start_master("s3", 1, 0);
    let _storage = start_storage("s3", 1, 0, master.addr);

    timeout(WAIT, async {
        let c1 = client("s3", 1, 0, master.addr);
        let oid = c1.new_oid().await.unwrap();
        let base = commit_one(&c1, oid, Tid::ZERO, b"base").await.unwrap();
        commit_one(&c1, oid, base, b"first").await.unwrap();

        let c2 = client("s3", 1, 0, master.addr);
        let mut txn = TxnContext::new();
        c2.tpc_begin(&mut txn, None).await.unwrap();
        c2.store(&mut txn, oid, base, b"second".to_vec()).await.unwrap();
        c2.tpc_vote(&mut txn, &MergeResolver).await.unwrap();
        let t2 = c2.tpc_finish(&mut txn, &MergeResolver).await.unwrap();

        let c3 = client("s3", 1, 0, master.addr);
        let mut txn = TxnContext::new();
        let (data, serial) = c3.load(&mut txn, oid).await.unwrap();
        assert_eq!(data, b"merged");
        assert_eq!(serial, t2);
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn storage_loss_mid_commit_with_replicas() {
    let cluster = "s4";
    let master = start_master(cluster, 2, 1);
    let _s1 = start_storage(cluster, 2, 1, master.addr);
    let s2 = start_storage(cluster, 2, 1, master.addr);

    timeout(WAIT, async {
        wait_fully_up_to_date(master.addr, cluster, 2).await;

        let c1 = client(cluster, 2, 1, master.addr);
        let oid = c1.new_oid().await.unwrap();
        let mut txn = TxnContext::new();
        c1.tpc_begin(&mut txn, None).await.unwrap();
        c1.store(&mut txn, oid, Tid::ZERO, b"replicated".to_vec())
            .await
            .unwrap();
        c1.tpc_vote(&mut txn, &NoResolution).await.unwrap();

        // One replica dies between vote and finish; the commit proceeds on
        // the survivor.
        s2.kill();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let tid = c1.tpc_finish(&mut txn, &NoResolution).await.unwrap();

        let c2 = client(cluster, 2, 1, master.addr);
        let mut txn = TxnContext::new();
        let (data, serial) = c2.load(&mut txn, oid).await.unwrap();
        assert_eq!(data, b"replicated");
        assert_eq!(serial, tid);
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_partition_changes_are_ignored() {
    let cluster = "s5";
    let master = start_master(cluster, 1, 0);
    let storage = start_storage(cluster, 1, 0, master.addr);

    timeout(WAIT, async {
        // Ensure the cluster is up before poking the storage directly.
        let c = client(cluster, 1, 0, master.addr);
        c.last_transaction().await.unwrap();

        let conn = control_conn(storage.addr, cluster, NodeType::Storage).await;
        let answer = conn.ask(Packet::AskPartitionTable).await.unwrap();
        let Packet::AnswerPartitionTable { ptid, rows } = answer else {
            panic!("expected a partition table");
        };
        assert!(!ptid.is_zero());

        // A diff with a revision the storage already processed is ignored.
        conn.notify(Packet::NotifyPartitionChanges {
            ptid,
            changes: vec![neo::CellChange {
                partition: 0,
                node: neo::NodeId::new(0xdead),
                state: CellState::OutOfDate,
            }],
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let answer = conn.ask(Packet::AskPartitionTable).await.unwrap();
        let Packet::AnswerPartitionTable {
            ptid: after,
            rows: rows_after,
        } = answer
        else {
            panic!("expected a partition table");
        };
        assert_eq!(after, ptid);
        assert_eq!(rows_after, rows);
        conn.close();
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn tids_are_strictly_monotonic() {
    let master = start_master("mono", 1, 0);
    let _storage = start_storage("mono", 1, 0, master.addr);

    timeout(WAIT, async {
        let c = client("mono", 1, 0, master.addr);
        let mut previous = Tid::ZERO;
        for _ in 0..20 {
            let mut txn = TxnContext::new();
            let tid = c.tpc_begin(&mut txn, None).await.unwrap();
            assert!(tid > previous);
            previous = tid;
            c.tpc_abort(&mut txn).await;
        }
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalidations_are_applied_before_the_next_snapshot() {
    let cluster = "barrier";
    let master = start_master(cluster, 1, 0);
    let _storage = start_storage(cluster, 1, 0, master.addr);

    timeout(WAIT, async {
        let writer = client(cluster, 1, 0, master.addr);
        let oid = writer.new_oid().await.unwrap();
        let t0 = commit_one(&writer, oid, Tid::ZERO, b"v1").await.unwrap();

        // The reader caches v1.
        let reader = client(cluster, 1, 0, master.addr);
        let mut txn = TxnContext::new();
        let (data, serial) = reader.load(&mut txn, oid).await.unwrap();
        assert_eq!(data, b"v1");
        assert_eq!(serial, t0);

        // A concurrent commit supersedes it.
        let t1 = commit_one(&writer, oid, t0, b"v2").await.unwrap();

        // A fresh transaction must observe the new revision, never a stale
        // cached "latest".
        let mut txn = TxnContext::new();
        let (data, serial) = reader.load(&mut txn, oid).await.unwrap();
        assert_eq!(data, b"v2");
        assert_eq!(serial, t1);
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn late_storage_replicates_and_serves_reads() {
    let cluster = "repl";
    let master = start_master(cluster, 2, 1);
    let s1 = start_storage(cluster, 2, 1, master.addr);

    timeout(Duration::from_secs(60), async {
        let c = client(cluster, 2, 1, master.addr);
        let mut committed = Vec::new();
        for i in 0..4 {
            let oid = c.new_oid().await.unwrap();
            let data = format!("value-{i}").into_bytes();
            let tid = commit_one(&c, oid, Tid::ZERO, &data).await.unwrap();
            committed.push((oid, data, tid));
        }

        // A storage joining later starts out-of-date and pulls every
        // partition from the existing replica.
        let _s2 = start_storage(cluster, 2, 1, master.addr);
        wait_fully_up_to_date(master.addr, cluster, 2).await;

        // The original replica disappears; reads now come from the copy.
        s1.kill();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let reader = client(cluster, 2, 1, master.addr);
        for (oid, data, tid) in committed {
            let mut txn = TxnContext::new();
            let (loaded, serial) = reader.load(&mut txn, oid).await.unwrap();
            assert_eq!(loaded, data);
            assert_eq!(serial, tid);
        }
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn undo_restores_the_previous_revision() {
    let cluster = "undo";
    let master = start_master(cluster, 1, 0);
    let _storage = start_storage(cluster, 1, 0, master.addr);

    timeout(WAIT, async {
        let c = client(cluster, 1, 0, master.addr);
        let oid = c.new_oid().await.unwrap();
        let t0 = commit_one(&c, oid, Tid::ZERO, b"v1").await.unwrap();
        let t1 = commit_one(&c, oid, t0, b"v2").await.unwrap();

        // Undo the latest transaction: a back-pointer to v1 is committed.
        let mut txn = TxnContext::new();
        c.tpc_begin(&mut txn, None).await.unwrap();
        let undone = c.undo(&mut txn, t1, &NoResolution).await.unwrap();
        assert_eq!(undone, vec![oid]);
        c.tpc_vote(&mut txn, &NoResolution).await.unwrap();
        let t2 = c.tpc_finish(&mut txn, &NoResolution).await.unwrap();

        let reader = client(cluster, 1, 0, master.addr);
        let mut txn = TxnContext::new();
        let (data, serial) = reader.load(&mut txn, oid).await.unwrap();
        assert_eq!(data, b"v1");
        assert_eq!(serial, t2);
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn history_lists_revisions_with_metadata() {
    let cluster = "hist";
    let master = start_master(cluster, 1, 0);
    let _storage = start_storage(cluster, 1, 0, master.addr);

    timeout(WAIT, async {
        let c = client(cluster, 1, 0, master.addr);
        let oid = c.new_oid().await.unwrap();

        let mut txn = TxnContext::new();
        c.tpc_begin(&mut txn, None).await.unwrap();
        txn.set_metadata("alice", "initial import", Vec::new());
        c.store(&mut txn, oid, Tid::ZERO, b"v1".to_vec()).await.unwrap();
        c.tpc_vote(&mut txn, &NoResolution).await.unwrap();
        let t0 = c.tpc_finish(&mut txn, &NoResolution).await.unwrap();
        let t1 = commit_one(&c, oid, t0, b"v2-longer").await.unwrap();

        let entries = c.history(oid, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tid, t1);
        assert_eq!(entries[1].tid, t0);
        assert_eq!(entries[1].user, "alice");
        assert_eq!(entries[1].description, "initial import");

        let log = c.undo_log(0, 10).await.unwrap();
        assert!(log.iter().any(|info| info.tid == t1));
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_node_proxies_cluster_queries() {
    let cluster = "admin";
    let master = start_master(cluster, 1, 0);
    let _storage = start_storage(cluster, 1, 0, master.addr);

    // Admin node on its own runtime, like the other roles.
    let (rt, admin) = bind_on_own_thread(neo::Admin::bind(config(cluster, 1, 0, vec![master.addr])));
    let admin = admin.unwrap();
    let admin_addr = admin.addr();
    rt.spawn(async move {
        let _ = admin.run().await;
    });
    let _admin_handle = NodeHandle {
        rt: Some(rt),
        addr: admin_addr,
    };

    timeout(WAIT, async {
        // Make sure the cluster is running first.
        let c = client(cluster, 1, 0, master.addr);
        c.last_transaction().await.unwrap();

        let conn = control_conn(admin_addr, cluster, NodeType::Admin).await;
        let answer = timeout(WAIT, conn.ask(Packet::AskClusterState))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            answer,
            Packet::AnswerClusterState {
                state: neo::ClusterState::Running
            }
        );
        let answer = conn
            .ask(Packet::AskNodeList { node_type: None })
            .await
            .unwrap();
        let Packet::AnswerNodeList { nodes } = answer else {
            panic!("expected a node list");
        };
        assert!(nodes.iter().any(|n| n.node_type == NodeType::Storage));
        assert!(nodes.iter().any(|n| n.node_type == NodeType::Admin));
        conn.close();
    })
    .await
    .expect("scenario timed out");
}

fn free_addr() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

fn start_master_at(
    cluster: &str,
    listen: SocketAddr,
    peers: Vec<SocketAddr>,
    node_id: u64,
    partitions: u32,
    replicas: u32,
) -> NodeHandle {
    let mut config = Config::new(cluster, listen)
        .with_masters(peers)
        .with_partitions(partitions, replicas);
    config.node_id = Some(neo::NodeId::new(node_id));
    let (rt, master) = bind_on_own_thread(Master::bind(config));
    let master = master.unwrap();
    let addr = master.addr();
    rt.spawn(async move {
        let _ = master.run().await;
    });
    NodeHandle { rt: Some(rt), addr }
}

#[tokio::test(flavor = "multi_thread")]
async fn lowest_id_master_wins_and_secondary_redirects() {
    let cluster = "elect";
    let (a1, a2) = (free_addr(), free_addr());
    let masters = vec![a1, a2];
    let _m1 = start_master_at(cluster, a1, masters.clone(), 1, 1, 0);
    let _m2 = start_master_at(cluster, a2, masters.clone(), 2, 1, 0);
    // The storage and client only know the secondary; identification is
    // proxied and both are redirected to the primary.
    let _storage = start_storage(cluster, 1, 0, a2);

    timeout(WAIT, async {
        let c = client(cluster, 1, 0, a2);
        let oid = c.new_oid().await.unwrap();
        let tid = commit_one(&c, oid, Tid::ZERO, b"elected").await.unwrap();
        let mut txn = TxnContext::new();
        let (data, serial) = c.load(&mut txn, oid).await.unwrap();
        assert_eq!(data, b"elected");
        assert_eq!(serial, tid);
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn secondary_takes_over_after_primary_failure() {
    let cluster = "failover";
    let (a1, a2) = (free_addr(), free_addr());
    let masters = vec![a1, a2];
    let m1 = start_master_at(cluster, a1, masters.clone(), 1, 1, 0);
    let _m2 = start_master_at(cluster, a2, masters.clone(), 2, 1, 0);

    let (rt, storage) = bind_on_own_thread(Storage::bind(
        Config::new(cluster, "127.0.0.1:0".parse().unwrap())
            .with_masters(masters.clone())
            .with_partitions(1, 0),
        Arc::new(MemoryDatabase::new()),
    ));
    let storage = storage.unwrap();
    let storage_addr = storage.addr();
    rt.spawn(async move {
        let _ = storage.run().await;
    });
    let _storage_handle = NodeHandle {
        rt: Some(rt),
        addr: storage_addr,
    };

    let (oid, tid_before) = timeout(Duration::from_secs(60), async {
        let c = client(cluster, 1, 0, a1);
        let oid = c.new_oid().await.unwrap();
        let tid = commit_one(&c, oid, Tid::ZERO, b"survives").await.unwrap();
        (oid, tid)
    })
    .await
    .expect("initial commit timed out");

    // The primary dies; the secondary reelects itself, re-verifies with the
    // storage, and serves a fresh client.
    m1.kill();
    timeout(Duration::from_secs(60), async {
        let c = client(cluster, 1, 0, a2);
        loop {
            let mut txn = TxnContext::new();
            match c.load(&mut txn, oid).await {
                Ok((data, serial)) => {
                    assert_eq!(data, b"survives");
                    assert_eq!(serial, tid_before);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
        // The new primary keeps TIDs strictly increasing past the old one.
        let mut txn = TxnContext::new();
        let tid_after = c.tpc_begin(&mut txn, None).await.unwrap();
        assert!(tid_after > tid_before);
        c.tpc_abort(&mut txn).await;
    })
    .await
    .expect("failover timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn second_begin_on_one_context_is_refused() {
    let master = start_master("misuse", 1, 0);
    let _storage = start_storage("misuse", 1, 0, master.addr);

    timeout(WAIT, async {
        let c = client("misuse", 1, 0, master.addr);
        let mut txn = TxnContext::new();
        c.tpc_begin(&mut txn, None).await.unwrap();
        let err = c.tpc_begin(&mut txn, None).await.unwrap_err();
        assert!(matches!(err, Error::StorageTransaction(_)));
        c.tpc_abort(&mut txn).await;

        // Storing outside a transaction is a misuse too.
        let err = c
            .store(&mut txn, Oid::new(1), Tid::ZERO, b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageTransaction(_)));
    })
    .await
    .expect("scenario timed out");
}
