//! NEO: a distributed, replicated, transactional object store.
//!
//! A cluster is made of master, storage, client, and admin nodes. The
//! elected primary master allocates identifiers, owns the partition table,
//! and orchestrates two-phase commit; storage nodes own horizontal
//! partitions of the object-id space; clients expose a transactional
//! load/store API backed by an MVCC cache.

pub mod admin;
pub mod client;
pub mod config;
pub mod error;
pub mod master;
pub mod net;
pub mod node;
pub mod partition;
pub mod storage;
pub mod types;

pub use admin::Admin;
pub use client::{
    cache::MvccCache, txn::TxnContext, Client, ConflictResolver, HistoryEntry, NoResolution,
    TransactionInfo,
};
pub use config::{Config, Connector};
pub use error::{Error, Result};
pub use master::Master;
pub use node::{Node, NodeInfo, NodeManager};
pub use partition::{Cell, CellChange, PartitionTable};
pub use storage::{
    database::{Database, MemoryDatabase, ObjectRow, SledDatabase, TransactionRow},
    Storage,
};
pub use types::{
    CellState, Checksum, ClusterState, NodeId, NodeState, NodeType, Oid, Ptid, Tid,
};
