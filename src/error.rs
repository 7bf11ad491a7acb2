//! Error taxonomy shared across node roles.

use crate::types::{Oid, Tid};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unexpected packet. The offending connection is closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transient refusal, the caller may retry later.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Persistent refusal from a node marked broken.
    #[error("broken node: {0}")]
    BrokenNode(String),

    #[error("oid not found: {0}")]
    OidNotFound(String),

    #[error("tid not found: {0}")]
    TidNotFound(String),

    /// Unresolvable write conflict, after the resolution loop gave up.
    /// `serials` is `(transaction tid, base serial)`.
    #[error("write conflict on {oid} (serials {}:{})", serials.0, serials.1)]
    Conflict {
        oid: Oid,
        serials: (Tid, Tid),
        data: Option<Vec<u8>>,
    },

    /// Conflict against an object that was read without modification.
    #[error("read conflict on {oid} (serials {}:{})", serials.0, serials.1)]
    ReadConflict { oid: Oid, serials: (Tid, Tid) },

    /// The primary master connection was lost; in-flight transactions abort.
    #[error("primary master failure: {0}")]
    PrimaryFailure(String),

    /// A storage left the operational state; the cluster re-verifies.
    #[error("operation failure: {0}")]
    OperationFailure(String),

    /// Cluster-wide I/O failure surfaced to the application.
    #[error("storage error: {0}")]
    Storage(String),

    /// Misuse of the two-phase commit API.
    #[error("transaction state error: {0}")]
    StorageTransaction(String),

    #[error("undo error: {0}")]
    Undo(String),

    #[error("write attempted on a read-only client")]
    ReadOnly,

    /// The peer connection closed before a pending request was answered.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is scoped to one connection, as opposed to a
    /// cluster-level condition.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::ConnectionClosed | Error::Io(_)
        )
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Error {
        Error::Database(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Error {
        Error::Database(e.to_string())
    }
}
