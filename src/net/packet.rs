//! Protocol packets with bounded payloads.
//!
//! Every `Ask*` has a matching `Answer*`. Notifications reuse the same frame
//! and must not be replied to. The identification packet must be the first
//! packet on every new connection.

use crate::node::NodeInfo;
use crate::partition::{CellChange, PartitionRow};
use crate::types::{Checksum, ClusterState, NodeId, NodeState, NodeType, Oid, Ptid, Tid};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Outer limit on any frame payload. Individual kinds have tighter caps.
pub const MESSAGE_SIZE_LIMIT: usize = 8 * 1024 * 1024;

/// Cap for control packets that carry no object data or listings.
pub const MAX_CONTROL_SIZE: usize = 64 * 1024;

/// Cap for listing packets (tids, history, node and partition rows).
pub const MAX_LISTING_SIZE: usize = 1024 * 1024;

/// Error codes carried by [`Packet::Error`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Positive reply carrying only a message.
    Ack,
    ProtocolError,
    NotReady,
    OidNotFound,
    TidNotFound,
    BrokenNode,
}

/// Per-object undo outcome answered by `AnswerObjectUndoSerial`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UndoSerial {
    /// Latest serial of the object.
    pub current_serial: Tid,
    /// Serial holding the data the undo would restore.
    pub undo_serial: Option<Tid>,
    /// Whether the undone transaction is the latest for this object.
    pub is_current: bool,
}

/// Lock state answered by `AnswerHasLock`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum LockStatus {
    NotLocked,
    /// Locked by the asking transaction.
    Granted,
    /// Locked by another transaction.
    GrantedToOther,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    Error {
        code: ErrorCode,
        message: String,
    },
    Ping,
    Pong,

    // Identification.
    RequestIdentification {
        node_type: NodeType,
        id: Option<NodeId>,
        addr: Option<SocketAddr>,
        cluster_name: String,
    },
    AcceptIdentification {
        node_type: NodeType,
        id: Option<NodeId>,
        partitions: u32,
        replicas: u32,
        your_id: Option<NodeId>,
    },

    // Primary election and discovery.
    AskPrimary,
    AnswerPrimary {
        primary: Option<NodeId>,
        known_masters: Vec<(SocketAddr, Option<NodeId>)>,
    },
    AnnouncePrimary,
    ReelectPrimary,

    // Node information.
    NotifyNodeInformation {
        nodes: Vec<NodeInfo>,
    },
    AskNodeInformation,
    AnswerNodeInformation,

    // Partition table.
    AskLastIds,
    AnswerLastIds {
        last_oid: Oid,
        last_tid: Tid,
        ptid: Ptid,
    },
    AskPartitionTable,
    AnswerPartitionTable {
        ptid: Ptid,
        rows: Vec<PartitionRow>,
    },
    SendPartitionTable {
        ptid: Ptid,
        rows: Vec<PartitionRow>,
    },
    NotifyPartitionChanges {
        ptid: Ptid,
        changes: Vec<CellChange>,
    },

    // Cluster state.
    StartOperation,
    StopOperation,
    AskClusterState,
    AnswerClusterState {
        state: ClusterState,
    },
    SetClusterState {
        state: ClusterState,
    },
    NotifyClusterInformation {
        state: ClusterState,
    },

    // Verification.
    AskUnfinishedTransactions,
    AnswerUnfinishedTransactions {
        tids: Vec<Tid>,
    },
    AskObjectPresent {
        oid: Oid,
        tid: Tid,
    },
    AnswerObjectPresent {
        oid: Oid,
        tid: Tid,
    },
    DeleteTransaction {
        tid: Tid,
    },
    CommitTransaction {
        tid: Tid,
    },

    // Identifier allocation.
    AskBeginTransaction {
        tid: Option<Tid>,
    },
    AnswerBeginTransaction {
        tid: Tid,
    },
    AskNewOids {
        count: u32,
    },
    AnswerNewOids {
        oids: Vec<Oid>,
    },
    NotifyLastOid {
        oid: Oid,
    },

    // Transaction store and commit.
    AskStoreObject {
        oid: Oid,
        serial: Tid,
        compression: bool,
        checksum: Checksum,
        data: Vec<u8>,
        data_tid: Option<Tid>,
        tid: Tid,
    },
    AnswerStoreObject {
        conflicting: bool,
        oid: Oid,
        serial: Tid,
    },
    AbortTransaction {
        tid: Tid,
    },
    AskStoreTransaction {
        tid: Tid,
        user: String,
        description: String,
        extension: Vec<u8>,
        oids: Vec<Oid>,
    },
    AnswerStoreTransaction {
        tid: Tid,
    },
    AskFinishTransaction {
        tid: Tid,
        oids: Vec<Oid>,
    },
    AnswerTransactionFinished {
        tid: Tid,
    },
    LockInformation {
        tid: Tid,
    },
    AnswerInformationLocked {
        tid: Tid,
    },
    InvalidateObjects {
        tid: Tid,
        oids: Vec<Oid>,
    },
    NotifyUnlockInformation {
        tid: Tid,
    },
    AskHasLock {
        tid: Tid,
        oid: Oid,
    },
    AnswerHasLock {
        oid: Oid,
        status: LockStatus,
    },
    AskCheckCurrentSerial {
        tid: Tid,
        serial: Tid,
        oid: Oid,
    },
    AskBarrier,
    AnswerBarrier,

    // Object and transaction queries.
    AskObject {
        oid: Oid,
        at_tid: Option<Tid>,
        before_tid: Option<Tid>,
    },
    AnswerObject {
        oid: Oid,
        serial_start: Tid,
        serial_end: Option<Tid>,
        compression: bool,
        checksum: Checksum,
        data: Vec<u8>,
        data_tid: Option<Tid>,
    },
    AskTids {
        first: u64,
        last: u64,
        partition: Option<u32>,
    },
    AnswerTids {
        tids: Vec<Tid>,
    },
    AskTransactionInformation {
        tid: Tid,
    },
    AnswerTransactionInformation {
        tid: Tid,
        user: String,
        description: String,
        extension: Vec<u8>,
        oids: Vec<Oid>,
    },
    AskObjectHistory {
        oid: Oid,
        first: u64,
        last: u64,
    },
    AnswerObjectHistory {
        oid: Oid,
        history: Vec<(Tid, u32)>,
    },
    AskObjectUndoSerial {
        tid: Tid,
        undone_tid: Tid,
        oids: Vec<Oid>,
    },
    AnswerObjectUndoSerial {
        serials: Vec<(Oid, UndoSerial)>,
    },
    AskLastTransaction,
    AnswerLastTransaction {
        tid: Tid,
    },
    AskPack {
        tid: Tid,
    },
    AnswerPack {
        status: bool,
    },

    // Admin control plane.
    AskNodeList {
        node_type: Option<NodeType>,
    },
    AnswerNodeList {
        nodes: Vec<NodeInfo>,
    },
    AskPartitionList {
        min_offset: u32,
        max_offset: u32,
        node: Option<NodeId>,
    },
    AnswerPartitionList {
        ptid: Ptid,
        rows: Vec<PartitionRow>,
    },
    SetNodeState {
        node: NodeId,
        state: NodeState,
    },
    AnswerNodeState {
        node: NodeId,
        state: NodeState,
    },
    AddPendingNodes {
        nodes: Vec<NodeId>,
    },
    AnswerNewNodes {
        nodes: Vec<NodeId>,
    },

    // Replication.
    NotifyReplicationDone {
        partition: u32,
    },
}

macro_rules! packet_kinds {
    ($($variant:ident = $code:expr,)*) => {
        /// Wire packet-type code, carried in the frame header.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
        #[repr(u16)]
        pub enum PacketKind {
            $($variant = $code,)*
        }

        impl PacketKind {
            pub fn from_u16(raw: u16) -> Option<PacketKind> {
                match raw {
                    $($code => Some(PacketKind::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(PacketKind::$variant => stringify!($variant),)*
                }
            }
        }

        impl Packet {
            pub fn kind(&self) -> PacketKind {
                match self {
                    $(Packet::$variant { .. } => PacketKind::$variant,)*
                }
            }
        }
    };
}

packet_kinds! {
    Error = 0x8000,
    Ping = 0x0001,
    Pong = 0x0002,
    RequestIdentification = 0x0010,
    AcceptIdentification = 0x0011,
    AskPrimary = 0x0020,
    AnswerPrimary = 0x0021,
    AnnouncePrimary = 0x0022,
    ReelectPrimary = 0x0023,
    NotifyNodeInformation = 0x0030,
    AskNodeInformation = 0x0031,
    AnswerNodeInformation = 0x0032,
    AskLastIds = 0x0040,
    AnswerLastIds = 0x0041,
    AskPartitionTable = 0x0042,
    AnswerPartitionTable = 0x0043,
    SendPartitionTable = 0x0044,
    NotifyPartitionChanges = 0x0045,
    StartOperation = 0x0050,
    StopOperation = 0x0051,
    AskClusterState = 0x0052,
    AnswerClusterState = 0x0053,
    SetClusterState = 0x0054,
    NotifyClusterInformation = 0x0055,
    AskUnfinishedTransactions = 0x0060,
    AnswerUnfinishedTransactions = 0x0061,
    AskObjectPresent = 0x0062,
    AnswerObjectPresent = 0x0063,
    DeleteTransaction = 0x0064,
    CommitTransaction = 0x0065,
    AskBeginTransaction = 0x0070,
    AnswerBeginTransaction = 0x0071,
    AskNewOids = 0x0072,
    AnswerNewOids = 0x0073,
    NotifyLastOid = 0x0074,
    AskStoreObject = 0x0080,
    AnswerStoreObject = 0x0081,
    AbortTransaction = 0x0082,
    AskStoreTransaction = 0x0083,
    AnswerStoreTransaction = 0x0084,
    AskFinishTransaction = 0x0085,
    AnswerTransactionFinished = 0x0086,
    LockInformation = 0x0087,
    AnswerInformationLocked = 0x0088,
    InvalidateObjects = 0x0089,
    NotifyUnlockInformation = 0x008a,
    AskHasLock = 0x008b,
    AnswerHasLock = 0x008c,
    AskCheckCurrentSerial = 0x008d,
    AskBarrier = 0x008e,
    AnswerBarrier = 0x008f,
    AskObject = 0x0090,
    AnswerObject = 0x0091,
    AskTids = 0x0092,
    AnswerTids = 0x0093,
    AskTransactionInformation = 0x0094,
    AnswerTransactionInformation = 0x0095,
    AskObjectHistory = 0x0096,
    AnswerObjectHistory = 0x0097,
    AskObjectUndoSerial = 0x0098,
    AnswerObjectUndoSerial = 0x0099,
    AskLastTransaction = 0x009a,
    AnswerLastTransaction = 0x009b,
    AskPack = 0x009c,
    AnswerPack = 0x009d,
    AskNodeList = 0x00a0,
    AnswerNodeList = 0x00a1,
    AskPartitionList = 0x00a2,
    AnswerPartitionList = 0x00a3,
    SetNodeState = 0x00a4,
    AnswerNodeState = 0x00a5,
    AddPendingNodes = 0x00a6,
    AnswerNewNodes = 0x00a7,
    NotifyReplicationDone = 0x00b0,
}

impl PacketKind {
    /// Whether this kind answers a request. Only response kinds are matched
    /// against the pending-request table; both endpoints allocate message
    /// ids independently, so a request id may collide with a local one.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            PacketKind::Error
                | PacketKind::Pong
                | PacketKind::AcceptIdentification
                | PacketKind::AnswerPrimary
                | PacketKind::AnswerNodeInformation
                | PacketKind::AnswerLastIds
                | PacketKind::AnswerPartitionTable
                | PacketKind::AnswerClusterState
                | PacketKind::AnswerUnfinishedTransactions
                | PacketKind::AnswerObjectPresent
                | PacketKind::AnswerBeginTransaction
                | PacketKind::AnswerNewOids
                | PacketKind::AnswerStoreObject
                | PacketKind::AnswerStoreTransaction
                | PacketKind::AnswerTransactionFinished
                | PacketKind::AnswerInformationLocked
                | PacketKind::AnswerHasLock
                | PacketKind::AnswerBarrier
                | PacketKind::AnswerObject
                | PacketKind::AnswerTids
                | PacketKind::AnswerTransactionInformation
                | PacketKind::AnswerObjectHistory
                | PacketKind::AnswerObjectUndoSerial
                | PacketKind::AnswerLastTransaction
                | PacketKind::AnswerPack
                | PacketKind::AnswerNodeList
                | PacketKind::AnswerPartitionList
                | PacketKind::AnswerNodeState
                | PacketKind::AnswerNewNodes
        )
    }

    /// Upper bound on the payload for this kind. Object-carrying packets get
    /// the outer limit, listings a middle tier, control packets a small one.
    pub fn max_size(self) -> usize {
        match self {
            PacketKind::AskStoreObject | PacketKind::AnswerObject => MESSAGE_SIZE_LIMIT,
            PacketKind::AnswerPartitionTable
            | PacketKind::SendPartitionTable
            | PacketKind::AnswerPartitionList
            | PacketKind::NotifyPartitionChanges
            | PacketKind::NotifyNodeInformation
            | PacketKind::AnswerNodeList
            | PacketKind::AnswerTids
            | PacketKind::AnswerUnfinishedTransactions
            | PacketKind::AnswerObjectHistory
            | PacketKind::AnswerObjectUndoSerial
            | PacketKind::AskObjectUndoSerial
            | PacketKind::AskStoreTransaction
            | PacketKind::AskFinishTransaction
            | PacketKind::AnswerNewOids
            | PacketKind::InvalidateObjects
            | PacketKind::AnswerTransactionInformation => MAX_LISTING_SIZE,
            _ => MAX_CONTROL_SIZE,
        }
    }
}

impl Packet {
    /// Build an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Packet {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    pub fn ack(message: impl Into<String>) -> Packet {
        Packet::error(ErrorCode::Ack, message)
    }
}

/// Convert a wire error reply into an [`crate::error::Error`]. `Ack` is a
/// positive reply and maps to `None`.
pub fn error_from_wire(code: ErrorCode, message: &str) -> Option<crate::error::Error> {
    use crate::error::Error;
    let message = message.to_owned();
    match code {
        ErrorCode::Ack => None,
        ErrorCode::ProtocolError => Some(Error::Protocol(message)),
        ErrorCode::NotReady => Some(Error::NotReady(message)),
        ErrorCode::OidNotFound => Some(Error::OidNotFound(message)),
        ErrorCode::TidNotFound => Some(Error::TidNotFound(message)),
        ErrorCode::BrokenNode => Some(Error::BrokenNode(message)),
    }
}

/// Map an [`crate::error::Error`] onto its wire reply.
pub fn error_to_wire(err: &crate::error::Error) -> (ErrorCode, String) {
    use crate::error::Error;
    let code = match err {
        Error::NotReady(_) => ErrorCode::NotReady,
        Error::BrokenNode(_) => ErrorCode::BrokenNode,
        Error::OidNotFound(_) => ErrorCode::OidNotFound,
        Error::TidNotFound(_) => ErrorCode::TidNotFound,
        _ => ErrorCode::ProtocolError,
    };
    (code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_round_trip() {
        for packet in [
            Packet::Ping,
            Packet::AskPrimary,
            Packet::AskBeginTransaction { tid: None },
            Packet::NotifyReplicationDone { partition: 3 },
        ] {
            let kind = packet.kind();
            assert_eq!(PacketKind::from_u16(kind as u16), Some(kind));
        }
        assert_eq!(PacketKind::from_u16(0x7fff), None);
    }

    #[test]
    fn object_packets_get_the_large_cap() {
        assert_eq!(PacketKind::AskStoreObject.max_size(), MESSAGE_SIZE_LIMIT);
        assert_eq!(PacketKind::Ping.max_size(), MAX_CONTROL_SIZE);
    }
}
