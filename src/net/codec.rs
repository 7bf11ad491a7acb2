//! Frame codec: `[msg_id:u32 BE][packet_type:u16 BE][length:u32 BE][payload]`.
//!
//! The payload is the postcard encoding of the packet body, bounded by the
//! per-kind size cap before it is read.

use crate::error::{Error, Result};
use crate::net::packet::{Packet, PacketKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_SIZE: usize = 10;

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub msg_id: u32,
    pub packet: Packet,
}

/// Encode a frame to bytes.
pub fn encode(msg_id: u32, packet: &Packet) -> Result<Vec<u8>> {
    let payload = postcard::to_allocvec(packet)
        .map_err(|e| Error::Protocol(format!("encode failed: {e}")))?;
    let kind = packet.kind();
    debug_assert!(payload.len() <= kind.max_size(), "{} too large", kind.name());
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&msg_id.to_be_bytes());
    buf.extend_from_slice(&(kind as u16).to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode one frame from a full buffer. Used by tests and by the reader via
/// [`read_frame`].
pub fn decode(buf: &[u8]) -> Result<Frame> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::Protocol("truncated frame header".into()));
    }
    let msg_id = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let raw_kind = u16::from_be_bytes(buf[4..6].try_into().unwrap());
    let length = u32::from_be_bytes(buf[6..10].try_into().unwrap()) as usize;
    let kind = PacketKind::from_u16(raw_kind)
        .ok_or_else(|| Error::Protocol(format!("unknown packet type {raw_kind:#06x}")))?;
    if length > kind.max_size() {
        return Err(Error::Protocol(format!(
            "{} payload of {length} bytes exceeds cap",
            kind.name()
        )));
    }
    if buf.len() < HEADER_SIZE + length {
        return Err(Error::Protocol("truncated frame payload".into()));
    }
    let packet = decode_payload(kind, &buf[HEADER_SIZE..HEADER_SIZE + length])?;
    Ok(Frame { msg_id, packet })
}

fn decode_payload(kind: PacketKind, payload: &[u8]) -> Result<Packet> {
    let packet: Packet = postcard::from_bytes(payload)
        .map_err(|e| Error::Protocol(format!("malformed {} payload: {e}", kind.name())))?;
    if packet.kind() != kind {
        return Err(Error::Protocol(format!(
            "header says {} but payload decodes as {}",
            kind.name(),
            packet.kind().name()
        )));
    }
    Ok(packet)
}

/// Read one frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let msg_id = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let raw_kind = u16::from_be_bytes(header[4..6].try_into().unwrap());
    let length = u32::from_be_bytes(header[6..10].try_into().unwrap()) as usize;
    let kind = PacketKind::from_u16(raw_kind)
        .ok_or_else(|| Error::Protocol(format!("unknown packet type {raw_kind:#06x}")))?;
    // Reject oversized payloads before allocating.
    if length > kind.max_size() {
        return Err(Error::Protocol(format!(
            "{} payload of {length} bytes exceeds cap",
            kind.name()
        )));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    let packet = decode_payload(kind, &payload)?;
    Ok(Frame { msg_id, packet })
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_id: u32,
    packet: &Packet,
) -> Result<()> {
    let buf = encode(msg_id, packet)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::packet::{ErrorCode, LockStatus, UndoSerial, MAX_CONTROL_SIZE};
    use crate::node::NodeInfo;
    use crate::partition::{Cell, CellChange};
    use crate::types::{
        CellState, Checksum, ClusterState, NodeId, NodeState, NodeType, Oid, Ptid, Tid,
    };

    fn roundtrip(packet: Packet) {
        let buf = encode(0xdead_beef, &packet).unwrap();
        let frame = decode(&buf).unwrap();
        assert_eq!(frame.msg_id, 0xdead_beef);
        assert_eq!(frame.packet, packet);
    }

    #[test]
    fn every_packet_kind_round_trips() {
        let oid = Oid::new(0x0102_0304);
        let tid = Tid::new(0x1111_2222_3333_4444);
        let ptid = Ptid::new(9);
        let node = NodeId::new(0xabcd);
        let addr = "127.0.0.1:5000".parse().unwrap();
        let info = NodeInfo {
            node_type: NodeType::Storage,
            addr: Some(addr),
            id: Some(node),
            state: NodeState::Running,
        };
        let cell = Cell {
            node,
            state: CellState::UpToDate,
        };
        let packets = vec![
            Packet::Error {
                code: ErrorCode::OidNotFound,
                message: "missing".into(),
            },
            Packet::Ping,
            Packet::Pong,
            Packet::RequestIdentification {
                node_type: NodeType::Client,
                id: None,
                addr: Some(addr),
                cluster_name: "test".into(),
            },
            Packet::AcceptIdentification {
                node_type: NodeType::Master,
                id: Some(node),
                partitions: 12,
                replicas: 1,
                your_id: Some(NodeId::new(4)),
            },
            Packet::AskPrimary,
            Packet::AnswerPrimary {
                primary: Some(node),
                known_masters: vec![(addr, Some(node)), (addr, None)],
            },
            Packet::AnnouncePrimary,
            Packet::ReelectPrimary,
            Packet::NotifyNodeInformation {
                nodes: vec![info.clone()],
            },
            Packet::AskNodeInformation,
            Packet::AnswerNodeInformation,
            Packet::AskLastIds,
            Packet::AnswerLastIds {
                last_oid: oid,
                last_tid: tid,
                ptid,
            },
            Packet::AskPartitionTable,
            Packet::AnswerPartitionTable {
                ptid,
                rows: vec![(0, vec![cell])],
            },
            Packet::SendPartitionTable {
                ptid,
                rows: vec![(1, vec![cell])],
            },
            Packet::NotifyPartitionChanges {
                ptid,
                changes: vec![CellChange {
                    partition: 0,
                    node,
                    state: CellState::OutOfDate,
                }],
            },
            Packet::StartOperation,
            Packet::StopOperation,
            Packet::AskClusterState,
            Packet::AnswerClusterState {
                state: ClusterState::Running,
            },
            Packet::SetClusterState {
                state: ClusterState::Stopping,
            },
            Packet::NotifyClusterInformation {
                state: ClusterState::Verifying,
            },
            Packet::AskUnfinishedTransactions,
            Packet::AnswerUnfinishedTransactions { tids: vec![tid] },
            Packet::AskObjectPresent { oid, tid },
            Packet::AnswerObjectPresent { oid, tid },
            Packet::DeleteTransaction { tid },
            Packet::CommitTransaction { tid },
            Packet::AskBeginTransaction { tid: Some(tid) },
            Packet::AnswerBeginTransaction { tid },
            Packet::AskNewOids { count: 100 },
            Packet::AnswerNewOids {
                oids: vec![oid, oid.next()],
            },
            Packet::NotifyLastOid { oid },
            Packet::AskStoreObject {
                oid,
                serial: tid,
                compression: true,
                checksum: Checksum::of(b"data"),
                data: b"data".to_vec(),
                data_tid: None,
                tid,
            },
            Packet::AnswerStoreObject {
                conflicting: false,
                oid,
                serial: tid,
            },
            Packet::AbortTransaction { tid },
            Packet::AskStoreTransaction {
                tid,
                user: "user".into(),
                description: "desc".into(),
                extension: vec![1, 2, 3],
                oids: vec![oid],
            },
            Packet::AnswerStoreTransaction { tid },
            Packet::AskFinishTransaction {
                tid,
                oids: vec![oid],
            },
            Packet::AnswerTransactionFinished { tid },
            Packet::LockInformation { tid },
            Packet::AnswerInformationLocked { tid },
            Packet::InvalidateObjects {
                tid,
                oids: vec![oid],
            },
            Packet::NotifyUnlockInformation { tid },
            Packet::AskHasLock { tid, oid },
            Packet::AnswerHasLock {
                oid,
                status: LockStatus::GrantedToOther,
            },
            Packet::AskCheckCurrentSerial {
                tid,
                serial: tid,
                oid,
            },
            Packet::AskBarrier,
            Packet::AnswerBarrier,
            Packet::AskObject {
                oid,
                at_tid: None,
                before_tid: Some(tid),
            },
            Packet::AnswerObject {
                oid,
                serial_start: tid,
                serial_end: None,
                compression: false,
                checksum: Checksum::of(b""),
                data: Vec::new(),
                data_tid: Some(tid),
            },
            Packet::AskTids {
                first: 0,
                last: 10,
                partition: Some(2),
            },
            Packet::AnswerTids { tids: vec![tid] },
            Packet::AskTransactionInformation { tid },
            Packet::AnswerTransactionInformation {
                tid,
                user: "u".into(),
                description: "d".into(),
                extension: Vec::new(),
                oids: vec![oid],
            },
            Packet::AskObjectHistory {
                oid,
                first: 0,
                last: 5,
            },
            Packet::AnswerObjectHistory {
                oid,
                history: vec![(tid, 42)],
            },
            Packet::AskObjectUndoSerial {
                tid,
                undone_tid: tid,
                oids: vec![oid],
            },
            Packet::AnswerObjectUndoSerial {
                serials: vec![(
                    oid,
                    UndoSerial {
                        current_serial: tid,
                        undo_serial: None,
                        is_current: true,
                    },
                )],
            },
            Packet::AskLastTransaction,
            Packet::AnswerLastTransaction { tid },
            Packet::AskPack { tid },
            Packet::AnswerPack { status: true },
            Packet::AskNodeList {
                node_type: Some(NodeType::Storage),
            },
            Packet::AnswerNodeList { nodes: vec![info] },
            Packet::AskPartitionList {
                min_offset: 0,
                max_offset: 4,
                node: None,
            },
            Packet::AnswerPartitionList {
                ptid,
                rows: vec![(0, vec![cell])],
            },
            Packet::SetNodeState {
                node,
                state: NodeState::Down,
            },
            Packet::AnswerNodeState {
                node,
                state: NodeState::Down,
            },
            Packet::AddPendingNodes { nodes: vec![node] },
            Packet::AnswerNewNodes { nodes: vec![node] },
            Packet::NotifyReplicationDone { partition: 7 },
        ];
        for packet in packets {
            roundtrip(packet);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = encode(1, &Packet::Ping).unwrap();
        buf[4] = 0x7f;
        buf[5] = 0xff;
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn mismatched_kind_is_rejected() {
        // Header claims Pong while the payload encodes Ping.
        let payload = postcard::to_allocvec(&Packet::Ping).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&(PacketKind::Pong as u16).to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn oversized_payload_is_rejected_from_header_alone() {
        let mut buf = encode(1, &Packet::Ping).unwrap();
        let huge = (MAX_CONTROL_SIZE as u32 + 1).to_be_bytes();
        buf[6..10].copy_from_slice(&huge);
        assert!(decode(&buf).is_err());
    }
}
