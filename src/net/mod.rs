//! Framed peer networking: packets, codec, and the connection actor.

pub mod codec;
pub mod connection;
pub mod packet;

pub use codec::{decode, encode, read_frame, write_frame, Frame};
pub use connection::{
    accept_loop, ConnEvent, Connection, ConnectionOptions, EventSink, MsgId, NotificationHook,
    Reply, ReplyEnvelope, ReplyQueue, TimeoutCallback,
};
pub use packet::{
    error_from_wire, error_to_wire, ErrorCode, LockStatus, Packet, PacketKind, UndoSerial,
};
