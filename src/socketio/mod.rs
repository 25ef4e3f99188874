//! Socket.IO v5 client over Engine.IO v4 websocket transport.
//!
//! Layering, from the wire up:
//!
//! - [`engine`]: one Engine.IO packet per text frame, a type digit then a body.
//!   The server pings, [`EngineProbe`] answers and feeds the heartbeat.
//! - [`packet`]: the Socket.IO packet carried by an Engine.IO message.
//! - [`codec`]: binary attachments, an event with binary arguments is a text
//!   packet with placeholders followed by one raw frame per attachment.
//! - [`Client`] and [`Namespace`]: namespaces, acknowledgements and rooms.

pub mod codec;
pub mod engine;
pub mod packet;
pub mod value;

mod client;
mod namespace;

pub use client::{AckSender, Client, ClientBuilder};
pub use engine::EngineProbe;
pub use namespace::{AckCallback, EventHandler, Namespace, Room};
pub use value::Value;

use std::time::Duration;

use snafu::prelude::*;

use crate::connection::SendError;

/// Events a caller can listen to but never emit
pub const RESERVED_EVENTS: [&str; 6] = [
    "connect",
    "connect_error",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

/// Malformed inbound data, the packet is dropped
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum ProtocolError {
    /// empty frame
    #[snafu(display("empty packet"))]
    Empty,

    /// first character is no Engine.IO type
    #[snafu(display("unknown engine packet type {c:?}"))]
    UnknownEngineType {
        /// the character
        c: char,
    },

    /// first character is no Socket.IO type
    #[snafu(display("unknown packet type {c:?}"))]
    UnknownPacketType {
        /// the character
        c: char,
    },

    /// attachment count prefix is malformed
    #[snafu(display("malformed attachment count"))]
    BadAttachmentCount,

    /// ack id does not fit
    #[snafu(display("malformed ack id"))]
    BadAckId,

    /// payload is no JSON
    #[snafu(display("payload is not json: {source}"))]
    Json {
        /// source error
        source: serde_json::Error,
    },

    /// payload shape does not match the packet type
    #[snafu(display("payload does not fit packet type {packet_type:?}"))]
    BadPayload {
        /// the type
        packet_type: packet::PacketType,
    },

    /// placeholder refers a missing attachment
    #[snafu(display("placeholder {num} has no attachment"))]
    BadPlaceholder {
        /// placeholder index
        num: u64,
    },

    /// a binary packet lost some attachments
    #[snafu(display("binary packet interrupted after {received} of {expected} attachments"))]
    Interrupted {
        /// declared count
        expected: usize,
        /// received count
        received: usize,
    },

    /// binary frame with no packet waiting it
    #[snafu(display("unexpected binary frame of {len} bytes"))]
    UnexpectedBinary {
        /// frame length
        len: usize,
    },

    /// open packet body is malformed
    #[snafu(display("malformed handshake: {source}"))]
    Handshake {
        /// source error
        source: serde_json::Error,
    },

    /// handshake asks a zero ping interval or timeout
    #[snafu(display("handshake ping interval {interval}ms or timeout {timeout}ms is zero"))]
    ZeroHeartbeat {
        /// ping interval in milliseconds
        interval: u64,
        /// ping timeout in milliseconds
        timeout: u64,
    },
}

/// Error of an emit
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(emit_error), context(suffix(false)))]
pub enum EmitError {
    /// the event name is reserved
    #[snafu(display("event name {event} is reserved"))]
    Reserved {
        /// the name
        event: String,
    },

    /// write failed
    #[snafu(display("emit failed: {source}"))]
    Send {
        /// source error
        source: SendError,
    },

    /// leave of a room not joined
    #[snafu(display("not in room {room}"))]
    NotInRoom {
        /// room name
        room: String,
    },

    /// an acknowledgement was already sent for this event
    #[snafu(display("event already acknowledged"))]
    AlreadyAcked,
}

/// Why an acknowledgement callback got no answer
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)), module(ack_error), context(suffix(false)))]
pub enum AckError {
    /// no answer in time
    #[snafu(display("no acknowledgement after {timeout:?}"))]
    Timeout {
        /// the limit
        timeout: Duration,
    },
}
