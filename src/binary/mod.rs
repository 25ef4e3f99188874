//! Length-prefixed binary request/response protocol.
//!
//! Every frame on the wire is a 4-byte big-endian length (added by
//! [`TcpConnector`](crate::transport::tcp::TcpConnector)), then this fixed
//! 20-byte header, then the payload:
//!
//! ```text
//! 0       2         4      5            6           10           14           18         20
//! | tag   | version | type | isResponse | requestId | functionId | statusCode | reserved |
//! ```
//!
//! All integers are big-endian. A frame whose function id is
//! [`HEARTBEAT_FUNCTION_ID`] is a heartbeat.

mod client;
mod probe;

pub use client::{Client, ClientBuilder, PacketHandler, RequestError};
pub use probe::BinaryProbe;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::prelude::*;

/// Size of the fixed header
pub const HEADER_LEN: usize = 20;

/// Value of the header tag field
pub const MAGIC: u16 = 0xC0DE;

/// Protocol version written in every header
pub const VERSION: u16 = 1;

/// Function id reserved for heartbeat frames
pub const HEARTBEAT_FUNCTION_ID: u32 = 0xFFFF;

/// Error when parsing a frame
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum DecodeError {
    /// shorter than a header
    #[snafu(display("frame of {len} bytes is shorter than header"))]
    TooShort {
        /// frame length
        len: usize,
    },

    /// tag field mismatch
    #[snafu(display("bad magic {tag:#06x}"))]
    BadMagic {
        /// tag found
        tag: u16,
    },

    /// binary protocol frames are never text
    #[snafu(display("unexpected text frame"))]
    Text,
}

/// The fixed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// protocol version
    pub version: u16,
    /// application defined packet type
    pub packet_type: u8,
    /// true on a response, false on a request or notification
    pub is_response: bool,
    /// correlates a response with its request, 0 for notifications
    pub request_id: u32,
    /// called function
    pub function_id: u32,
    /// application status, 0 on success
    pub status_code: u32,
    /// unused, kept for the peer
    pub reserved: u16,
}

impl Header {
    /// Request header of a function call
    pub fn request(function_id: u32, request_id: u32) -> Self {
        Self {
            version: VERSION,
            packet_type: 0,
            is_response: false,
            request_id,
            function_id,
            status_code: 0,
            reserved: 0,
        }
    }

    /// Heartbeat ping header
    pub fn heartbeat() -> Self {
        Self::request(HEARTBEAT_FUNCTION_ID, 0)
    }

    /// true on heartbeat frames
    pub fn is_heartbeat(&self) -> bool {
        self.function_id == HEARTBEAT_FUNCTION_ID
    }

    /// Same header turned into a response
    pub fn to_response(mut self) -> Self {
        self.is_response = true;
        self
    }

    /// Write the 20 header bytes
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u16(MAGIC);
        buf.put_u16(self.version);
        buf.put_u8(self.packet_type);
        buf.put_u8(self.is_response as u8);
        buf.put_u32(self.request_id);
        buf.put_u32(self.function_id);
        buf.put_u32(self.status_code);
        buf.put_u16(self.reserved);
    }

    /// Read the 20 header bytes from the front of `buf`
    pub fn read(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        ensure!(
            buf.remaining() >= HEADER_LEN,
            error::TooShort {
                len: buf.remaining()
            }
        );

        let tag = buf.get_u16();
        ensure!(tag == MAGIC, error::BadMagic { tag });

        Ok(Self {
            version: buf.get_u16(),
            packet_type: buf.get_u8(),
            is_response: buf.get_u8() != 0,
            request_id: buf.get_u32(),
            function_id: buf.get_u32(),
            status_code: buf.get_u32(),
            reserved: buf.get_u16(),
        })
    }
}

/// Header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// header
    pub header: Header,
    /// payload
    pub payload: Bytes,
}

impl Packet {
    /// Create packet
    pub fn new<B: Into<Bytes>>(header: Header, payload: B) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Encode header and payload, without the length prefix
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header.write(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame body
    pub fn decode(mut data: Bytes) -> Result<Self, DecodeError> {
        let header = Header::read(&mut data)?;
        Ok(Self {
            header,
            payload: data,
        })
    }
}
