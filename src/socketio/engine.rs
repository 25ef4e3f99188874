//! Engine.IO v4 framing over websocket text frames.

use std::time::Duration;

use serde::Deserialize;
use snafu::prelude::*;

use super::{error, ProtocolError};
use crate::{
    heartbeat::{Beat, HeartbeatProbe},
    transport::Frame,
};

/// Ping interval used until the handshake tells the real one
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25000);

/// Ping timeout used until the handshake tells the real one
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(20000);

/// Engine.IO packet type, the first character of a text frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, enum_as_inner::EnumAsInner)]
pub enum PacketType {
    /// handshake from server
    Open,
    /// transport close
    Close,
    /// liveness probe
    Ping,
    /// probe answer
    Pong,
    /// carries a Socket.IO packet
    Message,
    /// transport upgrade
    Upgrade,
    /// nothing
    Noop,
}

impl PacketType {
    /// wire digit
    pub fn as_char(&self) -> char {
        match self {
            Self::Open => '0',
            Self::Close => '1',
            Self::Ping => '2',
            Self::Pong => '3',
            Self::Message => '4',
            Self::Upgrade => '5',
            Self::Noop => '6',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        let t = match c {
            '0' => Self::Open,
            '1' => Self::Close,
            '2' => Self::Ping,
            '3' => Self::Pong,
            '4' => Self::Message,
            '5' => Self::Upgrade,
            '6' => Self::Noop,
            _ => return None,
        };
        Some(t)
    }
}

/// Split a text frame into its type and body
pub fn parse(text: &str) -> Result<(PacketType, &str), ProtocolError> {
    let mut chars = text.chars();
    let c = chars.next().context(error::Empty)?;
    let packet_type = PacketType::from_char(c).context(error::UnknownEngineType { c })?;
    Ok((packet_type, chars.as_str()))
}

/// Text frame of a packet type with a body
pub fn frame(packet_type: PacketType, body: &str) -> Frame {
    let mut s = String::with_capacity(body.len() + 1);
    s.push(packet_type.as_char());
    s.push_str(body);
    Frame::Text(s)
}

/// Body of the open packet
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// engine session id
    pub sid: String,
    /// transports the server can upgrade to
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// milliseconds between server pings
    pub ping_interval: u64,
    /// milliseconds the server waits a pong
    pub ping_timeout: u64,
    /// largest accepted payload
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl Handshake {
    /// Parse the open packet body
    pub fn parse(body: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(body).context(error::Handshake)
    }

    /// server ping interval
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval)
    }

    /// server ping timeout
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout)
    }

    /// Ping interval and timeout, both must be non-zero
    pub fn heartbeat(&self) -> Result<(Duration, Duration), ProtocolError> {
        ensure!(
            self.ping_interval > 0 && self.ping_timeout > 0,
            error::ZeroHeartbeat {
                interval: self.ping_interval,
                timeout: self.ping_timeout
            }
        );
        Ok((self.ping_interval(), self.ping_timeout()))
    }
}

/// Engine.IO v4 heartbeat: the server pings, the client answers.
///
/// Passive, a tick only opens the deadline the next server ping must meet.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineProbe;

impl HeartbeatProbe for EngineProbe {
    fn ping(&self) -> Option<Frame> {
        None
    }

    fn classify(&self, frame: &Frame) -> Beat {
        match frame {
            Frame::Text(text) => match parse(text) {
                Ok((PacketType::Ping, body)) => Beat::Ping(Some(self::frame(PacketType::Pong, body))),
                Ok((PacketType::Pong, _)) => Beat::Pong,
                _ => Beat::Data,
            },
            Frame::Binary(_) => Beat::Data,
        }
    }
}
