//! Byte-stream transports the connection engine runs on.
//!
//! A transport is handed to the engine already established: a [`Connector`]
//! performs the handshake (TCP, TLS, websocket upgrade...) and returns a
//! [`Link`], a sink for outbound [`Frame`]s and a stream of inbound ones.
//! The end of the stream means the remote closed, an error item means it
//! broke.

pub mod memory;
pub mod tcp;
pub mod ws;

use std::{fmt::Debug, pin::Pin};

use bytes::Bytes;
use futures_util::{Sink, Stream};
use snafu::prelude::*;

/// One unit of data crossing the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// text frame, always valid UTF-8
    Text(String),
    /// raw bytes
    Binary(Bytes),
}

impl Frame {
    /// payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    /// true if payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// true for text frame
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// take payload bytes
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(s) => Bytes::from(s),
            Self::Binary(b) => b,
        }
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Bytes> for Frame {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b.into())
    }
}

/// Error reported by a transport
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum TransportError {
    /// connect to remote failed
    #[snafu(display("connect {addr} failed: {source}"))]
    Connect {
        /// remote address
        addr: String,
        /// source error
        source: std::io::Error,
    },

    /// underlying io broken
    #[snafu(display("transport io broken: {source}"))]
    Io {
        /// source error
        source: std::io::Error,
    },

    /// underlying websocket stream broken
    #[snafu(display("underlying websocket stream broken: {source}"))]
    Websocket {
        /// source error
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// remote refused the connection
    #[snafu(display("connection refused: {reason}"))]
    Refused {
        /// reason
        reason: String,
    },

    /// handshake did not finish in time
    #[snafu(display("transport handshake timed out after {after:?}"))]
    Timeout {
        /// elapsed limit
        after: std::time::Duration,
    },

    /// the link is gone
    #[snafu(display("transport closed"))]
    Closed,
}

/// Outbound half of a link
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Inbound half of a link
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An established duplex channel.
pub struct Link {
    /// write side
    pub sink: FrameSink,
    /// read side
    pub stream: FrameStream,
}

impl Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

impl Link {
    /// Build a link from any sink/stream pair
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Frame, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens a fresh [`Link`] for every (re)connect attempt.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + Debug {
    /// perform the transport handshake
    async fn connect(&self) -> Result<Link, TransportError>;
}
