use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use snafu::prelude::*;

use crate::{
    middleware::PipelineError, state::DisconnectReason, transport::Frame,
    transport::TransportError,
};

/// Event kinds handlers can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// see [`Event::Connected`]
    Connected,
    /// see [`Event::Message`]
    Message,
    /// see [`Event::Disconnected`]
    Disconnected,
    /// see [`Event::Reconnecting`]
    Reconnecting,
    /// see [`Event::Error`]
    Error,
}

/// Something that happened to the connection, not caused by a caller's own call.
#[derive(Debug)]
pub enum Event {
    /// session is up
    Connected,
    /// inbound application frame, after middleware
    Message(Frame),
    /// session is gone
    Disconnected(DisconnectReason),
    /// a reconnect attempt is scheduled
    Reconnecting {
        /// zero based attempt index
        attempt: u32,
        /// time until the attempt
        delay: Duration,
    },
    /// a failure not tied to a caller
    Error(ErrorEvent),
}

impl Event {
    /// kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Message(_) => EventKind::Message,
            Self::Disconnected(_) => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// Payload of [`Event::Error`]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error_event), context(suffix(false)))]
pub enum ErrorEvent {
    /// the transport broke, the connection is dropped
    #[snafu(display("transport failed: {source}"))]
    Transport {
        /// source error
        source: Arc<TransportError>,
    },

    /// middleware rejected an inbound frame, the frame is dropped
    #[snafu(display("inbound frame dropped: {source}"))]
    Inbound {
        /// source error
        source: PipelineError,
    },

    /// upper protocol layer dropped a malformed packet
    #[snafu(display("protocol error: {message}"))]
    Protocol {
        /// reason
        message: String,
    },

    /// a heartbeat probe went unanswered
    #[snafu(display("heartbeat probe missed {misses} times in a row"))]
    HeartbeatMissed {
        /// consecutive misses
        misses: u32,
    },

    /// reconnection policy stopped retrying
    #[snafu(display("reconnect gave up after {attempts} attempts"))]
    ReconnectExhausted {
        /// attempts made
        attempts: u32,
    },
}

/// Event callback
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Handlers {
    map: HashMap<EventKind, Vec<Handler>>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self.map.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("Handlers").field("counts", &counts).finish()
    }
}

impl Handlers {
    pub fn add(&mut self, kind: EventKind, handler: Handler) {
        self.map.entry(kind).or_default().push(handler);
    }

    /// handlers of a kind, in registration order
    pub fn get(&self, kind: EventKind) -> Vec<Handler> {
        self.map.get(&kind).cloned().unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
