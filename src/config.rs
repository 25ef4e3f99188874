//! Setup-time configuration errors and default values.

use std::time::Duration;

use snafu::prelude::*;

/// Default limit for a (re)connect attempt to finish the transport handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default limit for one `send` to go through the pipeline and the transport
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default heartbeat probe interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default time a probe waits for its answer
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default count of consecutive missed probes before the connection is dropped
pub const DEFAULT_MAX_MISSED_BEATS: u32 = 2;

/// Default time a Socket.IO acknowledgement is waited for
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Time a user disconnect waits for the writer to flush and close the transport
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the outbound queue of one session
pub(crate) const OUTBOUND_QUEUE_SIZE: usize = 64;

/// Error found when validating configuration, before any connect happens
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum ConfigError {
    /// reconnection backoff parameters are invalid
    #[snafu(display("invalid backoff: {reason}"))]
    InvalidBackoff {
        /// what is wrong
        reason: String,
    },

    /// heartbeat parameters are invalid
    #[snafu(display("invalid heartbeat: {reason}"))]
    InvalidHeartbeat {
        /// what is wrong
        reason: String,
    },

    /// a timeout is zero
    #[snafu(display("{what} timeout is zero"))]
    ZeroTimeout {
        /// which timeout
        what: &'static str,
    },

    /// two middleware entries share the same name
    #[snafu(display("duplicate middleware name {name}"))]
    DuplicateMiddleware {
        /// duplicated name
        name: String,
    },

    /// the endpoint url can not be used
    #[snafu(display("invalid url {url}: {reason}"))]
    InvalidUrl {
        /// input url
        url: String,
        /// what is wrong
        reason: String,
    },

    /// builder is missing a required part
    #[snafu(display("missing {what}"))]
    Missing {
        /// missing part
        what: &'static str,
    },
}
