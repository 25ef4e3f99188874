//! # Relink
//!
//! Client side connection engine.
//!
//! A [`Connection`] owns one transport [`Link`](transport::Link) at a time and
//! drives it through a lifecycle state machine. It brings the link back with a
//! [`ReconnectPolicy`], watches it with a [`heartbeat`] monitor and runs every
//! frame through a [`middleware`] pipeline.
//!
//! Two protocol clients are built on top of it:
//!
//! - [`socketio::Client`], Socket.IO v5 over Engine.IO v4 websocket
//! - [`binary::Client`], request/response over a fixed 20 byte header
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use relink::{socketio, ReconnectPolicy};
//!
//! let client = socketio::Client::builder("http://localhost:3000")
//!     .reconnect(ReconnectPolicy::exponential(
//!         std::time::Duration::from_millis(500),
//!         2.0,
//!         std::time::Duration::from_secs(10),
//!     ))
//!     .build()?;
//!
//! client.on("chat", |args, _ack| println!("{:?}", args));
//! client.connect().await?;
//! client.emit("chat", vec!["hello".into()]).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod binary;
pub mod config;
pub mod connection;
pub mod heartbeat;
pub mod middleware;
pub mod reconnect;
pub mod socketio;
pub mod state;
pub mod transport;

pub use config::ConfigError;
pub use connection::{
    ConnectError, Connection, ConnectionBuilder, ErrorEvent, Event, EventKind, SendError,
};
pub use heartbeat::HeartbeatConfig;
pub use reconnect::ReconnectPolicy;
pub use state::{ConnectionState, DisconnectReason};
pub use transport::{Connector, Frame, TransportError};
