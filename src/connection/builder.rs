use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use snafu::prelude::*;

use super::Connection;
use crate::{
    config::{error, ConfigError, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SEND_TIMEOUT},
    heartbeat::{HeartbeatConfig, HeartbeatProbe, SilentProbe},
    middleware::{Middleware, MiddlewareEntry, Pipeline, PipelineBuilder},
    reconnect::{ReconnectPolicy, Reconnector},
    transport::Connector,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Collects and validates the setup of a [`Connection`].
///
/// Nothing is checked until [`build`](Self::build), which fails with a
/// [`ConfigError`] before any network activity happens.
#[derive(Debug)]
pub struct ConnectionBuilder {
    connector: Arc<dyn Connector>,
    id: Option<String>,
    heartbeat: Option<(HeartbeatConfig, Arc<dyn HeartbeatProbe>)>,
    reconnect: Option<ReconnectPolicy>,
    pipeline: PipelineBuilder,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl ConnectionBuilder {
    /// Start with a connector and default settings: no heartbeat, no reconnect
    pub fn new<C: Connector + 'static>(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
            id: None,
            heartbeat: None,
            reconnect: None,
            pipeline: Pipeline::builder(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Set connection id used in logs
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Enable heartbeat with the probe frames of a protocol
    pub fn heartbeat<P: HeartbeatProbe + 'static>(mut self, config: HeartbeatConfig, probe: P) -> Self {
        self.heartbeat = Some((config, Arc::new(probe)));
        self
    }

    /// Enable automatic reconnection
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Add a named middleware, higher priority is closer to the application
    pub fn middleware<S, M>(mut self, name: S, priority: i32, middleware: M) -> Self
    where
        S: Into<String>,
        M: Middleware + 'static,
    {
        self.pipeline
            .push(MiddlewareEntry::new(name, priority, middleware));
        self
    }

    /// Set the limit of one handshake
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default limit of one send
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Validate and create the connection, it starts disconnected
    pub fn build(self) -> Result<Connection, ConfigError> {
        ensure!(
            !self.connect_timeout.is_zero(),
            error::ZeroTimeout { what: "connect" }
        );
        ensure!(
            !self.send_timeout.is_zero(),
            error::ZeroTimeout { what: "send" }
        );

        if let Some((config, _)) = &self.heartbeat {
            config.validate()?;
        }
        if let Some(policy) = &self.reconnect {
            policy.validate()?;
        }
        let pipeline = self.pipeline.build()?;

        let id = self
            .id
            .unwrap_or_else(|| format!("conn-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)));

        let (heartbeat, probe) = match self.heartbeat {
            Some((config, probe)) => (Some(config), probe),
            None => (None, Arc::new(SilentProbe) as Arc<dyn HeartbeatProbe>),
        };

        log::debug!(
            "Connection {} built, middleware {:?}, heartbeat {:?}, reconnect {:?}",
            id,
            pipeline.names(),
            heartbeat,
            self.reconnect
        );

        Ok(Connection::from_parts(
            id,
            self.connector,
            pipeline,
            probe,
            heartbeat,
            Reconnector::new(self.reconnect),
            self.connect_timeout,
            self.send_timeout,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{middleware::SizeLimit, transport::memory};

    #[test]
    fn test_build_validates_before_connect() {
        let (connector, listener) = memory::pair();
        let err = ConnectionBuilder::new(connector)
            .reconnect(ReconnectPolicy::exponential(
                Duration::from_secs(1),
                0.5,
                Duration::from_secs(10),
            ))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBackoff { .. }));
        assert_eq!(listener.connect_count(), 0);

        let (connector, _) = memory::pair();
        let err = ConnectionBuilder::new(connector)
            .middleware("limit", 1, SizeLimit::new(1))
            .middleware("limit", 2, SizeLimit::new(2))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateMiddleware { .. }));

        let (connector, _) = memory::pair();
        let err = ConnectionBuilder::new(connector)
            .send_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroTimeout { what: "send" });
    }

    #[test]
    fn test_default_ids_are_unique() {
        let (a, _) = memory::pair();
        let (b, _) = memory::pair();
        let a = ConnectionBuilder::new(a).build().unwrap();
        let b = ConnectionBuilder::new(b).build().unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("conn-"));
    }
}
