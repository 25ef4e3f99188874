//! The connection engine.
//!
//! A [`Connection`] drives one logical link over a series of transport
//! sessions. It owns the state machine, runs the writer, reader and heartbeat
//! tasks of the live session, and schedules reconnect attempts when a session
//! is lost for any reason but a caller's request.
//!
//! Every state change happens under one lock, events produced by a change are
//! collected there and delivered to handlers after the lock is released.

mod builder;
mod event;
mod session;

pub use builder::ConnectionBuilder;
pub use event::{ErrorEvent, Event, EventKind, Handler};

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use snafu::prelude::*;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::CLOSE_TIMEOUT,
    heartbeat::{Action, HeartbeatProbe, Monitor},
    middleware::{Pipeline, PipelineError},
    reconnect::{Plan, Reconnector},
    state::{ConnectionState, DisconnectReason, InvalidTransition, StateMachine},
    transport::{Connector, Frame, TransportError},
};

use event::Handlers;
use session::{Outbound, SessionHandle};

/// Error of [`Connection::connect`]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum ConnectError {
    /// connect is not allowed in current state
    #[snafu(display("can not connect now: {source}"))]
    InvalidState {
        /// source error
        source: InvalidTransition,
    },

    /// transport handshake failed
    #[snafu(display("connect failed: {source}"))]
    Transport {
        /// source error
        source: Arc<TransportError>,
    },

    /// a disconnect or a newer connect superseded this attempt
    #[snafu(display("connect attempt cancelled"))]
    Cancelled,
}

/// Error of [`Connection::send`]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(send_error), context(suffix(false)))]
pub enum SendError {
    /// no live session
    #[snafu(display("connection is not connected, state {state}"))]
    NotConnected {
        /// state when send was called
        state: ConnectionState,
    },

    /// the session is shutting down, data was not written
    #[snafu(display("connection is closing"))]
    Closing,

    /// data was not written in time
    #[snafu(display("send timed out after {timeout:?}"))]
    Timeout {
        /// the limit
        timeout: Duration,
    },

    /// outbound middleware rejected the data
    #[snafu(display("outbound middleware failed: {source}"))]
    Middleware {
        /// source error
        source: PipelineError,
    },

    /// transport broke while writing
    #[snafu(display("write to transport failed: {source}"))]
    Transport {
        /// source error
        source: Arc<TransportError>,
    },
}

#[derive(Debug)]
struct Core {
    machine: StateMachine,
    reconnector: Reconnector,
    monitor: Monitor,
    session: Option<SessionHandle>,
    // bumped on every entry to connecting, identifies the attempt and its session
    epoch: u64,
}

/// A scheduled reconnect attempt, spawned once events are out
struct Retry {
    delay: Duration,
    ticket: u64,
    token: CancellationToken,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub id: String,
    pub pipeline: Pipeline,
    pub probe: Arc<dyn HeartbeatProbe>,
    pub heartbeat_enabled: bool,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    send_timeout: Duration,
    core: Mutex<Core>,
    handlers: Mutex<Handlers>,
    state_tx: watch::Sender<ConnectionState>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Shared {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn emit(&self, event: Event) {
        let handlers = self.lock_handlers().get(event.kind());
        for handler in handlers {
            handler(&event);
        }
    }

    fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn count_sent(&self, len: usize) {
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn count_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn transition(
        &self,
        core: &mut Core,
        to: ConnectionState,
    ) -> Result<ConnectionState, InvalidTransition> {
        let prev = core.machine.transition(to)?;
        if to.is_connected() {
            core.reconnector.reset();
        }
        self.state_tx.send_replace(to);
        Ok(prev)
    }

    fn begin_connecting(&self, core: &mut Core) -> Result<u64, InvalidTransition> {
        self.transition(core, ConnectionState::Connecting)?;
        core.epoch += 1;
        Ok(core.epoch)
    }

    async fn establish(self: &Arc<Self>, epoch: u64) -> Result<(), ConnectError> {
        log::debug!("Connection {} attempt {} start handshake", self.id, epoch);

        let result = match tokio::time::timeout(self.connect_timeout, self.connector.connect()).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                after: self.connect_timeout,
            }),
        };

        let link = match result {
            Ok(link) => link,
            Err(err) => {
                log::warn!("Connection {} handshake failed: {}", self.id, err);
                let err = Arc::new(err);
                self.fail(Some(epoch), DisconnectReason::Error, Some(err.clone()));
                return Err(ConnectError::Transport { source: err });
            }
        };

        let reader = {
            let mut core = self.lock_core();

            ensure!(
                core.epoch == epoch && core.machine.state() == ConnectionState::Connecting,
                error::Cancelled
            );

            self.transition(&mut core, ConnectionState::Connected)
                .context(error::InvalidState)?;
            core.monitor.reset(Instant::now());

            let (handle, reader) = session::start(self, epoch, link);
            core.session = Some(handle);
            reader
        };

        log::info!("Connection {} established", self.id);

        self.emit(Event::Connected);
        reader.spawn();

        Ok(())
    }

    /// Drop the current session for a reason other than a caller's request.
    ///
    /// `epoch` tells which session reports, a stale one is ignored.
    pub fn fail(
        self: &Arc<Self>,
        epoch: Option<u64>,
        reason: DisconnectReason,
        error: Option<Arc<TransportError>>,
    ) {
        let mut events = Vec::new();

        let retry = {
            let mut core = self.lock_core();

            if matches!(epoch, Some(e) if e != core.epoch) {
                log::trace!("Ignore failure of stale session {:?}", epoch);
                return;
            }

            let state = core.machine.state();
            if !matches!(
                state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                log::trace!("Ignore failure in state {}", state);
                return;
            }

            if let Some(session) = core.session.take() {
                session.cancel();
            }

            if let Err(err) = self.transition(&mut core, ConnectionState::Disconnected(reason)) {
                log::error!("Connection {} can not drop session: {}", self.id, err);
                return;
            }

            log::info!("Connection {} lost, reason: {}", self.id, reason);

            if let Some(source) = &error {
                events.push(Event::Error(ErrorEvent::Transport {
                    source: source.clone(),
                }));
            }
            events.push(Event::Disconnected(reason));

            self.schedule_reconnect(&mut core, reason, error.as_deref(), &mut events)
        };

        self.emit_all(events);

        if let Some(retry) = retry {
            tokio::spawn(reconnect_later(self.clone(), retry));
        }
    }

    fn schedule_reconnect(
        &self,
        core: &mut Core,
        reason: DisconnectReason,
        last_error: Option<&TransportError>,
        events: &mut Vec<Event>,
    ) -> Option<Retry> {
        match core.reconnector.plan(reason, last_error) {
            Plan::Stop => None,
            Plan::Exhausted { attempts } => {
                log::warn!(
                    "Connection {} gave up reconnecting after {} attempts",
                    self.id,
                    attempts
                );
                events.push(Event::Error(ErrorEvent::ReconnectExhausted { attempts }));
                None
            }
            Plan::Retry {
                attempt,
                delay,
                ticket,
                token,
            } => {
                if let Err(err) =
                    self.transition(core, ConnectionState::Reconnecting { attempt })
                {
                    log::error!("Connection {} can not schedule reconnect: {}", self.id, err);
                    core.reconnector.cancel();
                    return None;
                }

                log::info!(
                    "Connection {} reconnect attempt {} in {:?}",
                    self.id,
                    attempt,
                    delay
                );
                events.push(Event::Reconnecting { attempt, delay });

                Some(Retry {
                    delay,
                    ticket,
                    token,
                })
            }
        }
    }

    pub fn acknowledge(&self) {
        let rtt = self.lock_core().monitor.acknowledge(Instant::now());
        if let Some(rtt) = rtt {
            log::trace!("Heartbeat answered in {:?}", rtt);
        }
    }

    pub fn heartbeat_wakeup(&self, epoch: u64) -> Option<Instant> {
        let core = self.lock_core();
        (core.epoch == epoch && core.session.is_some()).then(|| core.monitor.next_wakeup())
    }

    pub fn heartbeat_poll(&self, epoch: u64, now: Instant) -> Option<Action> {
        let mut core = self.lock_core();
        (core.epoch == epoch && core.session.is_some()).then(|| core.monitor.poll(now))
    }
}

async fn reconnect_later(shared: Arc<Shared>, retry: Retry) {
    tokio::select! {
        biased;

        _ = retry.token.cancelled() => {
            log::debug!("Scheduled reconnect of {} cancelled", shared.id);
            return;
        }

        _ = tokio::time::sleep(retry.delay) => {}
    }

    let epoch = {
        let mut core = shared.lock_core();

        if !core.reconnector.claim(retry.ticket) {
            log::debug!("Scheduled reconnect of {} superseded", shared.id);
            return;
        }

        match shared.begin_connecting(&mut core) {
            Ok(epoch) => epoch,
            Err(err) => {
                log::debug!("Skip scheduled reconnect of {}: {}", shared.id, err);
                return;
            }
        }
    };

    if let Err(err) = shared.establish(epoch).await {
        log::debug!("Reconnect attempt of {} failed: {}", shared.id, err);
    }
}

/// A resilient, event driven connection.
///
/// Cheap to clone, all clones drive the same connection.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Start building a connection over `connector`
    pub fn builder<C: Connector + 'static>(connector: C) -> ConnectionBuilder {
        ConnectionBuilder::new(connector)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: String,
        connector: Arc<dyn Connector>,
        pipeline: Pipeline,
        probe: Arc<dyn HeartbeatProbe>,
        heartbeat: Option<crate::heartbeat::HeartbeatConfig>,
        reconnector: Reconnector,
        connect_timeout: Duration,
        send_timeout: Duration,
    ) -> Self {
        let initial = ConnectionState::default();
        let (state_tx, _) = watch::channel(initial);

        let core = Core {
            machine: StateMachine::new(initial),
            reconnector,
            monitor: Monitor::new(heartbeat.unwrap_or_default(), Instant::now()),
            session: None,
            epoch: 0,
        };

        Self {
            shared: Arc::new(Shared {
                id,
                pipeline,
                probe,
                heartbeat_enabled: heartbeat.is_some(),
                connector,
                connect_timeout,
                send_timeout,
                core: Mutex::new(core),
                handlers: Mutex::new(Handlers::default()),
                state_tx,
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        }
    }

    /// connection id
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// current state
    pub fn state(&self) -> ConnectionState {
        self.shared.lock_core().machine.state()
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// bytes written to transports, after outbound middleware
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    /// bytes read from transports, before inbound middleware
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    /// smoothed heartbeat round trip of the current session
    pub fn round_trip(&self) -> Option<Duration> {
        self.shared.lock_core().monitor.round_trip()
    }

    /// Register a handler for one event kind.
    ///
    /// Handlers run on the task that produced the event, in registration
    /// order. They must not block.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.lock_handlers().add(kind, Arc::new(handler));
    }

    /// Establish a session.
    ///
    /// Returns right away when already connected. A pending reconnect attempt
    /// is cancelled and replaced by this one.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let epoch = {
            let mut core = self.shared.lock_core();

            match core.machine.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Reconnecting { .. } => {
                    if core.reconnector.cancel() {
                        log::debug!("Manual connect replaces scheduled reconnect");
                    }
                }
                _ => {}
            }

            self.shared
                .begin_connecting(&mut core)
                .context(error::InvalidState)?
        };

        log::info!("Connecting {}", self.shared.id);

        self.shared.establish(epoch).await
    }

    /// Close the session on caller request, never followed by a reconnect.
    ///
    /// A write in progress and every queued send fail with
    /// [`SendError::Closing`], nothing more is written. Then waits the
    /// transport to close, a few seconds at most. Does nothing when already
    /// disconnected.
    pub async fn disconnect(&self) {
        let session = {
            let mut core = self.shared.lock_core();

            match core.machine.state() {
                ConnectionState::Connected => {
                    if let Err(err) = self
                        .shared
                        .transition(&mut core, ConnectionState::Disconnecting)
                    {
                        log::error!("Connection {} can not disconnect: {}", self.shared.id, err);
                        return;
                    }
                    core.session.take()
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                    core.reconnector.cancel();
                    let to = ConnectionState::Disconnected(DisconnectReason::UserInitiated);
                    if let Err(err) = self.shared.transition(&mut core, to) {
                        log::error!("Connection {} can not disconnect: {}", self.shared.id, err);
                        return;
                    }
                    drop(core);

                    log::info!("Connection {} stopped connecting", self.shared.id);
                    self.shared
                        .emit(Event::Disconnected(DisconnectReason::UserInitiated));
                    return;
                }
                ConnectionState::Disconnected(_) | ConnectionState::Disconnecting => return,
            }
        };

        log::info!("Disconnecting {}", self.shared.id);

        if let Some(session) = session {
            if tokio::time::timeout(CLOSE_TIMEOUT, session.shutdown())
                .await
                .is_err()
            {
                log::warn!("Writer of {} did not stop in time", self.shared.id);
            }
        }

        {
            let mut core = self.shared.lock_core();
            let to = ConnectionState::Disconnected(DisconnectReason::UserInitiated);
            if let Err(err) = self.shared.transition(&mut core, to) {
                log::error!("Connection {} can not finish disconnect: {}", self.shared.id, err);
                return;
            }
        }

        log::info!("Connection {} disconnected", self.shared.id);
        self.shared
            .emit(Event::Disconnected(DisconnectReason::UserInitiated));
    }

    /// Disconnect and drop every handler
    pub async fn close(self) {
        self.disconnect().await;
        self.shared.lock_handlers().clear();
    }

    /// Drop the session from outside, e.g. when an upper protocol layer
    /// sees the remote close.
    ///
    /// A user initiated reason runs a normal [`disconnect`](Self::disconnect)
    /// in background, other reasons go through the failure path and may be
    /// followed by a reconnect.
    pub fn abort(&self, reason: DisconnectReason) {
        if reason == DisconnectReason::UserInitiated {
            let this = self.clone();
            tokio::spawn(async move { this.disconnect().await });
            return;
        }

        self.shared.fail(None, reason, None);
    }

    /// Deliver an error event raised by an upper layer
    pub fn report_error(&self, error: ErrorEvent) {
        self.shared.emit(Event::Error(error));
    }

    /// Replace heartbeat interval and timeout of the current and later sessions
    pub fn reconfigure_heartbeat(&self, interval: Duration, timeout: Duration) {
        let mut core = self.shared.lock_core();
        core.monitor.reconfigure(interval, timeout);
        if let Some(session) = &core.session {
            session.kick.notify_one();
        }
    }

    /// Send one frame with the default send timeout
    pub async fn send<F: Into<Frame>>(&self, frame: F) -> Result<(), SendError> {
        self.send_timeout(frame, self.shared.send_timeout).await
    }

    /// Send one frame, giving up after `timeout`
    pub async fn send_timeout<F: Into<Frame>>(
        &self,
        frame: F,
        timeout: Duration,
    ) -> Result<(), SendError> {
        self.send_all(vec![frame.into()], timeout).await
    }

    /// Send frames back to back, nothing else is written in between.
    ///
    /// Succeeds once every frame reached the transport.
    pub async fn send_all(&self, frames: Vec<Frame>, timeout: Duration) -> Result<(), SendError> {
        let outbound = {
            let core = self.shared.lock_core();
            match core.machine.state() {
                ConnectionState::Connected => core.session.as_ref().map(|s| s.outbound.clone()),
                ConnectionState::Disconnecting => return Err(SendError::Closing),
                state => return Err(SendError::NotConnected { state }),
            }
        };
        let outbound = outbound.context(send_error::Closing)?;

        match tokio::time::timeout(timeout, enqueue(outbound, frames)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout { timeout }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.shared))
    }
}

/// Queue a batch and wait the writer's outcome
async fn enqueue(outbound: mpsc::Sender<Outbound>, frames: Vec<Frame>) -> Result<(), SendError> {
    let (done, result) = oneshot::channel();

    outbound
        .send(Outbound {
            frames,
            done: Some(done),
        })
        .await
        .map_err(|_| SendError::Closing)?;

    result.await.unwrap_or(Err(SendError::Closing))
}

/// Handle held by event handlers of upper layers, breaks the
/// connection -> handler -> connection cycle
#[derive(Debug, Clone)]
pub(crate) struct WeakConnection(Weak<Shared>);

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|shared| Connection { shared })
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::{
        heartbeat::HeartbeatConfig,
        reconnect::ReconnectPolicy,
        transport::memory::{self, MemoryListener},
    };

    fn record(conn: &Connection) -> Arc<StdMutex<Vec<String>>> {
        let log = Arc::new(StdMutex::new(vec![]));
        for kind in [
            EventKind::Connected,
            EventKind::Message,
            EventKind::Disconnected,
            EventKind::Reconnecting,
            EventKind::Error,
        ] {
            let log = log.clone();
            conn.on(kind, move |event| {
                let line = match event {
                    Event::Connected => "connected".to_string(),
                    Event::Message(f) => format!("message:{}", String::from_utf8_lossy(f.as_bytes())),
                    Event::Disconnected(r) => format!("disconnected:{}", r),
                    Event::Reconnecting { attempt, .. } => format!("reconnecting:{}", attempt),
                    Event::Error(e) => format!("error:{}", e),
                };
                log.lock().unwrap().push(line);
            });
        }
        log
    }

    fn plain() -> (Connection, MemoryListener) {
        let (connector, listener) = memory::pair();
        let conn = Connection::builder(connector).id("test").build().unwrap();
        (conn, listener)
    }

    #[tokio::test]
    async fn test_connect_send_receive_disconnect() {
        let (conn, mut listener) = plain();
        let log = record(&conn);

        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        let mut peer = listener.accept().await.unwrap();

        conn.send("hi").await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::from("hi")));
        assert_eq!(conn.bytes_sent(), 2);

        peer.send("yo");
        while log.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }

        conn.disconnect().await;
        assert_eq!(
            conn.state(),
            ConnectionState::Disconnected(DisconnectReason::UserInitiated)
        );
        assert_eq!(peer.recv().await, None);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["connected", "message:yo", "disconnected:user initiated"]
        );
        assert_eq!(conn.bytes_received(), 2);
    }

    #[tokio::test]
    async fn test_send_when_not_connected() {
        let (conn, _listener) = plain();
        assert!(matches!(
            conn.send("x").await,
            Err(SendError::NotConnected {
                state: ConnectionState::Disconnected(DisconnectReason::UserInitiated)
            })
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let (conn, mut listener) = plain();
        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();
        assert_eq!(listener.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_refused_connect_without_policy() {
        let (conn, listener) = plain();
        let log = record(&conn);
        listener.set_refusing(true);

        assert!(matches!(
            conn.connect().await,
            Err(ConnectError::Transport { .. })
        ));
        assert_eq!(
            conn.state(),
            ConnectionState::Disconnected(DisconnectReason::Error)
        );
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with("error:"));
        assert_eq!(log[1], "disconnected:error");
    }

    #[tokio::test]
    async fn test_remote_close_then_reconnect() {
        let (connector, mut listener) = memory::pair();
        let conn = Connection::builder(connector)
            .reconnect(ReconnectPolicy::immediate())
            .build()
            .unwrap();
        let mut state = conn.watch_state();

        conn.connect().await.unwrap();
        let mut peer = listener.accept().await.unwrap();
        peer.close();

        let _second = listener.accept().await.unwrap();
        state
            .wait_for(|s| s.is_connected())
            .await
            .unwrap();
        assert_eq!(listener.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_drops_session() {
        let (connector, mut listener) = memory::pair();
        let config = HeartbeatConfig::new(Duration::from_secs(1), Duration::from_secs(1), 2);
        let conn = Connection::builder(connector)
            .heartbeat(config, crate::heartbeat::SilentProbe)
            .build()
            .unwrap();
        let log = record(&conn);

        conn.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert!(conn.state().is_connected());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(
            conn.state(),
            ConnectionState::Disconnected(DisconnectReason::HeartbeatTimeout)
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "connected",
                "error:heartbeat probe missed 1 times in a row",
                "disconnected:heartbeat timeout"
            ]
        );
    }
}
