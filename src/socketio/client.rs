use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use snafu::prelude::*;
use tokio::sync::mpsc;

use super::{
    codec::{self, Decoder, Incoming},
    emit_error,
    engine::{self, EngineProbe, Handshake, PacketType as EngineType},
    namespace::{AckCallback, NamespaceState, PendingAck},
    packet::{PacketType, DEFAULT_NAMESPACE},
    AckError, EmitError, Namespace, ProtocolError, Value, RESERVED_EVENTS,
};
use crate::{
    config::{ConfigError, DEFAULT_ACK_TIMEOUT, DEFAULT_SEND_TIMEOUT},
    connection::{ConnectError, Connection, ConnectionBuilder, ErrorEvent, Event, EventKind},
    heartbeat::HeartbeatConfig,
    middleware::Middleware,
    reconnect::ReconnectPolicy,
    state::DisconnectReason,
    transport::{ws::WsConnector, Connector, Frame},
};

/// What the connection hands to the dispatcher, in arrival order
#[derive(Debug)]
enum Input {
    Connected,
    Frame(Frame),
    Disconnected(DisconnectReason),
    Join(String),
}

#[derive(Debug, Default)]
struct State {
    /// engine handshake done on the current session
    opened: bool,
    engine_sid: Option<String>,
    namespaces: HashMap<String, NamespaceState>,
}

impl State {
    fn namespace(&mut self, path: &str) -> &mut NamespaceState {
        self.namespaces
            .entry(path.to_string())
            .or_insert_with(|| NamespaceState::new(path.to_string(), None))
    }
}

pub(crate) struct Inner {
    connection: Connection,
    state: Mutex<State>,
    input: mpsc::UnboundedSender<Input>,
    dispatcher: Mutex<Option<mpsc::UnboundedReceiver<Input>>>,
    pub(crate) ack_timeout: Duration,
    send_timeout: Duration,
    serials: AtomicU64,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("connection", &self.connection)
            .field("state", &*self.lock_state())
            .field("ack_timeout", &self.ack_timeout)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn with_namespace<R, F>(&self, path: &str, f: F) -> R
    where
        F: FnOnce(&mut NamespaceState) -> R,
    {
        f(self.lock_state().namespace(path))
    }

    fn protocol_error(&self, err: ProtocolError) {
        log::warn!("Peer broke the protocol: {}", err);
        self.connection.report_error(ErrorEvent::Protocol {
            message: err.to_string(),
        });
    }

    fn fire(&self, path: &str, event: &str, args: &[Value], ack: Option<AckSender>) {
        let handlers = self.with_namespace(path, |ns| ns.handlers(event));
        if handlers.is_empty() {
            log::debug!("No handler of event {} on {}", event, path);
        }
        for handler in handlers {
            handler(args, ack.clone());
        }
    }

    pub(crate) fn activate(self: &Arc<Self>, path: &str) {
        let join = {
            let mut state = self.lock_state();
            let opened = state.opened;
            let ns = state.namespace(path);
            let join = !ns.active && opened;
            ns.active = true;
            join
        };

        if join {
            let _ = self.input.send(Input::Join(path.to_string()));
        }
    }

    pub(crate) async fn deactivate(&self, path: &str) -> Result<(), EmitError> {
        let was_connected = self.with_namespace(path, |ns| {
            let was = ns.connected;
            ns.active = false;
            ns.connected = false;
            ns.queue.clear();
            was
        });

        if was_connected {
            log::info!("Leave namespace {}", path);
            let frames = codec::encode(PacketType::Disconnect, path, None, None);
            self.connection
                .send_all(frames, self.send_timeout)
                .await
                .context(emit_error::Send)?;
        }
        Ok(())
    }

    async fn send_connect(&self, path: &str) {
        let auth = self.with_namespace(path, |ns| ns.auth.clone());
        let frames = codec::encode(PacketType::Connect, path, None, auth.map(Value::from));

        log::debug!("Connect namespace {}", path);

        if let Err(err) = self.connection.send_all(frames, self.send_timeout).await {
            log::warn!("Send connect of namespace {} failed: {}", path, err);
        }
    }

    pub(crate) async fn emit_event(
        self: &Arc<Self>,
        path: &str,
        event: &str,
        args: Vec<Value>,
        ack: Option<(AckCallback, Duration)>,
    ) -> Result<(), EmitError> {
        ensure!(
            !RESERVED_EVENTS.contains(&event),
            emit_error::Reserved { event }
        );

        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(Value::from(event));
        payload.extend(args);

        let (live, ack) = {
            let mut state = self.lock_state();
            let ns = state.namespace(path);

            let ack = ack.map(|(callback, timeout)| {
                let id = ns.allocate_ack_id();
                let serial = self.serials.fetch_add(1, Ordering::Relaxed);
                ns.pending_acks.insert(id, PendingAck { serial, callback });
                (id, serial, timeout)
            });

            let frames = codec::encode(
                PacketType::Event,
                path,
                ack.map(|(id, _, _)| id),
                Some(Value::Array(payload)),
            );

            if ns.connected {
                (Some(frames), ack)
            } else {
                log::debug!(
                    "Namespace {} not connected, queue event {} ({} waiting)",
                    path,
                    event,
                    ns.queue.len()
                );
                ns.queue.push_back(frames);
                (None, ack)
            }
        };

        if let Some((id, serial, timeout)) = ack {
            tokio::spawn(expire_ack(
                Arc::downgrade(self),
                path.to_string(),
                id,
                serial,
                timeout,
            ));
        }

        if let Some(frames) = live {
            if let Err(source) = self.connection.send_all(frames, self.send_timeout).await {
                if let Some((id, serial, _)) = ack {
                    self.with_namespace(path, |ns| ns.take_pending(id, serial));
                }
                return Err(EmitError::Send { source });
            }
        }

        Ok(())
    }

    async fn handle(self: &Arc<Self>, decoder: &mut Decoder, input: Input) {
        match input {
            Input::Connected => {
                if let Err(err) = decoder.interrupt() {
                    self.protocol_error(err);
                }
                log::debug!("Transport up, waiting engine handshake");
            }
            Input::Disconnected(reason) => self.on_disconnected(decoder, reason),
            Input::Join(path) => {
                let opened = self.lock_state().opened;
                if opened {
                    self.send_connect(&path).await;
                }
            }
            Input::Frame(Frame::Binary(data)) => match decoder.push_binary(data) {
                Ok(Some(incoming)) => self.on_packet(incoming).await,
                Ok(None) => {}
                Err(err) => self.protocol_error(err),
            },
            Input::Frame(Frame::Text(text)) => {
                if let Err(err) = decoder.interrupt() {
                    self.protocol_error(err);
                }

                match engine::parse(&text) {
                    Ok((EngineType::Open, body)) => self.on_open(body).await,
                    Ok((EngineType::Close, _)) => {
                        log::info!("Server closed the engine session");
                        self.connection.abort(DisconnectReason::RemoteClosed);
                    }
                    Ok((EngineType::Message, body)) => match decoder.decode_text(body) {
                        Ok(Some(incoming)) => self.on_packet(incoming).await,
                        Ok(None) => {}
                        Err(err) => self.protocol_error(err),
                    },
                    Ok((other, _)) => log::trace!("Ignore engine packet {:?}", other),
                    Err(err) => self.protocol_error(err),
                }
            }
        }
    }

    async fn on_open(self: &Arc<Self>, body: &str) {
        let handshake = match Handshake::parse(body) {
            Ok(h) => h,
            Err(err) => {
                self.protocol_error(err);
                return;
            }
        };

        log::info!(
            "Engine session {} open, ping interval {:?}, timeout {:?}",
            handshake.sid,
            handshake.ping_interval(),
            handshake.ping_timeout()
        );

        // a zero value keeps the defaults, the session still opens
        match handshake.heartbeat() {
            Ok((interval, timeout)) => self.connection.reconfigure_heartbeat(interval, timeout),
            Err(err) => self.protocol_error(err),
        }

        let paths: Vec<String> = {
            let mut state = self.lock_state();
            state.opened = true;
            state.engine_sid = Some(handshake.sid);
            state
                .namespaces
                .values()
                .filter(|ns| ns.active)
                .map(|ns| ns.path.clone())
                .collect()
        };

        for path in paths {
            self.send_connect(&path).await;
        }
    }

    fn on_disconnected(&self, decoder: &mut Decoder, reason: DisconnectReason) {
        if let Err(err) = decoder.interrupt() {
            self.protocol_error(err);
        }

        let paths: Vec<String> = {
            let mut state = self.lock_state();
            state.opened = false;
            state.engine_sid = None;
            state
                .namespaces
                .values_mut()
                .filter(|ns| ns.connected)
                .map(|ns| {
                    ns.connected = false;
                    ns.path.clone()
                })
                .collect()
        };

        let args = [Value::from(reason.to_string())];
        for path in paths {
            self.fire(&path, "disconnect", &args, None);
        }
    }

    async fn on_packet(self: &Arc<Self>, incoming: Incoming) {
        let path = incoming.namespace.clone();

        let known = self.lock_state().namespaces.contains_key(&path);
        if !known {
            log::warn!("Drop packet of unknown namespace {}", path);
            return;
        }

        match incoming.packet_type {
            PacketType::Connect => self.on_namespace_connect(incoming).await,
            PacketType::Disconnect => {
                log::info!("Server disconnected namespace {}", path);
                self.with_namespace(&path, |ns| {
                    ns.connected = false;
                    ns.active = false;
                });
                self.fire(&path, "disconnect", &[Value::from("io server disconnect")], None);
            }
            PacketType::ConnectError => {
                log::warn!("Server refused namespace {}", path);
                let args: Vec<Value> = incoming.payload.into_iter().collect();
                self.fire(&path, "connect_error", &args, None);
            }
            PacketType::Event | PacketType::BinaryEvent => self.on_event(incoming),
            PacketType::Ack | PacketType::BinaryAck => self.on_ack(incoming),
        }
    }

    async fn on_namespace_connect(self: &Arc<Self>, incoming: Incoming) {
        let path = incoming.namespace;
        let sid = incoming
            .payload
            .as_ref()
            .and_then(Value::as_object)
            .and_then(|obj| obj.get("sid"))
            .and_then(Value::as_string)
            .cloned();

        self.with_namespace(&path, |ns| ns.sid = sid);

        // flush queued packets in order, connected only once the queue is empty
        loop {
            let batch = self.with_namespace(&path, |ns| {
                let batch = ns.queue.pop_front();
                if batch.is_none() {
                    ns.connected = true;
                }
                batch
            });

            let frames = match batch {
                Some(frames) => frames,
                None => break,
            };

            if let Err(err) = self.connection.send_all(frames.clone(), self.send_timeout).await {
                log::warn!("Flush queued packet of {} failed: {}", path, err);
                self.with_namespace(&path, |ns| ns.queue.push_front(frames));
                return;
            }
        }

        log::info!("Namespace {} connected", path);
        self.fire(&path, "connect", &[], None);
    }

    fn on_event(self: &Arc<Self>, incoming: Incoming) {
        let mut args = match incoming.payload {
            Some(Value::Array(args)) => args,
            _ => return,
        };
        if args.is_empty() {
            return;
        }
        let event = match args.remove(0) {
            Value::String(name) => name,
            _ => return,
        };

        log::trace!("Event {} on {} with {} args", event, incoming.namespace, args.len());

        let ack = incoming.ack_id.map(|ack_id| AckSender {
            client: Client {
                inner: self.clone(),
            },
            namespace: incoming.namespace.clone(),
            ack_id,
            sent: Arc::new(AtomicBool::new(false)),
        });

        self.fire(&incoming.namespace, &event, &args, ack);
    }

    fn on_ack(&self, incoming: Incoming) {
        let id = match incoming.ack_id {
            Some(id) => id,
            None => return,
        };

        let pending = self.with_namespace(&incoming.namespace, |ns| ns.pending_acks.remove(&id));
        let pending = match pending {
            Some(p) => p,
            None => {
                log::warn!(
                    "Drop acknowledgement {} on {} with no pending emit",
                    id,
                    incoming.namespace
                );
                return;
            }
        };

        let args = match incoming.payload {
            Some(Value::Array(args)) => args,
            _ => Vec::new(),
        };
        (pending.callback)(Ok(args));
    }
}

async fn expire_ack(inner: Weak<Inner>, path: String, id: u32, serial: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let inner = match inner.upgrade() {
        Some(inner) => inner,
        None => return,
    };

    let pending = inner.with_namespace(&path, |ns| ns.take_pending(id, serial));
    if let Some(pending) = pending {
        log::debug!("Acknowledgement {} on {} timed out", id, path);
        (pending.callback)(Err(AckError::Timeout { timeout }));
    }
}

async fn dispatch(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Input>) {
    log::debug!("Dispatcher task start");

    let mut decoder = Decoder::new();

    while let Some(input) = rx.recv().await {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        inner.handle(&mut decoder, input).await;
    }

    log::debug!("Dispatcher task stop");
}

/// Replies to an event that waits an acknowledgement.
///
/// Clones share one reply, only the first [`send`](Self::send) writes.
#[derive(Debug, Clone)]
pub struct AckSender {
    client: Client,
    namespace: String,
    ack_id: u32,
    sent: Arc<AtomicBool>,
}

impl AckSender {
    /// the ack id of the event
    pub fn ack_id(&self) -> u32 {
        self.ack_id
    }

    /// Send the acknowledgement
    pub async fn send(self, args: Vec<Value>) -> Result<(), EmitError> {
        ensure!(
            !self.sent.swap(true, Ordering::SeqCst),
            emit_error::AlreadyAcked
        );

        let frames = codec::encode(
            PacketType::Ack,
            &self.namespace,
            Some(self.ack_id),
            Some(Value::Array(args)),
        );
        let inner = &self.client.inner;
        inner
            .connection
            .send_all(frames, inner.send_timeout)
            .await
            .context(emit_error::Send)
    }
}

/// Socket.IO client.
///
/// Cheap to clone. Inbound packets are handled one by one on a dispatcher
/// task, event handlers run there and must not block.
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) inner: Arc<Inner>,
}

impl Client {
    /// Start building a client of a server url like `http://host:port`
    pub fn builder(url: &str) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    fn new(
        connection: Connection,
        auth: Option<serde_json::Value>,
        ack_timeout: Duration,
        send_timeout: Duration,
    ) -> Self {
        let (input, rx) = mpsc::unbounded_channel();

        let mut state = State::default();
        state.namespaces.insert(
            DEFAULT_NAMESPACE.to_string(),
            NamespaceState::new(DEFAULT_NAMESPACE.to_string(), auth),
        );

        let tx = input.clone();
        connection.on(EventKind::Connected, move |_| {
            let _ = tx.send(Input::Connected);
        });
        let tx = input.clone();
        connection.on(EventKind::Message, move |event| {
            if let Event::Message(frame) = event {
                let _ = tx.send(Input::Frame(frame.clone()));
            }
        });
        let tx = input.clone();
        connection.on(EventKind::Disconnected, move |event| {
            if let Event::Disconnected(reason) = event {
                let _ = tx.send(Input::Disconnected(*reason));
            }
        });

        Self {
            inner: Arc::new(Inner {
                connection,
                state: Mutex::new(state),
                input,
                dispatcher: Mutex::new(Some(rx)),
                ack_timeout,
                send_timeout,
                serials: AtomicU64::new(0),
            }),
        }
    }

    /// the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// engine session id of the current session
    pub fn sid(&self) -> Option<String> {
        self.inner.lock_state().engine_sid.clone()
    }

    /// Connect the transport, namespaces connect once the engine handshake is done
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let rx = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = rx {
            tokio::spawn(dispatch(Arc::downgrade(&self.inner), rx));
        }

        self.inner.connection.connect().await
    }

    /// Leave every namespace, close the engine session and the transport
    pub async fn disconnect(&self) {
        let paths: Vec<String> = self
            .inner
            .lock_state()
            .namespaces
            .values()
            .filter(|ns| ns.connected)
            .map(|ns| ns.path.clone())
            .collect();

        let mut frames = Vec::new();
        for path in &paths {
            self.inner.with_namespace(path, |ns| ns.connected = false);
            frames.extend(codec::encode(PacketType::Disconnect, path, None, None));
        }
        frames.push(engine::frame(EngineType::Close, ""));

        if let Err(err) = self
            .inner
            .connection
            .send_all(frames, self.inner.send_timeout)
            .await
        {
            log::debug!("Send close packets failed: {}", err);
        }

        self.inner.connection.disconnect().await;

        let reason = [Value::from("io client disconnect")];
        for path in &paths {
            self.inner.fire(path, "disconnect", &reason, None);
        }
    }

    /// Handle of a namespace, connected as soon as the engine session is open
    pub fn namespace(&self, path: &str) -> Namespace {
        self.namespace_with_auth(path, None)
    }

    /// Handle of a namespace connected with an auth payload
    pub fn namespace_with_auth(&self, path: &str, auth: Option<serde_json::Value>) -> Namespace {
        let join = {
            let mut state = self.inner.lock_state();
            let opened = state.opened;
            let created = !state.namespaces.contains_key(path);
            let ns = state.namespace(path);
            if auth.is_some() {
                ns.auth = auth;
            }
            created && opened
        };

        if join {
            let _ = self.inner.input.send(Input::Join(path.to_string()));
        }

        Namespace {
            client: self.clone(),
            path: path.to_string(),
        }
    }

    /// Handle of the default namespace
    pub fn socket(&self) -> Namespace {
        self.namespace(DEFAULT_NAMESPACE)
    }

    /// Register a handler on the default namespace
    pub fn on<S, F>(&self, event: S, handler: F)
    where
        S: Into<String>,
        F: Fn(&[Value], Option<AckSender>) + Send + Sync + 'static,
    {
        self.socket().on(event, handler)
    }

    /// Emit on the default namespace
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), EmitError> {
        self.socket().emit(event, args).await
    }

    /// Emit on the default namespace and wait the acknowledgement
    pub async fn emit_with_ack<F>(
        &self,
        event: &str,
        args: Vec<Value>,
        callback: F,
    ) -> Result<(), EmitError>
    where
        F: FnOnce(Result<Vec<Value>, AckError>) + Send + 'static,
    {
        self.socket().emit_with_ack(event, args, callback).await
    }
}

/// Turn a server url into the Engine.IO websocket endpoint
fn endpoint(url: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason,
    };

    let mut parsed = url::Url::parse(url).map_err(|e| invalid(e.to_string()))?;

    let scheme = match parsed.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {}", other))),
    };
    parsed
        .set_scheme(scheme)
        .map_err(|_| invalid("can not switch scheme".to_string()))?;

    if parsed.path().is_empty() || parsed.path() == "/" {
        parsed.set_path("/socket.io/");
    }
    parsed
        .query_pairs_mut()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");

    Ok(parsed.to_string())
}

/// Builder of [`Client`], wraps a [`ConnectionBuilder`]
#[derive(Debug)]
pub struct ClientBuilder {
    invalid: Option<ConfigError>,
    connection: ConnectionBuilder,
    heartbeat: HeartbeatConfig,
    auth: Option<serde_json::Value>,
    ack_timeout: Duration,
    send_timeout: Duration,
}

impl ClientBuilder {
    /// Start with a server url
    pub fn new(url: &str) -> Self {
        match endpoint(url) {
            Ok(endpoint) => Self::with_connector(WsConnector::new(endpoint)),
            Err(err) => {
                let mut builder = Self::with_connector(WsConnector::new(url));
                builder.invalid = Some(err);
                builder
            }
        }
    }

    /// Start with any connector carrying Engine.IO text and binary frames
    pub fn with_connector<C: Connector + 'static>(connector: C) -> Self {
        Self {
            invalid: None,
            connection: ConnectionBuilder::new(connector),
            heartbeat: HeartbeatConfig::new(engine::DEFAULT_PING_INTERVAL, engine::DEFAULT_PING_TIMEOUT, 1),
            auth: None,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Set connection id
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.connection = self.connection.id(id);
        self
    }

    /// Heartbeat settings used until the server handshake replaces interval and timeout
    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = config;
        self
    }

    /// Enable automatic reconnection
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.connection = self.connection.reconnect(policy);
        self
    }

    /// Add a middleware
    pub fn middleware<S, M>(mut self, name: S, priority: i32, middleware: M) -> Self
    where
        S: Into<String>,
        M: Middleware + 'static,
    {
        self.connection = self.connection.middleware(name, priority, middleware);
        self
    }

    /// Auth payload sent with the default namespace connect
    pub fn auth(mut self, auth: serde_json::Value) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Set default ack timeout
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set send timeout of every packet
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the limit of one handshake
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connection = self.connection.connect_timeout(timeout);
        self
    }

    /// Validate and create the client
    pub fn build(self) -> Result<Client, ConfigError> {
        if let Some(err) = self.invalid {
            return Err(err);
        }
        ensure!(
            !self.ack_timeout.is_zero(),
            crate::config::error::ZeroTimeout { what: "ack" }
        );

        let connection = self
            .connection
            .send_timeout(self.send_timeout)
            .heartbeat(self.heartbeat, EngineProbe)
            .build()?;

        Ok(Client::new(
            connection,
            self.auth,
            self.ack_timeout,
            self.send_timeout,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_endpoint() {
        assert_eq!(
            endpoint("http://localhost:3000").unwrap(),
            "ws://localhost:3000/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            endpoint("https://example.com/custom/").unwrap(),
            "wss://example.com/custom/?EIO=4&transport=websocket"
        );
        assert!(matches!(
            endpoint("ftp://example.com"),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            endpoint("not a url"),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_invalid_url_fails_at_build() {
        assert!(matches!(
            Client::builder("::").build(),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            Client::builder("http://localhost")
                .ack_timeout(Duration::ZERO)
                .build(),
            Err(ConfigError::ZeroTimeout { what: "ack" })
        ));
    }

    #[tokio::test]
    async fn test_reserved_events_are_rejected() {
        let client = Client::builder("http://localhost").build().unwrap();
        assert!(matches!(
            client.emit("disconnect", vec![]).await,
            Err(EmitError::Reserved { .. })
        ));
    }
}
