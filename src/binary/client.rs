use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use snafu::prelude::*;
use tokio::sync::oneshot;

use super::{error as decode_error, BinaryProbe, Header, Packet};
use crate::{
    config::{ConfigError, DEFAULT_SEND_TIMEOUT},
    connection::{ConnectError, Connection, ConnectionBuilder, ErrorEvent, Event, EventKind, SendError},
    heartbeat::HeartbeatConfig,
    middleware::Middleware,
    reconnect::ReconnectPolicy,
    transport::{tcp::TcpConnector, Connector, Frame},
};

/// Error of [`Client::request`]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum RequestError {
    /// request could not be written
    #[snafu(display("send request failed: {source}"))]
    Send {
        /// source error
        source: SendError,
    },

    /// no response in time
    #[snafu(display("no response after {timeout:?}"))]
    Timeout {
        /// the limit
        timeout: Duration,
    },

    /// connection dropped before the response came
    #[snafu(display("connection lost before response"))]
    Disconnected,
}

/// Callback of unsolicited packets
pub type PacketHandler = Arc<dyn Fn(&Packet) + Send + Sync>;

type Pending = HashMap<u32, oneshot::Sender<Result<Packet, RequestError>>>;

#[derive(Default)]
struct Inner {
    next_request_id: AtomicU32,
    pending: Mutex<Pending>,
    handlers: Mutex<Vec<PacketHandler>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("next_request_id", &self.next_request_id)
            .field("pending", &self.lock_pending().len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// non-zero, skips ids still waiting a response
    fn allocate(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 && !self.lock_pending().contains_key(&id) {
                return id;
            }
        }
    }

    fn on_frame(&self, connection: &Connection, frame: &Frame) {
        let packet = match frame {
            Frame::Binary(data) => Packet::decode(data.clone()),
            Frame::Text(_) => decode_error::Text.fail(),
        };

        let packet = match packet {
            Ok(p) => p,
            Err(err) => {
                log::warn!("Drop malformed binary frame: {}", err);
                connection.report_error(ErrorEvent::Protocol {
                    message: err.to_string(),
                });
                return;
            }
        };

        if packet.header.is_response {
            let waiter = self.lock_pending().remove(&packet.header.request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok(packet));
                }
                None => log::warn!(
                    "Drop response of unknown request {}",
                    packet.header.request_id
                ),
            }
            return;
        }

        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(&packet);
        }
    }

    fn fail_pending(&self) {
        let pending = std::mem::take(&mut *self.lock_pending());
        if !pending.is_empty() {
            log::debug!("Fail {} pending requests on disconnect", pending.len());
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(RequestError::Disconnected));
        }
    }
}

/// Request/response client of the binary protocol.
///
/// Responses are matched to requests by request id, in any order.
#[derive(Debug, Clone)]
pub struct Client {
    connection: Connection,
    inner: Arc<Inner>,
    request_timeout: Duration,
}

impl Client {
    /// Start building a client for a TCP address
    pub fn builder<S: Into<String>>(addr: S) -> ClientBuilder {
        ClientBuilder::new(TcpConnector::new(addr))
    }

    fn new(connection: Connection, request_timeout: Duration) -> Self {
        let inner = Arc::new(Inner::default());

        let conn = connection.downgrade();
        let this = inner.clone();
        connection.on(EventKind::Message, move |event| {
            if let (Event::Message(frame), Some(conn)) = (event, conn.upgrade()) {
                this.on_frame(&conn, frame);
            }
        });

        let this = inner.clone();
        connection.on(EventKind::Disconnected, move |_| this.fail_pending());

        Self {
            connection,
            inner,
            request_timeout,
        }
    }

    /// the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Connect, see [`Connection::connect`]
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connection.connect().await
    }

    /// Disconnect, pending requests fail
    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    /// Register a handler of packets that are not responses
    pub fn on_packet<F>(&self, handler: F)
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Call a function and wait its response with the default timeout
    pub async fn request<B: Into<Bytes>>(
        &self,
        function_id: u32,
        payload: B,
    ) -> Result<Packet, RequestError> {
        self.request_timeout(function_id, payload, self.request_timeout)
            .await
    }

    /// Call a function and wait its response, a response with a non-zero
    /// status code is still a response
    pub async fn request_timeout<B: Into<Bytes>>(
        &self,
        function_id: u32,
        payload: B,
        timeout: Duration,
    ) -> Result<Packet, RequestError> {
        let request_id = self.inner.allocate();
        let (tx, rx) = oneshot::channel();
        self.inner.lock_pending().insert(request_id, tx);

        log::trace!("Request {} to function {}", request_id, function_id);

        let packet = Packet::new(Header::request(function_id, request_id), payload);
        let result = self.exchange(packet, rx, timeout).await;

        if result.is_err() {
            self.inner.lock_pending().remove(&request_id);
        }

        result
    }

    async fn exchange(
        &self,
        packet: Packet,
        rx: oneshot::Receiver<Result<Packet, RequestError>>,
        timeout: Duration,
    ) -> Result<Packet, RequestError> {
        self.connection
            .send_timeout(packet.encode(), timeout)
            .await
            .context(error::Send)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => error::Disconnected.fail(),
            Err(_) => error::Timeout { timeout }.fail(),
        }
    }

    /// Send a packet that expects no response
    pub async fn notify<B: Into<Bytes>>(&self, function_id: u32, payload: B) -> Result<(), SendError> {
        let packet = Packet::new(Header::request(function_id, 0), payload);
        self.connection.send(packet.encode()).await
    }

    /// Send a response to a request received by [`on_packet`](Self::on_packet)
    pub async fn respond<B: Into<Bytes>>(
        &self,
        request: &Header,
        status_code: u32,
        payload: B,
    ) -> Result<(), SendError> {
        let mut header = request.to_response();
        header.status_code = status_code;
        self.connection
            .send(Packet::new(header, payload).encode())
            .await
    }
}

/// Builder of [`Client`], wraps a [`ConnectionBuilder`]
#[derive(Debug)]
pub struct ClientBuilder {
    connection: ConnectionBuilder,
    heartbeat: Option<HeartbeatConfig>,
    request_timeout: Duration,
}

impl ClientBuilder {
    /// Start with any connector, frames must be length delimited by it
    pub fn new<C: Connector + 'static>(connector: C) -> Self {
        Self {
            connection: ConnectionBuilder::new(connector),
            heartbeat: Some(HeartbeatConfig::default()),
            request_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Set connection id
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.connection = self.connection.id(id);
        self
    }

    /// Set heartbeat settings, `None` turns heartbeat off
    pub fn heartbeat(mut self, config: Option<HeartbeatConfig>) -> Self {
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

    /// Set default request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validate and create the client
    pub fn build(self) -> Result<Client, ConfigError> {
        ensure!(
            !self.request_timeout.is_zero(),
            crate::config::error::ZeroTimeout { what: "request" }
        );

        let mut builder = self.connection;
        if let Some(config) = self.heartbeat {
            builder = builder.heartbeat(config, BinaryProbe);
        }

        Ok(Client::new(builder.build()?, self.request_timeout))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::memory;

    fn client() -> (Client, memory::MemoryListener) {
        let (connector, listener) = memory::pair();
        let client = ClientBuilder::new(connector)
            .heartbeat(None)
            .request_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        (client, listener)
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (client, mut listener) = client();
        client.connect().await.unwrap();
        let mut peer = listener.accept().await.unwrap();

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.request(10, &b"one"[..]).await }
        });
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.request(20, &b"two"[..]).await }
        });

        let mut requests = vec![];
        for _ in 0..2 {
            let frame = peer.recv().await.unwrap();
            requests.push(Packet::decode(frame.into_bytes()).unwrap());
        }

        // answer in reverse order
        for request in requests.iter().rev() {
            let mut payload = request.payload.to_vec();
            payload.extend_from_slice(b"!");
            let response = Packet::new(request.header.to_response(), payload);
            peer.send(response.encode());
        }

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"one!"));
        assert_eq!(first.header.function_id, 10);
        assert_eq!(second.payload, Bytes::from_static(b"two!"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_cleans_pending() {
        let (client, mut listener) = client();
        client.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        let err = client
            .request_timeout(1, Bytes::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Timeout { .. }));
        assert!(client.inner.lock_pending().is_empty());
    }

    #[tokio::test]
    async fn test_pending_request_fails_on_disconnect() {
        let (client, mut listener) = client();
        client.connect().await.unwrap();
        let mut peer = listener.accept().await.unwrap();

        let request = tokio::spawn({
            let client = client.clone();
            async move { client.request(1, Bytes::new()).await }
        });
        peer.recv().await.unwrap();
        peer.close();

        assert!(matches!(
            request.await.unwrap(),
            Err(RequestError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_packets_and_garbage() {
        let (client, mut listener) = client();
        let got = Arc::new(Mutex::new(vec![]));
        let errors = Arc::new(Mutex::new(0));

        client.on_packet({
            let got = got.clone();
            move |packet| got.lock().unwrap().push(packet.header.function_id)
        });
        client.connection().on(EventKind::Error, {
            let errors = errors.clone();
            move |_| *errors.lock().unwrap() += 1
        });

        client.connect().await.unwrap();
        let peer = listener.accept().await.unwrap();

        peer.send(b"junk".to_vec());
        peer.send(Packet::new(Header::request(42, 0), Bytes::new()).encode());

        while got.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(*got.lock().unwrap(), vec![42]);
        assert_eq!(*errors.lock().unwrap(), 1);
    }
}
