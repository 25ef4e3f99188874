//! In-process transport, the remote end is driven by a [`MemoryPeer`].

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use futures_util::{sink, stream};
use tokio::sync::mpsc;

use super::{Connector, Frame, Link, TransportError};

#[derive(Debug, Default)]
struct Gate {
    refusing: AtomicBool,
    connects: AtomicUsize,
}

/// Connector side of an in-process transport
#[derive(Debug)]
pub struct MemoryConnector {
    gate: Arc<Gate>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Accepts the peers created by a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryListener {
    gate: Arc<Gate>,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Create a connected connector/listener pair
pub fn pair() -> (MemoryConnector, MemoryListener) {
    let gate = Arc::new(Gate::default());
    let (tx, rx) = mpsc::unbounded_channel();

    (
        MemoryConnector {
            gate: gate.clone(),
            peers: tx,
        },
        MemoryListener { gate, peers: rx },
    )
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        self.gate.connects.fetch_add(1, Ordering::SeqCst);

        if self.gate.refusing.load(Ordering::SeqCst) {
            log::debug!("Memory listener refusing connection");
            return Err(TransportError::Refused {
                reason: "listener is refusing connections".to_string(),
            });
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Result<Frame, TransportError>>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();

        self.peers
            .send(MemoryPeer {
                tx: Some(inbound_tx),
                rx: outbound_rx,
            })
            .map_err(|_| TransportError::Refused {
                reason: "listener dropped".to_string(),
            })?;

        let sink = sink::unfold(outbound_tx, |tx, frame: Frame| async move {
            tx.send(frame).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });
        let stream = stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        Ok(Link::new(sink, stream))
    }
}

impl MemoryListener {
    /// Wait the next connection
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Make following connects fail (or succeed again)
    pub fn set_refusing(&self, refusing: bool) {
        self.gate.refusing.store(refusing, Ordering::SeqCst);
    }

    /// how many connects were attempted, refused ones included
    pub fn connect_count(&self) -> usize {
        self.gate.connects.load(Ordering::SeqCst)
    }
}

/// Remote end of one in-process link
#[derive(Debug)]
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    /// Deliver a frame to the client, false if the client side is gone
    pub fn send(&self, frame: impl Into<Frame>) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Ok(frame.into())).is_ok(),
            None => false,
        }
    }

    /// Wait the next frame written by the client, `None` once the client closed
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Take a frame written by the client if one is ready
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// End the client stream cleanly
    pub fn close(&mut self) {
        self.tx.take();
    }

    /// Break the client stream with an error
    pub fn fail(&mut self, reason: &str) {
        if let Some(tx) = self.tx.take() {
            let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, reason.to_string());
            let _ = tx.send(Err(TransportError::Io { source: err }));
        }
    }
}
