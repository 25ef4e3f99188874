use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use super::{AckError, AckSender, Client, EmitError, Value};
use crate::transport::Frame;

/// Handler of one event name, gets the arguments and a reply handle when the
/// sender waits an acknowledgement
pub type EventHandler = Arc<dyn Fn(&[Value], Option<AckSender>) + Send + Sync>;

/// Called once with the acknowledgement arguments or the timeout
pub type AckCallback = Box<dyn FnOnce(Result<Vec<Value>, AckError>) + Send>;

pub(crate) struct PendingAck {
    pub serial: u64,
    pub callback: AckCallback,
}

/// A room this client joined, with the local members known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// room name
    pub name: String,
    /// socket ids
    pub members: BTreeSet<String>,
}

/// Client side state of one namespace
pub(crate) struct NamespaceState {
    pub path: String,
    /// the server acknowledged our connect
    pub connected: bool,
    /// connect is wanted, sent on every engine open
    pub active: bool,
    pub sid: Option<String>,
    pub auth: Option<serde_json::Value>,
    pub handlers: HashMap<String, Vec<EventHandler>>,
    pub pending_acks: HashMap<u32, PendingAck>,
    next_ack_id: u32,
    /// packets emitted before the connect acknowledgement, one entry per packet
    pub queue: VecDeque<Vec<Frame>>,
    pub rooms: HashMap<String, Room>,
}

impl fmt::Debug for NamespaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceState")
            .field("path", &self.path)
            .field("connected", &self.connected)
            .field("active", &self.active)
            .field("sid", &self.sid)
            .field("events", &self.handlers.keys().collect::<Vec<_>>())
            .field("pending_acks", &self.pending_acks.len())
            .field("queue", &self.queue.len())
            .field("rooms", &self.rooms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NamespaceState {
    pub fn new(path: String, auth: Option<serde_json::Value>) -> Self {
        Self {
            path,
            connected: false,
            active: true,
            sid: None,
            auth,
            handlers: HashMap::new(),
            pending_acks: HashMap::new(),
            next_ack_id: 0,
            queue: VecDeque::new(),
            rooms: HashMap::new(),
        }
    }

    /// Monotonic, wraps around, never an id still pending
    pub fn allocate_ack_id(&mut self) -> u32 {
        loop {
            let id = self.next_ack_id;
            self.next_ack_id = self.next_ack_id.wrapping_add(1);
            if !self.pending_acks.contains_key(&id) {
                return id;
            }
        }
    }

    /// Remove a pending ack if it is still the one registered under `serial`
    pub fn take_pending(&mut self, id: u32, serial: u64) -> Option<PendingAck> {
        match self.pending_acks.get(&id) {
            Some(pending) if pending.serial == serial => self.pending_acks.remove(&id),
            _ => None,
        }
    }

    pub fn handlers(&self, event: &str) -> Vec<EventHandler> {
        self.handlers.get(event).cloned().unwrap_or_default()
    }
}

/// Handle of one namespace of a [`Client`].
///
/// Emits made before the server acknowledged the namespace connect are queued
/// and flushed in order once it does.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub(crate) client: Client,
    pub(crate) path: String,
}

impl Namespace {
    /// namespace path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// true once the server acknowledged the connect
    pub fn is_connected(&self) -> bool {
        self.client.inner.with_namespace(&self.path, |ns| ns.connected)
    }

    /// socket id given by the server
    pub fn sid(&self) -> Option<String> {
        self.client.inner.with_namespace(&self.path, |ns| ns.sid.clone())
    }

    /// Register an event handler, reserved names included
    pub fn on<S, F>(&self, event: S, handler: F)
    where
        S: Into<String>,
        F: Fn(&[Value], Option<AckSender>) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.client.inner.with_namespace(&self.path, |ns| {
            ns.handlers.entry(event.into()).or_default().push(handler)
        });
    }

    /// Emit an event
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), EmitError> {
        self.client
            .inner
            .emit_event(&self.path, event, args, None)
            .await
    }

    /// Emit an event and wait its acknowledgement for the default ack timeout
    pub async fn emit_with_ack<F>(
        &self,
        event: &str,
        args: Vec<Value>,
        callback: F,
    ) -> Result<(), EmitError>
    where
        F: FnOnce(Result<Vec<Value>, AckError>) + Send + 'static,
    {
        let timeout = self.client.inner.ack_timeout;
        self.emit_with_ack_timeout(event, args, timeout, callback)
            .await
    }

    /// Emit an event and wait its acknowledgement at most `timeout`.
    ///
    /// `callback` runs exactly once, with the answer or with
    /// [`AckError::Timeout`]. It never runs when the emit itself fails.
    pub async fn emit_with_ack_timeout<F>(
        &self,
        event: &str,
        args: Vec<Value>,
        timeout: Duration,
        callback: F,
    ) -> Result<(), EmitError>
    where
        F: FnOnce(Result<Vec<Value>, AckError>) + Send + 'static,
    {
        self.client
            .inner
            .emit_event(&self.path, event, args, Some((Box::new(callback), timeout)))
            .await
    }

    /// Join a room
    pub async fn join(&self, room: &str) -> Result<(), EmitError> {
        self.emit("join", vec![Value::from(room)]).await?;

        self.client.inner.with_namespace(&self.path, |ns| {
            let member = ns.sid.clone();
            let entry = ns.rooms.entry(room.to_string()).or_insert_with(|| Room {
                name: room.to_string(),
                members: BTreeSet::new(),
            });
            entry.members.extend(member);
        });

        log::debug!("Joined room {} of {}", room, self.path);
        Ok(())
    }

    /// Leave a joined room
    pub async fn leave(&self, room: &str) -> Result<(), EmitError> {
        let joined = self
            .client
            .inner
            .with_namespace(&self.path, |ns| ns.rooms.contains_key(room));
        if !joined {
            return Err(EmitError::NotInRoom {
                room: room.to_string(),
            });
        }

        self.emit("leave", vec![Value::from(room)]).await?;

        self.client
            .inner
            .with_namespace(&self.path, |ns| ns.rooms.remove(room));

        log::debug!("Left room {} of {}", room, self.path);
        Ok(())
    }

    /// rooms joined, sorted by name
    pub fn rooms(&self) -> Vec<Room> {
        let mut rooms = self
            .client
            .inner
            .with_namespace(&self.path, |ns| ns.rooms.values().cloned().collect::<Vec<_>>());
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    /// Ask the server to connect this namespace again after a
    /// [`disconnect`](Self::disconnect)
    pub fn connect(&self) {
        self.client.inner.activate(&self.path);
    }

    /// Leave the namespace, queued packets are dropped
    pub async fn disconnect(&self) -> Result<(), EmitError> {
        self.client.inner.deactivate(&self.path).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ack_ids_skip_pending() {
        let mut ns = NamespaceState::new("/".to_string(), None);
        assert_eq!(ns.allocate_ack_id(), 0);
        assert_eq!(ns.allocate_ack_id(), 1);

        ns.pending_acks.insert(
            2,
            PendingAck {
                serial: 9,
                callback: Box::new(|_| {}),
            },
        );
        assert_eq!(ns.allocate_ack_id(), 3);

        ns.next_ack_id = u32::MAX;
        assert_eq!(ns.allocate_ack_id(), u32::MAX);
        assert_eq!(ns.allocate_ack_id(), 0);
    }

    #[test]
    fn test_take_pending_checks_serial() {
        let mut ns = NamespaceState::new("/".to_string(), None);
        ns.pending_acks.insert(
            0,
            PendingAck {
                serial: 1,
                callback: Box::new(|_| {}),
            },
        );

        assert!(ns.take_pending(0, 2).is_none());
        assert!(ns.take_pending(0, 1).is_some());
        assert!(ns.take_pending(0, 1).is_none());
    }
}
