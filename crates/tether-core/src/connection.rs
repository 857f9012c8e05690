//! Control connections
//!
//! A [`Connection`] is one remote endpoint. It owns the outbound transport,
//! tracks the connected/disconnected state, fans state transitions out to
//! subscribers and runs the delivery loop that feeds inbound messages into
//! the dispatch table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::messages::Message;
use crate::sync::lock;
use crate::transport::{FrameReceiver, Transport, TransportError, TransportType};

/// Capacity of the inbound message broadcast used by observers
const MESSAGE_BROADCAST_CAPACITY: usize = 256;

/// Opaque identity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Session metadata negotiated during the handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Physical endpoint identity (e.g. "203.0.113.7:4782")
    pub endpoint: String,
    /// Human-readable name of the remote machine
    pub display_name: String,
    /// Where files fetched from this endpoint are stored
    pub download_directory: PathBuf,
    /// Capabilities advertised by the endpoint
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ConnectionInfo {
    pub fn new(endpoint: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            display_name: display_name.into(),
            download_directory: PathBuf::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_download_directory(mut self, dir: PathBuf) -> Self {
        self.download_directory = dir;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Title for a feature window opened against this endpoint
    pub fn window_title(&self, feature: &str) -> String {
        format!("{feature} - {}@{}", self.display_name, self.endpoint)
    }
}

/// A connect/disconnect transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub connection: ConnectionId,
    pub is_connected: bool,
}

type StateCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

struct ConnectionInner {
    id: ConnectionId,
    info: ConnectionInfo,
    transport: Box<dyn Transport>,
    transport_type: TransportType,
    state: Mutex<ConnectionState>,
    /// Serializes transitions together with their notifications
    transition: Mutex<()>,
    subscribers: Mutex<Vec<(u64, StateCallback)>>,
    next_subscriber: AtomicU64,
    received: broadcast::Sender<Message>,
}

/// Handle to one remote endpoint. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.info.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a connection in the `Disconnected` state
    pub fn new(info: ConnectionInfo, transport: impl Transport + 'static) -> Self {
        let (received, _) = broadcast::channel(MESSAGE_BROADCAST_CAPACITY);
        let transport_type = transport.transport_type();
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::new(),
                info,
                transport: Box::new(transport),
                transport_type,
                state: Mutex::new(ConnectionState::Disconnected),
                transition: Mutex::new(()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                received,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    pub fn transport_type(&self) -> TransportType {
        self.inner.transport_type
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Transition to `Connected`. Returns false if already connected.
    pub fn connect(&self) -> bool {
        self.transition(ConnectionState::Connected)
    }

    /// Transition to `Disconnected`. Returns false if already disconnected.
    pub fn disconnect(&self) -> bool {
        self.transition(ConnectionState::Disconnected)
    }

    fn transition(&self, target: ConnectionState) -> bool {
        // Subscribers must not call connect/disconnect from their callback.
        let _transition = lock(&self.inner.transition);

        {
            let mut state = lock(&self.inner.state);
            if *state == target {
                return false;
            }
            *state = target;
        }

        let event = ConnectionEvent {
            connection: self.inner.id,
            is_connected: target == ConnectionState::Connected,
        };

        let subscribers: Vec<StateCallback> = lock(&self.inner.subscribers)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        info!(
            "Connection {} ({}) is now {:?}, notifying {} subscriber(s)",
            self.inner.id,
            self.inner.info.endpoint,
            target,
            subscribers.len()
        );

        for callback in subscribers {
            callback(&event);
        }

        true
    }

    /// Subscribe to connect/disconnect transitions.
    ///
    /// The callback runs synchronously on the thread performing the
    /// transition. Dropping the returned guard unsubscribes.
    pub fn subscribe_state<F>(&self, callback: F) -> StateSubscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers).push((id, Arc::new(callback)));

        StateSubscription {
            connection: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn state_subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Subscribe to the inbound message stream, in wire order
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.inner.received.subscribe()
    }

    /// Encode and queue a message for transmission.
    ///
    /// Callers on different threads must serialize their own sends if they
    /// care about relative order.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let frame = message
            .encode()
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        trace!(
            "Sending {} ({} bytes) to {}",
            message.kind(),
            frame.len(),
            self.inner.info.endpoint
        );

        self.inner.transport.send(frame)
    }

    /// Hand one decoded inbound message to observers and the dispatch table
    pub fn deliver(&self, dispatcher: &Dispatcher, message: Message) {
        // No observers is the common case
        let _ = self.inner.received.send(message.clone());
        dispatcher.dispatch(self.inner.id, &message);
    }

    /// Run the delivery loop for this connection.
    ///
    /// Frames are decoded and dispatched strictly one at a time. The loop
    /// ends when the inbound channel closes (which disconnects the
    /// connection) or when the connection has been disconnected.
    pub fn spawn_delivery(
        &self,
        mut inbound: FrameReceiver,
        dispatcher: Arc<Dispatcher>,
    ) -> JoinHandle<()> {
        let connection = self.clone();

        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if !connection.is_connected() {
                    debug!(
                        "Dropping frame for disconnected connection {}",
                        connection.id()
                    );
                    break;
                }

                match Message::decode(&frame) {
                    Ok(message) => connection.deliver(&dispatcher, message),
                    Err(e) => warn!(
                        "Dropping undecodable frame from {}: {}",
                        connection.info().endpoint,
                        e
                    ),
                }
            }

            if connection.disconnect() {
                info!("Inbound channel for {} closed", connection.info().endpoint);
            }
        })
    }
}

/// Guard for a state subscription; unsubscribes on drop
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct StateSubscription {
    connection: Weak<ConnectionInner>,
    id: u64,
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.connection.upgrade() {
            lock(&inner.subscribers).retain(|(id, _)| *id != self.id);
        }
    }
}
