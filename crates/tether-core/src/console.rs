//! Console orchestration
//!
//! The [`Console`] owns everything shared across connections: the dispatch
//! table, the session registry, the notification queue and the table of
//! accepted connections. Feature sessions are only ever constructed through
//! its `open_*` methods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConsoleConfig;
use crate::connection::{Connection, ConnectionId, ConnectionInfo};
use crate::dispatch::Dispatcher;
use crate::error::{ConsoleError, Result};
use crate::events::{notification_channel, Notification, NotificationReceiver, Notifier};
use crate::features::{
    AudioCaptureHandler, Feature, FeatureError, FeatureHandler, LogRetrievalHandler,
    RegistryEditorHandler,
};
use crate::session::{Session, SessionRegistry};
use crate::sync::lock;
use crate::transport::{FrameReceiver, Transport};

pub type LogRetrievalSession = Arc<Session<Feature<LogRetrievalHandler>>>;
pub type AudioCaptureSession = Arc<Session<Feature<AudioCaptureHandler>>>;
pub type RegistryEditorSession = Arc<Session<Feature<RegistryEditorHandler>>>;

struct HeldConnection {
    connection: Connection,
    delivery: JoinHandle<()>,
}

pub struct Console {
    config: ConsoleConfig,
    dispatcher: Arc<Dispatcher>,
    sessions: SessionRegistry,
    notifications: mpsc::UnboundedSender<Notification>,
    connections: Mutex<HashMap<ConnectionId, HeldConnection>>,
}

impl Console {
    /// Create a console and the receiving end of its notification queue.
    ///
    /// The receiver belongs to the presentation context; drain it with
    /// [`crate::events::pump`] or by hand.
    pub fn new(config: ConsoleConfig) -> (Self, NotificationReceiver) {
        let (notifications, rx) = notification_channel();
        let console = Self {
            config,
            dispatcher: Arc::new(Dispatcher::new()),
            sessions: SessionRegistry::new(),
            notifications,
            connections: Mutex::new(HashMap::new()),
        };
        (console, rx)
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Take ownership of a freshly handshaken endpoint.
    ///
    /// Any connection already held for the same endpoint is torn down
    /// first. The new connection is connected and its delivery loop is
    /// spawned on the current tokio runtime.
    pub fn accept(
        &self,
        info: ConnectionInfo,
        transport: impl Transport + 'static,
        inbound: FrameReceiver,
    ) -> Connection {
        let info = if info.download_directory.as_os_str().is_empty() {
            let dir = self.config.download_directory_for(&info.display_name);
            info.with_download_directory(dir)
        } else {
            info
        };

        let connection = Connection::new(info, transport);
        connection.connect();
        let delivery = connection.spawn_delivery(inbound, Arc::clone(&self.dispatcher));
        let endpoint = connection.info().endpoint.clone();

        // Swap under one lock so concurrent accepts for an endpoint leave one entry
        let stale: Vec<(ConnectionId, HeldConnection)> = {
            let mut connections = lock(&self.connections);
            let stale_ids: Vec<ConnectionId> = connections
                .iter()
                .filter(|(_, held)| held.connection.info().endpoint == endpoint)
                .map(|(id, _)| *id)
                .collect();
            let stale = stale_ids
                .into_iter()
                .filter_map(|id| connections.remove(&id).map(|held| (id, held)))
                .collect();
            connections.insert(
                connection.id(),
                HeldConnection {
                    connection: connection.clone(),
                    delivery,
                },
            );
            stale
        };

        for (id, held) in stale {
            warn!(
                "Endpoint {} reconnected, dropping previous connection {}",
                endpoint, id
            );
            self.teardown(id, held);
        }

        info!(
            "Accepted {} ({}) as {} over {} transport",
            connection.info().display_name,
            endpoint,
            connection.id(),
            connection.transport_type()
        );
        connection
    }

    /// Disconnect and forget a connection. Returns false if it was not held.
    ///
    /// Attached handlers see the disconnect before any registration is
    /// removed.
    pub fn drop_connection(&self, id: ConnectionId) -> bool {
        let Some(held) = lock(&self.connections).remove(&id) else {
            return false;
        };
        self.teardown(id, held);
        true
    }

    fn teardown(&self, id: ConnectionId, held: HeldConnection) {
        held.connection.disconnect();
        held.delivery.abort();
        let removed = self.dispatcher.unregister_connection(id);

        debug!(
            "Dropped connection {} ({} registration(s) removed)",
            id, removed
        );
    }

    /// Drop every held connection
    pub fn shutdown(&self) {
        let ids: Vec<ConnectionId> = lock(&self.connections).keys().copied().collect();
        for id in ids {
            self.drop_connection(id);
        }
    }

    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.connections)
            .values()
            .map(|held| held.connection.clone())
            .collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        lock(&self.connections)
            .get(&id)
            .map(|held| held.connection.clone())
    }

    pub fn open_log_retrieval(&self, id: ConnectionId) -> Result<LogRetrievalSession> {
        let timeout = self.config.request_timeout();
        self.open(id, move |connection, notifier| {
            LogRetrievalHandler::new(connection, notifier, timeout)
        })
    }

    pub fn open_audio_capture(&self, id: ConnectionId) -> Result<AudioCaptureSession> {
        let bitrate = self.config.default_bitrate;
        self.open(id, move |connection, notifier| {
            AudioCaptureHandler::new(connection, notifier, bitrate)
        })
    }

    pub fn open_registry_editor(&self, id: ConnectionId) -> Result<RegistryEditorSession> {
        let timeout = self.config.request_timeout();
        self.open(id, move |connection, notifier| {
            RegistryEditorHandler::new(connection, notifier, timeout)
        })
    }

    fn open<H, B>(&self, id: ConnectionId, build: B) -> Result<Arc<Session<Feature<H>>>>
    where
        H: FeatureHandler,
        B: FnOnce(Connection, Notifier) -> H,
    {
        let connection = self
            .connection(id)
            .ok_or(ConsoleError::UnknownConnection(id))?;
        if !connection.is_connected() {
            return Err(FeatureError::NotConnected.into());
        }

        self.sessions.get_or_create(id, H::FEATURE, || -> Result<Feature<H>> {
            let notifier = Notifier::new(id, H::FEATURE, self.notifications.clone());
            let handler = build(connection.clone(), notifier);
            let feature = Feature::new(handler, connection.clone(), Arc::clone(&self.dispatcher));
            feature.attach()?;

            info!(
                "Opened {}",
                connection.info().window_title(H::FEATURE.title())
            );
            Ok(feature)
        })
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.shutdown();
    }
}
