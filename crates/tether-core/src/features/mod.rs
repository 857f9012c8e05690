//! Feature handlers
//!
//! A feature handler owns one feature session's state on one connection.
//! Attaching it acquires, as a single unit, its dispatch registrations and
//! its connection-state subscription; detaching (or dropping the owning
//! [`Feature`]) releases all of them.
//!
//! - [`logs`] - log bundle retrieval (request/response)
//! - [`audio`] - live audio capture (streaming)
//! - [`registry`] - registry editing (request/response, many in flight)

pub mod audio;
pub mod logs;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::connection::{Connection, ConnectionEvent, StateSubscription};
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::messages::MessageKind;
use crate::sync::lock;
use crate::transport::TransportError;

pub use audio::{AudioCaptureHandler, StreamParams, StreamState};
pub use logs::{LogArchive, LogRetrievalHandler};
pub use registry::{RegistryEditorHandler, RegistryTarget};

/// The features a console can open against a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    LogRetrieval,
    AudioCapture,
    RegistryEditor,
}

impl FeatureKind {
    /// Human-readable title
    pub fn title(&self) -> &'static str {
        match self {
            FeatureKind::LogRetrieval => "Log Retrieval",
            FeatureKind::AudioCapture => "Audio Capture",
            FeatureKind::RegistryEditor => "Registry Editor",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureKind::LogRetrieval => write!(f, "log_retrieval"),
            FeatureKind::AudioCapture => write!(f, "audio_capture"),
            FeatureKind::RegistryEditor => write!(f, "registry_editor"),
        }
    }
}

/// State of a request/response feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Idle,
    AwaitingResponse,
}

/// Errors raised by feature handler operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeatureError {
    #[error("Feature handler is already attached")]
    AlreadyAttached,

    #[error("Connection is not connected")]
    NotConnected,

    #[error("A request for this target is already pending")]
    RequestPending,

    #[error("Unsupported bitrate: {0}")]
    UnsupportedBitrate(u32),

    #[error("Unknown audio device: {0}")]
    UnknownDevice(u32),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for FeatureError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => FeatureError::NotConnected,
            other => FeatureError::Transport(other),
        }
    }
}

/// A message handler that belongs to one feature on one connection
pub trait FeatureHandler: MessageHandler + 'static {
    /// Which feature this handler implements
    const FEATURE: FeatureKind;

    /// Message kinds this handler consumes
    fn message_kinds(&self) -> &'static [MessageKind];

    /// Called synchronously on every connect/disconnect transition
    fn connection_changed(&self, event: &ConnectionEvent);

    /// Called before registrations are released
    fn detaching(&self) {}
}

/// Registrations plus state subscription held while a handler is attached.
/// Dropping it releases everything.
struct Attachment {
    dispatcher: Arc<Dispatcher>,
    connection: Connection,
    kinds: &'static [MessageKind],
    handler: Arc<dyn MessageHandler>,
    /// Cleared on release; state callbacks reach the handler only while set
    live: Arc<Mutex<bool>>,
    _state: StateSubscription,
}

impl Attachment {
    fn acquire<H: FeatureHandler>(
        dispatcher: &Arc<Dispatcher>,
        connection: &Connection,
        handler: &Arc<H>,
    ) -> Self {
        let weak = Arc::downgrade(handler);
        let live = Arc::new(Mutex::new(true));
        let gate = Arc::clone(&live);
        let state = connection.subscribe_state(move |event| {
            // Held across the callback so release waits for an in-flight one
            let live = lock(&gate);
            if !*live {
                return;
            }
            if let Some(handler) = weak.upgrade() {
                handler.connection_changed(event);
            }
        });

        let kinds = handler.message_kinds();
        let as_dyn: Arc<dyn MessageHandler> = handler.clone();
        for kind in kinds {
            dispatcher.register(connection.id(), *kind, Arc::clone(&as_dyn));
        }

        Self {
            dispatcher: Arc::clone(dispatcher),
            connection: connection.clone(),
            kinds,
            handler: as_dyn,
            live,
            _state: state,
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        *lock(&self.live) = false;
        for kind in self.kinds {
            self.dispatcher
                .unregister(self.connection.id(), *kind, &self.handler);
        }
        debug!(
            "Detached {} from {}",
            self.handler.name(),
            self.connection.id()
        );
    }
}

/// An attachable feature handler bound to one connection.
///
/// Dropping a `Feature` detaches it, so registrations never outlive the
/// session that owns them.
pub struct Feature<H: FeatureHandler> {
    handler: Arc<H>,
    connection: Connection,
    dispatcher: Arc<Dispatcher>,
    attachment: Mutex<Option<Attachment>>,
}

impl<H: FeatureHandler> Feature<H> {
    pub(crate) fn new(handler: H, connection: Connection, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            handler: Arc::new(handler),
            connection,
            dispatcher,
            attachment: Mutex::new(None),
        }
    }

    /// Register with the dispatch table and subscribe to connection state
    pub fn attach(&self) -> Result<(), FeatureError> {
        let mut attachment = lock(&self.attachment);
        if attachment.is_some() {
            error!(
                "{} handler attached twice on {}",
                H::FEATURE,
                self.connection.id()
            );
            return Err(FeatureError::AlreadyAttached);
        }

        *attachment = Some(Attachment::acquire(
            &self.dispatcher,
            &self.connection,
            &self.handler,
        ));
        Ok(())
    }

    /// Release registrations and subscription. Returns false if the
    /// handler was not attached.
    ///
    /// A transition already being delivered finishes first; once this
    /// returns, `connection_changed` is not called again.
    pub fn detach(&self) -> bool {
        let released = lock(&self.attachment).take();
        match released {
            Some(attachment) => {
                self.handler.detaching();
                drop(attachment);
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.attachment).is_some()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }
}

impl<H: FeatureHandler> Deref for Feature<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handler
    }
}

impl<H: FeatureHandler> Drop for Feature<H> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Run `on_expiry` once `timeout` has elapsed on the current tokio runtime.
pub(crate) fn arm_timeout<F>(timeout: Duration, on_expiry: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                on_expiry();
            });
        }
        Err(_) => warn!("No async runtime available, request timeout not armed"),
    }
}
