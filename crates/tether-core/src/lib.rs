//! Tether Core Library
//!
//! Message dispatch and feature-session lifecycle for a remote-operator
//! console. One long-lived connection per endpoint carries many independent
//! feature sessions (log retrieval, audio capture, registry editing); this
//! crate routes inbound messages to the handler that owns them and keeps
//! every session consistent with the connection's up/down state.
//!
//! # Modules
//!
//! - [`messages`] - Wire schema and positional codec
//! - [`transport`] - Transport seam and in-process channel transport
//! - [`connection`] - Connection state, subscriptions and delivery loop
//! - [`dispatch`] - Dispatch table keyed by (connection, message kind)
//! - [`features`] - Feature handlers and their attachment lifecycle
//! - [`session`] - At most one live session per (connection, feature)
//! - [`console`] - Top-level owner of connections and sessions
//! - [`events`] - Notification hand-off to the presentation context
//! - [`config`] - Console configuration
//! - [`error`] - Error types

pub mod config;
pub mod connection;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod features;
pub mod messages;
pub mod session;
mod sync;
pub mod transport;

// Re-export commonly used types
pub use config::ConsoleConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionId, ConnectionInfo, ConnectionState};
pub use console::{AudioCaptureSession, Console, LogRetrievalSession, RegistryEditorSession};
pub use dispatch::{Dispatcher, MessageHandler};
pub use error::{ConsoleError, Result};
pub use events::{EventSink, FeatureEvent, Notification, NotificationReceiver};
pub use features::{FeatureError, FeatureKind, RequestState};
pub use messages::{Message, MessageKind};
pub use session::{Session, SessionKey, SessionRegistry};
pub use transport::{channel_pair, ChannelEnd, Transport, TransportError, TransportType};
