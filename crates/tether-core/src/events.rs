//! Notifications and event sinks
//!
//! Feature handlers run on the delivery context and must never touch
//! presentation state directly. They push [`Notification`]s into an
//! unbounded queue instead; the presentation context drains that queue
//! (see [`pump`]) into an [`EventSink`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::trace;

use crate::connection::ConnectionId;
use crate::features::FeatureKind;
use crate::messages::{AudioDevice, LogFile, RegistryValue};

/// Why a feature session ended
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Disconnected,
}

/// Something a feature handler wants the presentation side to know
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureEvent {
    /// Free-form progress text
    Status { message: String },

    LogsRetrieved { request_id: u64, files: Vec<LogFile> },

    AudioDevicesChanged { devices: Vec<AudioDevice> },
    StreamStarted { device_index: u32, bitrate: u32 },
    StreamBitrateChanged { device_index: u32, bitrate: u32 },
    StreamStopped { device_index: u32 },
    AudioFrame { device_index: u32, data: Vec<u8> },

    RegistryKeyCreated { parent_path: String, key_name: String },
    RegistryKeyDeleted { parent_path: String, key_name: String },
    RegistryValueCreated { key_path: String, value: RegistryValue },
    RegistryValueDeleted { key_path: String, value_name: String },

    /// The endpoint answered with `is_error = true`
    RequestFailed { operation: String, error: String },
    /// No answer arrived within the request timeout
    RequestTimedOut { operation: String },

    SessionEnded { reason: EndReason },
}

impl FeatureEvent {
    /// Whether this event closes out an outstanding request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FeatureEvent::LogsRetrieved { .. }
                | FeatureEvent::AudioDevicesChanged { .. }
                | FeatureEvent::RegistryKeyCreated { .. }
                | FeatureEvent::RegistryKeyDeleted { .. }
                | FeatureEvent::RegistryValueCreated { .. }
                | FeatureEvent::RegistryValueDeleted { .. }
                | FeatureEvent::RequestFailed { .. }
                | FeatureEvent::RequestTimedOut { .. }
                | FeatureEvent::SessionEnded { .. }
        )
    }
}

impl fmt::Display for FeatureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureEvent::Status { message } => write!(f, "{message}"),
            FeatureEvent::LogsRetrieved { files, .. } => {
                write!(f, "Successfully retrieved all logs ({} files)", files.len())
            }
            FeatureEvent::AudioDevicesChanged { devices } => {
                write!(f, "{} audio device(s) available", devices.len())
            }
            FeatureEvent::StreamStarted {
                device_index,
                bitrate,
            } => write!(f, "Streaming from device {device_index} at {bitrate} Hz"),
            FeatureEvent::StreamBitrateChanged {
                device_index,
                bitrate,
            } => write!(f, "Device {device_index} bitrate set to {bitrate} Hz"),
            FeatureEvent::StreamStopped { device_index } => {
                write!(f, "Stopped streaming from device {device_index}")
            }
            FeatureEvent::AudioFrame { device_index, data } => {
                write!(f, "Audio frame from device {device_index} ({} bytes)", data.len())
            }
            FeatureEvent::RegistryKeyCreated {
                parent_path,
                key_name,
            } => write!(f, "Created key {parent_path}\\{key_name}"),
            FeatureEvent::RegistryKeyDeleted {
                parent_path,
                key_name,
            } => write!(f, "Deleted key {parent_path}\\{key_name}"),
            FeatureEvent::RegistryValueCreated { key_path, value } => {
                write!(f, "Created value {} ({}) in {key_path}", value.name, value.kind)
            }
            FeatureEvent::RegistryValueDeleted {
                key_path,
                value_name,
            } => write!(f, "Deleted value {value_name} in {key_path}"),
            FeatureEvent::RequestFailed { operation, error } => {
                write!(f, "Failed to {operation}: {error}")
            }
            FeatureEvent::RequestTimedOut { operation } => {
                write!(f, "Timed out waiting to {operation}")
            }
            FeatureEvent::SessionEnded { reason } => match reason {
                EndReason::Disconnected => write!(f, "Session ended: client disconnected"),
            },
        }
    }
}

/// A feature event tagged with where it came from
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Notification {
    pub connection: ConnectionId,
    pub feature: FeatureKind,
    pub timestamp: DateTime<Utc>,
    pub event: FeatureEvent,
}

/// Queue end drained by the presentation context
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

/// Create the notification queue shared by every handler of a console
pub fn notification_channel() -> (mpsc::UnboundedSender<Notification>, NotificationReceiver) {
    mpsc::unbounded_channel()
}

/// Sending side handed to one feature handler
#[derive(Debug, Clone)]
pub struct Notifier {
    connection: ConnectionId,
    feature: FeatureKind,
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn new(
        connection: ConnectionId,
        feature: FeatureKind,
        tx: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            connection,
            feature,
            tx,
        }
    }

    /// Queue an event for the presentation context. Never blocks.
    pub fn notify(&self, event: FeatureEvent) {
        let notification = Notification {
            connection: self.connection,
            feature: self.feature,
            timestamp: Utc::now(),
            event,
        };

        if self.tx.send(notification).is_err() {
            trace!(
                "Presentation side gone, dropping {} notification",
                self.feature
            );
        }
    }
}

/// Event sink for presenting notifications
///
/// This trait abstracts presentation so the core can work with different
/// frontends (CLI, GUI, tests, etc.)
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Present one notification
    async fn emit(&self, notification: &Notification) -> Result<(), String>;
}

/// No-op event sink for testing
#[derive(Default, Clone)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _notification: &Notification) -> Result<(), String> {
        Ok(())
    }
}

/// Stdout event sink for CLI mode
#[derive(Default, Clone)]
pub struct StdoutEventSink {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl StdoutEventSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    /// Render a notification the way `emit` prints it
    pub fn render(&self, notification: &Notification) -> String {
        if self.json_output {
            serde_json::to_string(notification).unwrap_or_default()
        } else {
            format!(
                "[{}] {} {}",
                notification.timestamp.format("%H:%M:%S%.3f"),
                notification.feature,
                notification.event
            )
        }
    }
}

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn emit(&self, notification: &Notification) -> Result<(), String> {
        println!("{}", self.render(notification));
        Ok(())
    }
}

/// Drain the queue into a sink until every sender is gone.
///
/// Returns the number of notifications presented.
pub async fn pump<E: EventSink + ?Sized>(mut rx: NotificationReceiver, sink: &E) -> usize {
    let mut count = 0;
    while let Some(notification) = rx.recv().await {
        if let Err(e) = sink.emit(&notification).await {
            tracing::warn!("Failed to present notification: {}", e);
        }
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(event: FeatureEvent) -> Notification {
        Notification {
            connection: ConnectionId::new(),
            feature: FeatureKind::RegistryEditor,
            timestamp: Utc::now(),
            event,
        }
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        let n = sample(FeatureEvent::Status {
            message: "Retrieving logs...".to_string(),
        });
        assert!(sink.emit(&n).await.is_ok());
    }

    #[tokio::test]
    async fn test_pump_drains_until_closed() {
        let (tx, rx) = notification_channel();
        let notifier = Notifier::new(ConnectionId::new(), FeatureKind::LogRetrieval, tx);
        notifier.notify(FeatureEvent::Status {
            message: "one".to_string(),
        });
        notifier.notify(FeatureEvent::SessionEnded {
            reason: EndReason::Disconnected,
        });
        drop(notifier);

        assert_eq!(pump(rx, &NoOpEventSink).await, 2);
    }

    #[test]
    fn test_notify_without_receiver_is_silent() {
        let (tx, rx) = notification_channel();
        drop(rx);
        let notifier = Notifier::new(ConnectionId::new(), FeatureKind::AudioCapture, tx);
        notifier.notify(FeatureEvent::StreamStopped { device_index: 0 });
    }

    #[test]
    fn test_render_json() {
        let sink = StdoutEventSink::new(true);
        let line = sink.render(&sample(FeatureEvent::RegistryKeyDeleted {
            parent_path: "HKCU\\Software\\X".to_string(),
            key_name: "Sub".to_string(),
        }));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["feature"], "registry_editor");
        assert_eq!(value["event"]["type"], "registry_key_deleted");
        assert_eq!(value["event"]["key_name"], "Sub");
    }

    #[test]
    fn test_render_text() {
        let sink = StdoutEventSink::new(false);
        let line = sink.render(&sample(FeatureEvent::RequestFailed {
            operation: "delete key HKCU\\X\\Sub".to_string(),
            error: "Access denied".to_string(),
        }));
        assert!(line.ends_with("Failed to delete key HKCU\\X\\Sub: Access denied"));
        assert!(line.contains("registry_editor"));
    }

    #[test]
    fn test_terminal_events() {
        assert!(FeatureEvent::SessionEnded {
            reason: EndReason::Disconnected
        }
        .is_terminal());
        assert!(!FeatureEvent::Status {
            message: String::new()
        }
        .is_terminal());
        assert!(!FeatureEvent::AudioFrame {
            device_index: 0,
            data: vec![]
        }
        .is_terminal());
    }
}
