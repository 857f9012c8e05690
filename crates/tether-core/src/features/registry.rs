//! Registry editing
//!
//! Several operations may be outstanding at once, one per target. Responses
//! carry no request id, so they are correlated by the paths they echo back.
//! The handler is `AwaitingResponse` while anything is outstanding.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::{arm_timeout, FeatureError, FeatureHandler, FeatureKind, RequestState};
use crate::connection::{Connection, ConnectionEvent};
use crate::dispatch::MessageHandler;
use crate::events::{EndReason, FeatureEvent, Notifier};
use crate::messages::{Message, MessageKind, RegistryValueKind};
use crate::sync::lock;

/// What an outstanding registry operation acts on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistryTarget {
    CreateKey { parent_path: String },
    DeleteKey { parent_path: String, key_name: String },
    CreateValue { key_path: String },
    DeleteValue { key_path: String, value_name: String },
}

impl fmt::Display for RegistryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryTarget::CreateKey { parent_path } => {
                write!(f, "create key under {parent_path}")
            }
            RegistryTarget::DeleteKey {
                parent_path,
                key_name,
            } => write!(f, "delete key {parent_path}\\{key_name}"),
            RegistryTarget::CreateValue { key_path } => write!(f, "create value in {key_path}"),
            RegistryTarget::DeleteValue {
                key_path,
                value_name,
            } => write!(f, "delete value {value_name} in {key_path}"),
        }
    }
}

type Pending = HashMap<RegistryTarget, u64>;

pub struct RegistryEditorHandler {
    connection: Connection,
    notifier: Notifier,
    timeout: Duration,
    next_request_id: AtomicU64,
    pending: Arc<Mutex<Pending>>,
}

impl RegistryEditorHandler {
    pub(crate) fn new(connection: Connection, notifier: Notifier, timeout: Duration) -> Self {
        Self {
            connection,
            notifier,
            timeout,
            next_request_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn state(&self) -> RequestState {
        if lock(&self.pending).is_empty() {
            RequestState::Idle
        } else {
            RequestState::AwaitingResponse
        }
    }

    /// Targets with an outstanding operation
    pub fn pending(&self) -> Vec<RegistryTarget> {
        lock(&self.pending).keys().cloned().collect()
    }

    pub fn create_key(&self, parent_path: &str) -> Result<(), FeatureError> {
        self.issue(
            RegistryTarget::CreateKey {
                parent_path: parent_path.to_string(),
            },
            Message::CreateRegistryKey {
                parent_path: parent_path.to_string(),
            },
        )
    }

    pub fn delete_key(&self, parent_path: &str, key_name: &str) -> Result<(), FeatureError> {
        self.issue(
            RegistryTarget::DeleteKey {
                parent_path: parent_path.to_string(),
                key_name: key_name.to_string(),
            },
            Message::DeleteRegistryKey {
                parent_path: parent_path.to_string(),
                key_name: key_name.to_string(),
            },
        )
    }

    pub fn create_value(&self, key_path: &str, kind: RegistryValueKind) -> Result<(), FeatureError> {
        self.issue(
            RegistryTarget::CreateValue {
                key_path: key_path.to_string(),
            },
            Message::CreateRegistryValue {
                key_path: key_path.to_string(),
                kind,
            },
        )
    }

    pub fn delete_value(&self, key_path: &str, value_name: &str) -> Result<(), FeatureError> {
        self.issue(
            RegistryTarget::DeleteValue {
                key_path: key_path.to_string(),
                value_name: value_name.to_string(),
            },
            Message::DeleteRegistryValue {
                key_path: key_path.to_string(),
                value_name: value_name.to_string(),
            },
        )
    }

    fn issue(&self, target: RegistryTarget, request: Message) -> Result<(), FeatureError> {
        let request_id = {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&target) {
                return Err(FeatureError::RequestPending);
            }

            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            self.connection.send(&request)?;
            pending.insert(target.clone(), request_id);
            request_id
        };

        debug!("Registry request {} issued: {}", request_id, target);

        let pending = Arc::downgrade(&self.pending);
        let notifier = self.notifier.clone();
        arm_timeout(self.timeout, move || {
            if let Some(pending) = pending.upgrade() {
                Self::expire(&pending, &notifier, target, request_id);
            }
        });

        Ok(())
    }

    fn expire(pending: &Mutex<Pending>, notifier: &Notifier, target: RegistryTarget, request_id: u64) {
        {
            let mut pending = lock(pending);
            if pending.get(&target) != Some(&request_id) {
                return;
            }
            pending.remove(&target);
        }

        warn!("Registry request {} timed out: {}", request_id, target);
        notifier.notify(FeatureEvent::RequestTimedOut {
            operation: target.to_string(),
        });
    }

    fn complete(&self, target: RegistryTarget, outcome: Result<(), &str>, success: FeatureEvent) {
        if lock(&self.pending).remove(&target).is_none() {
            warn!("Unmatched registry response for {}, dropping", target);
            return;
        }

        let event = match outcome {
            Ok(()) => success,
            Err(error) => FeatureEvent::RequestFailed {
                operation: target.to_string(),
                error: error.to_string(),
            },
        };
        self.notifier.notify(event);
    }
}

impl MessageHandler for RegistryEditorHandler {
    fn name(&self) -> &'static str {
        "registry-editor"
    }

    fn handle(&self, message: &Message) {
        let Some(outcome) = message.outcome() else {
            debug!("Registry editor ignoring {}", message.kind());
            return;
        };

        match message {
            Message::CreateRegistryKeyResponse {
                parent_path,
                key_name,
                ..
            } => self.complete(
                RegistryTarget::CreateKey {
                    parent_path: parent_path.clone(),
                },
                outcome,
                FeatureEvent::RegistryKeyCreated {
                    parent_path: parent_path.clone(),
                    key_name: key_name.clone(),
                },
            ),
            Message::DeleteRegistryKeyResponse {
                parent_path,
                key_name,
                ..
            } => self.complete(
                RegistryTarget::DeleteKey {
                    parent_path: parent_path.clone(),
                    key_name: key_name.clone(),
                },
                outcome,
                FeatureEvent::RegistryKeyDeleted {
                    parent_path: parent_path.clone(),
                    key_name: key_name.clone(),
                },
            ),
            Message::CreateRegistryValueResponse {
                key_path, value, ..
            } => self.complete(
                RegistryTarget::CreateValue {
                    key_path: key_path.clone(),
                },
                outcome,
                FeatureEvent::RegistryValueCreated {
                    key_path: key_path.clone(),
                    value: value.clone(),
                },
            ),
            Message::DeleteRegistryValueResponse {
                key_path,
                value_name,
                ..
            } => self.complete(
                RegistryTarget::DeleteValue {
                    key_path: key_path.clone(),
                    value_name: value_name.clone(),
                },
                outcome,
                FeatureEvent::RegistryValueDeleted {
                    key_path: key_path.clone(),
                    value_name: value_name.clone(),
                },
            ),
            other => debug!("Registry editor ignoring {}", other.kind()),
        }
    }
}

impl FeatureHandler for RegistryEditorHandler {
    const FEATURE: FeatureKind = FeatureKind::RegistryEditor;

    fn message_kinds(&self) -> &'static [MessageKind] {
        &[
            MessageKind::CreateRegistryKeyResponse,
            MessageKind::DeleteRegistryKeyResponse,
            MessageKind::CreateRegistryValueResponse,
            MessageKind::DeleteRegistryValueResponse,
        ]
    }

    fn connection_changed(&self, event: &ConnectionEvent) {
        if event.is_connected {
            return;
        }

        let abandoned = {
            let mut pending = lock(&self.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        if abandoned > 0 {
            debug!("Abandoned {} registry request(s) on disconnect", abandoned);
        }

        self.notifier.notify(FeatureEvent::SessionEnded {
            reason: EndReason::Disconnected,
        });
    }
}
