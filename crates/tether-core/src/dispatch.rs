//! Dispatch table
//!
//! Routes each inbound message to the single handler registered for its
//! kind on the connection it arrived on. Registering over an existing
//! registrant replaces it (last registrant wins) and logs a warning.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace, warn};

use crate::connection::ConnectionId;
use crate::messages::{Message, MessageKind};
use crate::sync::{read, write};

/// Receiver of dispatched messages.
///
/// `handle` runs on the delivery context and must return promptly: update
/// local state and queue notifications, never block.
pub trait MessageHandler: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Process one inbound message
    fn handle(&self, message: &Message);
}

type Route = (ConnectionId, MessageKind);

/// Process-wide mapping from (connection, message kind) to handler
#[derive(Default)]
pub struct Dispatcher {
    routes: RwLock<HashMap<Route, Arc<dyn MessageHandler>>>,
}

fn same_handler(a: &Arc<dyn MessageHandler>, b: &Arc<dyn MessageHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` as the receiver of `kind` on `connection`
    pub fn register(
        &self,
        connection: ConnectionId,
        kind: MessageKind,
        handler: Arc<dyn MessageHandler>,
    ) {
        let name = handler.name();
        let previous = write(&self.routes).insert((connection, kind), handler);

        match previous {
            Some(previous) => warn!(
                "Replacing {} handler for {} on {} with {}",
                previous.name(),
                kind,
                connection,
                name
            ),
            None => debug!("Registered {} for {} on {}", name, kind, connection),
        }
    }

    /// Remove the registration for `kind`, but only if `handler` is the
    /// current registrant. Returns whether anything was removed.
    pub fn unregister(
        &self,
        connection: ConnectionId,
        kind: MessageKind,
        handler: &Arc<dyn MessageHandler>,
    ) -> bool {
        let mut routes = write(&self.routes);
        let key = (connection, kind);

        match routes.get(&key) {
            Some(current) if same_handler(current, handler) => {
                routes.remove(&key);
                debug!("Unregistered {} for {} on {}", handler.name(), kind, connection);
                true
            }
            Some(current) => {
                debug!(
                    "Ignoring stale unregister of {} for {} on {} (current: {})",
                    handler.name(),
                    kind,
                    connection,
                    current.name()
                );
                false
            }
            None => false,
        }
    }

    /// Drop every registration for a connection that is going away
    pub fn unregister_connection(&self, connection: ConnectionId) -> usize {
        let mut routes = write(&self.routes);
        let before = routes.len();
        routes.retain(|(conn, _), _| *conn != connection);
        let removed = before - routes.len();
        if removed > 0 {
            debug!("Removed {} registration(s) for {}", removed, connection);
        }
        removed
    }

    /// Deliver a message to its registrant. Messages nobody registered for
    /// are dropped; that is not an error.
    pub fn dispatch(&self, connection: ConnectionId, message: &Message) -> bool {
        let kind = message.kind();
        // Clone out so the handler can (un)register without deadlocking.
        let handler = read(&self.routes).get(&(connection, kind)).cloned();

        match handler {
            Some(handler) => {
                trace!("Dispatching {} on {} to {}", kind, connection, handler.name());
                handler.handle(message);
                true
            }
            None => {
                trace!("No handler for {} on {}, dropping", kind, connection);
                false
            }
        }
    }

    /// Check whether `handler` is the current registrant for `kind`
    pub fn is_registered(
        &self,
        connection: ConnectionId,
        kind: MessageKind,
        handler: &Arc<dyn MessageHandler>,
    ) -> bool {
        read(&self.routes)
            .get(&(connection, kind))
            .is_some_and(|current| same_handler(current, handler))
    }

    /// Number of registrations held for a connection
    pub fn registrant_count(&self, connection: ConnectionId) -> usize {
        read(&self.routes)
            .keys()
            .filter(|(conn, _)| *conn == connection)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<MessageKind>>,
    }

    impl Recorder {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<MessageKind> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl MessageHandler for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn handle(&self, message: &Message) {
            self.seen.lock().unwrap().push(message.kind());
        }
    }

    fn as_handler(r: &Arc<Recorder>) -> Arc<dyn MessageHandler> {
        Arc::clone(r) as Arc<dyn MessageHandler>
    }

    #[test]
    fn test_last_registrant_wins() {
        let dispatcher = Dispatcher::new();
        let conn = ConnectionId::new();
        let first = Recorder::new("first");
        let second = Recorder::new("second");

        dispatcher.register(conn, MessageKind::GetAudioDevices, as_handler(&first));
        dispatcher.register(conn, MessageKind::GetAudioDevices, as_handler(&second));

        assert!(dispatcher.dispatch(conn, &Message::GetAudioDevices));
        assert!(first.seen().is_empty());
        assert_eq!(second.seen(), vec![MessageKind::GetAudioDevices]);
        assert_eq!(dispatcher.registrant_count(conn), 1);
    }

    #[test]
    fn test_stale_unregister_is_ignored() {
        let dispatcher = Dispatcher::new();
        let conn = ConnectionId::new();
        let stale = Recorder::new("stale");
        let current = Recorder::new("current");

        dispatcher.register(conn, MessageKind::GetLogsResponse, as_handler(&stale));
        dispatcher.register(conn, MessageKind::GetLogsResponse, as_handler(&current));

        assert!(!dispatcher.unregister(conn, MessageKind::GetLogsResponse, &as_handler(&stale)));
        assert!(dispatcher.is_registered(
            conn,
            MessageKind::GetLogsResponse,
            &as_handler(&current)
        ));

        assert!(dispatcher.unregister(conn, MessageKind::GetLogsResponse, &as_handler(&current)));
        assert_eq!(dispatcher.registrant_count(conn), 0);
    }

    #[test]
    fn test_unregistered_kind_is_dropped() {
        let dispatcher = Dispatcher::new();
        let conn = ConnectionId::new();
        let handler = Recorder::new("audio");
        dispatcher.register(conn, MessageKind::AudioFrame, as_handler(&handler));

        assert!(!dispatcher.dispatch(conn, &Message::GetAudioDevices));
        let frame = Message::AudioFrame {
            device_index: 0,
            data: vec![],
        };
        assert!(!dispatcher.dispatch(ConnectionId::new(), &frame));
        assert!(handler.seen().is_empty());
    }

    #[test]
    fn test_one_handler_many_kinds() {
        let dispatcher = Dispatcher::new();
        let conn = ConnectionId::new();
        let handler = Recorder::new("audio");
        for kind in [MessageKind::GetAudioDevicesResponse, MessageKind::AudioFrame] {
            dispatcher.register(conn, kind, as_handler(&handler));
        }

        let frame = Message::AudioFrame {
            device_index: 1,
            data: vec![0; 4],
        };
        let devices = Message::GetAudioDevicesResponse {
            devices: vec![],
            is_error: false,
            error_msg: String::new(),
        };
        dispatcher.dispatch(conn, &frame);
        dispatcher.dispatch(conn, &devices);

        assert_eq!(
            handler.seen(),
            vec![MessageKind::AudioFrame, MessageKind::GetAudioDevicesResponse]
        );
    }

    #[test]
    fn test_connections_are_isolated() {
        let dispatcher = Dispatcher::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let on_a = Recorder::new("a");
        let on_b = Recorder::new("b");
        dispatcher.register(a, MessageKind::GetAudioDevices, as_handler(&on_a));
        dispatcher.register(b, MessageKind::GetAudioDevices, as_handler(&on_b));

        dispatcher.dispatch(b, &Message::GetAudioDevices);
        assert!(on_a.seen().is_empty());
        assert_eq!(on_b.seen().len(), 1);

        assert_eq!(dispatcher.unregister_connection(a), 1);
        assert_eq!(dispatcher.registrant_count(a), 0);
        assert_eq!(dispatcher.registrant_count(b), 1);
    }

    struct SelfRemoving {
        dispatcher: Arc<Dispatcher>,
        connection: ConnectionId,
        me: Mutex<Option<Arc<dyn MessageHandler>>>,
    }

    impl MessageHandler for SelfRemoving {
        fn name(&self) -> &'static str {
            "self-removing"
        }

        fn handle(&self, message: &Message) {
            if let Some(me) = self.me.lock().unwrap().take() {
                self.dispatcher.unregister(self.connection, message.kind(), &me);
            }
        }
    }

    #[test]
    fn test_handler_may_unregister_during_delivery() {
        let dispatcher = Arc::new(Dispatcher::new());
        let conn = ConnectionId::new();
        let handler = Arc::new(SelfRemoving {
            dispatcher: Arc::clone(&dispatcher),
            connection: conn,
            me: Mutex::new(None),
        });
        let as_dyn: Arc<dyn MessageHandler> = handler.clone();
        *handler.me.lock().unwrap() = Some(Arc::clone(&as_dyn));
        dispatcher.register(conn, MessageKind::GetAudioDevices, as_dyn);

        assert!(dispatcher.dispatch(conn, &Message::GetAudioDevices));
        assert_eq!(dispatcher.registrant_count(conn), 0);
    }
}
