//! Session registry
//!
//! Guarantees at most one live feature session per (connection, feature).
//! The registry only holds weak references; a session is disposed when the
//! last [`Arc<Session<T>>`] is dropped, and its slot is released with it.

use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use crate::connection::ConnectionId;
use crate::features::FeatureKind;
use crate::sync::lock;

/// Registry slot identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionKey {
    pub connection: ConnectionId,
    pub feature: FeatureKind,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.feature)
    }
}

struct Entry {
    generation: u64,
    session: Weak<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct Slots {
    entries: HashMap<SessionKey, Entry>,
    next_generation: u64,
}

/// Releases a registry slot when the owning session goes away
struct SlotRelease {
    slots: Weak<Mutex<Slots>>,
    key: SessionKey,
    generation: u64,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        let Some(slots) = self.slots.upgrade() else {
            return;
        };

        let mut slots = lock(&slots);
        let current = slots
            .entries
            .get(&self.key)
            .map(|entry| entry.generation);
        if current == Some(self.generation) {
            slots.entries.remove(&self.key);
            debug!("Released session slot {}", self.key);
        }
    }
}

/// A live feature session.
///
/// The wrapped value is dropped before the slot is released, so a feature
/// handler is fully detached by the time a new session can take its place.
pub struct Session<T> {
    value: T,
    key: SessionKey,
    _slot: SlotRelease,
}

impl<T> Session<T> {
    pub fn key(&self) -> SessionKey {
        self.key
    }
}

impl<T> Deref for Session<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

/// Process-wide map of live feature sessions. Clones share the same map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    slots: Arc<Mutex<Slots>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live session for `(connection, feature)`, or build one.
    ///
    /// The registry lock is held while `factory` runs, so concurrent callers
    /// for the same key never both construct a session. `factory` must not
    /// call back into the registry.
    pub fn get_or_create<T, E, F>(
        &self,
        connection: ConnectionId,
        feature: FeatureKind,
        factory: F,
    ) -> Result<Arc<Session<T>>, E>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        let key = SessionKey {
            connection,
            feature,
        };

        // Declared before the guard so it is dropped after the lock is released
        let mut displaced: Option<Arc<dyn Any + Send + Sync>> = None;
        let mut slots = lock(&self.slots);

        if let Some(live) = slots
            .entries
            .get(&key)
            .and_then(|entry| entry.session.upgrade())
        {
            match live.downcast::<Session<T>>() {
                Ok(session) => {
                    debug!("Reusing session {}", key);
                    return Ok(session);
                }
                Err(other) => {
                    warn!("Session {} holds a different type, replacing it", key);
                    displaced = Some(other);
                }
            }
        }

        let value = factory()?;

        let generation = slots.next_generation;
        slots.next_generation += 1;

        let session = Arc::new(Session {
            value,
            key,
            _slot: SlotRelease {
                slots: Arc::downgrade(&self.slots),
                key,
                generation,
            },
        });
        let as_any: Arc<dyn Any + Send + Sync> = session.clone();
        slots.entries.insert(
            key,
            Entry {
                generation,
                session: Arc::downgrade(&as_any),
            },
        );

        debug!("Created session {} (generation {})", key, generation);
        drop(slots);
        drop(displaced);
        Ok(session)
    }

    /// Whether a live session exists for `(connection, feature)`
    pub fn contains(&self, connection: ConnectionId, feature: FeatureKind) -> bool {
        let key = SessionKey {
            connection,
            feature,
        };
        lock(&self.slots)
            .entries
            .get(&key)
            .is_some_and(|entry| entry.session.strong_count() > 0)
    }

    /// Keys of every live session
    pub fn live_sessions(&self) -> Vec<SessionKey> {
        lock(&self.slots)
            .entries
            .iter()
            .filter(|(_, entry)| entry.session.strong_count() > 0)
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
