#![forbid(unsafe_code)]

// Connection registry: live connection id -> outbound channel and current room binding.
//
// The map is guarded by a std RwLock held only for brief insert/lookup/remove,
// never across an await point.

use super::participant::{MediaKind, Participant};
use crate::signaling::outbox::Outbox;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

/// Room a connection currently occupies, with a cached copy of its public fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub room_id: String,
    pub participant: Participant,
}

struct ConnectionEntry {
    outbox: Outbox,
    binding: Option<Binding>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<StdRwLock<HashMap<String, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly opened connection with no room binding.
    pub fn register(&self, connection_id: String, outbox: Outbox) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(connection_id, ConnectionEntry { outbox, binding: None });
    }

    /// Forgets a closed connection. Returns its binding, if any, so the caller
    /// can reconcile the room. Calling it twice returns `None` the second time.
    pub fn deregister(&self, connection_id: &str) -> Option<Binding> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(connection_id).and_then(|entry| entry.binding)
    }

    pub fn outbox(&self, connection_id: &str) -> Option<Outbox> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(connection_id).map(|entry| entry.outbox.clone())
    }

    /// Records or overwrites the room binding. Returns false (and records
    /// nothing) for a connection that is not registered.
    pub fn bind(&self, connection_id: &str, room_id: &str, participant: Participant) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(connection_id) {
            Some(entry) => {
                entry.binding = Some(Binding {
                    room_id: room_id.to_string(),
                    participant,
                });
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, connection_id: &str) -> Option<Binding> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(connection_id).and_then(|entry| entry.binding.clone())
    }

    /// Atomically clears and returns the binding; the connection stays registered.
    pub fn unbind(&self, connection_id: &str) -> Option<Binding> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.get_mut(connection_id).and_then(|entry| entry.binding.take())
    }

    /// Keeps the cached participant in step with the room's copy.
    pub fn set_media(&self, connection_id: &str, kind: MediaKind, enabled: bool) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(binding) = map.get_mut(connection_id).and_then(|e| e.binding.as_mut()) {
            binding.participant.set_media(kind, enabled);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Connections currently bound to a room.
    pub fn bound_count(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|entry| entry.binding.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn outbox() -> Outbox {
        mpsc::channel(4).0
    }

    #[test]
    fn test_bind_lookup_unbind() {
        let registry = ConnectionRegistry::new();
        registry.register("c1".into(), outbox());

        assert!(registry.lookup("c1").is_none());
        assert!(registry.bind("c1", "room-a", Participant::new("c1", Some("Alice"))));

        let binding = registry.lookup("c1").unwrap();
        assert_eq!(binding.room_id, "room-a");
        assert_eq!(binding.participant.name, "Alice");

        // Overwrite
        assert!(registry.bind("c1", "room-b", Participant::new("c1", Some("Alice"))));
        assert_eq!(registry.lookup("c1").unwrap().room_id, "room-b");

        let removed = registry.unbind("c1").unwrap();
        assert_eq!(removed.room_id, "room-b");
        assert!(registry.unbind("c1").is_none());
        assert!(registry.outbox("c1").is_some(), "unbind keeps the connection registered");
    }

    #[test]
    fn test_unknown_connection_is_not_an_error() {
        let registry = ConnectionRegistry::new();
        assert!(registry.lookup("ghost").is_none());
        assert!(registry.unbind("ghost").is_none());
        assert!(registry.deregister("ghost").is_none());
        assert!(!registry.bind("ghost", "room", Participant::new("ghost", None)));
        registry.set_media("ghost", MediaKind::Audio, false);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_deregister_returns_binding_once() {
        let registry = ConnectionRegistry::new();
        registry.register("c1".into(), outbox());
        registry.bind("c1", "room-a", Participant::new("c1", None));
        assert_eq!(registry.bound_count(), 1);

        assert_eq!(registry.deregister("c1").unwrap().room_id, "room-a");
        assert!(registry.deregister("c1").is_none());
        assert!(registry.outbox("c1").is_none());
        assert_eq!(registry.bound_count(), 0);
    }

    #[test]
    fn test_set_media_updates_cached_copy() {
        let registry = ConnectionRegistry::new();
        registry.register("c1".into(), outbox());
        registry.bind("c1", "room-a", Participant::new("c1", None));

        registry.set_media("c1", MediaKind::Video, false);
        let p = registry.lookup("c1").unwrap().participant;
        assert!(!p.video_enabled);
        assert!(p.audio_enabled);
    }
}
