//! Presence channel (spec §4.5): ephemeral per-connection state, never
//! persisted, never part of a snapshot or the WAL. One [`PresenceChannel`]
//! per document; [`PresenceRegistry`] lazily creates them the way the
//! engine lazily creates documents.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use docsync_schema::Value;
use docsync_wire::PresenceEntry;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq)]
pub enum PresenceEvent {
    Update { id: String, data: Value, user_id: Option<String> },
    Remove { id: String },
}

/// Per-document presence state: a map from connection id to its entry, plus
/// a broadcast of update/remove events for subscribers.
pub struct PresenceChannel {
    entries: RwLock<BTreeMap<String, PresenceEntry>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceChannel {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        PresenceChannel { entries: RwLock::new(BTreeMap::new()), events }
    }

    /// Overwrite `conn`'s entry and publish `presence_update`.
    pub fn set(&self, conn: &str, entry: PresenceEntry) {
        let event = PresenceEvent::Update { id: conn.to_string(), data: entry.data.clone(), user_id: entry.user_id.clone() };
        self.entries.write().unwrap().insert(conn.to_string(), entry);
        let _ = self.events.send(event);
    }

    /// Delete `conn`'s entry and publish `presence_remove`; idempotent when
    /// nothing was there to remove.
    pub fn remove(&self, conn: &str) {
        let removed = self.entries.write().unwrap().remove(conn).is_some();
        if removed {
            let _ = self.events.send(PresenceEvent::Remove { id: conn.to_string() });
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, PresenceEntry> {
        self.entries.read().unwrap().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for PresenceChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazily creates and hands out one [`PresenceChannel`] per documentId.
#[derive(Default)]
pub struct PresenceRegistry {
    channels: RwLock<BTreeMap<String, Arc<PresenceChannel>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, document_id: &str) -> Arc<PresenceChannel> {
        if let Some(channel) = self.channels.read().unwrap().get(document_id) {
            return channel.clone();
        }
        self.channels
            .write()
            .unwrap()
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(PresenceChannel::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn entry(text: &str) -> PresenceEntry {
        PresenceEntry { data: Value::from(text), user_id: None }
    }

    #[test]
    fn set_then_snapshot_reflects_entry() {
        let channel = PresenceChannel::new();
        channel.set("conn1", entry("cursor:10"));
        let snapshot = channel.snapshot();
        assert_eq!(snapshot.get("conn1"), Some(&entry("cursor:10")));
    }

    #[test]
    fn remove_on_missing_connection_is_idempotent() {
        let channel = PresenceChannel::new();
        channel.remove("ghost");
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn subscribers_observe_update_and_remove_events() {
        let channel = PresenceChannel::new();
        let mut rx = channel.subscribe();
        channel.set("conn1", entry("a"));
        channel.remove("conn1");

        let first = rx.recv().await.unwrap();
        assert_eq!(first, PresenceEvent::Update { id: "conn1".into(), data: Value::from("a"), user_id: None });
        let second = rx.recv().await.unwrap();
        assert_eq!(second, PresenceEvent::Remove { id: "conn1".into() });
    }

    #[test]
    fn registry_returns_same_channel_for_same_document_id() {
        let registry = PresenceRegistry::new();
        let a = registry.get_or_create("doc1");
        let b = registry.get_or_create("doc1");
        a.set("conn1", entry("x"));
        assert!(!b.is_empty());
    }
}
