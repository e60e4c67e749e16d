//! In-memory event store shared by every connection.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::event::Event;

/// Concurrent map from event id to event.
///
/// Writers take the lock exclusively; scans share it, so a scan never sees a
/// half-written map and a put waits for in-flight scans to finish.
#[derive(Default)]
pub struct EventStore {
    events: RwLock<HashMap<String, Arc<Event>>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `event`, replacing any stored event with the same id.
    ///
    /// Returns the replaced event, if any.
    pub fn put(&self, event: Arc<Event>) -> Option<Arc<Event>> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.insert(event.id.clone(), event)
    }

    /// Look up an event by its full id.
    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<Arc<Event>> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.get(id).cloned()
    }

    /// Snapshot of every stored event, in no particular order.
    pub fn scan(&self) -> Vec<Arc<Event>> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        events.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sample_event(id: &str, content: &str) -> Arc<Event> {
        Arc::new(Event {
            id: id.into(),
            pubkey: "p".into(),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: content.into(),
            sig: String::new(),
        })
    }

    #[test]
    fn put_then_scan() {
        let store = EventStore::new();
        assert!(store.scan().is_empty());
        store.put(sample_event("a", ""));
        store.put(sample_event("b", ""));
        let mut ids: Vec<_> = store.scan().iter().map(|e| e.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn republish_overwrites() {
        let store = EventStore::new();
        assert!(store.put(sample_event("a", "first")).is_none());
        let old = store.put(sample_event("a", "second")).unwrap();
        assert_eq!(old.content, "first");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().content, "second");
    }

    #[test]
    fn scan_is_a_snapshot() {
        let store = EventStore::new();
        store.put(sample_event("a", ""));
        let snapshot = store.scan();
        store.put(sample_event("b", ""));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let store = Arc::new(EventStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        store.put(sample_event(&format!("{t}-{i}"), ""));
                        let _ = store.scan();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }
}
