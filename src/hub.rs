//! Registry of live connections and broadcast fan-out.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use tracing::warn;

use crate::{
    connection::{ConnId, Connection},
    event::Event,
};

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Broadcast {
    /// Deliveries queued across all connections.
    pub delivered: usize,
    /// Connections dropped because their outbox was full.
    pub dropped: usize,
}

/// Membership set of open connections. Holds handles only; each connection
/// owns its own subscriptions.
#[derive(Default)]
pub struct Hub {
    connections: RwLock<HashMap<ConnId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh connection id.
    pub fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, conn: Arc<Connection>) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id(), conn);
    }

    pub fn deregister(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: ConnId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Membership as of now. Later joins and leaves do not affect the result.
    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Offer `event` to every registered connection without blocking.
    ///
    /// A connection whose outbox is full is moved to closing and removed from
    /// the hub; the remaining connections are unaffected.
    pub fn broadcast(&self, event: &Arc<Event>) -> Broadcast {
        let mut report = Broadcast::default();
        for conn in self.snapshot() {
            match conn.offer(event) {
                Ok(n) => report.delivered += n,
                Err(overflow) => {
                    warn!(
                        conn = conn.id(),
                        peer = conn.peer(),
                        "{overflow}; dropping connection"
                    );
                    conn.begin_close();
                    self.deregister(conn.id());
                    report.dropped += 1;
                }
            }
        }
        report
    }
}
