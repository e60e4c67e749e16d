//! Per-connection state: lifecycle, subscriptions, and the bounded outbox.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError, error::TrySendError},
    watch,
};

use crate::{
    event::Event,
    filter::{self, Filter},
    message::RelayMessage,
};

/// Identifier of a live connection, unique for the lifetime of the process.
pub type ConnId = u64;

/// Connection lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// A named set of filters owned by one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

/// The outbox could not take another message; the peer is not keeping up.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("outbound queue full")]
pub struct Overflow;

/// Shared handle to one client connection.
///
/// The inbound task mutates the subscription map while other connections'
/// publish paths read it through [`Connection::offer`].
pub struct Connection {
    id: ConnId,
    peer: String,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    outbox: mpsc::Sender<RelayMessage>,
    state: watch::Sender<ConnState>,
}

impl Connection {
    /// Create a connection in `Connecting` state together with the receiving
    /// end of its outbox.
    pub fn new(
        id: ConnId,
        peer: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(ConnState::Connecting);
        let conn = Arc::new(Self {
            id,
            peer: peer.into(),
            subscriptions: RwLock::new(HashMap::new()),
            outbox: tx,
            state,
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Remote address label used in logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes, e.g. to stop a task once closing starts.
    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state.subscribe()
    }

    /// `Connecting -> Open`. Returns false if the connection was not connecting.
    pub fn open(&self) -> bool {
        self.advance(ConnState::Connecting, ConnState::Open)
    }

    /// Move to `Closing` unless already closing or closed. Returns true when
    /// this call performed the transition.
    pub fn begin_close(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s < ConnState::Closing {
                *s = ConnState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// Terminal transition. Drops every subscription.
    pub fn finish_close(&self) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.state.send_if_modified(|s| {
            let changed = *s != ConnState::Closed;
            *s = ConnState::Closed;
            changed
        });
    }

    fn advance(&self, from: ConnState, to: ConnState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    /// Register `sub`, replacing any subscription with the same id. Returns
    /// true if one was replaced.
    pub fn subscribe(&self, sub: Subscription) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subs.insert(sub.id.clone(), sub).is_some()
    }

    /// Remove a subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subs.remove(id).is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Enqueue without waiting. A full queue is an [`Overflow`]; a queue whose
    /// receiver is gone belongs to a connection already tearing down, so the
    /// message is dropped silently.
    pub fn enqueue(&self, msg: RelayMessage) -> Result<(), Overflow> {
        match self.outbox.try_send(msg) {
            Ok(()) | Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Overflow),
        }
    }

    /// Enqueue a reply to this connection's own request, waiting at most
    /// `wait` for room in the outbox.
    pub async fn reply(&self, msg: RelayMessage, wait: Duration) -> Result<(), Overflow> {
        match self.outbox.send_timeout(msg, wait).await {
            Ok(()) | Err(SendTimeoutError::Closed(_)) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(Overflow),
        }
    }

    /// Offer a newly accepted event to every matching subscription, once per
    /// subscription. Returns how many deliveries were queued.
    pub fn offer(&self, event: &Arc<Event>) -> Result<usize, Overflow> {
        if self.state() != ConnState::Open {
            return Ok(0);
        }
        let subs = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut queued = 0;
        for sub in subs.values() {
            if filter::matches(event, &sub.filters) {
                self.enqueue(RelayMessage::Event {
                    sub_id: sub.id.clone(),
                    event: event.clone(),
                })?;
                queued += 1;
            }
        }
        Ok(queued)
    }
}
