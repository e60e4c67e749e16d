//! Request handling shared by every connection: publish, subscribe, close.

use std::{collections::HashSet, sync::Arc};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    config::Limits,
    connection::{Connection, Overflow, Subscription},
    event::Event,
    filter::Filter,
    hub::Hub,
    message::{ClientMessage, RelayMessage},
    store::EventStore,
};

/// The relay core: one event store, one hub, shared by all connections.
pub struct Relay {
    store: EventStore,
    hub: Hub,
    limits: Limits,
}

impl Relay {
    pub fn new(limits: Limits) -> Self {
        Self {
            store: EventStore::new(),
            hub: Hub::new(),
            limits,
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Open a connection after the transport handshake and register it with
    /// the hub. The receiver is the connection's outbox.
    pub fn connect(
        &self,
        peer: impl Into<String>,
    ) -> (Arc<Connection>, mpsc::Receiver<RelayMessage>) {
        let (conn, outbox) =
            Connection::new(self.hub.next_id(), peer, self.limits.outbound_queue);
        conn.open();
        self.hub.register(conn.clone());
        info!(conn = conn.id(), peer = conn.peer(), "client connected");
        (conn, outbox)
    }

    /// Tear a connection down: deregister it and move it to `Closed`.
    pub fn disconnect(&self, conn: &Connection) {
        conn.begin_close();
        self.hub.deregister(conn.id());
        conn.finish_close();
        info!(conn = conn.id(), peer = conn.peer(), "client disconnected");
    }

    /// Handle one inbound text frame. Malformed input is answered with a
    /// NOTICE and never closes the connection.
    ///
    /// An `Err` means the connection's own outbox stayed full for longer than
    /// the write timeout, i.e. the peer stopped reading.
    pub async fn handle_text(&self, conn: &Arc<Connection>, text: &str) -> Result<(), Overflow> {
        match ClientMessage::parse(text) {
            Ok(msg) => self.handle(conn, msg).await,
            Err(e) => {
                debug!(conn = conn.id(), error = %e, "malformed message");
                self.reply(conn, RelayMessage::Notice(e.to_string())).await
            }
        }
    }

    /// Dispatch a decoded request.
    pub async fn handle(
        &self,
        conn: &Arc<Connection>,
        msg: ClientMessage,
    ) -> Result<(), Overflow> {
        match msg {
            ClientMessage::Event(payload) => self.publish(conn, payload).await,
            ClientMessage::Req { sub_id, filters } => self.subscribe(conn, sub_id, filters).await,
            ClientMessage::Close(sub_id) => {
                self.unsubscribe(conn, &sub_id);
                Ok(())
            }
        }
    }

    async fn reply(&self, conn: &Connection, msg: RelayMessage) -> Result<(), Overflow> {
        conn.reply(msg, self.limits.write_timeout).await
    }

    /// Validate, store, acknowledge, then broadcast.
    async fn publish(&self, conn: &Arc<Connection>, payload: Value) -> Result<(), Overflow> {
        let claimed_id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let event = match Event::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                debug!(conn = conn.id(), error = %e, "invalid event");
                let msg = match claimed_id {
                    Some(id) => RelayMessage::rejected(id, format!("invalid: {e}")),
                    None => RelayMessage::Notice(format!("invalid event: {e}")),
                };
                return self.reply(conn, msg).await;
            }
        };
        if let Err(e) = event.verify() {
            debug!(conn = conn.id(), id = %event.id, error = %e, "rejected event");
            return self
                .reply(conn, RelayMessage::rejected(event.id, "invalid signature"))
                .await;
        }

        let event = Arc::new(event);
        let replaced = self.store.put(event.clone()).is_some();
        info!(
            id = %event.id,
            kind = event.kind,
            pubkey = %event.pubkey,
            size = event.content.len(),
            replaced,
            "event stored"
        );
        // the publisher hears back before any subscriber is offered the event
        let ack = self.reply(conn, RelayMessage::accepted(event.id.clone())).await;
        let report = self.hub.broadcast(&event);
        debug!(
            id = %event.id,
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast"
        );
        ack
    }

    /// Drop any subscription under `sub_id`, replay stored matches, send EOSE,
    /// then register for live events.
    async fn subscribe(
        &self,
        conn: &Arc<Connection>,
        sub_id: String,
        filters: Vec<Filter>,
    ) -> Result<(), Overflow> {
        // the old filters must stop matching before the new replay starts
        let replaced = conn.unsubscribe(&sub_id);
        let backlog = self.replay(&filters);
        let replayed = backlog.len();
        for event in backlog {
            self.reply(
                conn,
                RelayMessage::Event {
                    sub_id: sub_id.clone(),
                    event,
                },
            )
            .await?;
        }
        self.reply(conn, RelayMessage::Eose(sub_id.clone())).await?;
        conn.subscribe(Subscription {
            id: sub_id.clone(),
            filters,
        });
        info!(
            conn = conn.id(),
            sub = %sub_id,
            replayed,
            replaced,
            open = conn.subscription_count(),
            "subscription created"
        );
        Ok(())
    }

    fn unsubscribe(&self, conn: &Connection, sub_id: &str) {
        if conn.unsubscribe(sub_id) {
            info!(conn = conn.id(), sub = %sub_id, "subscription closed");
        }
    }

    /// Stored events matching any of `filters`, each at most once.
    ///
    /// A filter with a `limit` contributes only its newest `limit` matches.
    pub fn replay(&self, filters: &[Filter]) -> Vec<Arc<Event>> {
        let snapshot = self.store.scan();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for filter in filters {
            let mut hits: Vec<&Arc<Event>> =
                snapshot.iter().filter(|e| filter.matches(e)).collect();
            if let Some(limit) = filter.limit {
                hits.sort_by(|a, b| {
                    b.created_at
                        .cmp(&a.created_at)
                        .then_with(|| a.id.cmp(&b.id))
                });
                hits.truncate(limit);
            }
            for event in hits {
                if seen.insert(event.id.as_str()) {
                    out.push(event.clone());
                }
            }
        }
        out
    }
}
