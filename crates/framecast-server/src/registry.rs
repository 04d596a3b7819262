//! Connection Registry: live observer connections and their subscriptions.
//!
//! Every connection owns a bounded outbound queue drained by its socket
//! writer task. Delivery never blocks: a full queue drops the message for
//! that connection only and bumps its drop counter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use framecast_core::messages::now_timestamp;
use framecast_core::{ConnectionId, RelayError, ServerMessage, SessionId};
use framecast_session::SessionSink;

/// One accepted socket.
pub struct Connection {
    pub id: ConnectionId,
    /// RFC 3339 accept time.
    pub created_at: String,
    accepted: Instant,
    last_activity: Mutex<Instant>,
    subscription: Mutex<Option<SessionId>>,
    tx: mpsc::Sender<Arc<str>>,
    dropped: AtomicU64,
    close: CancellationToken,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<Arc<str>>, close: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now_timestamp(),
            accepted: now,
            last_activity: Mutex::new(now),
            subscription: Mutex::new(None),
            tx,
            dropped: AtomicU64::new(0),
            close,
        }
    }

    /// Enqueue pre-serialized text. Returns `false` (and counts a drop) if
    /// the queue is full or closed.
    pub fn send(&self, text: Arc<str>) -> bool {
        if self.tx.try_send(text).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn send_message(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => self.send(Arc::from(json)),
            Err(err) => {
                warn!(conn_id = %self.id, error = %err, "failed to serialize message");
                false
            }
        }
    }

    pub fn subscription(&self) -> Option<SessionId> {
        self.subscription.lock().clone()
    }

    /// Record inbound traffic.
    pub fn mark_alive(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound traffic (or accept).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.accepted.elapsed()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Cancelled when the connection is unregistered; the socket tasks
    /// watch it to close the transport.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("subscription", &self.subscription())
            .field("dropped", &self.drop_count())
            .finish_non_exhaustive()
    }
}

pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_connections: usize,
    queue_capacity: usize,
    register_lock: Mutex<()>,
    /// Drops accumulated by connections that have since gone away.
    retired_drops: AtomicU64,
    shutdown: CancellationToken,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, queue_capacity: usize, shutdown: CancellationToken) -> Self {
        Self {
            connections: DashMap::new(),
            max_connections,
            queue_capacity,
            register_lock: Mutex::new(()),
            retired_drops: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Add a newly accepted connection and hand back its outbound queue.
    pub fn register(&self) -> Result<(Arc<Connection>, mpsc::Receiver<Arc<str>>), RelayError> {
        let _guard = self.register_lock.lock();
        if self.connections.len() >= self.max_connections {
            warn!(limit = self.max_connections, "connection rejected, registry full");
            return Err(RelayError::CapacityExceeded {
                resource: "connections",
                limit: self.max_connections,
            });
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let connection = Arc::new(Connection::new(
            ConnectionId::new(),
            tx,
            self.shutdown.child_token(),
        ));
        self.connections.insert(connection.id.clone(), Arc::clone(&connection));
        info!(conn_id = %connection.id, total = self.connections.len(), "connection registered");
        Ok((connection, rx))
    }

    /// Subscribe a connection to a session, replacing any prior subscription.
    /// Returns the previous subscription.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        session_id: SessionId,
    ) -> Result<Option<SessionId>, RelayError> {
        let connection = self.require(connection_id)?;
        debug!(conn_id = %connection_id, session_id = %session_id, "subscribed");
        let previous = connection.subscription.lock().replace(session_id);
        Ok(previous)
    }

    /// Clear a connection's subscription. Returns the previous one.
    pub fn unsubscribe(&self, connection_id: &ConnectionId) -> Result<Option<SessionId>, RelayError> {
        let connection = self.require(connection_id)?;
        let previous = connection.subscription.lock().take();
        Ok(previous)
    }

    /// Subscribe every connection without a subscription. Returns how many.
    pub fn subscribe_unattached(&self, session_id: &SessionId) -> usize {
        let mut attached = 0;
        for entry in &self.connections {
            let mut subscription = entry.value().subscription.lock();
            if subscription.is_none() {
                *subscription = Some(session_id.clone());
                attached += 1;
            }
        }
        attached
    }

    /// Clear every subscription to `session_id`. Returns how many.
    pub fn release_session(&self, session_id: &SessionId) -> usize {
        let mut released = 0;
        for entry in &self.connections {
            let mut subscription = entry.value().subscription.lock();
            if subscription.as_ref() == Some(session_id) {
                *subscription = None;
                released += 1;
            }
        }
        released
    }

    /// Deliver to every subscriber of `session_id`. Returns the number of
    /// connections the message was queued for.
    pub fn broadcast(&self, session_id: &SessionId, message: &ServerMessage) -> usize {
        let text: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => Arc::from(json),
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed to serialize broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        for entry in &self.connections {
            let connection = entry.value();
            if connection.subscription.lock().as_ref() != Some(session_id) {
                continue;
            }
            if connection.send(Arc::clone(&text)) {
                delivered += 1;
            } else {
                debug!(
                    conn_id = %connection.id,
                    kind = message.kind(),
                    dropped = connection.drop_count(),
                    "outbound queue full, message dropped"
                );
            }
        }
        delivered
    }

    /// Deliver to one connection. `Ok(false)` means the message was dropped.
    pub fn unicast(&self, connection_id: &ConnectionId, message: &ServerMessage) -> Result<bool, RelayError> {
        let connection = self.require(connection_id)?;
        Ok(connection.send_message(message))
    }

    /// Remove a connection and close its transport. Idempotent.
    pub fn unregister(&self, connection_id: &ConnectionId) -> bool {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return false;
        };
        connection.subscription.lock().take();
        connection.close.cancel();
        let _ = self
            .retired_drops
            .fetch_add(connection.drop_count(), Ordering::Relaxed);
        info!(
            conn_id = %connection_id,
            age_ms = connection.age().as_millis() as u64,
            dropped = connection.drop_count(),
            "connection unregistered"
        );
        true
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(connection_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().subscription.lock().as_ref() == Some(session_id))
            .count()
    }

    /// Messages dropped across all connections, past and present.
    pub fn total_dropped(&self) -> u64 {
        let live: u64 = self.connections.iter().map(|entry| entry.value().drop_count()).sum();
        live + self.retired_drops.load(Ordering::Relaxed)
    }

    fn require(&self, connection_id: &ConnectionId) -> Result<Arc<Connection>, RelayError> {
        self.get(connection_id)
            .ok_or_else(|| RelayError::UnknownConnection(connection_id.clone()))
    }
}

impl SessionSink for ConnectionRegistry {
    fn publish(&self, session_id: &SessionId, message: &ServerMessage) {
        let delivered = self.broadcast(session_id, message);
        tracing::trace!(session_id = %session_id, kind = message.kind(), delivered, "published");
    }
}
