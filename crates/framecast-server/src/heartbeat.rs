//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use framecast_core::ServerMessage;

use crate::registry::{Connection, ConnectionRegistry};

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound traffic within the timeout window.
    TimedOut,
    /// The connection closed or the server is shutting down.
    Cancelled,
}

/// Send a JSON `ping` every `interval` until the connection has been silent
/// for at least `timeout`.
///
/// Any inbound frame refreshes liveness, not only `pong`.
pub async fn run_heartbeat(
    connection: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = ticker.tick() => {
                let idle = connection.idle_for();
                if idle >= timeout {
                    return HeartbeatResult::TimedOut;
                }
                if idle >= interval {
                    debug!(conn_id = %connection.id, idle_ms = idle.as_millis() as u64, "missed heartbeat");
                }
                connection.send_message(&ServerMessage::ping());
            }
        }
    }
}

/// Run the heartbeat for one connection and evict it on timeout.
pub async fn monitor(
    registry: Arc<ConnectionRegistry>,
    connection: Arc<Connection>,
    interval: Duration,
    timeout: Duration,
) -> HeartbeatResult {
    let cancel = connection.close_token();
    let result = run_heartbeat(Arc::clone(&connection), interval, timeout, cancel).await;
    if result == HeartbeatResult::TimedOut {
        warn!(
            conn_id = %connection.id,
            timeout_ms = timeout.as_millis() as u64,
            "connection unresponsive, evicting"
        );
        let _ = registry.unregister(&connection.id);
    }
    result
}

/// Answer an inbound `ping` with `pong`.
pub fn acknowledge_ping(connection: &Connection) -> bool {
    connection.mark_alive();
    connection.send_message(&ServerMessage::pong())
}
