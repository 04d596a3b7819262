//! `/health` endpoint.

use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: String,
    pub uptime_secs: u64,
    /// Live socket connections.
    pub connections: usize,
    /// Non-terminal sessions.
    pub active_sessions: usize,
    /// Outbound messages dropped on full queues since startup.
    pub dropped_messages: u64,
}

pub fn health_check(
    start_time: Instant,
    shutting_down: bool,
    connections: usize,
    sessions: usize,
    dropped: u64,
) -> HealthResponse {
    let status = if shutting_down { "shutting_down" } else { "ok" };
    HealthResponse {
        status: status.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions: sessions,
        dropped_messages: dropped,
    }
}
