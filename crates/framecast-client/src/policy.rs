use std::fmt;
use std::time::Duration;

use framecast_core::config::ClientSettings;

use crate::error::ClientError;

/// Retry and heartbeat timing for a [`ReconnectingClient`](crate::ReconnectingClient).
///
/// Retries are fixed-interval: the first attempt is immediate and every later
/// attempt waits `reconnect_interval`. The attempt counter resets after each
/// successful connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub reconnect_interval: Duration,
    pub max_attempts: u32,
    pub ping_interval: Duration,
    /// A link with no inbound traffic for this long is considered dead.
    pub ping_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl ReconnectPolicy {
    /// The client heartbeat needs a non-zero period and a timeout longer
    /// than it.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.ping_interval.is_zero() {
            return Err(ClientError::InvalidPolicy("ping interval must be positive".into()));
        }
        if self.ping_timeout <= self.ping_interval {
            return Err(ClientError::InvalidPolicy(format!(
                "ping timeout ({:?}) must exceed ping interval ({:?})",
                self.ping_timeout, self.ping_interval
            )));
        }
        Ok(())
    }
}

impl From<&ClientSettings> for ReconnectPolicy {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            reconnect_interval: Duration::from_millis(settings.reconnect_interval_ms),
            max_attempts: settings.max_reconnect_attempts,
            ping_interval: Duration::from_millis(settings.ping_interval_ms),
            ping_timeout: Duration::from_millis(settings.ping_timeout_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: the attempt budget ran out.
    Failed,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
