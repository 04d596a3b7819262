//! Relay configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`RelayConfig::default()`]
//! 2. If a JSON file is given and exists, merge it over the defaults
//! 3. Merge `FRAMECAST_`-prefixed environment variables (highest priority);
//!    nested keys use `__`, e.g. `FRAMECAST_HEARTBEAT__TIMEOUT_MS=45000`
//!
//! The merged result is validated before it is returned.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for the relay server and the reconnecting client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub heartbeat: HeartbeatSettings,
    pub pacing: PacingSettings,
    pub client: ClientSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Maximum live connections before `register` rejects.
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,
    /// Maximum non-terminal sessions.
    pub max_sessions: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9001,
            max_connections: 256,
            outbound_queue_capacity: 256,
            max_sessions: 32,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    /// Must be strictly greater than `interval_ms`.
    pub timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 90_000,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingSettings {
    /// Send rate used when neither the request nor the source gives one.
    pub default_send_rate: f64,
    /// Frame count for synthetic sessions when the request omits it.
    pub default_test_frames: u64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            default_send_rate: 5.0,
            default_test_frames: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub url: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ping_interval_ms: u64,
    /// Must be strictly greater than `ping_interval_ms`.
    pub ping_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9001/ws".into(),
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: 5,
            ping_interval_ms: 15_000,
            ping_timeout_ms: 45_000,
        }
    }
}

impl RelayConfig {
    /// Load from defaults, an optional JSON file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Json::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed("FRAMECAST_").split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat timeout ({}ms) must exceed interval ({}ms)",
                self.heartbeat.timeout_ms, self.heartbeat.interval_ms
            )));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat interval must be positive".into()));
        }
        if self.client.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid("client ping interval must be positive".into()));
        }
        if self.client.ping_timeout_ms <= self.client.ping_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "client ping timeout ({}ms) must exceed ping interval ({}ms)",
                self.client.ping_timeout_ms, self.client.ping_interval_ms
            )));
        }
        if self.server.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid("outbound queue capacity must be positive".into()));
        }
        if self.server.max_connections == 0 || self.server.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_connections and max_sessions must be positive".into(),
            ));
        }
        if !(self.pacing.default_send_rate > 0.0) {
            return Err(ConfigError::Invalid("default send rate must be positive".into()));
        }
        if self.client.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid("max reconnect attempts must be positive".into()));
        }
        Ok(())
    }
}
