//! Relay configuration, read from the environment at startup.

use std::env;
use std::time::Duration;

use uuid::Uuid;

/// How long an empty room stays resident before eviction.
///
/// Policy knob, not a correctness parameter; tests shrink it.
pub const EVICTION_GRACE: Duration = Duration::from_secs(60);

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port for the WebSocket + HTTP listener
    pub port: u16,
    /// Identity of this process on the bus; echo suppression keys on it
    pub instance_id: String,
    /// Bus / KV endpoint
    pub redis_url: String,
    /// Grace period before an empty room is evicted
    pub eviction_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 1234,
            instance_id: Uuid::new_v4().to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            eviction_grace: EVICTION_GRACE,
        }
    }
}

impl RelayConfig {
    /// Build a config from `PORT`, `INSTANCE_ID`, and `REDIS_URL`.
    ///
    /// Unset variables fall back to defaults; an unparseable `PORT` is
    /// logged and the default kept. A missing `INSTANCE_ID` mints a
    /// fresh unique id, so two processes never share one accidentally.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = env::var("PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => log::warn!("invalid PORT value {port:?}, using {}", config.port),
            }
        }
        if let Ok(id) = env::var("INSTANCE_ID") {
            if !id.is_empty() {
                config.instance_id = id;
            }
        }
        if let Ok(url) = env::var("REDIS_URL") {
            if !url.is_empty() {
                config.redis_url = url;
            }
        }

        config
    }
}
