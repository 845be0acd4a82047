#![forbid(unsafe_code)]

// Server configuration, loaded from environment variables.

use std::time::Duration;
use tracing::warn;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Concurrent WebSocket connections before upgrades get 503
    pub max_connections: usize,
    /// Close a connection after this long without an inbound frame
    pub idle_timeout: Duration,
    /// Token bucket refill rate and burst size, frames per second
    pub rate_limit_per_sec: u64,
    /// Outbound queue depth per connection; overflow is dropped
    pub channel_capacity: usize,
    pub max_message_size: usize,
    /// Allowed browser origins. Empty means any origin.
    pub cors_origins: Vec<String>,
    /// Bearer token required by /metrics when set
    pub metrics_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: Duration::from_secs(300),
            rate_limit_per_sec: 100,
            channel_capacity: 64,
            max_message_size: 65_536,
            cors_origins: Vec::new(),
            metrics_token: None,
        }
    }
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let mut max_connections = parsed("MAX_CONNECTIONS")
            .map(|v| v as usize)
            .unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let cors_origins = lookup("CORS_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: lookup("PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            max_connections,
            idle_timeout: parsed("IDLE_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            rate_limit_per_sec: parsed("RATE_LIMIT_PER_SEC")
                .filter(|rate| *rate > 0)
                .unwrap_or(defaults.rate_limit_per_sec),
            channel_capacity: parsed("CHANNEL_CAPACITY")
                .filter(|cap| *cap > 0)
                .map(|cap| cap as usize)
                .unwrap_or(defaults.channel_capacity),
            max_message_size: defaults.max_message_size,
            cors_origins,
            metrics_token: lookup("METRICS_TOKEN").filter(|t| !t.is_empty()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}
