//! Engine, server and client configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::oplog::Retention;
use crate::protocol::RoomKey;

/// Per-room engine settings shared by every room of a server.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum attached connections per room
    pub max_connections_per_room: usize,
    /// Bounded outbox size per connection (messages)
    pub outbox_capacity: usize,
    /// Presence coalescing window (default: 33ms, one frame at 30 fps)
    pub presence_window: Duration,
    /// How many storage operations are kept for reconnection replay
    pub retention: Retention,
    /// How long an empty room is kept before teardown
    pub grace_period: Duration,
    /// Connections silent for longer than this are detached
    pub heartbeat_timeout: Duration,
    /// Period of the maintenance sweep
    pub maintenance_interval: Duration,
    /// Sequence numbers reserved in the store at a time
    pub sequence_block: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections_per_room: 100,
            outbox_capacity: 256,
            presence_window: Duration::from_millis(33),
            retention: Retention::Unbounded,
            grace_period: Duration::ZERO,
            heartbeat_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_millis(50),
            sequence_block: 1024,
        }
    }
}

impl EngineConfig {
    /// Small queues and short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            max_connections_per_room: 8,
            outbox_capacity: 64,
            presence_window: Duration::from_millis(20),
            retention: Retention::Unbounded,
            grace_period: Duration::ZERO,
            heartbeat_timeout: Duration::from_secs(5),
            maintenance_interval: Duration::from_millis(10),
            sequence_block: 16,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub engine: EngineConfig,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Accepted join tokens (None = accept everyone)
    pub tokens: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            engine: EngineConfig::default(),
            storage_path: None,
            tokens: None,
        }
    }
}

impl ServerConfig {
    /// Read `ATRIUM_*` environment variables over the defaults.
    ///
    /// | Variable                   | Meaning                               |
    /// |----------------------------|---------------------------------------|
    /// | `ATRIUM_BIND_ADDR`         | listen address                        |
    /// | `ATRIUM_STORAGE_PATH`      | RocksDB directory                     |
    /// | `ATRIUM_TOKENS`            | comma-separated accepted tokens       |
    /// | `ATRIUM_MAX_CONNECTIONS`   | connections per room                  |
    /// | `ATRIUM_RETENTION`         | `unbounded` or an operation count     |
    /// | `ATRIUM_GRACE_MS`          | empty-room grace period               |
    /// | `ATRIUM_PRESENCE_WINDOW_MS`| presence coalescing window            |
    /// | `ATRIUM_HEARTBEAT_TIMEOUT_SECS` | silent-connection timeout        |
    /// | `ATRIUM_SEQUENCE_BLOCK`    | sequence numbers reserved at a time   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("ATRIUM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("ATRIUM_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(tokens) = lookup("ATRIUM_TOKENS") {
            let tokens: Vec<String> = tokens
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
            config.tokens = Some(tokens);
        }
        if let Some(n) = parse(&lookup, "ATRIUM_MAX_CONNECTIONS")? {
            config.engine.max_connections_per_room = n as usize;
        }
        if let Some(raw) = lookup("ATRIUM_RETENTION") {
            config.engine.retention = if raw.eq_ignore_ascii_case("unbounded") {
                Retention::Unbounded
            } else {
                let n = raw.parse::<usize>().map_err(|_| ConfigError::Invalid {
                    var: "ATRIUM_RETENTION",
                    value: raw.clone(),
                })?;
                Retention::Operations(n)
            };
        }
        if let Some(ms) = parse(&lookup, "ATRIUM_GRACE_MS")? {
            config.engine.grace_period = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "ATRIUM_PRESENCE_WINDOW_MS")? {
            config.engine.presence_window = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, "ATRIUM_HEARTBEAT_TIMEOUT_SECS")? {
            config.engine.heartbeat_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&lookup, "ATRIUM_SEQUENCE_BLOCK")? {
            config.engine.sequence_block = n.max(1);
        }
        Ok(config)
    }
}

fn parse(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

/// WebSocket client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL (ws://host:port)
    pub url: String,
    pub room: RoomKey,
    pub token: Option<String>,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// First reconnect delay
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling
    pub max_backoff: Duration,
    /// Outgoing queue size
    pub send_buffer: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, room: impl Into<RoomKey>) -> Self {
        Self {
            url: url.into(),
            room: room.into(),
            token: None,
            heartbeat_interval: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            send_buffer: 256,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Backoff before reconnect attempt `attempt` (0-based), doubling up to the ceiling.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_engine_defaults_are_neutral() {
        let config = EngineConfig::default();
        assert_eq!(config.retention, Retention::Unbounded);
        assert_eq!(config.grace_period, Duration::ZERO);
        assert_eq!(config.presence_window, Duration::from_millis(33));
    }

    #[test]
    fn test_server_config_from_lookup() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("ATRIUM_BIND_ADDR", "0.0.0.0:8080"),
            ("ATRIUM_RETENTION", "500"),
            ("ATRIUM_GRACE_MS", "2500"),
            ("ATRIUM_TOKENS", "a, b,,c"),
            ("ATRIUM_SEQUENCE_BLOCK", "0"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.engine.retention, Retention::Operations(500));
        assert_eq!(config.engine.grace_period, Duration::from_millis(2500));
        assert_eq!(config.engine.sequence_block, 1);
        assert_eq!(
            config.tokens,
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_config_rejects_garbage() {
        let err = ServerConfig::from_lookup(lookup(&[("ATRIUM_GRACE_MS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid { var: "ATRIUM_GRACE_MS", value: "soon".into() }
        );
    }

    #[test]
    fn test_client_backoff_doubles_and_caps() {
        let config = ClientConfig::new("ws://127.0.0.1:9090", "room");
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(40), Duration::from_secs(30));
    }
}
