//! Broker configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a config file is given, deep-merge its values over the defaults
//! 3. Apply `NODECAST_*` environment overrides
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use nodecast_core::EchoPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Errors while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The config file is not valid JSON or has wrongly typed fields.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value parsed but is out of range.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Smallest accepted `maxFrameBytes`.
pub const MIN_FRAME_BYTES: usize = 1024;

/// One listener's bind address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
}

impl ListenerConfig {
    /// `host:port` as passed to `bind`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for the broker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Name reported by `serverConnect`.
    pub process_name: String,
    /// Raw TCP listener.
    pub socket: ListenerConfig,
    /// WebSocket listener (also serves `/health` and `/metrics`).
    pub websocket: ListenerConfig,
    /// Live connections allowed across both listeners.
    pub max_connections: usize,
    /// Outbound queue capacity per client, in envelopes.
    pub outbound_buffer: usize,
    /// Largest inbound line or WebSocket message, in bytes.
    pub max_frame_bytes: usize,
    /// Whether `nodeChannelSend` echoes to the sender.
    pub echo_policy: EchoPolicy,
    /// Answer unknown methods with an error envelope instead of dropping them.
    pub report_unknown_methods: bool,
    /// How long `stop()` waits for the listeners.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            process_name: "default".into(),
            socket: ListenerConfig {
                host: "127.0.0.1".into(),
                port: 6900,
            },
            websocket: ListenerConfig {
                host: "127.0.0.1".into(),
                port: 6901,
            },
            max_connections: 256,
            outbound_buffer: 1024,
            max_frame_bytes: 1024 * 1024, // 1 MiB
            echo_policy: EchoPolicy::ExcludeOrigin,
            report_unknown_methods: true,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Load from an optional JSON file, then apply process environment
    /// overrides. A missing file is an error only when explicitly given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Deep-merge `path` over the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(?path, "loading config file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        Self::from_value(user)
    }

    /// Deep-merge `user` over the defaults.
    pub fn from_value(user: Value) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;
        let config: Self = serde_json::from_value(deep_merge(defaults, user))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the listeners cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "maxFrameBytes must be at least {MIN_FRAME_BYTES}, got {}",
                self.max_frame_bytes
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("maxConnections must be at least 1".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue("outboundBuffer must be at least 1".into()));
        }
        Ok(())
    }

    /// Apply `NODECAST_*` overrides read through `lookup`.
    ///
    /// Values are strictly parsed; invalid ones are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = EnvReader { lookup };
        if let Some(v) = env.string("NODECAST_PROCESS_NAME") {
            self.process_name = v;
        }
        if let Some(v) = env.string("NODECAST_HOST") {
            self.socket.host.clone_from(&v);
            self.websocket.host = v;
        }
        if let Some(v) = env.parsed("NODECAST_SOCKET_PORT", parse_port) {
            self.socket.port = v;
        }
        if let Some(v) = env.parsed("NODECAST_WS_PORT", parse_port) {
            self.websocket.port = v;
        }
        if let Some(v) = env.parsed("NODECAST_MAX_CONNECTIONS", |s| {
            parse_usize_range(s, 1, 1_000_000)
        }) {
            self.max_connections = v;
        }
        if let Some(v) = env.parsed("NODECAST_ECHO_POLICY", |s| s.parse().ok()) {
            self.echo_policy = v;
        }
        if let Some(v) = env.parsed("NODECAST_REPORT_UNKNOWN_METHODS", parse_bool) {
            self.report_unknown_methods = v;
        }
    }
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

// ── Pure parsing functions ──────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a non-zero port.
pub fn parse_port(val: &str) -> Option<u16> {
    val.parse().ok().filter(|p| *p != 0)
}

/// Parse a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}
