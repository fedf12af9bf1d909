//! Gateway configuration.
//!
//! Compiled defaults, optionally deep-merged with a JSON file, then
//! overridden by `BEACON_*` environment variables with range-validated
//! parsing. Invalid env values are logged and ignored rather than
//! aborting startup.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Configuration for the gateway process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Redis URL; absent means the in-memory broker.
    pub redis_url: Option<String>,
    /// Auth gate handshake timeout in milliseconds.
    pub auth_timeout_ms: u64,
    /// Server-initiated WebSocket ping interval in seconds.
    pub ping_interval_secs: u64,
    /// Heartbeat inactivity timeout in seconds (forced close after).
    pub heartbeat_timeout_secs: u64,
    /// SSE keep-alive comment interval in seconds.
    pub sse_keepalive_secs: u64,
    /// Presence reconnect grace window in seconds.
    pub presence_grace_secs: u64,
    /// Per-connection outbound queue capacity (backpressure threshold).
    pub outbound_queue_capacity: usize,
    /// Dispatcher → bridge publish queue capacity.
    pub publish_queue_capacity: usize,
    /// Bridge outage buffer capacity.
    pub publish_buffer_capacity: usize,
    /// Recent envelope-id dedupe window size.
    pub dedupe_window: usize,
    /// Max accepted control frame size in bytes.
    pub max_frame_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            redis_url: None,
            auth_timeout_ms: 5_000,
            ping_interval_secs: 25,
            heartbeat_timeout_secs: 60,
            sse_keepalive_secs: 30,
            presence_grace_secs: 10,
            outbound_queue_capacity: 256,
            publish_queue_capacity: 1_024,
            publish_buffer_capacity: 1_000,
            dedupe_window: 4_096,
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Load from a JSON file (deep-merged over defaults) and apply env
    /// overrides. A missing file yields defaults; invalid JSON is an error.
    pub fn load_from_path(path: &Path) -> Result<Self, serde_json::Error> {
        let defaults = serde_json::to_value(Self::default())?;
        let merged = if path.exists() {
            debug!(?path, "loading gateway config from file");
            let content = std::fs::read_to_string(path).map_err(|err| {
                serde::de::Error::custom(format!("read {}: {err}", path.display()))
            })?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        } else {
            debug!(?path, "config file not found, using defaults");
            defaults
        };
        let mut config: Self = serde_json::from_value(merged)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `BEACON_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = read_env_string("BEACON_HOST") {
            self.host = v;
        }
        if let Some(v) = read_env_u16("BEACON_PORT", 0, 65535) {
            self.port = v;
        }
        if let Some(v) = read_env_string("BEACON_REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some(v) = read_env_u64("BEACON_AUTH_TIMEOUT_MS", 100, 60_000) {
            self.auth_timeout_ms = v;
        }
        if let Some(v) = read_env_u64("BEACON_PING_INTERVAL_SECS", 1, 600) {
            self.ping_interval_secs = v;
        }
        if let Some(v) = read_env_u64("BEACON_HEARTBEAT_TIMEOUT_SECS", 1, 3_600) {
            self.heartbeat_timeout_secs = v;
        }
        if let Some(v) = read_env_u64("BEACON_PRESENCE_GRACE_SECS", 0, 600) {
            self.presence_grace_secs = v;
        }
        if let Some(v) = read_env_usize("BEACON_OUTBOUND_QUEUE", 8, 65_536) {
            self.outbound_queue_capacity = v;
        }
        if let Some(v) = read_env_usize("BEACON_PUBLISH_BUFFER", 1, 1_000_000) {
            self.publish_buffer_capacity = v;
        }
    }
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per-key; arrays and primitives are replaced; nulls in the
/// source are skipped so a file cannot accidentally erase a default.
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

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let parsed = val.parse::<u16>().ok().filter(|n| *n >= min && *n <= max);
    if parsed.is_none() {
        warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    parsed
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let parsed = val.parse::<u64>().ok().filter(|n| *n >= min && *n <= max);
    if parsed.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    parsed
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let parsed = val.parse::<usize>().ok().filter(|n| *n >= min && *n <= max);
    if parsed.is_none() {
        warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    parsed
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
