//! Configuration loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a config file is given, deep-merge its values over the defaults
//! 3. Apply `WSX_*` environment variable overrides
//! 4. Validate
//!
//! Command-line flags are applied by the binary after this.

use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ServerConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The config file is not valid JSON or has the wrong shape.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value is out of range or inconsistent.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Load configuration from an optional file plus the process environment.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// [`load_config`] with an injectable environment lookup.
pub fn load_config_with(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ServerConfig> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) => {
            debug!(?path, "loading config file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides_with(&mut config, lookup);
    validate(&config)?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `WSX_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored.
pub fn apply_env_overrides_with(
    config: &mut ServerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("WSX_HOST") {
        config.host = v;
    }
    if let Some(v) = env.parsed("WSX_PORT", |s| parse_range::<u16>(s, 0, u16::MAX)) {
        config.port = v;
    }
    if let Some(v) = env.parsed("WSX_PATH", parse_path) {
        config.path = v;
    }
    if let Some(v) = env.parsed("WSX_MAX_CONNECTIONS", |s| parse_range::<usize>(s, 1, 1_000_000)) {
        config.max_connections = v;
    }
    if let Some(v) = env.parsed("WSX_HEARTBEAT_INTERVAL_SECS", |s| parse_range::<u64>(s, 1, 3600)) {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.parsed("WSX_HEARTBEAT_TIMEOUT_SECS", |s| parse_range::<u64>(s, 1, 86_400)) {
        config.heartbeat_timeout_secs = v;
    }
    if let Some(v) = env.parsed("WSX_MAX_MESSAGE_SIZE", |s| {
        parse_range::<usize>(s, 1024, 1024 * 1024 * 1024)
    }) {
        config.max_message_size = v;
    }
    if let Some(v) = env.parsed("WSX_SEND_QUEUE_CAPACITY", |s| parse_range::<usize>(s, 1, 1_000_000)) {
        config.send_queue_capacity = v;
    }
    if let Some(v) = env.string("WSX_PROTOCOLS") {
        config.protocols = parse_list(&v);
    }
    if let Some(v) = env.string("WSX_ALLOWED_TYPES") {
        config.allowed_types = parse_list(&v);
    }
    if let Some(v) = env.string("WSX_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = env.parsed("WSX_LOG_FORMAT", |s| s.parse().ok()) {
        config.log_format = v;
    }
}

/// Reject configurations that cannot work.
pub fn validate(config: &ServerConfig) -> Result<()> {
    if !config.path.starts_with('/') {
        return Err(ConfigError::InvalidValue(format!(
            "path must start with '/': {}",
            config.path
        )));
    }
    if config.heartbeat_timeout_secs < config.heartbeat_interval_secs {
        return Err(ConfigError::InvalidValue(format!(
            "heartbeat_timeout_secs ({}) is shorter than heartbeat_interval_secs ({})",
            config.heartbeat_timeout_secs, config.heartbeat_interval_secs
        )));
    }
    if config.max_connections == 0 || config.send_queue_capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "max_connections and send_queue_capacity must be positive".into(),
        ));
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse an integer within an inclusive range.
pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a route path; must start with `/`.
pub fn parse_path(val: &str) -> Option<String> {
    let val = val.trim();
    (val.starts_with('/') && !val.contains(char::is_whitespace)).then(|| val.to_owned())
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
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
