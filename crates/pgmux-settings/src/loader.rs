//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PgmuxSettings::default()`]
//! 2. If `~/.pgmux/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::PgmuxSettings;

/// Resolve the path to the settings file (`~/.pgmux/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pgmux").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PgmuxSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<PgmuxSettings> {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Load settings from `path`, resolving overrides through `lookup`.
///
/// `lookup` stands in for the process environment, which keeps the override
/// layer testable without mutating global state.
pub fn load_settings_with<F>(path: &Path, lookup: F) -> Result<PgmuxSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(PgmuxSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: PgmuxSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, lookup);
    settings.validate()?;
    Ok(settings)
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

/// Apply environment variable overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut PgmuxSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides resolved through `lookup`.
///
/// Integers must parse and fall within range; invalid values are ignored
/// with a warning. `PGMUX_DATABASE_URL` wins over `POSTGRES_URL`.
pub fn apply_overrides<F>(settings: &mut PgmuxSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Database ────────────────────────────────────────────────────
    if let Some(v) = env
        .read_string("PGMUX_DATABASE_URL")
        .or_else(|| env.read_string("POSTGRES_URL"))
    {
        settings.database.url = v;
    }
    if let Some(v) = env.read_usize("PGMUX_POOL_SIZE", 1, 1024) {
        settings.database.max_pool_size = v;
    }

    // ── Notifier ────────────────────────────────────────────────────
    if let Some(v) = env.read_usize("PGMUX_BUFFER_CAPACITY", 1, 65_536) {
        settings.notifier.buffer_capacity = v;
    }
    if let Some(v) = env.read_u64("PGMUX_COMMAND_TIMEOUT_MS", 100, 600_000) {
        settings.notifier.command_timeout_ms = v;
    }
    if let Some(v) = env.read_u64("PGMUX_HEARTBEAT_MS", 100, 3_600_000) {
        settings.notifier.heartbeat_ms = v;
    }

    // ── Cache ───────────────────────────────────────────────────────
    if let Some(v) = env.read_string("PGMUX_CACHE_CHANNEL") {
        settings.cache.channel = v;
    }
    if let Some(v) = env.read_u64("PGMUX_CACHE_TTL_MS", 1, 86_400_000) {
        settings.cache.ttl_ms = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.read_string("PGMUX_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.read_bool("PGMUX_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse `1`/`true`/`yes`/`on` and `0`/`false`/`no`/`off`, case-insensitively.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn read_string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn read_u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn read_bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid bool env var, ignoring");
        }
        result
    }

    fn read_usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
