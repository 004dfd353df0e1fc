//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may contain any subset of fields; missing fields keep their compiled
//! default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "database": { "url": "postgres://app@db/app" },
///   "notifier": { "heartbeatMs": 15000 },
///   "cache": { "ttlMs": 60000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PgmuxSettings {
    /// Database connection settings.
    pub database: DatabaseSettings,
    /// Notification multiplexer tuning.
    pub notifier: NotifierSettings,
    /// Event-invalidated cache settings.
    pub cache: CacheSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl PgmuxSettings {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.notifier.buffer_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "notifier.bufferCapacity must be at least 1".into(),
            ));
        }
        if self.notifier.command_timeout_ms == 0 || self.notifier.heartbeat_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "notifier timeouts must be non-zero".into(),
            ));
        }
        if self.database.max_pool_size == 0 {
            return Err(SettingsError::InvalidValue(
                "database.maxPoolSize must be at least 1".into(),
            ));
        }
        if self.cache.channel.is_empty() {
            return Err(SettingsError::InvalidValue(
                "cache.channel must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Database connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// libpq-style connection string or URL.
    pub url: String,
    /// Maximum connections held by the record-store pool.
    pub max_pool_size: usize,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost:5432/postgres".to_string(),
            max_pool_size: 8,
        }
    }
}

/// Notification multiplexer tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifierSettings {
    /// Per-subscription event queue capacity.
    pub buffer_capacity: usize,
    /// Deadline for a single LISTEN/UNLISTEN command, in milliseconds.
    pub command_timeout_ms: u64,
    /// Upper bound of one wait cycle, in milliseconds.
    pub heartbeat_ms: u64,
}

impl NotifierSettings {
    /// Command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Heartbeat window as a [`Duration`].
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 2,
            command_timeout_ms: 10_000,
            heartbeat_ms: 30_000,
        }
    }
}

/// Event-invalidated cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Channel carrying change envelopes for the cached table.
    pub channel: String,
    /// Entry lifetime in milliseconds; `None` keeps entries until invalidated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl CacheSettings {
    /// Entry lifetime as a [`Duration`].
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            channel: "users_channel".to_string(),
            ttl_ms: None,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
