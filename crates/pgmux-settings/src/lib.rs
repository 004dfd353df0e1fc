//! # pgmux-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`PgmuxSettings::default()`]
//! 2. **User file**: `~/.pgmux/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `PGMUX_*` and `POSTGRES_URL` overrides
//!
//! Settings are loaded once by the binary and passed down explicitly; there
//! is no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    load_settings_with, settings_path,
};
pub use types::*;
