//! # pgmux-core
//!
//! Shared plumbing for the pgmux crates.
//!
//! - **Logging**: [`logging::init_subscriber`] installs the process-wide
//!   `tracing` subscriber; libraries only emit events and never install one.
//! - **Test capture**: [`logging::capture_logs`] records emitted events in
//!   memory so tests can assert on drop and decode warnings.

#![deny(unsafe_code)]

pub mod logging;
