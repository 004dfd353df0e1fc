//! # pgmux-cache
//!
//! A key-value cache invalidated by row-change events.
//!
//! Database triggers publish a JSON [`ChangeEnvelope`] on a channel for every
//! INSERT, UPDATE and DELETE. [`Cache::listen`] follows that channel through a
//! [`pgmux_notifier::Subscription`] and patches its entries in place, so
//! readers see new values without waiting for an expiry window. Misses go to
//! a [`Loader`].

#![deny(unsafe_code)]

pub mod cache;
pub mod envelope;
pub mod errors;
pub mod keyer;

pub use cache::Cache;
pub use envelope::{ChangeAction, ChangeEnvelope};
pub use errors::{BoxError, CacheError, Result};
pub use keyer::{Keyer, Loader};
