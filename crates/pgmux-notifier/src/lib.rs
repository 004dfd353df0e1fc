//! # pgmux-notifier
//!
//! Many logical subscriptions over one `PostgreSQL` LISTEN/NOTIFY connection.
//!
//! - **Listener**: [`Listener`] is the physical connection contract;
//!   [`PgListener`] implements it over a dedicated `tokio-postgres`
//!   connection. With the `testing` feature, `testing::MemoryListener`
//!   implements it in memory.
//! - **Notifier**: [`Notifier`] reference-counts channel interest, issues
//!   LISTEN on the first subscriber and UNLISTEN after the last, and fans
//!   each event out to every subscriber of its channel.
//! - **Subscription**: [`Subscription`] is a bounded event queue with an
//!   `established` signal; a slow consumer loses events instead of stalling
//!   the others.
//!
//! [`Notifier::run`] must be driven by exactly one task. It returns only on
//! a fatal error or when its lifetime token is cancelled; reconnecting is
//! left to the caller.

#![deny(unsafe_code)]

pub mod errors;
pub mod listener;
pub mod notifier;
pub mod postgres;
pub mod subscription;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use errors::{ChangeKind, ListenerError, NotifierError, Result};
pub use listener::{Listener, Notification, quote_identifier};
pub use notifier::{Notifier, NotifierConfig};
pub use postgres::PgListener;
pub use subscription::Subscription;
