//! The physical connection contract.
//!
//! A [`Listener`] wraps one exclusively held link to the notification
//! source. Implementations serialize every operation behind a single lock;
//! in practice only the notifier run loop issues `listen`, `unlisten` and
//! `wait_for_notification`, while `connect`, `ping` and `close` are
//! administrative calls made from outside it.

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;

/// One event received from the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Channel the event was published on.
    pub channel: String,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Notification {
    /// Build a notification.
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// A single stateful duplex connection to the notification source.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Establish the connection. Fails with
    /// [`AlreadyConnected`](crate::ListenerError::AlreadyConnected) if one is
    /// already held.
    async fn connect(&self) -> Result<()>;

    /// Release the connection. A no-op when not connected.
    async fn close(&self) -> Result<()>;

    /// Verify the connection is alive.
    async fn ping(&self) -> Result<()>;

    /// Start receiving events for `channel`.
    async fn listen(&self, channel: &str) -> Result<()>;

    /// Stop receiving events for `channel`.
    async fn unlisten(&self, channel: &str) -> Result<()>;

    /// Block until the next event arrives.
    ///
    /// Returns [`Cancelled`](crate::ListenerError::Cancelled) once `cancel`
    /// fires. Implementations must be cancel-safe: dropping the returned
    /// future loses no event.
    async fn wait_for_notification(&self, cancel: &CancellationToken) -> Result<Notification>;
}

/// Quote `name` as a SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
