//! Error types for the listener connection and the notifier run loop.
//!
//! [`ListenerError`] is returned by [`Listener`](crate::Listener)
//! implementations. [`NotifierError`] is what ends
//! [`Notifier::run`](crate::Notifier::run); it is the only fatal signal the
//! multiplexer produces.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by a [`Listener`](crate::Listener).
#[derive(Debug, Error)]
pub enum ListenerError {
    /// `connect` was called on an already connected listener.
    #[error("connection already established")]
    AlreadyConnected,

    /// An operation other than `connect`/`close` ran without a connection.
    #[error("listener is not connected")]
    NotConnected,

    /// The wait was interrupted through its cancellation token.
    #[error("wait for notification cancelled")]
    Cancelled,

    /// `PostgreSQL` driver error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// The underlying connection went away.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

impl ListenerError {
    /// Whether this is the benign "wait was interrupted" outcome rather
    /// than a transport failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Physical registration command issued by the run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Start watching a channel.
    Listen,
    /// Stop watching a channel.
    Unlisten,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen => f.write_str("LISTEN"),
            Self::Unlisten => f.write_str("UNLISTEN"),
        }
    }
}

/// Errors that end the notifier run loop.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// Waiting for a notification failed at the transport level.
    #[error("error waiting for notification: {0}")]
    Listener(#[from] ListenerError),

    /// A LISTEN/UNLISTEN command failed.
    #[error("{kind} on channel {channel:?} failed: {source}")]
    Command {
        /// Which command.
        kind: ChangeKind,
        /// Target channel.
        channel: String,
        /// Underlying listener failure.
        #[source]
        source: ListenerError,
    },

    /// A LISTEN/UNLISTEN command exceeded its deadline.
    #[error("{kind} on channel {channel:?} timed out after {timeout:?}")]
    CommandTimeout {
        /// Which command.
        kind: ChangeKind,
        /// Target channel.
        channel: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The lifetime token was cancelled.
    #[error("notifier stopped")]
    Stopped,

    /// `run` was called while another run loop is active.
    #[error("notifier run loop is already active")]
    AlreadyRunning,

    /// The run loop ended before the channel registration completed.
    #[error("notifier closed before registration completed")]
    Closed,
}

/// Convenience alias for listener results.
pub type Result<T> = std::result::Result<T, ListenerError>;
