//! Cache errors.

use thiserror::Error;

/// Boxed error returned by a [`Loader`](crate::Loader).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The loader failed for a key that was not cached.
    #[error("failed to load {key}: {source}")]
    Load {
        /// Debug rendering of the requested key.
        key: String,
        /// Loader failure.
        #[source]
        source: BoxError,
    },

    /// A change payload was not a valid envelope.
    #[error("malformed change envelope: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Convenience alias for cache results.
pub type Result<T> = std::result::Result<T, CacheError>;
