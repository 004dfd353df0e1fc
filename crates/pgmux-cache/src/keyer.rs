//! Cache keys and loaders.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;

use crate::errors::BoxError;

/// A value that knows its own cache key.
pub trait Keyer {
    /// Key type.
    type Key: Eq + Hash + Clone + Debug + Send + Sync;

    /// The key this value is cached under.
    fn key(&self) -> Self::Key;
}

/// Fetches a value from the backing store on a cache miss.
///
/// Cancellation is by drop: abandoning the `get` future abandons the load.
#[async_trait]
pub trait Loader<V: Keyer>: Send + Sync {
    /// Load the value for `key`.
    async fn load(&self, key: &V::Key) -> Result<V, BoxError>;
}
