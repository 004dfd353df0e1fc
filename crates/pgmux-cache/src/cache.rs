//! Read-through cache kept fresh by change events.
//!
//! [`Cache::get`] serves live entries from memory and falls back to the
//! [`Loader`] on a miss. [`Cache::listen`] consumes a notifier subscription:
//! INSERT and UPDATE replace the entry with the row carried in the envelope,
//! DELETE evicts it. With a TTL, entries also expire on their own; without
//! one, they live until an event removes them.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use pgmux_notifier::Subscription;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::{ChangeAction, ChangeEnvelope};
use crate::errors::{CacheError, Result};
use crate::keyer::{Keyer, Loader};

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Event-invalidated key-value cache.
pub struct Cache<V: Keyer, L> {
    loader: L,
    entries: RwLock<HashMap<V::Key, Entry<V>>>,
    ttl: Option<Duration>,
}

impl<V, L> Cache<V, L>
where
    V: Keyer + Clone + DeserializeOwned + Send + Sync,
    L: Loader<V>,
{
    /// Create an empty cache. `ttl` of `None` disables expiry.
    pub fn new(loader: L, ttl: Option<Duration>) -> Self {
        Self {
            loader,
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Create a cache whose entries never expire.
    pub fn without_ttl(loader: L) -> Self {
        Self::new(loader, None)
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Return the cached value for `key`, loading it on a miss or expiry.
    ///
    /// A failed load leaves the cache untouched.
    pub async fn get(&self, key: &V::Key) -> Result<V> {
        let cached = {
            let entries = self.entries.read();
            entries
                .get(key)
                .filter(|entry| entry.is_live(Instant::now()))
                .map(|entry| entry.value.clone())
        };
        if let Some(value) = cached {
            debug!(?key, "cache hit");
            return Ok(value);
        }

        debug!(?key, "cache miss, loading");
        let value = self
            .loader
            .load(key)
            .await
            .map_err(|source| CacheError::Load {
                key: format!("{key:?}"),
                source,
            })?;
        self.store(key.clone(), value.clone());
        Ok(value)
    }

    /// Drop the entry for `key`. Returns whether one was present.
    pub fn invalidate(&self, key: &V::Key) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Apply one decoded change.
    pub fn apply(&self, envelope: ChangeEnvelope<V>) {
        let key = envelope.data.key();
        info!(
            table = %envelope.table,
            action = %envelope.action,
            ?key,
            "received cache invalidation"
        );

        match envelope.action {
            ChangeAction::Insert | ChangeAction::Update => self.store(key, envelope.data),
            ChangeAction::Delete => {
                let _ = self.invalidate(&key);
            }
            ChangeAction::Unknown(action) => {
                info!(%action, ?key, "ignoring change with unknown action");
            }
        }
    }

    /// Decode and apply a raw notification payload.
    pub fn apply_payload(&self, payload: &[u8]) -> Result<()> {
        let envelope: ChangeEnvelope<V> = serde_json::from_slice(payload)?;
        self.apply(envelope);
        Ok(())
    }

    /// Apply every change received on `subscription` until `cancel` fires.
    ///
    /// Malformed payloads are logged and skipped. The subscription is
    /// withdrawn on return.
    pub async fn listen(&self, mut subscription: Subscription, cancel: CancellationToken) {
        info!(channel = subscription.channel(), "cache following channel");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(channel = subscription.channel(), "cache listener stopped");
                    break;
                }
                payload = subscription.recv() => {
                    let Some(payload) = payload else {
                        warn!(channel = subscription.channel(), "cache subscription closed");
                        break;
                    };
                    if let Err(e) = self.apply_payload(&payload) {
                        warn!(
                            error = %e,
                            payload = %String::from_utf8_lossy(&payload),
                            "dropping change notification"
                        );
                    }
                }
            }
        }
        subscription.unlisten();
    }

    fn store(&self, key: V::Key, value: V) {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        let _ = self
            .entries
            .write()
            .insert(key, Entry { value, expires_at });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use assert_matches::assert_matches;
    use serde::Deserialize;

    use super::*;
    use crate::errors::BoxError;

    #[derive(Clone, Debug, PartialEq, Deserialize)]
    struct Item {
        id: u32,
        #[serde(default)]
        name: String,
    }

    impl Keyer for Item {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Loader<Item> for CountingLoader {
        async fn load(&self, key: &u32) -> std::result::Result<Item, BoxError> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            if *key == 0 {
                return Err("not found".into());
            }
            Ok(Item {
                id: *key,
                name: format!("loaded-{key}"),
            })
        }
    }

    fn cache(ttl: Option<Duration>) -> (Cache<Item, CountingLoader>, Arc<AtomicUsize>) {
        let loader = CountingLoader::default();
        let calls = loader.calls.clone();
        (Cache::new(loader, ttl), calls)
    }

    #[tokio::test]
    async fn miss_loads_then_hits() {
        let (cache, calls) = cache(None);
        assert_eq!(cache.get(&7).await.unwrap().name, "loaded-7");
        assert_eq!(cache.get(&7).await.unwrap().name, "loaded-7");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn load_failure_is_not_cached() {
        let (cache, calls) = cache(None);
        assert_matches!(cache.get(&0).await, Err(CacheError::Load { key, .. }) if key == "0");
        assert!(cache.is_empty());
        let _ = cache.get(&0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let (cache, calls) = cache(Some(Duration::from_secs(60)));
        let _ = cache.get(&1).await.unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        let _ = cache.get(&1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let _ = cache.get(&1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_without_ttl_never_expire() {
        let (cache, calls) = cache(None);
        let _ = cache.get(&1).await.unwrap();
        tokio::time::advance(Duration::from_secs(86_400)).await;
        let _ = cache.get(&1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn insert_populates_without_loading() {
        let (cache, calls) = cache(None);
        cache
            .apply_payload(br#"{"table":"items","action":"INSERT","data":{"id":3,"name":"fresh"}}"#)
            .unwrap();
        assert_eq!(cache.get(&3).await.unwrap().name, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_action_is_ignored() {
        let (cache, _calls) = cache(None);
        cache
            .apply_payload(br#"{"action":"TRUNCATE","data":{"id":3,"name":"x"}}"#)
            .unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let (cache, _calls) = cache(None);
        assert_matches!(cache.apply_payload(b"not json"), Err(CacheError::Decode(_)));
        assert_matches!(
            cache.apply_payload(br#"{"action":"UPDATE","data":{"name":"no id"}}"#),
            Err(CacheError::Decode(_))
        );
    }

    #[tokio::test]
    async fn invalidate_reports_presence() {
        let (cache, _calls) = cache(None);
        let _ = cache.get(&4).await.unwrap();
        assert!(cache.invalidate(&4));
        assert!(!cache.invalidate(&4));
    }
}
