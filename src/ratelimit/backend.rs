//! Window counting strategies over a [`CounterStore`].
//!
//! Real stores differ in what they can do atomically, so the limiter talks
//! to a [`CountingBackend`] and the deployment picks the strategy that
//! matches its store:
//!
//! - [`AtomicCounting`] relies on a server-side atomic increment and sets the
//!   TTL in a second call when the increment created the key. A crash between
//!   the two calls leaves a key without expiry; that race is accepted.
//! - [`GetSetCounting`] reads, adds one, and writes back. The first writer of
//!   a window attaches the TTL in the same write. Concurrent first writers can
//!   both observe an absent key and under-count; no locking is added.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::store::{CounterStore, StoreError, StoreResult};
use crate::config::StoreKind;

/// Delimiter between counter key segments.
pub const KEY_DELIMITER: &str = ":";

/// Build a window counter key from its segments, skipping absent ones.
pub fn window_key(
    key_prefix: &str,
    count_prefix: Option<&str>,
    bucket: Option<&str>,
    identity: &str,
) -> String {
    [Some(key_prefix), count_prefix, bucket, Some(identity)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(KEY_DELIMITER)
}

/// Stored in place of a quota when the resolver had none for an identity.
const UNRESOLVED_QUOTA: i64 = -1;

/// A quota lookup remembered in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedQuota {
    Limit(u64),
    /// The resolver had no quota for the identity
    Unresolved,
}

impl From<Option<u64>> for CachedQuota {
    fn from(quota: Option<u64>) -> Self {
        quota.map_or(CachedQuota::Unresolved, CachedQuota::Limit)
    }
}

/// Build a cached quota key.
pub fn quota_key(limit_prefix: &str, identity: &str) -> String {
    [limit_prefix, identity].join(KEY_DELIMITER)
}

/// Counter operations used by the limiter.
#[async_trait]
pub trait CountingBackend: Send + Sync {
    /// Increment the window counter at `key` and return the new count.
    /// A freshly created counter expires after `window`.
    async fn increment(&self, key: &str, window: Duration) -> StoreResult<u64>;

    /// Read a previously cached quota lookup.
    async fn cached_quota(&self, key: &str) -> StoreResult<Option<CachedQuota>>;

    /// Cache a quota lookup for `ttl`.
    async fn cache_quota(&self, key: &str, quota: CachedQuota, ttl: Duration) -> StoreResult<()>;
}

/// Build the backend for a store kind.
pub fn counting_backend<S>(kind: StoreKind, store: S) -> Arc<dyn CountingBackend>
where
    S: CounterStore + 'static,
{
    match kind {
        StoreKind::Atomic => Arc::new(AtomicCounting::new(store)),
        StoreKind::GetThenSet => Arc::new(GetSetCounting::new(store)),
    }
}

async fn read_quota<S: CounterStore>(store: &S, key: &str) -> StoreResult<Option<CachedQuota>> {
    match store.get(key).await? {
        None => Ok(None),
        Some(UNRESOLVED_QUOTA) => Ok(Some(CachedQuota::Unresolved)),
        Some(value) => u64::try_from(value)
            .map(|quota| Some(CachedQuota::Limit(quota)))
            .map_err(|_| StoreError::Malformed {
                key: key.to_string(),
                value: value.to_string(),
            }),
    }
}

async fn write_quota<S: CounterStore>(
    store: &S,
    key: &str,
    quota: CachedQuota,
    ttl: Duration,
) -> StoreResult<()> {
    let value = match quota {
        CachedQuota::Limit(quota) => i64::try_from(quota).unwrap_or(i64::MAX),
        CachedQuota::Unresolved => UNRESOLVED_QUOTA,
    };
    store.set(key, value, Some(ttl)).await
}

/// Counting on stores with an atomic increment.
#[derive(Debug)]
pub struct AtomicCounting<S> {
    store: S,
}

impl<S: CounterStore> AtomicCounting<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: CounterStore> CountingBackend for AtomicCounting<S> {
    async fn increment(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let count = self.store.incr(key).await?;
        if count == 1 {
            trace!(key = %key, ttl_secs = window.as_secs(), "Setting expiry on new counter");
            self.store.expire(key, window).await?;
        }
        Ok(count)
    }

    async fn cached_quota(&self, key: &str) -> StoreResult<Option<CachedQuota>> {
        read_quota(&self.store, key).await
    }

    async fn cache_quota(&self, key: &str, quota: CachedQuota, ttl: Duration) -> StoreResult<()> {
        write_quota(&self.store, key, quota, ttl).await
    }
}

/// Counting on stores that can only read and write.
#[derive(Debug)]
pub struct GetSetCounting<S> {
    store: S,
}

impl<S: CounterStore> GetSetCounting<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: CounterStore> CountingBackend for GetSetCounting<S> {
    async fn increment(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let current = self.store.get(key).await?;
        let count = match current {
            None => {
                self.store.set(key, 1, Some(window)).await?;
                1
            }
            Some(value) => {
                let next = value.saturating_add(1);
                // The key may have expired since the read; never leave it persistent.
                let ttl = match self.store.ttl(key).await? {
                    Some(_) => None,
                    None => Some(window),
                };
                self.store.set(key, next, ttl).await?;
                next
            }
        };
        u64::try_from(count).map_err(|_| StoreError::Malformed {
            key: key.to_string(),
            value: count.to_string(),
        })
    }

    async fn cached_quota(&self, key: &str) -> StoreResult<Option<CachedQuota>> {
        read_quota(&self.store, key).await
    }

    async fn cache_quota(&self, key: &str, quota: CachedQuota, ttl: Duration) -> StoreResult<()> {
        write_quota(&self.store, key, quota, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::store::MemoryStore;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_window_key() {
        assert_eq!(window_key("ratelimit", None, None, "127.0.0.1"), "ratelimit:127.0.0.1");
        assert_eq!(
            window_key("ratelimit", Some("api"), Some("2024030709"), "api_key:123"),
            "ratelimit:api:2024030709:api_key:123"
        );
        assert_eq!(quota_key("ratelimit:limit", "123"), "ratelimit:limit:123");
    }

    #[tokio::test]
    async fn test_atomic_counting_sets_ttl_on_first_increment() {
        let backend = AtomicCounting::new(MemoryStore::new());

        assert_eq!(backend.increment("k", HOUR).await.unwrap(), 1);
        let ttl = backend.store().ttl("k").await.unwrap().unwrap();
        assert!(ttl <= HOUR && ttl > Duration::from_secs(3590));

        assert_eq!(backend.increment("k", HOUR).await.unwrap(), 2);
        assert_eq!(backend.increment("k", HOUR).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_atomic_counting_concurrent_increments_are_distinct() {
        let backend = Arc::new(AtomicCounting::new(MemoryStore::new()));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let backend = backend.clone();
                tokio::spawn(async move { backend.increment("k", HOUR).await.unwrap() })
            })
            .collect();

        let mut counts = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect::<Vec<_>>();
        counts.sort_unstable();
        assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_get_set_counting() {
        let backend = GetSetCounting::new(MemoryStore::new());

        assert_eq!(backend.increment("k", HOUR).await.unwrap(), 1);
        assert!(backend.store().ttl("k").await.unwrap().is_some());
        assert_eq!(backend.increment("k", HOUR).await.unwrap(), 2);
        assert!(backend.store().ttl("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_set_counting_restores_ttl_on_persistent_counter() {
        let store = Arc::new(MemoryStore::new());
        store.set("k", 4, None).await.unwrap();

        let backend = GetSetCounting::new(store.clone());
        assert_eq!(backend.increment("k", HOUR).await.unwrap(), 5);
        let ttl = store.ttl("k").await.unwrap().unwrap();
        assert!(ttl <= HOUR && ttl > Duration::from_secs(3590));
    }

    #[tokio::test]
    async fn test_malformed_counter_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_raw("k", "garbage");

        let atomic = AtomicCounting::new(store.clone());
        assert!(atomic.increment("k", HOUR).await.is_err());

        let get_set = GetSetCounting::new(store);
        assert!(get_set.increment("k", HOUR).await.is_err());
    }

    #[tokio::test]
    async fn test_quota_cache() {
        let backend = counting_backend(StoreKind::Atomic, MemoryStore::new());

        assert_eq!(backend.cached_quota("q").await.unwrap(), None);
        backend
            .cache_quota("q", CachedQuota::Limit(25), HOUR)
            .await
            .unwrap();
        assert_eq!(
            backend.cached_quota("q").await.unwrap(),
            Some(CachedQuota::Limit(25))
        );

        backend
            .cache_quota("none", CachedQuota::Unresolved, HOUR)
            .await
            .unwrap();
        assert_eq!(
            backend.cached_quota("none").await.unwrap(),
            Some(CachedQuota::Unresolved)
        );
    }

    #[tokio::test]
    async fn test_unresolved_quota_expires_with_ttl() {
        let backend = AtomicCounting::new(MemoryStore::new());
        backend
            .cache_quota("q", CachedQuota::Unresolved, HOUR)
            .await
            .unwrap();

        assert_eq!(backend.store().get("q").await.unwrap(), Some(UNRESOLVED_QUOTA));
        assert!(backend.store().ttl("q").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_negative_cached_quota_is_malformed() {
        let store = Arc::new(MemoryStore::new());
        store.set("q", -4, None).await.unwrap();

        let backend = GetSetCounting::new(store);
        assert!(matches!(
            backend.cached_quota("q").await,
            Err(StoreError::Malformed { .. })
        ));
    }
}
