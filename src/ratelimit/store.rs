//! Counter store contract and the in-process store.
//!
//! A [`CounterStore`] is the client handle to a shared key-value store such
//! as Redis or memcached. Every operation may block on I/O and may fail on
//! its own, so every operation returns a [`StoreResult`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::trace;

/// Writes between opportunistic sweeps of expired entries.
pub const DEFAULT_SWEEP_EVERY: u64 = 1024;

/// Errors reported by a counting store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Counting store unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed value at `{key}`: {value:?}")]
    Malformed { key: String, value: String },
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations the limiter needs from a counting store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the integer at `key`, creating it as 1.
    async fn incr(&self, key: &str) -> StoreResult<u64>;

    /// Set or refresh the TTL of `key`. No-op if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Read the integer at `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Write `value` at `key`. A `ttl` of `None` keeps the key's current TTL.
    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remaining TTL of `key`, `None` if absent or persistent.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn incr(&self, key: &str) -> StoreResult<u64> {
        (**self).incr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        (**self).expire(key, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> StoreResult<()> {
        (**self).set(key, value, ttl).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        (**self).ttl(key).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn parse_value(key: &str, value: &str) -> StoreResult<i64> {
    value.parse().map_err(|_| StoreError::Malformed {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// In-process counting store with lazy expiry.
///
/// Values are kept as strings, the way network stores keep them, so a
/// foreign non-integer value surfaces as [`StoreError::Malformed`].
/// Suitable for single-instance deployments and tests.
///
/// Expired entries are dropped on read, and swept from the whole map every
/// `sweep_every` writes so that keys of past windows do not pile up.
/// [`MemoryStore::spawn_sweeper`] adds a periodic sweep on top.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    writes: AtomicU64,
    sweep_every: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_sweep_every(DEFAULT_SWEEP_EVERY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep expired entries every `sweep_every` writes. Zero disables it.
    pub fn with_sweep_every(sweep_every: u64) -> Self {
        Self {
            entries: DashMap::new(),
            writes: AtomicU64::new(0),
            sweep_every,
        }
    }

    /// Sweep expired entries every `period` until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match store.upgrade() {
                    Some(store) => store.purge_expired(),
                    None => break,
                }
            }
        })
    }

    fn record_write(&self) {
        if self.sweep_every == 0 {
            return;
        }
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.sweep_every == 0 {
            self.purge_expired();
        }
    }

    /// Entries held in memory, including expired ones not yet swept.
    pub fn retained(&self) -> usize {
        self.entries.len()
    }

    /// Write a raw string value without TTL.
    pub fn set_raw(&self, key: &str, value: &str) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        trace!(removed = before.saturating_sub(self.entries.len()), "Swept expired entries");
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr(&self, key: &str) -> StoreResult<u64> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = Entry {
                value: "0".to_string(),
                expires_at: None,
            };
        }

        let next = parse_value(key, &entry.value)? + 1;
        let count = u64::try_from(next).map_err(|_| StoreError::Malformed {
            key: key.to_string(),
            value: entry.value.clone(),
        })?;
        entry.value = next.to_string();
        drop(entry);

        self.record_write();
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => {
                return parse_value(key, &entry.value).map(Some)
            }
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: String::new(),
            expires_at: None,
        });
        let kept = if entry.is_expired(now) {
            None
        } else {
            entry.expires_at
        };
        entry.value = value.to_string();
        entry.expires_at = match ttl {
            Some(ttl) => Some(now + ttl),
            None => kept,
        };
        drop(entry);

        self.record_write();
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|entry| {
            entry
                .expires_at
                .filter(|at| *at > now)
                .map(|at| at.duration_since(now))
        }))
    }
}
