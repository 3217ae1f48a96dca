//! Time-boxed cache for expensive, slowly changing results.
//!
//! Holds a single value (the storage capacity snapshot) that is replaced
//! wholesale on every successful fetch and expires purely by elapsed time.

use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::debug;

/// TTL used when the configured one is zero.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) < self.ttl
    }
}

/// Single-slot cache with time based expiry.
///
/// Values are cloned out on read; store an `Arc` for large values.
#[derive(Debug)]
pub struct TtlCache<T> {
    entry: RwLock<Option<CacheEntry<T>>>,
    last_success: RwLock<Option<SystemTime>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    /// Create an empty cache. A zero `ttl` falls back to [`DEFAULT_CACHE_TTL`].
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_CACHE_TTL } else { ttl };
        Self {
            entry: RwLock::new(None),
            last_success: RwLock::new(None),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Interval of the background sweep.
    pub fn sweep_interval(&self) -> Duration {
        self.ttl.saturating_mul(2)
    }

    /// Cached value if present and not expired.
    pub fn get(&self) -> Option<T> {
        let entry = self.entry.read().unwrap_or_else(|p| p.into_inner());
        entry
            .as_ref()
            .filter(|e| e.is_fresh(Instant::now()))
            .map(|e| e.value.clone())
    }

    /// Replace the cached value and record a successful collection.
    pub fn set(&self, value: T) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl: self.ttl,
        };
        *self.entry.write().unwrap_or_else(|p| p.into_inner()) = Some(entry);
        *self.last_success.write().unwrap_or_else(|p| p.into_inner()) = Some(SystemTime::now());
    }

    /// Drop the cached value regardless of age.
    ///
    /// The last-success timestamp is kept; it describes the exporter's
    /// history, not the cache contents.
    pub fn flush(&self) {
        self.entry.write().unwrap_or_else(|p| p.into_inner()).take();
    }

    /// Time of the last [`TtlCache::set`].
    pub fn last_success(&self) -> Option<SystemTime> {
        *self.last_success.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Remove the entry if it has expired. Returns whether one was removed.
    pub fn purge_expired(&self) -> bool {
        let mut entry = self.entry.write().unwrap_or_else(|p| p.into_inner());
        match entry.as_ref() {
            Some(e) if !e.is_fresh(Instant::now()) => {
                entry.take();
                true
            }
            _ => false,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> TtlCache<T> {
    /// Periodically purge expired entries every [`TtlCache::sweep_interval`].
    ///
    /// The task only holds a weak reference and exits once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                if cache.purge_expired() {
                    debug!("Purged expired cache entry");
                }
            }
        })
    }
}
