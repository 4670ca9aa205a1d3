//! Process-wide cache of resolved remote-read app-label filters.
//!
//! Keyed by the verbatim filter text. Entries expire lazily: a stale entry is
//! ignored on lookup and overwritten by the next insert, never swept in the
//! background. Inserting past capacity evicts the least recently used entry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    filter: String,
    inserted_at: Instant,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

pub struct PrometheusSubqueryCache {
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner>,
    stats: CacheStats,
}

impl PrometheusSubqueryCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self::with_clock(ttl, capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            clock,
            inner: Mutex::new(CacheInner::default()),
            stats: CacheStats::default(),
        }
    }

    /// Returns the cached filter when it is younger than the TTL.
    pub fn get_fresh(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();

        let fresh = inner.entries.get_mut(key).and_then(|entry| {
            if now.saturating_duration_since(entry.inserted_at) < self.ttl {
                entry.last_used = tick;
                Some(entry.filter.clone())
            } else {
                None
            }
        });

        let counter = if fresh.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        fresh
    }

    pub fn insert(&self, key: impl Into<String>, filter: impl Into<String>) {
        let key = key.into();
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let lru = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(lru) = lru {
                inner.entries.remove(&lru);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                filter: filter.into(),
                inserted_at: now,
                last_used: tick,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Hand-advanced clock for deterministic expiry.
#[cfg(test)]
pub(crate) struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_go_stale_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = PrometheusSubqueryCache::with_clock(Duration::from_secs(60), 10, clock.clone());

        cache.insert("tag.job = 'api'", "app_label_value_id_1 IN (3)");
        clock.advance(Duration::from_secs(59));
        assert_eq!(
            cache.get_fresh("tag.job = 'api'").as_deref(),
            Some("app_label_value_id_1 IN (3)")
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get_fresh("tag.job = 'api'"), None);
        // Lazy expiry keeps the stale entry until it is overwritten.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = PrometheusSubqueryCache::new(Duration::from_secs(60), 2);
        cache.insert("a", "1");
        cache.insert("b", "2");
        assert!(cache.get_fresh("a").is_some());

        cache.insert("c", "3");
        assert_eq!(cache.len(), 2);
        assert!(cache.get_fresh("b").is_none());
        assert!(cache.get_fresh("a").is_some());
        assert!(cache.get_fresh("c").is_some());
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn overwriting_refreshes_timestamp() {
        let clock = Arc::new(ManualClock::new());
        let cache = PrometheusSubqueryCache::with_clock(Duration::from_secs(10), 1, clock.clone());
        cache.insert("k", "old");
        clock.advance(Duration::from_secs(30));
        cache.insert("k", "new");
        assert_eq!(cache.get_fresh("k").as_deref(), Some("new"));
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn shared_across_threads() {
        let cache = Arc::new(PrometheusSubqueryCache::new(Duration::from_secs(60), 1000));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.insert(format!("{worker}-{i}"), "1!=1");
                        assert!(cache.get_fresh(&format!("{worker}-{i}")).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 200);
    }
}
