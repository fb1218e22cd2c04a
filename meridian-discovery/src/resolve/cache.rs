//! Resolution cache
//!
//! Keyed by `(service, strategy)`. Sticky strategies cache the instance
//! they picked; the others cache the candidate list so the strategy still
//! runs on every resolve. Every entry remembers the service revision it was
//! computed at, and a lookup with a newer revision is a miss. Registry
//! events evict a service's entries eagerly; TTL bounds everything else.

use dashmap::DashMap;
use moka::sync::Cache;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::discovery::{ServiceInstance, Watcher};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&meridian_core::CacheConfig::default())
    }
}

impl From<&meridian_core::CacheConfig> for CacheConfig {
    fn from(config: &meridian_core::CacheConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.ttl_ms),
            max_capacity: config.max_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    service: String,
    strategy: String,
}

impl CacheKey {
    fn new(service: &str, strategy: &str) -> Self {
        Self {
            service: service.to_string(),
            strategy: strategy.to_string(),
        }
    }
}

/// What a cache entry holds
#[derive(Debug, Clone, PartialEq)]
pub enum CachedEntry {
    /// Instance chosen by a sticky strategy
    Selected(ServiceInstance),
    /// Live candidates before request filters, sorted by id
    Candidates(Arc<Vec<ServiceInstance>>),
}

#[derive(Debug, Clone)]
struct CachedResolution {
    revision: u64,
    entry: CachedEntry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Service-wide evictions triggered by registry events
    pub invalidations: u64,
}

pub struct ResolutionCache {
    entries: Cache<CacheKey, CachedResolution>,
    /// Strategies cached per service, for service-wide eviction
    strategies: DashMap<String, HashSet<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl ResolutionCache {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl)
            .build();

        Self {
            entries,
            strategies: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Look up an entry computed at `revision`
    pub fn get(&self, service: &str, strategy: &str, revision: u64) -> Option<CachedEntry> {
        let key = CacheKey::new(service, strategy);
        match self.entries.get(&key) {
            Some(cached) if cached.revision == revision => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(service = %service, strategy = %strategy, "Resolution cache hit");
                Some(cached.entry)
            }
            Some(cached) => {
                self.entries.invalidate(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    service = %service,
                    strategy = %strategy,
                    cached_revision = cached.revision,
                    revision,
                    "Resolution cache entry outdated"
                );
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(service = %service, strategy = %strategy, "Resolution cache miss");
                None
            }
        }
    }

    pub fn insert(&self, service: &str, strategy: &str, revision: u64, entry: CachedEntry) {
        self.entries
            .insert(CacheKey::new(service, strategy), CachedResolution { revision, entry });
        self.strategies
            .entry(service.to_string())
            .or_default()
            .insert(strategy.to_string());
    }

    /// Drop every entry of `service`, whatever the strategy
    pub fn invalidate_service(&self, service: &str) {
        let Some((_, strategies)) = self.strategies.remove(service) else {
            return;
        };
        for strategy in &strategies {
            self.entries.invalidate(&CacheKey::new(service, strategy));
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(service = %service, entries = strategies.len(), "Resolution cache invalidated");
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.strategies.clear();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Evict a service's entries whenever the registry reports a change to it
    pub fn spawn_invalidator(self: &Arc<Self>, mut watcher: Watcher, cancel_token: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel_token.cancelled() => break,
                    event = watcher.recv() => match event {
                        Some(event) => cache.invalidate_service(event.service()),
                        None => break,
                    },
                }
            }
            debug!(watcher_id = watcher.id(), "Cache invalidator stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{EventBus, EventKind, ServiceEvent};

    fn cache() -> ResolutionCache {
        ResolutionCache::new(&CacheConfig {
            ttl: Duration::from_secs(60),
            max_capacity: 100,
        })
    }

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new(id, "api", format!("{id}:80"))
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = cache();
        assert!(cache.get("api", "first", 1).is_none());

        let selected = instance("a");
        cache.insert("api", "first", 1, CachedEntry::Selected(selected.clone()));
        assert_eq!(cache.get("api", "first", 1), Some(CachedEntry::Selected(selected)));
        assert!(cache.get("api", "round_robin", 1).is_none());

        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 2,
                invalidations: 0
            }
        );
    }

    #[test]
    fn test_outdated_revision_is_a_miss() {
        let cache = cache();
        cache.insert(
            "api",
            "round_robin",
            4,
            CachedEntry::Candidates(Arc::new(vec![instance("a")])),
        );

        assert!(cache.get("api", "round_robin", 5).is_none());
        // the outdated entry is gone, even for its own revision
        assert!(cache.get("api", "round_robin", 4).is_none());
    }

    #[test]
    fn test_invalidate_service_drops_all_strategies() {
        let cache = cache();
        cache.insert("api", "first", 1, CachedEntry::Selected(instance("a")));
        cache.insert(
            "api",
            "random",
            1,
            CachedEntry::Candidates(Arc::new(vec![instance("a")])),
        );
        cache.insert("db", "first", 1, CachedEntry::Selected(instance("d")));

        cache.invalidate_service("api");
        cache.invalidate_service("missing");

        assert!(cache.get("api", "first", 1).is_none());
        assert!(cache.get("api", "random", 1).is_none());
        assert!(cache.get("db", "first", 1).is_some());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResolutionCache::new(&CacheConfig {
            ttl: Duration::from_millis(50),
            max_capacity: 100,
        });
        cache.insert("api", "first", 1, CachedEntry::Selected(instance("a")));
        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.get("api", "first", 1).is_none());
    }

    #[tokio::test]
    async fn test_invalidator_follows_events() {
        let cache = Arc::new(cache());
        let bus = EventBus::new(8);
        let cancel_token = CancellationToken::new();
        let task = cache.spawn_invalidator(bus.subscribe(None), cancel_token.clone());

        cache.insert("api", "first", 1, CachedEntry::Selected(instance("a")));
        bus.publish(&ServiceEvent::new(EventKind::Deregistered, instance("a")));

        for _ in 0..100 {
            if cache.stats().invalidations == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.stats().invalidations, 1);
        assert!(cache.get("api", "first", 1).is_none());

        cancel_token.cancel();
        task.await.unwrap();
    }
}
