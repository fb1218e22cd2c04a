//! Service resolution: cache, filters, strategy, retries, deadline

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::cache::{CachedEntry, ResolutionCache};
use super::filter::{apply_filters, passes_all, InstanceFilter};
use super::load_balancer::{BalanceStrategy, LoadBalancer};
use crate::discovery::{Registry, ServiceInstance};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub default_strategy: String,
    /// Deadline of a whole resolve, retries included
    pub timeout: Duration,
    pub retries: u32,
    /// Fixed delay, or the first delay of an exponential backoff
    pub retry_delay: Duration,
    pub retry_max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::from(&meridian_core::ResolverConfig::default())
    }
}

impl From<&meridian_core::ResolverConfig> for ResolverConfig {
    fn from(config: &meridian_core::ResolverConfig) -> Self {
        Self {
            default_strategy: config.default_strategy.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            retries: config.retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
            backoff: if config.backoff == "fixed" {
                Backoff::Fixed
            } else {
                Backoff::Exponential
            },
        }
    }
}

/// Per-call resolution options
///
/// Unset fields fall back to the resolver's configuration. The cache is
/// used unless turned off with [`ResolveOptions::without_cache`].
#[derive(Clone)]
pub struct ResolveOptions {
    pub strategy: Option<String>,
    pub filters: Vec<Arc<dyn InstanceFilter>>,
    pub timeout: Option<Duration>,
    pub use_cache: bool,
    pub retries: Option<u32>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            strategy: None,
            filters: Vec::new(),
            timeout: None,
            use_cache: true,
            retries: None,
        }
    }
}

impl ResolveOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl InstanceFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    #[must_use]
    pub const fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

pub struct Resolver {
    registry: Arc<Registry>,
    balancer: Arc<LoadBalancer>,
    cache: Option<Arc<ResolutionCache>>,
    config: ResolverConfig,
}

impl Resolver {
    #[must_use]
    pub const fn new(
        registry: Arc<Registry>,
        balancer: Arc<LoadBalancer>,
        cache: Option<Arc<ResolutionCache>>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            registry,
            balancer,
            cache,
            config,
        }
    }

    #[must_use]
    pub const fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    #[must_use]
    pub const fn cache(&self) -> Option<&Arc<ResolutionCache>> {
        self.cache.as_ref()
    }

    /// Resolve `service` to one instance
    ///
    /// Only `NoAvailableInstances` is retried. Exceeding the deadline
    /// returns `Timeout` and abandons any pending retry wait.
    pub async fn resolve(&self, service: &str, options: &ResolveOptions) -> Result<ServiceInstance> {
        let strategy_name = options
            .strategy
            .as_deref()
            .unwrap_or(&self.config.default_strategy);
        let strategy = self.balancer.strategy(strategy_name)?;
        let deadline = options.timeout.unwrap_or(self.config.timeout);

        match tokio::time::timeout(deadline, self.resolve_with_retry(service, strategy.as_ref(), options)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(service = %service, timeout = ?deadline, "Resolve timed out");
                Err(Error::Timeout(format!(
                    "resolving {service} exceeded {}ms",
                    deadline.as_millis()
                )))
            }
        }
    }

    fn retry_delays(&self, retries: u32) -> Vec<Duration> {
        let retries = retries as usize;
        match self.config.backoff {
            Backoff::Fixed => ConstantBuilder::default()
                .with_delay(self.config.retry_delay)
                .with_max_times(retries)
                .build()
                .collect(),
            Backoff::Exponential => ExponentialBuilder::default()
                .with_min_delay(self.config.retry_delay)
                .with_max_delay(self.config.retry_max_delay)
                .with_max_times(retries)
                .with_jitter()
                .build()
                .collect(),
        }
    }

    async fn resolve_with_retry(
        &self,
        service: &str,
        strategy: &dyn BalanceStrategy,
        options: &ResolveOptions,
    ) -> Result<ServiceInstance> {
        let delays = self.retry_delays(options.retries.unwrap_or(self.config.retries));

        let mut last_err = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(delays).enumerate() {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            match self.resolve_once(service, strategy, options) {
                Ok(instance) => return Ok(instance),
                Err(e) if e.is_retryable() => {
                    debug!(service = %service, attempt, error = %e, "Resolve attempt found no instances");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::NoAvailableInstances(service.to_string())))
    }

    fn resolve_once(
        &self,
        service: &str,
        strategy: &dyn BalanceStrategy,
        options: &ResolveOptions,
    ) -> Result<ServiceInstance> {
        let cache = self.cache.as_ref().filter(|_| options.use_cache);

        if let Some(cache) = cache {
            let revision = self.registry.revision(service);
            match cache.get(service, strategy.name(), revision) {
                Some(CachedEntry::Selected(instance)) if passes_all(&options.filters, &instance) => {
                    return Ok(instance);
                }
                Some(CachedEntry::Candidates(candidates)) => {
                    let filtered = apply_filters(candidates.to_vec(), &options.filters);
                    if !filtered.is_empty() {
                        return strategy.select(&filtered);
                    }
                }
                _ => {}
            }
        }

        // Snapshot the revision first so the entry is never newer than the list
        let revision = self.registry.revision(service);
        let live = self.registry.list(service, false);
        let candidates = apply_filters(live.clone(), &options.filters);
        if candidates.is_empty() {
            return Err(Error::NoAvailableInstances(service.to_string()));
        }

        let selected = strategy.select(&candidates)?;

        if let Some(cache) = cache {
            if !strategy.is_sticky() {
                cache.insert(service, strategy.name(), revision, CachedEntry::Candidates(Arc::new(live)));
            } else if options.filters.is_empty() {
                cache.insert(service, strategy.name(), revision, CachedEntry::Selected(selected.clone()));
            }
        }

        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{RegistryConfig, ServiceStatus};
    use crate::health::NoopProber;
    use crate::resolve::cache::CacheConfig;
    use crate::resolve::filter::TagFilter;
    use crate::store::MemoryStore;

    fn setup(config: ResolverConfig) -> (Arc<Registry>, Resolver) {
        let registry = Registry::new(
            RegistryConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopProber),
        );
        let cache = Arc::new(ResolutionCache::new(&CacheConfig::default()));
        let resolver = Resolver::new(registry.clone(), Arc::new(LoadBalancer::new()), Some(cache), config);
        (registry, resolver)
    }

    fn fixed(retries: u32, delay_ms: u64) -> ResolverConfig {
        ResolverConfig {
            default_strategy: "round_robin".to_string(),
            timeout: Duration::from_secs(5),
            retries,
            retry_delay: Duration::from_millis(delay_ms),
            retry_max_delay: Duration::from_millis(delay_ms),
            backoff: Backoff::Fixed,
        }
    }

    fn exponential(retries: u32, delay_ms: u64, max_delay_ms: u64) -> ResolverConfig {
        ResolverConfig {
            retry_max_delay: Duration::from_millis(max_delay_ms),
            backoff: Backoff::Exponential,
            ..fixed(retries, delay_ms)
        }
    }

    async fn register(registry: &Registry, id: &str) {
        registry
            .register(ServiceInstance::new(id, "api", format!("{id}:80")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_round_robin_through_cache() {
        let (registry, resolver) = setup(fixed(0, 10));
        for id in ["c", "a", "b"] {
            register(&registry, id).await;
        }

        let options = ResolveOptions::new();
        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(resolver.resolve("api", &options).await.unwrap().id);
        }
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
        assert_eq!(resolver.cache().unwrap().stats().hits, 3);
    }

    #[tokio::test]
    async fn test_filters_apply_on_cache_hit() {
        let (registry, resolver) = setup(fixed(0, 10));
        register(&registry, "a").await;
        registry
            .register(ServiceInstance::new("b", "api", "b:80").with_tag("canary"))
            .await
            .unwrap();

        resolver.resolve("api", &ResolveOptions::new()).await.unwrap();

        let canary = ResolveOptions::new().with_filter(TagFilter::new(["canary"]));
        for _ in 0..3 {
            assert_eq!(resolver.resolve("api", &canary).await.unwrap().id, "b");
        }

        let nothing = ResolveOptions::new().with_filter(TagFilter::new(["gpu"]));
        let err = resolver.resolve("api", &nothing).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableInstances(_)));
    }

    #[tokio::test]
    async fn test_sticky_strategy_caches_selection() {
        let (registry, resolver) = setup(fixed(0, 10));
        register(&registry, "b").await;
        register(&registry, "a").await;

        let options = ResolveOptions::new().with_strategy("first");
        assert_eq!(resolver.resolve("api", &options).await.unwrap().id, "a");
        assert_eq!(resolver.resolve("api", &options).await.unwrap().id, "a");
        assert_eq!(resolver.cache().unwrap().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_deregister_makes_cached_entry_unusable() {
        let (registry, resolver) = setup(fixed(0, 10));
        register(&registry, "a").await;

        let options = ResolveOptions::new().with_strategy("first");
        resolver.resolve("api", &options).await.unwrap();
        registry.deregister("a").await.unwrap();

        // no invalidator is running; the revision alone turns the hit into a miss
        let err = resolver.resolve("api", &options).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableInstances(_)));
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_not_retried() {
        let (registry, resolver) = setup(fixed(50, 1_000));
        register(&registry, "a").await;

        let options = ResolveOptions::new().with_strategy("least_conn");
        let started = tokio::time::Instant::now();
        let err = resolver.resolve("api", &options).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_picks_up_late_instance() {
        let (registry, resolver) = setup(fixed(5, 50));
        let options = ResolveOptions::new().without_cache();

        let (resolved, ()) = tokio::join!(resolver.resolve("api", &options), async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            register(&registry, "late").await;
        });
        assert_eq!(resolved.unwrap().id, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let (_registry, resolver) = setup(fixed(2, 50));
        let err = resolver.resolve("api", &ResolveOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableInstances(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_retry_wait() {
        let (_registry, resolver) = setup(fixed(100, 50));
        let options = ResolveOptions::new().with_timeout(Duration::from_millis(120));

        let err = resolver.resolve("api", &options).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_starting_instances_are_resolvable() {
        let (registry, resolver) = setup(fixed(0, 10));
        register(&registry, "a").await;
        assert_eq!(registry.get("a").unwrap().status, ServiceStatus::Starting);

        // Starting counts as resolvable
        let options = ResolveOptions::new().without_cache();
        assert_eq!(resolver.resolve("api", &options).await.unwrap().id, "a");
    }

    #[test]
    fn test_retry_delays() {
        let (_registry, resolver) = setup(fixed(3, 25));
        assert_eq!(resolver.retry_delays(3), vec![Duration::from_millis(25); 3]);
        assert!(resolver.retry_delays(0).is_empty());
    }

    #[test]
    fn test_exponential_retry_delays_stay_bounded() {
        let (_registry, resolver) = setup(exponential(6, 20, 100));
        let delays = resolver.retry_delays(6);

        assert_eq!(delays.len(), 6);
        for delay in &delays {
            assert!(*delay >= Duration::from_millis(20), "{delay:?} below the first delay");
            // jitter adds at most one more delay on top of the cap
            assert!(*delay <= Duration::from_millis(200), "{delay:?} above the cap");
        }
        assert!(resolver.retry_delays(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_retry_picks_up_late_instance() {
        let (registry, resolver) = setup(exponential(8, 20, 80));
        let options = ResolveOptions::new().without_cache();

        let (resolved, ()) = tokio::join!(resolver.resolve("api", &options), async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            register(&registry, "late").await;
        });
        assert_eq!(resolved.unwrap().id, "late");
    }

    #[test]
    fn test_config_conversion() {
        let mut core = meridian_core::ResolverConfig::default();
        core.backoff = "fixed".to_string();
        core.retries = 4;
        let config = ResolverConfig::from(&core);
        assert_eq!(config.backoff, Backoff::Fixed);
        assert_eq!(config.retries, 4);
        assert_eq!(config.timeout, Duration::from_millis(core.timeout_ms));
    }
}
