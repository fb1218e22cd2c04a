//! Engine wiring and lifecycle

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use meridian_core::{Config, StaticInstanceConfig};
use meridian_discovery::{
    build_prober, CacheConfig, Error, InstanceStore, LoadBalancer, MemoryStore, RedisStore, Registry, RegistryConfig,
    ResolutionCache, Resolver, ResolverConfig, ServiceInstance, Watcher,
};

/// Generate an instance id for a static instance configured without one
fn generate_instance_id(service: &str) -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{service}-{hostname}-{}", nanoid::nanoid!(6))
}

fn static_instance(config: &StaticInstanceConfig) -> ServiceInstance {
    let id = if config.id.is_empty() {
        generate_instance_id(&config.name)
    } else {
        config.id.clone()
    };

    let mut instance = ServiceInstance::new(id, config.name.clone(), config.endpoint.clone())
        .with_version(config.version.clone());
    if let Some(weight) = config.weight {
        instance = instance.with_weight(weight);
    }
    for tag in &config.tags {
        instance = instance.with_tag(tag.clone());
    }
    for (key, value) in &config.metadata {
        instance = instance.with_metadata(key.clone(), value.clone());
    }
    instance
}

fn build_store(config: &Config) -> Result<Arc<dyn InstanceStore>> {
    match config.store.backend.as_str() {
        "redis" => {
            let url = config
                .store
                .redis_url
                .as_deref()
                .context("store.redis_url is required for the redis backend")?;
            info!(key_prefix = %config.store.key_prefix, "Using Redis instance store");
            Ok(Arc::new(RedisStore::new(url, config.store.key_prefix.clone())?))
        }
        _ => {
            info!("Using in-memory instance store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// A running discovery engine
pub struct Daemon {
    config: Config,
    registry: Arc<Registry>,
    resolver: Arc<Resolver>,
    cache: Arc<ResolutionCache>,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        let store = build_store(&config)?;
        let prober = build_prober(&config.health)?;
        info!(probe = prober.name(), "Health prober configured");

        let registry = Registry::new(RegistryConfig::from(&config), store, prober);
        let cache = Arc::new(ResolutionCache::new(&CacheConfig::from(&config.cache)));
        let resolver = Arc::new(Resolver::new(
            registry.clone(),
            Arc::new(LoadBalancer::new()),
            Some(cache.clone()),
            ResolverConfig::from(&config.resolver),
        ));

        Ok(Self {
            config,
            registry,
            resolver,
            cache,
            cancel_token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub const fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Load persisted instances into the registry
    pub async fn load(&self) -> Result<usize> {
        let loaded = self.registry.bootstrap().await?;
        Ok(loaded)
    }

    /// Bootstrap, start background work and register static instances
    pub async fn start(&mut self) -> Result<()> {
        let loaded = self.load().await?;
        info!(loaded, "Loaded persisted instances");

        self.registry.start()?;

        let invalidator = self
            .cache
            .spawn_invalidator(self.registry.watch(None), self.cancel_token.clone());
        self.tasks.push(invalidator);
        self.tasks
            .push(spawn_event_logger(self.registry.watch(None), self.cancel_token.clone()));

        let mut owned = Vec::with_capacity(self.config.instances.len());
        for config in &self.config.instances {
            let instance = static_instance(config);
            match self.registry.register(instance.clone()).await {
                Ok(_) => {}
                // Loaded from the store by bootstrap; keep it alive as ours
                Err(Error::AlreadyExists(_)) => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to register static instance {}", instance.id));
                }
            }
            owned.push(instance);
        }

        if !owned.is_empty() {
            let period = (self.registry.config().heartbeat_timeout / 3).max(Duration::from_secs(1));
            self.tasks.push(spawn_heartbeats(
                self.registry.clone(),
                owned,
                period,
                self.cancel_token.clone(),
            ));
        }

        info!(
            services = ?self.registry.services(),
            instances = self.registry.len(),
            "Discovery engine started"
        );
        Ok(())
    }

    pub async fn shutdown(self) {
        info!("Stopping discovery engine");
        self.cancel_token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed");
            }
        }
        self.registry.shutdown().await;

        let stats = self.cache.stats();
        info!(
            cache_hits = stats.hits,
            cache_misses = stats.misses,
            cache_invalidations = stats.invalidations,
            dropped_events = self.registry.dropped_events(),
            "Discovery engine stopped"
        );
    }
}

fn spawn_event_logger(mut watcher: Watcher, cancel_token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                event = watcher.recv() => {
                    let Some(event) = event else { break };
                    info!(
                        kind = %event.kind,
                        instance_id = %event.instance.id,
                        service = %event.instance.name,
                        status = %event.instance.status,
                        previous_status = ?event.previous_status,
                        "Registry event"
                    );
                }
            }
        }
    })
}

/// Keep the daemon's own instances alive, re-registering any that expired
fn spawn_heartbeats(
    registry: Arc<Registry>,
    instances: Vec<ServiceInstance>,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for instance in &instances {
                match registry.heartbeat(&instance.id) {
                    Ok(()) => {}
                    Err(Error::NotFound(_)) => {
                        warn!(instance_id = %instance.id, "Static instance missing, registering again");
                        if let Err(e) = registry.register(instance.clone()).await {
                            error!(instance_id = %instance.id, error = %e, "Failed to re-register static instance");
                        }
                    }
                    Err(e) => warn!(instance_id = %instance.id, error = %e, "Heartbeat failed"),
                }
            }
        }
    })
}
