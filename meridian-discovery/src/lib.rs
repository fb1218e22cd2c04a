//! Service discovery and resolution engine
//!
//! A [`Registry`] holds the live instances of every service, supervises
//! them with active health probes and evicts those whose heartbeats stop.
//! A [`Resolver`] turns a service name into one instance through filters,
//! a load balancing strategy and a revision-checked cache.

pub mod discovery;
pub mod error;
pub mod health;
pub mod resolve;
pub mod store;

pub use discovery::{EventKind, Registry, RegistryConfig, ServiceEvent, ServiceInstance, ServiceStatus, Watcher};
pub use error::{Error, Result};
pub use health::{build_prober, HealthCheckConfig, HttpProber, NoopProber, Prober, TcpProber};
pub use resolve::{
    CacheConfig, CacheStats, InstanceFilter, LoadBalancer, MetadataFilter, ResolutionCache, ResolveOptions, Resolver,
    ResolverConfig, TagFilter, VersionFilter,
};
pub use store::{InstanceStore, MemoryStore, RedisStore};
