//! Turning a service name into one instance

pub mod cache;
pub mod filter;
pub mod load_balancer;
pub mod resolver;

pub use cache::{CacheConfig, CacheStats, CachedEntry, ResolutionCache};
pub use filter::{apply_filters, InstanceFilter, MetadataFilter, TagFilter, VersionFilter};
pub use load_balancer::{BalanceStrategy, First, LoadBalancer, Random, RoundRobin, WeightedRandom};
pub use resolver::{Backoff, ResolveOptions, Resolver, ResolverConfig};
