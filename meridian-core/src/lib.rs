//! Shared configuration and logging for the meridian discovery engine

pub mod config;
pub mod logging;

pub use config::{
    CacheConfig, Config, DiscoveryConfig, HealthConfig, LoggingConfig, ResolverConfig,
    StaticInstanceConfig, StoreConfig,
};
