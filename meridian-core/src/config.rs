use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Strategy names understood by the resolver out of the box
pub const BUILTIN_STRATEGIES: &[&str] = &["round_robin", "weighted_random", "random", "first"];

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub health: HealthConfig,
    pub cache: CacheConfig,
    pub resolver: ResolverConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
    /// Instances registered (and kept alive) by the daemon at startup
    pub instances: Vec<StaticInstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Instances silent for longer than this are evicted by the sweep
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-watcher queue length; overflowing events are dropped and counted
    pub event_queue_capacity: usize,
    /// Treat a passing probe as a heartbeat
    pub probe_refreshes_heartbeat: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 90,
            sweep_interval_secs: 15,
            event_queue_capacity: 1024,
            probe_refreshes_heartbeat: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// "http", "tcp" or "none"
    pub probe: String,
    /// Path appended to the endpoint by the HTTP prober
    pub http_path: String,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe: "http".to_string(),
            http_path: "/health".to_string(),
            probe_interval_ms: 10_000,
            probe_timeout_ms: 3_000,
            success_threshold: 1,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            max_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub default_strategy: String,
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// "fixed" or "exponential"
    pub backoff: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_strategy: "round_robin".to_string(),
            timeout_ms: 2_000,
            retries: 2,
            retry_delay_ms: 100,
            retry_max_delay_ms: 1_000,
            backoff: "exponential".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// "memory" or "redis"
    pub backend: String,
    pub redis_url: Option<String>,
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_url: None,
            key_prefix: "meridian:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// An instance declared in configuration rather than registered over the API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticInstanceConfig {
    pub id: String,
    pub name: String,
    pub version: String,
    pub endpoint: String,
    pub weight: Option<u32>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // MERIDIAN_RESOLVER__TIMEOUT_MS, MERIDIAN_STORE__BACKEND, ...
        builder = builder.add_source(
            Environment::with_prefix("MERIDIAN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check cross-field constraints, collecting every violation
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.discovery.heartbeat_timeout_secs == 0 {
            errors.push("discovery.heartbeat_timeout_secs must be greater than 0".to_string());
        }
        if self.discovery.sweep_interval_secs == 0 {
            errors.push("discovery.sweep_interval_secs must be greater than 0".to_string());
        }
        if self.discovery.event_queue_capacity == 0 {
            errors.push("discovery.event_queue_capacity must be greater than 0".to_string());
        }

        if !matches!(self.health.probe.as_str(), "http" | "tcp" | "none") {
            errors.push(format!(
                "health.probe must be one of http, tcp, none (got {:?})",
                self.health.probe
            ));
        }
        if self.health.probe_interval_ms == 0 {
            errors.push("health.probe_interval_ms must be greater than 0".to_string());
        }
        if self.health.probe_timeout_ms == 0 {
            errors.push("health.probe_timeout_ms must be greater than 0".to_string());
        }
        if self.health.success_threshold == 0 {
            errors.push("health.success_threshold must be at least 1".to_string());
        }
        if self.health.failure_threshold == 0 {
            errors.push("health.failure_threshold must be at least 1".to_string());
        }

        if self.cache.ttl_ms == 0 {
            errors.push("cache.ttl_ms must be greater than 0".to_string());
        } else if self.cache.ttl_ms >= self.discovery.heartbeat_timeout_secs.saturating_mul(1000) {
            errors.push("cache.ttl_ms must be shorter than discovery.heartbeat_timeout_secs".to_string());
        }

        if !BUILTIN_STRATEGIES.contains(&self.resolver.default_strategy.as_str()) {
            errors.push(format!(
                "resolver.default_strategy must be one of {} (got {:?})",
                BUILTIN_STRATEGIES.join(", "),
                self.resolver.default_strategy
            ));
        }
        if self.resolver.timeout_ms == 0 {
            errors.push("resolver.timeout_ms must be greater than 0".to_string());
        }
        if !matches!(self.resolver.backoff.as_str(), "fixed" | "exponential") {
            errors.push(format!(
                "resolver.backoff must be fixed or exponential (got {:?})",
                self.resolver.backoff
            ));
        }

        match self.store.backend.as_str() {
            "memory" => {}
            "redis" => {
                if self.store.redis_url.as_deref().is_none_or(str::is_empty) {
                    errors.push("store.redis_url is required when store.backend is redis".to_string());
                }
            }
            other => errors.push(format!("store.backend must be memory or redis (got {other:?})")),
        }

        for (index, instance) in self.instances.iter().enumerate() {
            if instance.id.is_empty() || instance.name.is_empty() || instance.endpoint.is_empty() {
                errors.push(format!("instances[{index}] needs id, name and endpoint"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolver.default_strategy, "round_robin");
        assert_eq!(config.store.backend, "memory");
        assert!(config.instances.is_empty());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.health.success_threshold = 0;
        config.health.failure_threshold = 0;
        config.resolver.default_strategy = "fastest".to_string();
        config.store.backend = "redis".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("success_threshold")));
        assert!(errors.iter().any(|e| e.contains("fastest")));
        assert!(errors.iter().any(|e| e.contains("redis_url")));
    }

    #[test]
    fn test_cache_ttl_must_be_shorter_than_heartbeat_timeout() {
        let mut config = Config::default();
        config.discovery.heartbeat_timeout_secs = 5;
        config.cache.ttl_ms = 5_000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("cache.ttl_ms"));
    }

    #[test]
    fn test_static_instance_requires_identity() {
        let mut config = Config::default();
        config.instances.push(StaticInstanceConfig {
            name: "api".to_string(),
            endpoint: "http://127.0.0.1:8080".to_string(),
            ..Default::default()
        });

        let errors = config.validate().unwrap_err();
        assert!(errors[0].starts_with("instances[0]"));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
resolver:
  default_strategy: weighted_random
  retries: 5
health:
  probe: tcp
instances:
  - id: api-1
    name: api
    endpoint: "127.0.0.1:9000"
    weight: 3
    tags: [blue]
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.resolver.default_strategy, "weighted_random");
        assert_eq!(config.resolver.retries, 5);
        assert_eq!(config.health.probe, "tcp");
        // untouched sections keep their defaults
        assert_eq!(config.cache.ttl_ms, 5_000);
        assert_eq!(config.instances.len(), 1);
        assert_eq!(config.instances[0].weight, Some(3));
        assert_eq!(config.instances[0].tags, vec!["blue".to_string()]);
        assert!(config.validate().is_ok());
    }
}
