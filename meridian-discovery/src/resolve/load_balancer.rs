//! Load balancing strategies
//!
//! Strategies pick one instance from a candidate list that the registry has
//! already sorted by id. Built-in strategies are registered by name on
//! [`LoadBalancer::new`]; callers can add their own with
//! [`LoadBalancer::register`].

use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::discovery::ServiceInstance;
use crate::error::{Error, Result};

pub const ROUND_ROBIN: &str = "round_robin";
pub const WEIGHTED_RANDOM: &str = "weighted_random";
pub const RANDOM: &str = "random";
pub const FIRST: &str = "first";

/// A named selection algorithm
pub trait BalanceStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Pick one of `candidates`. An empty slice is `NoAvailableInstances`.
    fn select(&self, candidates: &[ServiceInstance]) -> Result<ServiceInstance>;

    /// Whether the selection is stable for a given candidate set, so the
    /// cache may keep the selected instance instead of the candidates
    fn is_sticky(&self) -> bool {
        false
    }
}

fn no_candidates() -> Error {
    Error::NoAvailableInstances("empty candidate list".to_string())
}

/// Walks the candidates in order with one shared atomic counter
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BalanceStrategy for RoundRobin {
    fn name(&self) -> &str {
        ROUND_ROBIN
    }

    fn select(&self, candidates: &[ServiceInstance]) -> Result<ServiceInstance> {
        if candidates.is_empty() {
            return Err(no_candidates());
        }
        let index = self.counter.fetch_add(1, Ordering::AcqRel) % candidates.len();
        Ok(candidates[index].clone())
    }
}

/// Picks proportionally to `weight`
///
/// Zero-weight candidates are skipped unless every candidate has weight
/// zero, in which case the pick is uniform.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRandom;

impl BalanceStrategy for WeightedRandom {
    fn name(&self) -> &str {
        WEIGHTED_RANDOM
    }

    fn select(&self, candidates: &[ServiceInstance]) -> Result<ServiceInstance> {
        if candidates.is_empty() {
            return Err(no_candidates());
        }

        let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
        let mut rng = rand::rng();
        if total == 0 {
            return candidates.choose(&mut rng).cloned().ok_or_else(no_candidates);
        }

        let offset = rng.random_range(0..total);
        let mut cumulative = 0u64;
        for candidate in candidates {
            cumulative += u64::from(candidate.weight);
            if cumulative > offset {
                return Ok(candidate.clone());
            }
        }
        Err(no_candidates())
    }
}

/// Uniform random pick
#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl BalanceStrategy for Random {
    fn name(&self) -> &str {
        RANDOM
    }

    fn select(&self, candidates: &[ServiceInstance]) -> Result<ServiceInstance> {
        candidates.choose(&mut rand::rng()).cloned().ok_or_else(no_candidates)
    }
}

/// Always the lowest id; sticky
#[derive(Debug, Default, Clone, Copy)]
pub struct First;

impl BalanceStrategy for First {
    fn name(&self) -> &str {
        FIRST
    }

    fn select(&self, candidates: &[ServiceInstance]) -> Result<ServiceInstance> {
        candidates
            .iter()
            .min_by(|a, b| a.id.cmp(&b.id))
            .cloned()
            .ok_or_else(no_candidates)
    }

    fn is_sticky(&self) -> bool {
        true
    }
}

/// Strategy table keyed by name
pub struct LoadBalancer {
    strategies: RwLock<HashMap<String, Arc<dyn BalanceStrategy>>>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    /// Balancer with every built-in strategy registered
    #[must_use]
    pub fn new() -> Self {
        let balancer = Self {
            strategies: RwLock::new(HashMap::new()),
        };
        balancer.register(Arc::new(RoundRobin::new()));
        balancer.register(Arc::new(WeightedRandom));
        balancer.register(Arc::new(Random));
        balancer.register(Arc::new(First));
        balancer
    }

    /// Add or replace a strategy under its own name
    pub fn register(&self, strategy: Arc<dyn BalanceStrategy>) {
        self.strategies
            .write()
            .insert(strategy.name().to_string(), strategy);
    }

    pub fn strategy(&self, name: &str) -> Result<Arc<dyn BalanceStrategy>> {
        self.strategies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Invalid(format!("unknown load balancing strategy: {name}")))
    }

    /// Registered strategy names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn select(&self, name: &str, candidates: &[ServiceInstance]) -> Result<ServiceInstance> {
        self.strategy(name)?.select(candidates)
    }
}
