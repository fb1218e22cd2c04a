//! Persistence boundary for instance records
//!
//! The registry calls the store synchronously on every mutation: a failed
//! `save` aborts registration, a failed `delete` is logged and ignored.

pub mod redis_store;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::discovery::ServiceInstance;
use crate::error::Result;

pub use redis_store::RedisStore;

/// Durable storage for registered instances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert or overwrite the record for `instance.id`
    async fn save(&self, instance: &ServiceInstance) -> Result<()>;

    /// Remove a record. Deleting an absent id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// All stored records, in no particular order
    async fn list(&self) -> Result<Vec<ServiceInstance>>;
}

/// In-process store (tests, single-node deployments)
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, ServiceInstance>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn save(&self, instance: &ServiceInstance) -> Result<()> {
        self.records.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ServiceInstance>> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let instance = ServiceInstance::new("api-1", "api", "10.0.0.1:80");

        store.save(&instance).await.unwrap();
        assert!(store.contains("api-1"));
        assert_eq!(store.list().await.unwrap(), vec![instance]);

        store.delete("api-1").await.unwrap();
        assert!(store.is_empty());
        // deleting twice is fine
        store.delete("api-1").await.unwrap();
    }
}
