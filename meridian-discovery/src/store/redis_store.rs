//! Redis-backed instance store
//!
//! Each instance is a JSON document at `<prefix>instances:<id>`.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::time::{timeout, Duration};

use super::InstanceStore;
use crate::discovery::ServiceInstance;
use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    fn instance_key(&self, id: &str) -> String {
        format!("{}instances:{id}", self.key_prefix)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Store("Redis connection timed out".to_string()))?
        .map_err(|e| Error::store("Redis connection failed", e))
    }

    async fn scan_keys(&self, conn: &mut MultiplexedConnection) -> Result<Vec<String>> {
        let pattern = format!("{}instances:*", self.key_prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut *conn),
            )
            .await
            .map_err(|_| Error::Store("Redis SCAN timed out".to_string()))??;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl InstanceStore for RedisStore {
    async fn save(&self, instance: &ServiceInstance) -> Result<()> {
        let mut conn = self.connection().await?;
        let value = serde_json::to_string(instance)?;

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            redis::cmd("SET")
                .arg(self.instance_key(&instance.id))
                .arg(&value)
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| Error::Store("Redis SET timed out".to_string()))??;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.connection().await?;

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            redis::cmd("DEL")
                .arg(self.instance_key(id))
                .query_async::<()>(&mut conn),
        )
        .await
        .map_err(|_| Error::Store("Redis DEL timed out".to_string()))??;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<ServiceInstance>> {
        let mut conn = self.connection().await?;
        let keys = self.scan_keys(&mut conn).await?;

        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<String> = timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                redis::cmd("GET").arg(&key).query_async(&mut conn),
            )
            .await
            .map_err(|_| Error::Store("Redis GET timed out".to_string()))??;

            // Key may have been deleted between SCAN and GET
            let Some(value) = value else { continue };
            match serde_json::from_str::<ServiceInstance>(&value) {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping undecodable instance record");
                }
            }
        }

        Ok(instances)
    }
}
