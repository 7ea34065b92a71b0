// Post-commit invalidation of cached documents

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

/// Cache key layout shared by writers and readers of cached documents.
pub mod keys {
    use uuid::Uuid;

    pub const ORDERS_LIST: &str = "orders:list";
    pub const INVOICES_LIST: &str = "invoices:list";

    pub fn order(id: Uuid) -> String {
        format!("order:{}", id)
    }

    pub fn orders_for_customer(customer_id: Uuid) -> String {
        format!("orders:customer:{}", customer_id)
    }

    pub fn invoice(id: Uuid) -> String {
        format!("invoice:{}", id)
    }

    pub fn invoices_for_customer(customer_id: Uuid) -> String {
        format!("invoices:customer:{}", customer_id)
    }
}

/// Receives the keys made stale by a committed document change.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

/// Evicts keys from the Redis instance that readers cache documents in.
#[derive(Clone)]
pub struct RedisInvalidator {
    client: redis::Client,
}

impl RedisInvalidator {
    pub fn new(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::Connection, CacheError> {
        Ok(self.client.get_async_connection().await?)
    }

    /// Round-trips a PING to confirm the server is reachable.
    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheInvalidator for RedisInvalidator {
    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        debug!(key, "invalidating cache entry");
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// For deployments that run without a cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

#[async_trait]
impl CacheInvalidator for NoopInvalidator {
    async fn invalidate(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Picks the invalidation sink for `config`. An unusable Redis disables
/// invalidation rather than failing startup.
pub async fn invalidator_from_config(config: &CacheConfig) -> Arc<dyn CacheInvalidator> {
    if !config.enabled {
        info!("Document cache invalidation disabled");
        return Arc::new(NoopInvalidator);
    }

    match RedisInvalidator::new(&config.redis_url) {
        Ok(redis) => match redis.ping().await {
            Ok(()) => {
                info!("Invalidating document cache in Redis at {}", config.redis_url);
                Arc::new(redis)
            }
            Err(e) => {
                warn!(error = %e, "Redis unreachable, cache invalidation disabled");
                Arc::new(NoopInvalidator)
            }
        },
        Err(e) => {
            warn!(error = %e, "Invalid Redis URL, cache invalidation disabled");
            Arc::new(NoopInvalidator)
        }
    }
}
