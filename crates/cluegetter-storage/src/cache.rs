//! Redis cache client

use async_trait::async_trait;
use cluegetter_common::{Error, Result};
use redis::aio::MultiplexedConnection;
use std::time::Duration;

/// The cache operations the engine relies on. Kept narrow so tests can
/// substitute an in-memory implementation.
#[async_trait]
pub trait Cache: Send + Sync {
    /// GET a key holding an integer; `None` when absent
    async fn get_i64(&self, key: &str) -> Result<Option<i64>>;

    /// SET with an expiry
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// SET-if-absent with an expiry; returns whether the key was set
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Whether the key exists
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Cache backed by a Redis server
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    /// Create a new cache client for the given Redis URL
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Cache(format!("Failed to create Redis client: {}", e)))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Cache(format!("Failed to connect to Redis: {}", e)))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        Ok(count > 0)
    }
}
