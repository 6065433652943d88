use async_trait::async_trait;

use portal_schedule_core::{Error, Result, cache::CacheBackend};

/// Redis 缓存实现
///
/// `SET` 整体替换值，`SETNX` 保证别名只写入一次。
#[derive(Debug, Clone)]
pub struct RedisCache {
    connection: redis::aio::MultiplexedConnection,
    prefix: String,
}

impl RedisCache {
    /// 创建新的 Redis 缓存实例
    pub async fn new(redis_url: &str, prefix: Option<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Config(format!("Failed to create Redis client: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or_else(|| "portal_schedule".to_string()),
        })
    }

    /// 构建带前缀的键
    fn build_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn set_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        use redis::AsyncCommands;

        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        conn.set::<_, _, ()>(&full_key, value)
            .await
            .map_err(|e| Error::Storage(format!("Failed to set Redis key: {}", e)))?;

        Ok(())
    }

    async fn set_raw_nx(&self, key: &str, value: &[u8]) -> Result<bool> {
        use redis::AsyncCommands;

        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        conn.set_nx::<_, _, bool>(&full_key, value)
            .await
            .map_err(|e| Error::Storage(format!("Failed to set Redis key: {}", e)))
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        use redis::AsyncCommands;

        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        let result: redis::RedisResult<Option<Vec<u8>>> = conn.get(&full_key).await;
        result.map_err(|e| Error::Storage(format!("Failed to get Redis key: {}", e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        use redis::AsyncCommands;

        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        conn.del::<_, ()>(&full_key)
            .await
            .map_err(|e| Error::Storage(format!("Failed to delete Redis key: {}", e)))?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        use redis::AsyncCommands;

        let full_key = self.build_key(key);
        let mut conn = self.connection.clone();

        conn.exists(&full_key)
            .await
            .map_err(|e| Error::Storage(format!("Failed to check Redis key existence: {}", e)))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        use redis::AsyncCommands;

        let pattern = format!("{}*", self.build_key(prefix));
        let mut conn = self.connection.clone();

        let keys: Vec<String> = conn
            .keys(&pattern)
            .await
            .map_err(|e| Error::Storage(format!("Failed to scan Redis keys: {}", e)))?;

        let own_prefix = format!("{}:", self.prefix);
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&own_prefix).map(str::to_string))
            .collect())
    }
}
