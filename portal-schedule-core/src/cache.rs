use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;

use crate::Result;

/// 原始键值存储
///
/// `set_raw` 必须整体替换旧值，`set_raw_nx` 必须是原子的“不存在才写入”。
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn set_raw(&self, key: &str, value: &[u8]) -> Result<()>;
    /// 键已存在时返回 false 且不写入
    async fn set_raw_nx(&self, key: &str, value: &[u8]) -> Result<bool>;
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// 列出以 `prefix` 开头的所有键
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Cache: CacheBackend {
    async fn set<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Send + Sync,
    {
        let value_bytes = serde_json::to_vec(value)?;
        self.set_raw(key, &value_bytes).await
    }

    async fn set_nx<T>(&self, key: &str, value: &T) -> Result<bool>
    where
        T: Serialize + Send + Sync,
    {
        let value_bytes = serde_json::to_vec(value)?;
        self.set_raw_nx(key, &value_bytes).await
    }

    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        if let Some(raw) = self.get_raw(key).await? {
            let value = serde_json::from_slice::<T>(&raw).map_err(|e| {
                crate::Error::Storage(format!("Failed to deserialize value at {}: {}", key, e))
            })?;

            Ok(Some(value))
        } else {
            Ok(None)
        }
    }
}

/// 为所有实现了 CacheBackend 的类型自动实现 Cache
impl<T: CacheBackend> Cache for T {}

/// 进程内存储，用于测试和单机运行
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn set_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn set_raw_nx(&self, key: &str, value: &[u8]) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(true)
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
