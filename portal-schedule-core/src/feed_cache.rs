use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::{Event, FeedKey, FeedSnapshot, Result, store::FeedStore};

/// 每个 (用户, provider) 最近一次完整解析结果的缓存
///
/// 快照以 `Arc` 形式整体替换：先写入存储，成功后再在内存里一次性换掉指针，
/// 读者要么拿到旧快照，要么拿到新快照。
#[derive(Clone)]
pub struct FeedCache {
    store: Arc<dyn FeedStore>,
    snapshots: Arc<RwLock<HashMap<FeedKey, Arc<FeedSnapshot>>>>,
}

impl FeedCache {
    pub fn new(store: Arc<dyn FeedStore>) -> Self {
        Self {
            store,
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 用新的事件集合替换旧快照；存储写入失败时旧快照保持不变
    pub async fn replace(&self, key: &FeedKey, snapshot: FeedSnapshot) -> Result<Arc<FeedSnapshot>> {
        self.store.replace_events(key, &snapshot).await?;

        let snapshot = Arc::new(snapshot);
        self.snapshots
            .write()
            .await
            .insert(key.clone(), snapshot.clone());

        tracing::debug!("Replaced {} cached events for {}", snapshot.events.len(), key);
        Ok(snapshot)
    }

    /// 当前快照，从未刷新过时为空快照
    pub async fn snapshot(&self, key: &FeedKey) -> Result<Arc<FeedSnapshot>> {
        if let Some(snapshot) = self.snapshots.read().await.get(key) {
            return Ok(snapshot.clone());
        }

        let loaded = Arc::new(self.store.find_events(key).await?.unwrap_or_default());

        // 加载期间可能有 replace 完成，已有的条目更新，保留它
        let mut snapshots = self.snapshots.write().await;
        Ok(snapshots.entry(key.clone()).or_insert(loaded).clone())
    }

    /// 当前缓存的事件
    pub async fn read(&self, key: &FeedKey) -> Result<Vec<Event>> {
        Ok(self.snapshot(key).await?.events.clone())
    }
}
