use async_trait::async_trait;

use crate::{
    Alias, FeedKey, FeedSnapshot, Provider, Result, UserFeedState, UserId, UserProfile,
    cache::{Cache, CacheBackend},
};

/// 同步引擎依赖的存储接口
///
/// 所有写操作对并发读者必须是原子的：读者只能看到完整的旧值或完整的新值。
#[async_trait]
pub trait FeedStore: Send + Sync {
    async fn find_events(&self, key: &FeedKey) -> Result<Option<FeedSnapshot>>;

    /// 整体替换某个用户某个 provider 的快照
    async fn replace_events(&self, key: &FeedKey, snapshot: &FeedSnapshot) -> Result<()>;

    async fn find_alias(&self, provider: Provider, remote_class: &str) -> Result<Option<Alias>>;

    /// 已存在同一 `(provider, remote_class)` 时返回 false，不覆盖
    async fn insert_alias(&self, alias: &Alias) -> Result<bool>;

    async fn get_user_queue_state(&self, key: &FeedKey) -> Result<Option<UserFeedState>>;

    async fn set_user_queue_state(&self, state: &UserFeedState) -> Result<()>;

    async fn list_queue_states(&self) -> Result<Vec<UserFeedState>>;

    async fn get_profile(&self, user: &UserId) -> Result<Option<UserProfile>>;

    async fn put_profile(&self, profile: &UserProfile) -> Result<()>;
}

/// 基于键值后端的存储实现，值以 JSON 保存
#[derive(Clone)]
pub struct KvStore<C: CacheBackend> {
    cache: C,
}

impl<C: CacheBackend> KvStore<C> {
    pub fn new(cache: C) -> Self
    where
        C: CacheBackend + 'static,
    {
        Self { cache }
    }

    pub fn events_key(key: &FeedKey) -> String {
        format!("events:{}:{}", key.provider, key.user)
    }

    pub fn alias_key(provider: Provider, remote_class: &str) -> String {
        format!("alias:{}:{}", provider, remote_class)
    }

    pub fn feed_state_key(key: &FeedKey) -> String {
        format!("feed:{}:{}", key.provider, key.user)
    }

    pub fn profile_key(user: &UserId) -> String {
        format!("profile:{}", user)
    }
}

#[async_trait]
impl<C: CacheBackend + 'static> FeedStore for KvStore<C> {
    async fn find_events(&self, key: &FeedKey) -> Result<Option<FeedSnapshot>> {
        self.cache.get(&Self::events_key(key)).await
    }

    async fn replace_events(&self, key: &FeedKey, snapshot: &FeedSnapshot) -> Result<()> {
        self.cache.set(&Self::events_key(key), snapshot).await
    }

    async fn find_alias(&self, provider: Provider, remote_class: &str) -> Result<Option<Alias>> {
        self.cache
            .get(&Self::alias_key(provider, remote_class))
            .await
    }

    async fn insert_alias(&self, alias: &Alias) -> Result<bool> {
        self.cache
            .set_nx(&Self::alias_key(alias.provider, &alias.remote_class), alias)
            .await
    }

    async fn get_user_queue_state(&self, key: &FeedKey) -> Result<Option<UserFeedState>> {
        self.cache.get(&Self::feed_state_key(key)).await
    }

    async fn set_user_queue_state(&self, state: &UserFeedState) -> Result<()> {
        self.cache
            .set(&Self::feed_state_key(&state.key()), state)
            .await
    }

    async fn list_queue_states(&self) -> Result<Vec<UserFeedState>> {
        let mut states = Vec::new();
        for key in self.cache.keys("feed:").await? {
            if let Some(state) = self.cache.get::<UserFeedState>(&key).await? {
                states.push(state);
            }
        }
        Ok(states)
    }

    async fn get_profile(&self, user: &UserId) -> Result<Option<UserProfile>> {
        self.cache.get(&Self::profile_key(user)).await
    }

    async fn put_profile(&self, profile: &UserProfile) -> Result<()> {
        self.cache
            .set(&Self::profile_key(&profile.user), profile)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use uuid::Uuid;

    fn alias(native: &str) -> Alias {
        Alias {
            id: Uuid::new_v4(),
            provider: Provider::Canvas,
            remote_class: "AP Chemistry".to_string(),
            native_class_id: native.to_string(),
        }
    }

    #[tokio::test]
    async fn alias_insert_is_first_writer_wins() {
        let store = KvStore::new(MemoryCache::new());
        assert!(store.insert_alias(&alias("CHEM-AP")).await.unwrap());
        assert!(!store.insert_alias(&alias("CHEM-OTHER")).await.unwrap());

        let found = store
            .find_alias(Provider::Canvas, "AP Chemistry")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.native_class_id, "CHEM-AP");
        assert!(
            store
                .find_alias(Provider::Portal, "AP Chemistry")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn queue_states_are_listed() {
        let store = KvStore::new(MemoryCache::new());
        let key = FeedKey::new(UserId::new("u1"), Provider::Portal);
        store
            .set_user_queue_state(&UserFeedState::new(key.clone(), "https://x/feed"))
            .await
            .unwrap();

        let states = store.list_queue_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].key(), key);
        assert!(store.find_events(&key).await.unwrap().is_none());
    }
}
