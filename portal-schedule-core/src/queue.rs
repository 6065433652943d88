use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, broadcast, mpsc},
    task::JoinHandle,
    time::timeout,
};

use crate::{
    Error, FeedKey, FeedSnapshot, Provider, Result, UserFeedState,
    alias::AliasResolver, config::SyncConfig, feed_cache::FeedCache, fetcher::FeedSource,
    ics::FeedParser, store::FeedStore,
};

const REPORT_CAPACITY: usize = 256;

/// 队列中的状态；不在表里即为空闲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Queued,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued,
    /// 已在排队或正在刷新，本次调用不做任何事
    AlreadyPending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RefreshOutcome {
    Success {
        events: usize,
        skipped: usize,
        /// 还没有别名的远端课程名
        unaliased: Vec<String>,
    },
    Failed {
        error: String,
    },
}

/// 每次刷新结束后广播的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub key: FeedKey,
    pub outcome: RefreshOutcome,
}

struct Shared {
    store: Arc<dyn FeedStore>,
    source: Arc<dyn FeedSource>,
    cache: FeedCache,
    aliases: AliasResolver,
    timezone: Tz,
    attempt_timeout: Duration,
    /// 所有 `UserFeedState` 的写入都在这把锁内完成
    states: Mutex<HashMap<FeedKey, RefreshState>>,
    reports: broadcast::Sender<RefreshReport>,
}

/// 后台刷新队列
///
/// 每个 provider 一个顺序执行的 worker，不同 provider 之间并行。
/// 同一个 (用户, provider) 任意时刻最多只有一个排队或执行中的刷新。
///
/// 多个进程共用同一份存储时（例如 CLI 指向服务端的 Redis），持久化的
/// `queued` 标记在两倍单次超时内视为有效，另一个进程不会重复刷新；
/// 超过这个时间的标记视为进程崩溃遗留，可以被清理或覆盖。
pub struct RefreshQueue {
    shared: Arc<Shared>,
    senders: Mutex<Option<HashMap<Provider, mpsc::UnboundedSender<FeedKey>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RefreshQueue {
    /// 清理上次进程遗留的排队标记并启动 worker
    pub async fn start(
        store: Arc<dyn FeedStore>,
        source: Arc<dyn FeedSource>,
        cache: FeedCache,
        aliases: AliasResolver,
        config: &SyncConfig,
    ) -> Result<Self> {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        let shared = Arc::new(Shared {
            store,
            source,
            cache,
            aliases,
            timezone: config.timezone(),
            attempt_timeout: config.refresh_timeout(),
            states: Mutex::new(HashMap::new()),
            reports,
        });

        let cleared = shared.clear_stale_markers().await?;
        if cleared > 0 {
            tracing::info!("Cleared {} stale refresh markers", cleared);
        }

        let mut senders = HashMap::new();
        let mut workers = Vec::new();
        for provider in Provider::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(provider, tx);
            workers.push(tokio::spawn(run_worker(shared.clone(), provider, rx)));
        }

        Ok(Self {
            shared,
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(workers),
        })
    }

    /// 记录或更新订阅地址，不改变排队标记
    pub async fn subscribe(&self, key: &FeedKey, feed_url: &str) -> Result<()> {
        let _states = self.shared.states.lock().await;
        let state = match self
            .shared
            .bounded(self.shared.store.get_user_queue_state(key))
            .await?
        {
            Some(mut existing) => {
                existing.feed_url = feed_url.to_string();
                existing
            }
            None => UserFeedState::new(key.clone(), feed_url),
        };
        self.shared
            .bounded(self.shared.store.set_user_queue_state(&state))
            .await?;
        tracing::info!("Subscribed {} to {}", key, feed_url);
        Ok(())
    }

    pub async fn enqueue(&self, key: &FeedKey) -> Result<EnqueueOutcome> {
        let mut states = self.shared.states.lock().await;
        if let Some(current) = states.get(key) {
            tracing::debug!("Refresh for {} already {:?}", key, current);
            return Ok(EnqueueOutcome::AlreadyPending);
        }

        let sender = self
            .senders
            .lock()
            .await
            .as_ref()
            .and_then(|senders| senders.get(&key.provider).cloned())
            .ok_or(Error::QueueClosed)?;

        let mut state = self
            .shared
            .bounded(self.shared.store.get_user_queue_state(key))
            .await?
            .ok_or_else(|| Error::NotSubscribed {
                user: key.user.to_string(),
                provider: key.provider,
            })?;
        if self.shared.marker_is_live(&state, Utc::now()) {
            tracing::debug!("Refresh for {} is pending in another process", key);
            return Ok(EnqueueOutcome::AlreadyPending);
        }

        state.queued = true;
        state.queued_at = Some(Utc::now());
        self.shared
            .bounded(self.shared.store.set_user_queue_state(&state))
            .await?;
        states.insert(key.clone(), RefreshState::Queued);

        if sender.send(key.clone()).is_err() {
            states.remove(key);
            state.queued = false;
            state.queued_at = None;
            self.shared
                .bounded(self.shared.store.set_user_queue_state(&state))
                .await?;
            return Err(Error::QueueClosed);
        }

        tracing::debug!("Queued refresh for {}", key);
        Ok(EnqueueOutcome::Queued)
    }

    /// 把所有订阅重新入队，返回新入队的数量
    pub async fn refresh_all(&self) -> Result<usize> {
        let mut queued = 0;
        let states = self
            .shared
            .bounded(self.shared.store.list_queue_states())
            .await?;
        for state in states {
            if self.enqueue(&state.key()).await? == EnqueueOutcome::Queued {
                queued += 1;
            }
        }
        tracing::info!("Queued {} feed refreshes", queued);
        Ok(queued)
    }

    pub async fn state(&self, key: &FeedKey) -> Option<RefreshState> {
        self.shared.states.lock().await.get(key).copied()
    }

    pub fn reports(&self) -> broadcast::Receiver<RefreshReport> {
        self.shared.reports.subscribe()
    }

    /// 停止接收新任务，等待 worker 处理完已排队的刷新
    pub async fn shutdown(&self) {
        self.senders.lock().await.take();

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!("Refresh worker panicked: {}", err);
            }
        }
        tracing::info!("Refresh queue stopped");
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    provider: Provider,
    mut rx: mpsc::UnboundedReceiver<FeedKey>,
) {
    tracing::info!("Refresh worker for {} started", provider);
    while let Some(key) = rx.recv().await {
        shared.process(key).await;
    }
    tracing::info!("Refresh worker for {} stopped", provider);
}

impl Shared {
    /// 存储调用统一受单次超时约束
    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        timeout(self.attempt_timeout, op)
            .await
            .unwrap_or(Err(Error::Timeout))
    }

    /// 其他进程留下、仍在有效期内的排队标记
    fn marker_is_live(&self, state: &UserFeedState, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::from_std(self.attempt_timeout * 2).unwrap_or(TimeDelta::MAX);
        state.queued
            && state
                .queued_at
                .is_some_and(|at| now.signed_duration_since(at) < ttl)
    }

    async fn clear_stale_markers(&self) -> Result<usize> {
        let _states = self.states.lock().await;
        let now = Utc::now();
        let mut cleared = 0;
        for mut state in self.bounded(self.store.list_queue_states()).await? {
            if state.queued && !self.marker_is_live(&state, now) {
                state.queued = false;
                state.queued_at = None;
                self.bounded(self.store.set_user_queue_state(&state)).await?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn process(self: &Arc<Self>, key: FeedKey) {
        {
            let mut states = self.states.lock().await;
            states.insert(key.clone(), RefreshState::InFlight);
            if let Err(err) = self.bounded(self.touch_marker(&key)).await {
                tracing::warn!("Cannot refresh queue marker for {}: {}", key, err);
            }
        }

        // 单独的任务里执行，feed 触发的 panic 只让这一次刷新失败
        let mut task = {
            let shared = self.clone();
            let key = key.clone();
            tokio::spawn(async move { shared.attempt(&key).await })
        };
        let outcome = match timeout(self.attempt_timeout, &mut task).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(err))) => RefreshOutcome::Failed {
                error: err.to_string(),
            },
            Ok(Err(err)) => RefreshOutcome::Failed {
                error: Error::Internal(format!("Refresh task panicked: {}", err)).to_string(),
            },
            Err(_) => {
                task.abort();
                RefreshOutcome::Failed {
                    error: Error::Timeout.to_string(),
                }
            }
        };

        match &outcome {
            RefreshOutcome::Success {
                events, skipped, ..
            } => tracing::info!(
                "Refreshed {}: {} events, {} skipped",
                key,
                events,
                skipped
            ),
            RefreshOutcome::Failed { error } => {
                tracing::warn!("Refresh of {} failed: {}", key, error)
            }
        }

        {
            let mut states = self.states.lock().await;
            if let Err(err) = self.bounded(self.finish(&key, &outcome)).await {
                tracing::error!("Cannot clear queue marker for {}: {}", key, err);
            }
            states.remove(&key);
        }

        // 没有订阅者时发送失败，忽略即可
        let _ = self.reports.send(RefreshReport { key, outcome });
    }

    /// 获取 → 解析 → 别名解析 → 替换缓存
    async fn attempt(&self, key: &FeedKey) -> Result<RefreshOutcome> {
        let state = self
            .store
            .get_user_queue_state(key)
            .await?
            .ok_or_else(|| Error::NotSubscribed {
                user: key.user.to_string(),
                provider: key.provider,
            })?;

        let text = self.source.fetch(key.provider, &state.feed_url).await?;
        let parsed =
            FeedParser::new(key.provider, key.user.clone(), self.timezone).parse(&text)?;
        if let Some(partial) = parsed.partial_error() {
            tracing::warn!("{}: {}", key, partial);
        }

        let class_refs: BTreeSet<&str> = parsed
            .events
            .iter()
            .filter_map(|event| event.class_ref.as_deref())
            .collect();
        let mut unaliased = Vec::new();
        for class_ref in class_refs {
            if !self.aliases.resolve(key.provider, class_ref).await?.is_native() {
                unaliased.push(class_ref.to_string());
            }
        }

        let events = parsed.events.len();
        self.cache
            .replace(
                key,
                FeedSnapshot {
                    events: parsed.events,
                    refreshed_at: Some(Utc::now()),
                    skipped: parsed.skipped,
                },
            )
            .await?;

        Ok(RefreshOutcome::Success {
            events,
            skipped: parsed.skipped,
            unaliased,
        })
    }

    /// 开始执行时更新标记时间，其他进程按这个时间判断是否过期
    async fn touch_marker(&self, key: &FeedKey) -> Result<()> {
        let Some(mut state) = self.store.get_user_queue_state(key).await? else {
            return Ok(());
        };
        state.queued_at = Some(Utc::now());
        self.store.set_user_queue_state(&state).await
    }

    async fn finish(&self, key: &FeedKey, outcome: &RefreshOutcome) -> Result<()> {
        let Some(mut state) = self.store.get_user_queue_state(key).await? else {
            return Ok(());
        };
        state.queued = false;
        state.queued_at = None;
        match outcome {
            RefreshOutcome::Success { .. } => {
                state.last_refreshed_at = Some(Utc::now());
                state.last_error = None;
            }
            RefreshOutcome::Failed { error } => state.last_error = Some(error.clone()),
        }
        self.store.set_user_queue_state(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{UserId, cache::MemoryCache, fetcher::FeedFetcher, store::KvStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const FEED_URL: &str = "https://x.instructure.com/feeds/calendars/u.ics";

    const CANVAS_FEED: &str = "BEGIN:VCALENDAR\r
VERSION:2.0\r
BEGIN:VEVENT\r
UID:lab-1\r
DTSTART:20240916T133000Z\r
DTEND:20240916T134500Z\r
SUMMARY:Lab report due [AP Physics]\r
END:VEVENT\r
BEGIN:VEVENT\r
UID:quiz-1\r
DTSTART:20240917T140000Z\r
DTEND:20240917T143000Z\r
SUMMARY:Quiz [AP Physics]\r
END:VEVENT\r
END:VCALENDAR\r
";

    const HOSTILE_FEED: &str = "BEGIN:VCALENDAR\r
BEGIN:VEVENT\r
UID:forever\r
DTSTART:20240916T133000Z\r
DURATION:P99999999999W\r
SUMMARY:Never ends [AP Physics]\r
END:VEVENT\r
BEGIN:VEVENT\r
UID:quiz-2\r
DTSTART:20240917T140000Z\r
DTEND:20240917T143000Z\r
SUMMARY:Quiz [AP Physics]\r
END:VEVENT\r
END:VCALENDAR\r
";

    /// 返回固定内容的 feed 源，可选地在返回前等待放行
    ///
    /// 几个特殊文件名模拟坏掉的 feed：维护页面、超长时长、直接 panic。
    struct ScriptedSource {
        body: String,
        calls: AtomicUsize,
        gate: Option<Notify>,
        delay: Option<Duration>,
    }

    impl ScriptedSource {
        fn new(body: &str) -> Self {
            Self {
                body: body.to_string(),
                calls: AtomicUsize::new(0),
                gate: None,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedSource {
        async fn fetch(&self, _provider: Provider, url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.ends_with("/explode.ics") {
                panic!("feed source exploded");
            }
            if url.ends_with("/maintenance.ics") {
                return Ok("<html>Down for maintenance</html>".to_string());
            }
            if url.ends_with("/hostile.ics") {
                return Ok(HOSTILE_FEED.to_string());
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.body.clone())
        }
    }

    /// 打开开关后 `get_user_queue_state` 永远不返回
    struct HangingStore {
        inner: KvStore<MemoryCache>,
        hang: AtomicBool,
    }

    impl HangingStore {
        fn new() -> Self {
            Self {
                inner: KvStore::new(MemoryCache::new()),
                hang: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl FeedStore for HangingStore {
        async fn find_events(&self, key: &FeedKey) -> Result<Option<FeedSnapshot>> {
            self.inner.find_events(key).await
        }

        async fn replace_events(&self, key: &FeedKey, snapshot: &FeedSnapshot) -> Result<()> {
            self.inner.replace_events(key, snapshot).await
        }

        async fn find_alias(
            &self,
            provider: Provider,
            remote_class: &str,
        ) -> Result<Option<crate::Alias>> {
            self.inner.find_alias(provider, remote_class).await
        }

        async fn insert_alias(&self, alias: &crate::Alias) -> Result<bool> {
            self.inner.insert_alias(alias).await
        }

        async fn get_user_queue_state(&self, key: &FeedKey) -> Result<Option<UserFeedState>> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.get_user_queue_state(key).await
        }

        async fn set_user_queue_state(&self, state: &UserFeedState) -> Result<()> {
            self.inner.set_user_queue_state(state).await
        }

        async fn list_queue_states(&self) -> Result<Vec<UserFeedState>> {
            self.inner.list_queue_states().await
        }

        async fn get_profile(&self, user: &UserId) -> Result<Option<crate::UserProfile>> {
            self.inner.get_profile(user).await
        }

        async fn put_profile(&self, profile: &crate::UserProfile) -> Result<()> {
            self.inner.put_profile(profile).await
        }
    }

    struct Harness {
        store: Arc<dyn FeedStore>,
        cache: FeedCache,
        queue: RefreshQueue,
    }

    async fn harness(source: Arc<dyn FeedSource>, config: &SyncConfig) -> Harness {
        let store: Arc<dyn FeedStore> = Arc::new(KvStore::new(MemoryCache::new()));
        harness_with_store(store, source, config).await
    }

    async fn harness_with_store(
        store: Arc<dyn FeedStore>,
        source: Arc<dyn FeedSource>,
        config: &SyncConfig,
    ) -> Harness {
        let cache = FeedCache::new(store.clone());
        let queue = RefreshQueue::start(
            store.clone(),
            source,
            cache.clone(),
            AliasResolver::new(store.clone()),
            config,
        )
        .await
        .unwrap();
        Harness {
            store,
            cache,
            queue,
        }
    }

    fn canvas_key() -> FeedKey {
        FeedKey::new(UserId::new("student-1"), Provider::Canvas)
    }

    #[tokio::test]
    async fn successful_refresh_replaces_cache_and_reports_unaliased() {
        let source = Arc::new(ScriptedSource::new(CANVAS_FEED));
        let h = harness(source, &SyncConfig::default()).await;
        let key = canvas_key();
        h.queue.subscribe(&key, "https://x.instructure.com/feeds/calendars/u.ics").await.unwrap();

        let mut reports = h.queue.reports();
        assert_eq!(h.queue.enqueue(&key).await.unwrap(), EnqueueOutcome::Queued);
        let report = reports.recv().await.unwrap();

        assert_eq!(report.key, key);
        assert_eq!(
            report.outcome,
            RefreshOutcome::Success {
                events: 2,
                skipped: 0,
                unaliased: vec!["AP Physics".to_string()],
            }
        );
        assert_eq!(h.cache.read(&key).await.unwrap().len(), 2);

        let state = h.store.get_user_queue_state(&key).await.unwrap().unwrap();
        assert!(!state.queued);
        assert!(state.last_refreshed_at.is_some());
        assert!(h.queue.state(&key).await.is_none());
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn double_enqueue_processes_once() {
        let source = Arc::new(ScriptedSource {
            gate: Some(Notify::new()),
            ..ScriptedSource::new(CANVAS_FEED)
        });
        let h = harness(source.clone(), &SyncConfig::default()).await;
        let key = canvas_key();
        h.queue.subscribe(&key, "https://x.instructure.com/feeds/calendars/u.ics").await.unwrap();

        let mut reports = h.queue.reports();
        assert_eq!(h.queue.enqueue(&key).await.unwrap(), EnqueueOutcome::Queued);
        assert_eq!(
            h.queue.enqueue(&key).await.unwrap(),
            EnqueueOutcome::AlreadyPending
        );
        assert!(h.store.get_user_queue_state(&key).await.unwrap().unwrap().queued);

        if let Some(gate) = &source.gate {
            gate.notify_one();
        }
        reports.recv().await.unwrap();
        h.queue.shutdown().await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn http_500_keeps_cache_and_clears_marker() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/podium/feed/student-1.ics")
            .with_status(500)
            .create_async()
            .await;

        let mut config = SyncConfig::default();
        config.portal.host = "127.0.0.1".to_string();
        let fetcher = Arc::new(FeedFetcher::new(&config).unwrap());
        let h = harness(fetcher, &config).await;

        let key = FeedKey::new(UserId::new("student-1"), Provider::Portal);
        let previous = FeedParser::new(Provider::Portal, key.user.clone(), config.timezone())
            .parse(CANVAS_FEED)
            .unwrap();
        h.cache
            .replace(
                &key,
                FeedSnapshot {
                    events: previous.events.clone(),
                    refreshed_at: Some(Utc::now()),
                    skipped: 0,
                },
            )
            .await
            .unwrap();
        h.queue
            .subscribe(&key, &format!("{}/podium/feed/student-1.ics", server.url()))
            .await
            .unwrap();

        let mut reports = h.queue.reports();
        h.queue.enqueue(&key).await.unwrap();
        let report = reports.recv().await.unwrap();

        match report.outcome {
            RefreshOutcome::Failed { error } => assert!(error.contains("500"), "{error}"),
            other => panic!("expected failure, got {other:?}"),
        }
        mock.assert_async().await;
        assert_eq!(h.cache.read(&key).await.unwrap(), previous.events);

        let state = h.store.get_user_queue_state(&key).await.unwrap().unwrap();
        assert!(!state.queued);
        assert!(state.last_error.is_some());
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn slow_feed_times_out_as_failure() {
        let source = Arc::new(ScriptedSource {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedSource::new(CANVAS_FEED)
        });
        let config = SyncConfig {
            refresh_timeout_secs: 1,
            ..Default::default()
        };
        let h = harness(source, &config).await;
        let key = canvas_key();
        h.queue.subscribe(&key, "https://x.instructure.com/feeds/calendars/u.ics").await.unwrap();

        let mut reports = h.queue.reports();
        h.queue.enqueue(&key).await.unwrap();
        let report = reports.recv().await.unwrap();

        assert_eq!(
            report.outcome,
            RefreshOutcome::Failed {
                error: Error::Timeout.to_string()
            }
        );
        assert!(h.cache.read(&key).await.unwrap().is_empty());
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_without_subscription_fails() {
        let h = harness(Arc::new(ScriptedSource::new("")), &SyncConfig::default()).await;
        let err = h.queue.enqueue(&canvas_key()).await.unwrap_err();
        assert!(matches!(err, Error::NotSubscribed { provider: Provider::Canvas, .. }));
        assert!(h.queue.state(&canvas_key()).await.is_none());
    }

    #[tokio::test]
    async fn stale_markers_are_cleared_on_start() {
        let store: Arc<dyn FeedStore> = Arc::new(KvStore::new(MemoryCache::new()));
        let key = canvas_key();
        let mut stale = UserFeedState::new(key.clone(), "https://x.instructure.com/feeds/calendars/u.ics");
        stale.queued = true;
        store.set_user_queue_state(&stale).await.unwrap();

        let h = harness_with_store(
            store,
            Arc::new(ScriptedSource::new(CANVAS_FEED)),
            &SyncConfig::default(),
        )
        .await;
        assert!(!h.store.get_user_queue_state(&key).await.unwrap().unwrap().queued);

        let mut reports = h.queue.reports();
        assert_eq!(h.queue.refresh_all().await.unwrap(), 1);
        reports.recv().await.unwrap();
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn failing_feeds_do_not_block_other_users() {
        let h = harness(Arc::new(ScriptedSource::new(CANVAS_FEED)), &SyncConfig::default()).await;
        let keys: Vec<FeedKey> = ["maintenance", "explode", "hostile", "good"]
            .into_iter()
            .map(|name| FeedKey::new(UserId::new(name), Provider::Canvas))
            .collect();
        for key in &keys {
            let url = format!("https://x.instructure.com/feeds/calendars/{}.ics", key.user);
            h.queue.subscribe(key, &url).await.unwrap();
        }

        let mut reports = h.queue.reports();
        for key in &keys {
            assert_eq!(h.queue.enqueue(key).await.unwrap(), EnqueueOutcome::Queued);
        }
        let mut outcomes = HashMap::new();
        for _ in 0..keys.len() {
            let report = reports.recv().await.unwrap();
            outcomes.insert(report.key.user.to_string(), report.outcome);
        }

        assert!(matches!(outcomes["maintenance"], RefreshOutcome::Failed { .. }));
        match &outcomes["explode"] {
            RefreshOutcome::Failed { error } => assert!(error.contains("panicked"), "{error}"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(matches!(
            outcomes["hostile"],
            RefreshOutcome::Success { events: 1, skipped: 1, .. }
        ));
        assert!(matches!(
            outcomes["good"],
            RefreshOutcome::Success { events: 2, skipped: 0, .. }
        ));
        for key in &keys {
            assert!(!h.store.get_user_queue_state(key).await.unwrap().unwrap().queued);
            assert!(h.queue.state(key).await.is_none());
        }

        // worker 在 panic 之后仍然可用
        assert_eq!(h.queue.enqueue(&keys[1]).await.unwrap(), EnqueueOutcome::Queued);
        assert_eq!(reports.recv().await.unwrap().key, keys[1]);
        assert_eq!(h.queue.enqueue(&keys[3]).await.unwrap(), EnqueueOutcome::Queued);
        assert_eq!(reports.recv().await.unwrap().key, keys[3]);
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn hung_store_times_out_enqueue_and_releases_the_lock() {
        let store = Arc::new(HangingStore::new());
        let config = SyncConfig {
            refresh_timeout_secs: 1,
            ..Default::default()
        };
        let h = harness_with_store(store.clone(), Arc::new(ScriptedSource::new(CANVAS_FEED)), &config).await;
        let key = canvas_key();
        let other = FeedKey::new(UserId::new("student-2"), Provider::Canvas);
        h.queue.subscribe(&key, FEED_URL).await.unwrap();
        h.queue.subscribe(&other, FEED_URL).await.unwrap();

        store.hang.store(true, Ordering::SeqCst);
        assert!(matches!(h.queue.enqueue(&key).await, Err(Error::Timeout)));
        assert!(h.queue.state(&key).await.is_none());

        store.hang.store(false, Ordering::SeqCst);
        let mut reports = h.queue.reports();
        assert_eq!(h.queue.enqueue(&other).await.unwrap(), EnqueueOutcome::Queued);
        let report = reports.recv().await.unwrap();
        assert_eq!(report.key, other);
        assert!(matches!(report.outcome, RefreshOutcome::Success { .. }));
        h.queue.shutdown().await;
    }

    #[tokio::test]
    async fn live_marker_from_another_process_is_honoured() {
        let store: Arc<dyn FeedStore> = Arc::new(KvStore::new(MemoryCache::new()));
        let live_key = canvas_key();
        let crashed_key = FeedKey::new(UserId::new("student-2"), Provider::Canvas);

        let mut live = UserFeedState::new(live_key.clone(), FEED_URL);
        live.queued = true;
        live.queued_at = Some(Utc::now());
        store.set_user_queue_state(&live).await.unwrap();
        let mut crashed = UserFeedState::new(crashed_key.clone(), FEED_URL);
        crashed.queued = true;
        crashed.queued_at = Some(Utc::now() - TimeDelta::hours(1));
        store.set_user_queue_state(&crashed).await.unwrap();

        let source = Arc::new(ScriptedSource::new(CANVAS_FEED));
        let h = harness_with_store(store, source.clone(), &SyncConfig::default()).await;
        assert!(h.store.get_user_queue_state(&live_key).await.unwrap().unwrap().queued);
        assert!(!h.store.get_user_queue_state(&crashed_key).await.unwrap().unwrap().queued);

        assert_eq!(
            h.queue.enqueue(&live_key).await.unwrap(),
            EnqueueOutcome::AlreadyPending
        );
        let mut reports = h.queue.reports();
        assert_eq!(h.queue.enqueue(&crashed_key).await.unwrap(), EnqueueOutcome::Queued);
        assert_eq!(reports.recv().await.unwrap().key, crashed_key);
        h.queue.shutdown().await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let h = harness(Arc::new(ScriptedSource::new(CANVAS_FEED)), &SyncConfig::default()).await;
        let key = canvas_key();
        h.queue.subscribe(&key, "https://x.instructure.com/feeds/calendars/u.ics").await.unwrap();
        h.queue.shutdown().await;

        assert!(matches!(h.queue.enqueue(&key).await, Err(Error::QueueClosed)));
        assert!(!h.store.get_user_queue_state(&key).await.unwrap().unwrap().queued);
    }
}
