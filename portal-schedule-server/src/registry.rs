use std::sync::Arc;

use portal_schedule_core::{
    Result,
    config::SyncConfig,
    fetcher::FeedFetcher,
    service::{ScheduleService, load_calendar, load_templates},
    store::KvStore,
};

use crate::cache::RedisCache;

/// 用 Redis 存储组装同步服务并启动刷新队列
pub(crate) async fn init_with_redis(
    redis_url: &str,
    config: SyncConfig,
) -> Result<Arc<ScheduleService>> {
    tracing::info!("Initializing schedule service with Redis store");

    let redis_cache = RedisCache::new(redis_url, Some("portal-schedule".to_string())).await?;
    let fetcher = FeedFetcher::new(&config)?;
    let templates = load_templates(&config)?;
    let calendar = load_calendar(&config)?;

    let service = ScheduleService::start(
        config,
        Arc::new(KvStore::new(redis_cache)),
        Arc::new(fetcher),
        templates,
        calendar,
    )
    .await?;

    Ok(Arc::new(service))
}
