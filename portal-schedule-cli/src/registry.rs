use std::{path::PathBuf, sync::Arc};

use portal_schedule_core::{
    Result,
    config::SyncConfig,
    fetcher::FeedFetcher,
    service::{ScheduleService, load_calendar, load_templates},
    store::KvStore,
};

use crate::cache::FileCache;

/// 用本地文件存储组装同步服务
pub(crate) async fn init(config: SyncConfig, data_dir: Option<PathBuf>) -> Result<ScheduleService> {
    let file_cache = match data_dir {
        Some(dir) => FileCache::new(dir)?,
        None => FileCache::with_default_dir("portal-schedule")?,
    };
    tracing::debug!("Using local store at {}", file_cache.dir().display());

    let fetcher = FeedFetcher::new(&config)?;
    let templates = load_templates(&config)?;
    let calendar = load_calendar(&config)?;

    ScheduleService::start(
        config,
        Arc::new(KvStore::new(file_cache)),
        Arc::new(fetcher),
        templates,
        calendar,
    )
    .await
}
