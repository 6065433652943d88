use std::{fs::File, sync::Arc};

use chrono::{NaiveDate, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    ClassIdentity, Error, FeedKey, FeedSnapshot, MergedScheduleEntry, Provider, Result,
    UserFeedState, UserId, UserProfile,
    alias::AliasResolver,
    composer::{ScheduleComposer, ScheduleRequest},
    config::SyncConfig,
    feed_cache::FeedCache,
    fetcher::{FeedSource, normalize_feed_url},
    queue::{EnqueueOutcome, RefreshQueue, RefreshReport},
    rotation::{DayInfo, RotationCalendar},
    store::FeedStore,
    template::{SchoolLevel, TemplateSet},
};

/// 配置了文件时读取文件，否则使用内置课表
pub fn load_templates(config: &SyncConfig) -> Result<TemplateSet> {
    match &config.templates_path {
        Some(path) => TemplateSet::from_path(path),
        None => TemplateSet::builtin(),
    }
}

/// 配置了文件时读取文件，否则按当前日期推断学年；再并入停课日 ICS
pub fn load_calendar(config: &SyncConfig) -> Result<RotationCalendar> {
    let mut calendar = match &config.rotation_calendar_path {
        Some(path) => RotationCalendar::from_path(path)?,
        None => RotationCalendar::for_school_year_of(
            Utc::now().with_timezone(&config.timezone()).date_naive(),
        ),
    };

    if let Some(path) = &config.no_school_ics_path {
        tracing::info!("Loading no-school days from {}", path.display());
        let file = File::open(path).map_err(|err| {
            Error::Config(format!("Cannot open {}: {}", path.display(), err))
        })?;
        calendar.add_no_school_from_ics(file)?;
    }
    Ok(calendar)
}

/// 某天的合并课表
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySchedule {
    pub date: NaiveDate,
    /// 非上课日为 None
    pub day: Option<DayInfo>,
    pub entries: Vec<MergedScheduleEntry>,
}

/// 对外暴露的同步与合并服务
pub struct ScheduleService {
    config: SyncConfig,
    store: Arc<dyn FeedStore>,
    cache: FeedCache,
    aliases: AliasResolver,
    composer: ScheduleComposer,
    calendar: RotationCalendar,
    queue: RefreshQueue,
}

impl ScheduleService {
    pub async fn start(
        config: SyncConfig,
        store: Arc<dyn FeedStore>,
        source: Arc<dyn FeedSource>,
        templates: TemplateSet,
        calendar: RotationCalendar,
    ) -> Result<Self> {
        config.validate()?;
        calendar.validate()?;

        let cache = FeedCache::new(store.clone());
        let aliases = AliasResolver::new(store.clone());
        let composer = ScheduleComposer::new(
            Arc::new(templates),
            cache.clone(),
            aliases.clone(),
            config.timezone(),
        );
        let queue =
            RefreshQueue::start(store.clone(), source, cache.clone(), aliases.clone(), &config)
                .await?;

        tracing::info!(
            "Schedule service started with {} templates, school year from {}",
            composer.templates().len(),
            calendar.first_day
        );
        Ok(Self {
            config,
            store,
            cache,
            aliases,
            composer,
            calendar,
            queue,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn templates(&self) -> &TemplateSet {
        self.composer.templates()
    }

    pub fn calendar(&self) -> &RotationCalendar {
        &self.calendar
    }

    /// 校验并保存订阅地址，返回规范化后的 URL
    pub async fn subscribe(&self, user: &UserId, provider: Provider, url: &str) -> Result<String> {
        let url = normalize_feed_url(self.config.rule(provider), provider, url)?;
        self.queue
            .subscribe(&FeedKey::new(user.clone(), provider), url.as_str())
            .await?;
        Ok(url.to_string())
    }

    pub async fn set_profile(&self, user: &UserId, grade: u8) -> Result<UserProfile> {
        SchoolLevel::for_grade(grade)?;
        let profile = UserProfile {
            user: user.clone(),
            grade,
        };
        self.store.put_profile(&profile).await?;
        Ok(profile)
    }

    pub async fn request_refresh(&self, user: &UserId, provider: Provider) -> Result<EnqueueOutcome> {
        self.queue.enqueue(&FeedKey::new(user.clone(), provider)).await
    }

    pub async fn refresh_all(&self) -> Result<usize> {
        self.queue.refresh_all().await
    }

    pub fn reports(&self) -> broadcast::Receiver<RefreshReport> {
        self.queue.reports()
    }

    pub async fn request_schedule(&self, user: &UserId, date: NaiveDate) -> Result<DaySchedule> {
        let profile = self
            .store
            .get_profile(user)
            .await?
            .ok_or_else(|| Error::ProfileMissing(user.to_string()))?;

        let Some(day) = self.calendar.day_info(date) else {
            tracing::debug!("{} is not a school day", date);
            SchoolLevel::for_grade(profile.grade)?;
            return Ok(DaySchedule {
                date,
                day: None,
                entries: Vec::new(),
            });
        };

        let entries = self
            .composer
            .compose(&ScheduleRequest {
                user: user.clone(),
                grade: profile.grade,
                rotation_day: day.rotation_day,
                late_start: day.late_start,
                date,
            })
            .await?;
        Ok(DaySchedule {
            date,
            day: Some(day),
            entries,
        })
    }

    pub async fn resolve_alias(&self, provider: Provider, remote_class: &str) -> Result<ClassIdentity> {
        self.aliases.resolve(provider, remote_class).await
    }

    pub async fn create_alias(
        &self,
        provider: Provider,
        remote_class: &str,
        native_class_id: &str,
    ) -> Result<Uuid> {
        self.aliases
            .create(provider, remote_class, native_class_id)
            .await
    }

    pub async fn feed_state(&self, user: &UserId, provider: Provider) -> Result<Option<UserFeedState>> {
        self.store
            .get_user_queue_state(&FeedKey::new(user.clone(), provider))
            .await
    }

    pub async fn cached_feed(&self, user: &UserId, provider: Provider) -> Result<Arc<FeedSnapshot>> {
        self.cache
            .snapshot(&FeedKey::new(user.clone(), provider))
            .await
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
