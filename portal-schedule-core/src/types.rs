use std::{fmt, str::FromStr};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 外部日历来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Portal,
    Canvas,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Portal, Provider::Canvas];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Portal => "portal",
            Provider::Canvas => "canvas",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "portal" => Ok(Provider::Portal),
            "canvas" => Ok(Provider::Canvas),
            other => Err(crate::Error::Config(format!("Unknown provider '{}'", other))),
        }
    }
}

/// 用户标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// (用户, provider) 组合，缓存与刷新队列的寻址单位
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedKey {
    pub user: UserId,
    pub provider: Provider,
}

impl FeedKey {
    pub fn new(user: UserId, provider: Provider) -> Self {
        Self { user, provider }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.provider)
    }
}

/// 从 feed 解析出的单个日程
///
/// 创建后不再修改，下一次刷新整体替换。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub provider: Provider,
    /// feed 中的 UID
    pub remote_uid: String,
    pub title: String,
    pub location: Option<String>,
    /// 远端课程标识（未经别名解析）
    pub class_ref: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub is_all_day: bool,
    pub owner: UserId,
}

impl Event {
    /// 用于别名解析的远端字符串，没有课程引用时退回标题
    pub fn class_key(&self) -> &str {
        self.class_ref.as_deref().unwrap_or(&self.title)
    }
}

/// 某个用户某个 provider 的最近一次完整快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub events: Vec<Event>,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// 解析时跳过的组件数
    pub skipped: usize,
}

/// provider 课程名到本地课程的映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub id: Uuid,
    pub provider: Provider,
    pub remote_class: String,
    pub native_class_id: String,
}

/// 别名解析结果
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ClassIdentity {
    /// 已有别名，指向本地课程
    Native(String),
    /// 尚未建立别名，原样返回远端字符串
    Unaliased(String),
}

impl ClassIdentity {
    pub fn as_str(&self) -> &str {
        match self {
            ClassIdentity::Native(id) | ClassIdentity::Unaliased(id) => id,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, ClassIdentity::Native(_))
    }
}

impl fmt::Display for ClassIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 用户 feed 的持久化状态
///
/// `queued` 在进入刷新队列时置为 true，本次刷新结束（成功或失败）后置回 false。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFeedState {
    pub user: UserId,
    pub provider: Provider,
    pub feed_url: String,
    pub queued: bool,
    /// 最近一次置位 `queued` 或开始刷新的时间，共用存储的其他进程据此判断标记是否过期
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl UserFeedState {
    pub fn new(key: FeedKey, feed_url: impl Into<String>) -> Self {
        Self {
            user: key.user,
            provider: key.provider,
            feed_url: feed_url.into(),
            queued: false,
            queued_at: None,
            last_refreshed_at: None,
            last_error: None,
        }
    }

    pub fn key(&self) -> FeedKey {
        FeedKey::new(self.user.clone(), self.provider)
    }
}

/// 用户资料，目前只需要年级
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user: UserId,
    pub grade: u8,
}

/// 合并结果中条目的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    Generic,
    Feed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum EntryLabel {
    Block(String),
    Class(ClassIdentity),
}

/// 合并后的一条日程，按请求生成，不持久化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedScheduleEntry {
    pub label: EntryLabel,
    pub title: String,
    pub location: Option<String>,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub source: EntrySource,
}

impl MergedScheduleEntry {
    /// 半开区间 `[start, end)` 是否相交
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}
