use thiserror::Error;

use crate::Provider;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid {provider} feed URL: {url}")]
    InvalidFeedUrl { provider: Provider, url: String },

    #[error("Feed unreachable: {0}")]
    FeedUnreachable(String),

    /// 整个 feed 无法解析；`skipped` 为已跳过的组件数
    #[error("Feed parse error near `{fragment}` ({skipped} components skipped)")]
    FeedParse { fragment: String, skipped: usize },

    #[error("Alias already exists for {provider}: {remote}")]
    DuplicateAlias { provider: Provider, remote: String },

    #[error("Unsupported school level for grade {0}")]
    UnsupportedSchoolLevel(u8),

    #[error("Rotation day must be between 1 and 6, got {0}")]
    InvalidRotationDay(u8),

    #[error("No schedule template for {0}")]
    TemplateMissing(String),

    #[error("No {provider} feed subscribed for user {user}")]
    NotSubscribed { user: String, provider: Provider },

    #[error("No grade on file for user {0}")]
    ProfileMissing(String),

    #[error("Refresh queue is shut down")]
    QueueClosed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network timeout")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// feed 获取/解析阶段的错误，刷新失败但不影响缓存
    pub fn is_feed_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFeedUrl { .. }
                | Self::FeedUnreachable(_)
                | Self::FeedParse { .. }
                | Self::Timeout
                | Self::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
