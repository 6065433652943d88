use std::{env, path::PathBuf, str::FromStr, time::Duration};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{Error, Provider, Result};

/// 每个 provider 的 feed URL 校验规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRule {
    /// host 必须包含的子串
    pub host: String,
    /// path 必须包含的子串
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 单次 HTTP 请求超时（秒）
    pub request_timeout_secs: u64,
    /// 单次刷新（获取 + 存储）的总超时（秒）
    pub refresh_timeout_secs: u64,
    pub user_agent: String,
    /// 学校所在的 IANA 时区，例如 `America/Chicago`
    pub school_timezone: String,
    pub portal: ProviderRule,
    pub canvas: ProviderRule,
    pub templates_path: Option<PathBuf>,
    pub rotation_calendar_path: Option<PathBuf>,
    /// 停课日 ICS，加入轮换日历的停课日
    pub no_school_ics_path: Option<PathBuf>,
    /// 定时重新入队所有订阅的间隔（秒），0 表示关闭
    pub refresh_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            refresh_timeout_secs: 60,
            user_agent: format!("portal-schedule/{}", env!("CARGO_PKG_VERSION")),
            school_timezone: "America/Chicago".to_string(),
            portal: ProviderRule {
                host: "myschoolapp.com".to_string(),
                path: "/podium/feed/".to_string(),
            },
            canvas: ProviderRule {
                host: "instructure.com".to_string(),
                path: "/feeds/calendars/".to_string(),
            },
            templates_path: None,
            rotation_calendar_path: None,
            no_school_ics_path: None,
            refresh_interval_secs: 60 * 60 * 6,
        }
    }
}

impl SyncConfig {
    /// 从环境变量覆盖默认配置
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = env_string("PORTAL_HOST") {
            config.portal.host = host;
        }
        if let Some(host) = env_string("CANVAS_HOST") {
            config.canvas.host = host;
        }
        if let Some(secs) = env_parse("FEED_TIMEOUT_SECS")? {
            config.request_timeout_secs = secs;
        }
        if let Some(secs) = env_parse("REFRESH_TIMEOUT_SECS")? {
            config.refresh_timeout_secs = secs;
        }
        if let Some(name) = env_string("SCHOOL_TZ") {
            config.school_timezone = name;
        }
        if let Some(secs) = env_parse("REFRESH_INTERVAL_SECS")? {
            config.refresh_interval_secs = secs;
        }
        config.templates_path = env_string("TEMPLATES_PATH").map(PathBuf::from);
        config.rotation_calendar_path = env_string("ROTATION_CALENDAR_PATH").map(PathBuf::from);
        config.no_school_ics_path = env_string("NO_SCHOOL_ICS_PATH").map(PathBuf::from);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(err) = self.school_timezone.parse::<Tz>() {
            return Err(Error::Config(format!(
                "Unknown school timezone '{}': {}",
                self.school_timezone, err
            )));
        }
        if self.refresh_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(Error::Config("Timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn rule(&self, provider: Provider) -> &ProviderRule {
        match provider {
            Provider::Portal => &self.portal,
            Provider::Canvas => &self.canvas,
        }
    }

    /// 学校时区；未通过 `validate` 的名字退回 UTC
    pub fn timezone(&self) -> Tz {
        self.school_timezone.parse().unwrap_or(Tz::UTC)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env_string(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::Config(format!("Invalid {}='{}': {}", name, raw, e)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Offset, TimeZone, Utc};

    #[test]
    fn default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timezone(), chrono_tz::America::Chicago);
        assert_eq!(config.rule(Provider::Canvas).host, "instructure.com");
    }

    #[test]
    fn school_timezone_follows_daylight_saving() {
        let tz = SyncConfig::default().timezone();
        let september = Utc.with_ymd_and_hms(2024, 9, 16, 13, 30, 0).unwrap();
        let december = Utc.with_ymd_and_hms(2024, 12, 16, 13, 30, 0).unwrap();
        let offset = |at: chrono::DateTime<Utc>| {
            at.with_timezone(&tz).offset().fix().local_minus_utc()
        };
        assert_eq!(offset(september), -5 * 3600);
        assert_eq!(offset(december), -6 * 3600);
    }

    #[test]
    fn rejects_unknown_timezone() {
        let config = SyncConfig {
            school_timezone: "Mars/Olympus_Mons".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_interval_disables_periodic_refresh() {
        let config = SyncConfig {
            refresh_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.refresh_interval().is_none());
    }
}
