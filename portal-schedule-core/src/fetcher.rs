use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, Url};

use crate::{Error, Provider, Result, config::ProviderRule, config::SyncConfig};

/// 获取原始 feed 文本
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, provider: Provider, url: &str) -> Result<String>;
}

pub struct FeedFetcherBuilder {
    pub client_builder: ClientBuilder,
    portal: ProviderRule,
    canvas: ProviderRule,
}

/// 通过 HTTP 拉取 iCalendar feed，不做重试
pub struct FeedFetcher {
    client: Client,
    portal: ProviderRule,
    canvas: ProviderRule,
}

impl FeedFetcherBuilder {
    pub fn new(config: &SyncConfig) -> Self {
        let client_builder = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::ACCEPT,
                    reqwest::header::HeaderValue::from_static("text/calendar, */*;q=0.8"),
                );
                headers.insert(
                    reqwest::header::ACCEPT_ENCODING,
                    reqwest::header::HeaderValue::from_static(
                        "br;q=1.0, gzip;q=0.9, deflate;q=0.8",
                    ),
                );
                headers
            });

        Self {
            client_builder,
            portal: config.portal.clone(),
            canvas: config.canvas.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client_builder = self.client_builder.timeout(timeout);
        self
    }

    pub fn build(self) -> Result<FeedFetcher> {
        let client = self
            .client_builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(FeedFetcher {
            client,
            portal: self.portal,
            canvas: self.canvas,
        })
    }
}

impl FeedFetcher {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        FeedFetcherBuilder::new(config).build()
    }

    fn rule(&self, provider: Provider) -> &ProviderRule {
        match provider {
            Provider::Portal => &self.portal,
            Provider::Canvas => &self.canvas,
        }
    }

    /// 校验并标准化 feed URL，`webcal://` 改写为 `https://`
    pub fn validate_url(&self, provider: Provider, raw: &str) -> Result<Url> {
        normalize_feed_url(self.rule(provider), provider, raw)
    }

    fn handle_error_req(&self, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout
        } else {
            Error::FeedUnreachable(error.to_string())
        }
    }
}

#[async_trait]
impl FeedSource for FeedFetcher {
    async fn fetch(&self, provider: Provider, url: &str) -> Result<String> {
        let url = self.validate_url(provider, url)?;
        tracing::debug!("Fetching {} feed from {}", provider, url.host_str().unwrap_or(""));

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.handle_error_req(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::FeedUnreachable(format!("HTTP {}", status)));
        }

        response.text().await.map_err(|e| self.handle_error_req(e))
    }
}

pub fn normalize_feed_url(rule: &ProviderRule, provider: Provider, raw: &str) -> Result<Url> {
    let invalid = || Error::InvalidFeedUrl {
        provider,
        url: raw.to_string(),
    };

    let trimmed = raw.trim();
    let rewritten = match trimmed.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("webcal") => {
            format!("https://{}", rest)
        }
        Some((scheme, _)) if scheme.eq_ignore_ascii_case("https") => trimmed.to_string(),
        Some((scheme, _)) if scheme.eq_ignore_ascii_case("http") => trimmed.to_string(),
        _ => return Err(invalid()),
    };

    let url = Url::parse(&rewritten).map_err(|_| invalid())?;
    let host = url.host_str().ok_or_else(invalid)?;
    if !host.contains(rule.host.as_str()) || !url.path().contains(rule.path.as_str()) {
        return Err(invalid());
    }

    Ok(url)
}
