mod cache;
mod handlers;
mod registry;
mod server;

use std::env;

use anyhow::Result;
use portal_schedule_core::config::SyncConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "portal_schedule_server=info,portal_schedule_core=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 获取Redis URL
    let redis_url = env::var("REDIS_URL")
        .map_err(|_| anyhow::anyhow!("REDIS_URL environment variable is required"))?;

    let config = SyncConfig::from_env()?;

    // 初始化同步服务
    let service = match registry::init_with_redis(&redis_url, config).await {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to initialize schedule service: {}", e);
            return Err(e.into());
        }
    };

    // 启动服务器
    server::start_server(service).await
}
