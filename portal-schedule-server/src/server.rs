use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Result;
use portal_schedule_core::{
    queue::{RefreshOutcome, RefreshReport},
    service::ScheduleService,
};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};

use crate::handlers::create_app;

pub async fn start_server(service: Arc<ScheduleService>) -> Result<()> {
    let app = create_app(service.clone());

    // 从环境变量获取端口，默认为3000
    let port = env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse::<u16>()
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("Portal Schedule Server starting on {}", addr);

    let reporter = spawn_report_logger(service.reports());
    let ticker = spawn_periodic_refresh(service.clone());

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Waiting for in-flight refreshes");
    if let Some(ticker) = ticker {
        ticker.abort();
    }
    service.shutdown().await;
    reporter.abort();

    Ok(())
}

/// 定时把所有订阅重新入队
fn spawn_periodic_refresh(service: Arc<ScheduleService>) -> Option<JoinHandle<()>> {
    let period = service.config().refresh_interval()?;
    tracing::info!("Refreshing all feeds every {}s", period.as_secs());

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // 第一次 tick 立即返回，启动时不刷新
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = service.refresh_all().await {
                tracing::error!("Periodic refresh failed: {}", e);
            }
        }
    }))
}

fn spawn_report_logger(mut reports: broadcast::Receiver<RefreshReport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reports.recv().await {
                Ok(RefreshReport {
                    key,
                    outcome: RefreshOutcome::Success { unaliased, .. },
                }) if !unaliased.is_empty() => {
                    tracing::info!("{} has unaliased classes: {}", key, unaliased.join(", "));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Report logger skipped {} refresh reports", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
