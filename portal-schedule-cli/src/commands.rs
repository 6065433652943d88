use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use portal_schedule_core::{
    EntryLabel, EntrySource, FeedKey, MergedScheduleEntry, Provider, UserId,
    config::SyncConfig,
    fetcher::{FeedFetcherBuilder, FeedSource},
    ics::FeedParser,
    queue::{RefreshOutcome, RefreshReport},
    service::{ScheduleService, load_templates},
};
use tokio::sync::broadcast;

/// 拉取并解析 feed 命令
pub async fn fetch_command(
    config: &SyncConfig,
    provider: String,
    url: String,
    timeout: Option<u64>,
) -> Result<()> {
    let provider: Provider = provider.parse()?;

    let mut builder = FeedFetcherBuilder::new(config);
    if let Some(secs) = timeout {
        builder = builder.with_timeout(Duration::from_secs(secs));
    }
    let fetcher = builder.build()?;

    println!("拉取 {} feed...", provider);
    let text = fetcher.fetch(provider, &url).await?;
    let parsed = FeedParser::new(provider, UserId::new("cli"), config.timezone()).parse(&text)?;

    println!("✓ 解析出 {} 个日程", parsed.events.len());
    for event in &parsed.events {
        let start = event.start.with_timezone(&config.timezone());
        let end = event.end.with_timezone(&config.timezone());
        println!(
            "  {} - {}  {}{}",
            start.format("%Y-%m-%d %H:%M"),
            end.format("%H:%M"),
            event.title,
            event
                .class_ref
                .as_ref()
                .map(|class| format!("  <{}>", class))
                .unwrap_or_default()
        );
    }

    if parsed.skipped > 0 {
        println!("⚠ 跳过了 {} 个无法解析的组件:", parsed.skipped);
        for fragment in &parsed.fragments {
            println!("    {}", fragment);
        }
    }

    Ok(())
}

/// 订阅命令
pub async fn subscribe_command(
    service: &ScheduleService,
    user: String,
    provider: String,
    url: String,
) -> Result<()> {
    let provider: Provider = provider.parse()?;
    let url = service.subscribe(&UserId::new(user), provider, &url).await?;
    println!("✓ 已保存 {} 订阅: {}", provider, url);
    Ok(())
}

/// 设置年级命令
pub async fn profile_command(service: &ScheduleService, user: String, grade: u8) -> Result<()> {
    let profile = service.set_profile(&UserId::new(user), grade).await?;
    println!("✓ {} 的年级已设为 {}", profile.user, profile.grade);
    Ok(())
}

/// 刷新命令，等待所有入队的刷新结束
pub async fn refresh_command(
    service: &ScheduleService,
    user: String,
    provider: Option<String>,
) -> Result<()> {
    let user = UserId::new(user);
    let providers = match provider {
        Some(name) => vec![name.parse::<Provider>()?],
        None => Provider::ALL.to_vec(),
    };

    let mut reports = service.reports();
    let mut pending = Vec::new();
    for provider in providers {
        if service.feed_state(&user, provider).await?.is_none() {
            println!("  {} 未订阅，跳过", provider);
            continue;
        }
        let outcome = service.request_refresh(&user, provider).await?;
        tracing::debug!("Enqueue {} -> {:?}", provider, outcome);
        pending.push(FeedKey::new(user.clone(), provider));
    }

    if pending.is_empty() {
        anyhow::bail!("用户 {} 没有任何订阅", user);
    }

    // 每个 provider 一个 worker，并行执行，总等待时间按单次超时计
    let wait = service.config().refresh_timeout() * 2;
    while !pending.is_empty() {
        let report = tokio::time::timeout(wait, next_report(&mut reports))
            .await
            .map_err(|_| anyhow::anyhow!("等待刷新结果超时"))??;
        if let Some(index) = pending.iter().position(|key| *key == report.key) {
            pending.swap_remove(index);
            print_report(&report);
        }
    }

    Ok(())
}

async fn next_report(reports: &mut broadcast::Receiver<RefreshReport>) -> Result<RefreshReport> {
    loop {
        match reports.recv().await {
            Ok(report) => return Ok(report),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("刷新队列已关闭"),
        }
    }
}

fn print_report(report: &RefreshReport) {
    match &report.outcome {
        RefreshOutcome::Success {
            events,
            skipped,
            unaliased,
        } => {
            println!(
                "✓ {} 刷新成功: {} 个日程, 跳过 {} 个组件",
                report.key.provider, events, skipped
            );
            if !unaliased.is_empty() {
                println!("  未建立别名的课程:");
                for class in unaliased {
                    println!("    {}", class);
                }
            }
        }
        RefreshOutcome::Failed { error } => {
            println!("✗ {} 刷新失败: {}（保留上次的缓存）", report.key.provider, error);
        }
    }
}

/// 打印课表命令
pub async fn schedule_command(
    service: &ScheduleService,
    user: String,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let timezone = service.config().timezone();
    let date = match date {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("无效的日期 {}: {}", raw, e))?,
        None => Utc::now().with_timezone(&timezone).date_naive(),
    };

    let schedule = service.request_schedule(&UserId::new(user), date).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&schedule)?);
        return Ok(());
    }

    let Some(day) = schedule.day else {
        println!("{} 不是上课日", date);
        return Ok(());
    };
    println!(
        "{} 轮换日 {}{}",
        date,
        day.rotation_day,
        if day.late_start { "（推迟上课）" } else { "" }
    );
    for entry in &schedule.entries {
        println!("  {}", format_entry(entry));
    }

    Ok(())
}

fn format_entry(entry: &MergedScheduleEntry) -> String {
    let label = match &entry.label {
        EntryLabel::Block(code) => code.clone(),
        EntryLabel::Class(identity) if identity.is_native() => identity.to_string(),
        EntryLabel::Class(identity) => format!("{}?", identity),
    };
    let marker = match entry.source {
        EntrySource::Generic => ' ',
        EntrySource::Feed => '*',
    };
    format!(
        "{} {}-{} {:<8} {}{}",
        marker,
        entry.start.format("%H:%M"),
        entry.end.format("%H:%M"),
        label,
        entry.title,
        entry
            .location
            .as_ref()
            .map(|location| format!(" @ {}", location))
            .unwrap_or_default()
    )
}

/// 别名查询命令
pub async fn alias_resolve_command(
    service: &ScheduleService,
    provider: String,
    remote: String,
) -> Result<()> {
    let provider: Provider = provider.parse()?;
    let identity = service.resolve_alias(provider, &remote).await?;
    if identity.is_native() {
        println!("{} -> {}", remote, identity);
    } else {
        println!("{} 尚未建立别名", remote);
    }
    Ok(())
}

/// 新建别名命令
pub async fn alias_create_command(
    service: &ScheduleService,
    provider: String,
    remote: String,
    native: String,
) -> Result<()> {
    let provider: Provider = provider.parse()?;
    let id = service.create_alias(provider, &remote, &native).await?;
    println!("✓ 已创建别名 {} -> {} ({})", remote, native, id);
    Ok(())
}

/// 列出通用课表命令
pub fn templates_command(
    config: &SyncConfig,
    grade: Option<u8>,
    rotation_day: u8,
    late_start: bool,
) -> Result<()> {
    let templates = load_templates(config)?;

    let Some(grade) = grade else {
        println!("可用的通用课表:");
        for key in templates.keys() {
            println!("  {}", key);
        }
        return Ok(());
    };

    println!(
        "{} 年级 轮换日 {}{}:",
        grade,
        rotation_day,
        if late_start { "（推迟上课）" } else { "" }
    );
    for block in templates.blocks_for(grade, rotation_day, late_start)? {
        println!(
            "  {}-{} {:<6} {}",
            block.start.format("%H:%M"),
            block.end.format("%H:%M"),
            block.code,
            block.display_name()
        );
    }

    Ok(())
}
