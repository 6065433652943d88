mod cache;
mod commands;
mod registry;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use portal_schedule_core::config::SyncConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "portal-schedule")]
#[command(about = "校园门户日历同步与课表合并工具")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 启用详细日志
    #[arg(short, long)]
    verbose: bool,

    /// 本地数据目录，默认为系统缓存目录
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// 直接拉取并解析一个 feed，不写入存储
    Fetch {
        /// 数据来源 (portal, canvas)
        #[arg(short, long)]
        provider: String,

        /// feed 地址，支持 webcal://
        #[arg(short, long)]
        url: String,

        /// 请求超时（秒）
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// 保存用户的 feed 订阅地址
    Subscribe {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        provider: String,

        #[arg(long)]
        url: String,
    },

    /// 设置用户年级
    Profile {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        grade: u8,
    },

    /// 刷新用户的 feed 并等待结果
    Refresh {
        #[arg(short, long)]
        user: String,

        /// 缺省时刷新全部订阅
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// 打印某天的合并课表
    Schedule {
        #[arg(short, long)]
        user: String,

        /// 日期（格式：YYYY-MM-DD），缺省为今天
        #[arg(short, long)]
        date: Option<String>,

        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },

    /// 别名管理相关命令
    Alias {
        #[command(subcommand)]
        action: AliasCommands,
    },

    /// 列出通用课表，或打印某个年级某个轮换日的时段
    Templates {
        #[arg(short, long)]
        grade: Option<u8>,

        #[arg(short = 'r', long, default_value = "1")]
        rotation_day: u8,

        #[arg(long)]
        late_start: bool,
    },
}

#[derive(Subcommand)]
enum AliasCommands {
    /// 查询远端课程名对应的本地课程
    Resolve {
        #[arg(short, long)]
        provider: String,

        /// 远端课程名
        remote: String,
    },

    /// 新建别名
    Create {
        #[arg(short, long)]
        provider: String,

        /// 远端课程名
        remote: String,

        /// 本地课程 ID
        native: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 设置日志级别
    let log_level = if cli.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "portal_schedule_cli={0},portal_schedule_core={0}",
                    log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env()?;

    // 这些命令不需要存储
    match cli.command {
        Commands::Fetch {
            provider,
            url,
            timeout,
        } => return commands::fetch_command(&config, provider, url, timeout).await,
        Commands::Templates {
            grade,
            rotation_day,
            late_start,
        } => return commands::templates_command(&config, grade, rotation_day, late_start),
        _ => {}
    }

    let service = registry::init(config, cli.data_dir).await?;
    let result = match cli.command {
        Commands::Subscribe {
            user,
            provider,
            url,
        } => commands::subscribe_command(&service, user, provider, url).await,

        Commands::Profile { user, grade } => {
            commands::profile_command(&service, user, grade).await
        }

        Commands::Refresh { user, provider } => {
            commands::refresh_command(&service, user, provider).await
        }

        Commands::Schedule { user, date, json } => {
            commands::schedule_command(&service, user, date, json).await
        }

        Commands::Alias { action } => match action {
            AliasCommands::Resolve { provider, remote } => {
                commands::alias_resolve_command(&service, provider, remote).await
            }
            AliasCommands::Create {
                provider,
                remote,
                native,
            } => commands::alias_create_command(&service, provider, remote, native).await,
        },

        Commands::Fetch { .. } | Commands::Templates { .. } => Ok(()),
    };

    service.shutdown().await;
    result
}
