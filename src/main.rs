use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use harvester_core::config::AppConfig;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "harvester", version, about = "数据提取任务分发与插件协调系统")]
struct Cli {
    /// 配置文件路径
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "config/harvester.toml"
    )]
    config: String,

    /// 运行模式
    #[arg(short, long, value_enum, default_value_t = RunMode::All)]
    mode: RunMode,

    /// 插件ID，覆盖配置文件（仅worker模式）
    #[arg(long, value_name = "ID")]
    plugin_id: Option<String>,

    /// 日志级别，可被RUST_LOG覆盖
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// 日志输出格式
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunMode {
    Dispatcher,
    Worker,
    Api,
    All,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    info!(
        "启动数据提取任务分发系统，配置文件: {}，模式: {:?}",
        cli.config, cli.mode
    );

    let mut config = AppConfig::load(Some(&cli.config))
        .with_context(|| format!("加载配置文件失败: {}", cli.config))?;
    if let Some(id) = cli.plugin_id {
        info!("命令行指定插件ID: {id}");
        config.worker.plugin_id = id;
    }

    let mode = resolve_mode(cli.mode, &config)?;
    let app = Arc::new(Application::new(config, mode).await?);

    let shutdown_manager = ShutdownManager::new();
    let shutdown_rx = shutdown_manager.subscribe();
    let app_handle = tokio::spawn({
        let app = Arc::clone(&app);
        async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e}");
            }
        }
    });

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await.is_err() {
        warn!("应用关闭超时，强制退出");
    } else {
        info!("应用已优雅关闭");
    }

    info!("数据提取任务分发系统已退出");
    Ok(())
}

fn init_logging(log_level: &str, format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    }
    .context("初始化日志系统失败")
}

/// 校验所选模式在配置中可用
fn resolve_mode(mode: RunMode, config: &AppConfig) -> Result<AppMode> {
    match mode {
        RunMode::Dispatcher => {
            if !config.dispatcher.enabled {
                bail!("Dispatcher模式被禁用，请检查配置");
            }
            Ok(AppMode::Dispatcher)
        }
        RunMode::Worker => {
            if config.worker.plugin_id.is_empty() {
                bail!("Worker模式需要插件ID");
            }
            Ok(AppMode::Worker)
        }
        RunMode::Api => {
            if !config.api.enabled {
                bail!("API模式被禁用，请检查配置");
            }
            Ok(AppMode::Api)
        }
        RunMode::All => Ok(AppMode::All),
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装Ctrl+C信号处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装SIGTERM信号处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
