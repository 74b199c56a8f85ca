use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use cluster_core::config::AppConfig;
use cluster_core::logging::init_logging;
use tokio::signal;
use tracing::{error, info, warn};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("cluster")
        .version("1.0.0")
        .about("分布式爬虫任务集群")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认路径查找"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式，缺省时取配置中的 node.is_master")
                .value_parser(["master", "worker"]),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| {
            format!("加载配置失败: {}", config_path.map_or("<默认>", String::as_str))
        })?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.log.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.log.format = format.clone();
    }
    init_logging(&config.log.level, &config.log.format)?;

    let mode = match matches.get_one::<String>("mode").map(String::as_str) {
        Some("master") => AppMode::Master,
        Some("worker") => AppMode::Worker,
        Some(other) => return Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        None if config.node.is_master => AppMode::Master,
        None => AppMode::Worker,
    };

    info!("启动分布式爬虫任务集群");
    info!("运行模式: {:?}", mode);

    let app = Application::new(config, mode).await?;
    let shutdown_manager = ShutdownManager::new();
    let mut internal_shutdown = shutdown_manager.subscribe().await;

    let app_handle = {
        let shutdown_manager = shutdown_manager.clone();
        tokio::spawn(async move {
            let result = app.run(&shutdown_manager).await;
            if let Err(e) = &result {
                error!("应用运行失败: {e:#}");
            }
            // 启动失败时通知主循环退出
            shutdown_manager.shutdown().await;
            result
        })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        _ = internal_shutdown.recv() => {
            warn!("组件请求关闭");
        }
    }
    shutdown_manager.shutdown().await;

    let exit = match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(anyhow::anyhow!("应用任务异常结束: {e}")),
        Err(_) => {
            warn!("应用关闭超时，强制退出");
            Ok(())
        }
    };

    info!("分布式爬虫任务集群已退出");
    exit
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
