use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    node::{NodeConfig, ServerConfig},
    observability::{LogConfig, ObservabilityConfig},
    runtime::{FetcherConfig, MonitorConfig, RunnerConfig, SchedulerConfig, TransportConfig},
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub fetcher: FetcherConfig,
    pub runner: RunnerConfig,
    pub monitor: MonitorConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
    pub log: LogConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration (serde defaults of every section)
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: CLUSTER__, separator: __)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/cluster.toml",
                "cluster.toml",
                "/etc/cluster/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("CLUSTER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.node.validate().context("节点配置验证失败")?;
        self.server.validate().context("控制平面地址配置验证失败")?;
        self.database.validate().context("数据库配置验证失败")?;
        self.fetcher.validate().context("任务领取配置验证失败")?;
        self.runner.validate().context("任务执行配置验证失败")?;
        self.monitor.validate().context("监控配置验证失败")?;
        self.scheduler.validate().context("调度配置验证失败")?;
        self.transport.validate().context("控制平面客户端配置验证失败")?;
        self.log.validate().context("日志配置验证失败")?;
        Ok(())
    }
}
