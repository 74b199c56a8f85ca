use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::ExponentialBackoff;

/// 任务领取循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub fetch_interval_millis: u64,
    pub report_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            fetch_interval_millis: 1000,
            report_interval_seconds: 5,
            heartbeat_interval_seconds: 15,
        }
    }
}

impl FetcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fetch_interval_millis == 0 {
            return Err(anyhow::anyhow!("任务领取间隔必须大于0"));
        }
        if self.report_interval_seconds == 0 {
            return Err(anyhow::anyhow!("状态上报间隔必须大于0"));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        Ok(())
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_millis)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }
}

/// 任务执行器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// 爬虫工作目录根路径；主节点上同时是文件同步的来源
    pub workspace_dir: String,
    pub health_check_interval_millis: u64,
    pub cancel_timeout_seconds: u64,
    pub log_batch_size: usize,
    pub log_flush_interval_millis: u64,
    pub sync_concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace_dir: "./workspace".to_string(),
            health_check_interval_millis: 1000,
            cancel_timeout_seconds: 5,
            log_batch_size: 100,
            log_flush_interval_millis: 200,
            sync_concurrency: 10,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workspace_dir.is_empty() {
            return Err(anyhow::anyhow!("工作目录不能为空"));
        }
        if self.health_check_interval_millis == 0 {
            return Err(anyhow::anyhow!("健康检查间隔必须大于0"));
        }
        if self.cancel_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("取消超时时间必须大于0"));
        }
        if self.log_batch_size == 0 {
            return Err(anyhow::anyhow!("日志批量大小必须大于0"));
        }
        if self.sync_concurrency == 0 {
            return Err(anyhow::anyhow!("文件同步并发数必须大于0"));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_millis)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_seconds)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_millis)
    }
}

/// 主节点监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_seconds: u64,
    pub offline_retry_attempts: u32,
    pub offline_retry_interval_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 15,
            offline_retry_attempts: 3,
            offline_retry_interval_seconds: 1,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("监控间隔必须大于0"));
        }
        if self.offline_retry_attempts == 0 {
            return Err(anyhow::anyhow!("离线标记尝试次数必须大于0"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// 离线降级写入的重试策略
    pub fn offline_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::constant(
            Duration::from_secs(self.offline_retry_interval_seconds),
            self.offline_retry_attempts.saturating_sub(1),
        )
    }
}

/// 任务队列清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub cleanup_interval_seconds: u64,
    pub retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 1800,
            retention_days: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cleanup_interval_seconds == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }
        if self.retention_days <= 0 {
            return Err(anyhow::anyhow!("任务保留天数必须大于0"));
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// 控制平面客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub initial_backoff_seconds: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_seconds: u64,
    pub max_elapsed_seconds: u64,
    pub monitor_interval_millis: u64,
    pub request_timeout_seconds: u64,
    /// 超过该时长没有成功调用，连接状态从 Ready 变为 Idle
    pub idle_timeout_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_backoff_seconds: 5,
            backoff_multiplier: 2.0,
            max_backoff_seconds: 60,
            max_elapsed_seconds: 600,
            monitor_interval_millis: 1000,
            request_timeout_seconds: 30,
            idle_timeout_seconds: 300,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1"));
        }
        if self.monitor_interval_millis == 0 {
            return Err(anyhow::anyhow!("连接状态采样间隔必须大于0"));
        }
        if self.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("请求超时时间必须大于0"));
        }
        Ok(())
    }

    pub fn reconnect_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_secs(self.initial_backoff_seconds),
            self.backoff_multiplier,
        )
        .with_max_interval(Duration::from_secs(self.max_backoff_seconds))
        .with_max_elapsed_time(Duration::from_secs(self.max_elapsed_seconds))
        .with_randomization_factor(0.1)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}
