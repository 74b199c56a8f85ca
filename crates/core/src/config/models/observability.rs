use serde::{Deserialize, Serialize};

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 任务日志文件根目录
    pub dir: String,
    pub level: String,
    /// "json" 或 "pretty"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "./logs".to_string(),
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.level));
        }

        if !["json", "pretty"].contains(&self.format.as_str()) {
            return Err(anyhow::anyhow!("不支持的日志格式: {}", self.format));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
        }
    }
}
