use thiserror::Error;

/// 集群错误类型定义
///
/// 分为四类：网络/传输类（可重试）、进程/任务类（记录到任务上）、
/// 协调类（返回给取消调用方）以及致命类（由进程入口处理）。
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("task not found: {id}")]
    TaskNotFound { id: i64 },

    #[error("node not found: {key}")]
    NodeNotFound { key: String },

    #[error("spider not found: {id}")]
    SpiderNotFound { id: i64 },

    /// 取消请求到达了没有该任务执行上下文的节点
    #[error("task {id} is not running on this node")]
    TaskNotRunning { id: i64 },

    #[error("process still exists: pid={pid}")]
    ProcessStillExists { pid: u32 },

    #[error("process lost")]
    ProcessLost,

    #[error("unauthorized")]
    Unauthorized,

    #[error("network error: {0}")]
    Network(String),

    #[error("control plane error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task execution error: {0}")]
    TaskExecution(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// 是否属于可通过重连/重试恢复的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Network(_) | ClusterError::Transport(_))
    }

    /// 是否为"未找到"类错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClusterError::TaskNotFound { .. }
                | ClusterError::NodeNotFound { .. }
                | ClusterError::SpiderNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ClusterError::Network("refused".into()).is_transient());
        assert!(!ClusterError::Unauthorized.is_transient());
        assert!(ClusterError::TaskNotFound { id: 1 }.is_not_found());
        assert!(!ClusterError::TaskNotRunning { id: 1 }.is_not_found());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ClusterError::ProcessStillExists { pid: 42 }.to_string(),
            "process still exists: pid=42"
        );
        assert_eq!(ClusterError::ProcessLost.to_string(), "process lost");
        assert_eq!(
            ClusterError::TaskNotRunning { id: 7 }.to_string(),
            "task 7 is not running on this node"
        );
    }
}
