use std::sync::Arc;

use async_trait::async_trait;
use cluster_core::ClusterResult;
use serde::Serialize;

use crate::entities::{NodeStatus, TaskStatus};

/// 状态变化通知
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    NodeStatusChanged {
        node_key: String,
        node_name: String,
        status: NodeStatus,
    },
    TaskStatusChanged {
        task_id: i64,
        spider_id: i64,
        status: TaskStatus,
        error: String,
    },
}

/// 通知投递，调用方不等待结果
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}

/// 在后台投递通知
pub fn dispatch_notification(sink: &Arc<dyn NotificationSink>, event: NotificationEvent) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        sink.notify(event).await;
    });
}

/// 本节点的任务取消入口，主节点的调度器取消本地任务时使用
#[async_trait]
pub trait LocalTaskCanceller: Send + Sync {
    async fn cancel_local(&self, task_id: i64, force: bool) -> ClusterResult<()>;
}
