use async_trait::async_trait;
use cluster_domain::{NotificationEvent, NotificationSink};
use tracing::info;

/// 以结构化日志形式输出通知
#[derive(Debug, Default, Clone)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, event: NotificationEvent) {
        match &event {
            NotificationEvent::NodeStatusChanged {
                node_key,
                node_name,
                status,
            } => {
                info!(
                    event = "node_status_changed",
                    node_key = %node_key,
                    node_name = %node_name,
                    status = %status,
                    "Node status changed"
                );
            }
            NotificationEvent::TaskStatusChanged {
                task_id,
                spider_id,
                status,
                error,
            } => {
                info!(
                    event = "task_status_changed",
                    task_id = *task_id,
                    spider_id = *spider_id,
                    status = %status,
                    error = %error,
                    "Task status changed"
                );
            }
        }
    }
}
