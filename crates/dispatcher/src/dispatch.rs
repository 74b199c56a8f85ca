use std::sync::Arc;

use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{
    dispatch_notification, ConnectSummary, NotificationEvent, NotificationSink, Store, StreamCode,
    StreamMessage,
};
use cluster_infrastructure::FileLogDriver;
use tracing::{debug, info};

use crate::streams::{StreamTable, Subscription};

/// 主节点上的任务服务：领取、数据流写入、任务级推送流与通知
pub struct TaskDispatchService {
    store: Store,
    log_driver: Arc<FileLogDriver>,
    task_streams: Arc<StreamTable>,
    notifier: Arc<dyn NotificationSink>,
}

impl TaskDispatchService {
    pub fn new(
        store: Store,
        log_driver: Arc<FileLogDriver>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            log_driver,
            task_streams: StreamTable::new("task"),
            notifier,
        }
    }

    pub fn task_streams(&self) -> Arc<StreamTable> {
        Arc::clone(&self.task_streams)
    }

    /// 为节点领取一个任务
    ///
    /// 节点未激活、被禁用或执行器已满时返回 `None`，不视为错误。
    pub async fn fetch_task(&self, node_key: &str) -> ClusterResult<Option<i64>> {
        let node = self
            .store
            .nodes
            .find_by_key(node_key)
            .await?
            .ok_or_else(|| ClusterError::NodeNotFound {
                key: node_key.to_string(),
            })?;

        if !node.is_schedulable() {
            debug!("节点 {} 未激活或已禁用，跳过领取", node_key);
            return Ok(None);
        }

        let occupying = self.store.tasks.count_occupying(node.id).await?;
        if occupying >= i64::from(node.max_runners) {
            debug!(
                "节点 {} 已满载 ({}/{})",
                node_key, occupying, node.max_runners
            );
            return Ok(None);
        }

        let claimed = self.store.tasks.claim_next(node.id).await?;
        if let Some(task_id) = claimed {
            metrics::counter!("cluster_tasks_claimed_total", "node" => node.key.clone())
                .increment(1);
            info!("任务 {} 已分配给节点 {}", task_id, node_key);
        }
        Ok(claimed)
    }

    /// 处理数据流中的一条消息
    pub async fn ingest(
        &self,
        message: StreamMessage,
        summary: &mut ConnectSummary,
    ) -> ClusterResult<()> {
        summary.messages += 1;
        match message.code {
            StreamCode::InsertLogs => {
                let lines: Vec<String> = message
                    .data
                    .into_iter()
                    .map(|value| match value {
                        serde_json::Value::String(line) => line,
                        other => other.to_string(),
                    })
                    .collect();
                self.log_driver.append(message.task_id, &lines).await?;
                summary.logs += lines.len() as u64;
            }
            StreamCode::InsertData => {
                let inserted = self
                    .store
                    .results
                    .insert_many(message.task_id, &message.data)
                    .await?;
                if inserted > 0 {
                    self.store
                        .task_stats
                        .increment_result_count(message.task_id, inserted as i64)
                        .await?;
                }
                summary.records += inserted;
            }
        }
        Ok(())
    }

    /// 打开任务级推送流
    pub async fn subscribe_task(&self, task_id: i64) -> ClusterResult<Subscription> {
        self.store.tasks.get(task_id).await?;
        debug!("任务 {} 已订阅推送流", task_id);
        Ok(self.task_streams.add(task_id))
    }

    /// 按任务当前状态发出通知
    pub async fn send_notification(&self, task_id: i64) -> ClusterResult<()> {
        let task = self.store.tasks.get(task_id).await?;
        dispatch_notification(
            &self.notifier,
            NotificationEvent::TaskStatusChanged {
                task_id: task.id,
                spider_id: task.spider_id,
                status: task.status,
                error: task.error,
            },
        );
        Ok(())
    }
}
