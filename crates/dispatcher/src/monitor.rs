use std::sync::Arc;

use cluster_core::config::MonitorConfig;
use cluster_core::{backoff, ClusterResult};
use cluster_domain::{NodeRecord, NodeStatus, Store};
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::registry::NodeRegistry;

/// 主节点巡检：刷新自身状态，探测工作节点，维护执行器计数
pub struct MasterMonitor {
    store: Store,
    registry: Arc<NodeRegistry>,
    master_key: String,
    config: MonitorConfig,
}

impl MasterMonitor {
    pub fn new(
        store: Store,
        registry: Arc<NodeRegistry>,
        master_key: impl Into<String>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            master_key: master_key.into(),
            config,
        }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "主节点巡检启动，间隔 {:?}",
            self.config.interval()
        );
        let mut interval = tokio::time::interval(self.config.interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("节点巡检失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("节点巡检收到关闭信号");
                    break;
                }
            }
        }
    }

    /// 执行一轮巡检
    pub async fn tick(&self) -> ClusterResult<()> {
        self.registry.heartbeat(&self.master_key).await?;

        let peers: Vec<NodeRecord> = self
            .store
            .nodes
            .list_active()
            .await?
            .into_iter()
            .filter(|node| node.key != self.master_key)
            .collect();

        debug!("检查 {} 个工作节点", peers.len());
        let results = join_all(peers.iter().map(|node| self.check_node(node))).await;
        for (node, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                warn!("检查节点 {} 失败: {}", node.key, e);
            }
        }
        Ok(())
    }

    async fn check_node(&self, node: &NodeRecord) -> ClusterResult<()> {
        let reachable = if self.registry.has_stream(node.id) {
            match self.registry.ping(node.id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("向节点 {} 发送 ping 失败: {}", node.key, e);
                    false
                }
            }
        } else {
            debug!("节点 {} 没有推送流", node.key);
            false
        };

        if !reachable {
            return self.demote(node).await;
        }

        let occupying = self.store.tasks.count_occupying(node.id).await?;
        let current = i32::try_from(occupying).unwrap_or(i32::MAX);
        self.store
            .nodes
            .update_current_runners(node.id, current)
            .await?;
        metrics::gauge!("cluster_node_current_runners", "node" => node.key.clone())
            .set(occupying as f64);
        Ok(())
    }

    async fn demote(&self, node: &NodeRecord) -> ClusterResult<()> {
        if node.status == NodeStatus::Offline {
            return Ok(());
        }

        let mut policy = self.config.offline_backoff();
        backoff::retry(&mut policy, "标记节点离线", || {
            self.store.nodes.mark_offline(node.id)
        })
        .await?;

        warn!("节点 {} 已离线", node.key);
        let mut offline = node.clone();
        offline.status = NodeStatus::Offline;
        self.registry.notify_status(&offline);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_store, RecordingSink};
    use cluster_domain::{NotificationEvent, RegisterRequest, Task};

    fn request(key: &str, is_master: bool) -> RegisterRequest {
        RegisterRequest {
            node_key: key.to_string(),
            node_name: key.to_string(),
            max_runners: 4,
            is_master,
        }
    }

    #[tokio::test]
    async fn test_node_without_stream_goes_offline() {
        let (_db, store) = test_store().await;
        let sink = RecordingSink::new();
        let registry = Arc::new(NodeRegistry::new(store.clone(), sink.clone()));
        registry.register(&request("master", true)).await.unwrap();
        registry.register(&request("w1", false)).await.unwrap();
        sink.wait_for(2).await;

        let monitor = MasterMonitor::new(
            store.clone(),
            Arc::clone(&registry),
            "master",
            MonitorConfig::default(),
        );
        monitor.tick().await.unwrap();

        let w1 = store.nodes.find_by_key("w1").await.unwrap().unwrap();
        assert_eq!(w1.status, NodeStatus::Offline);
        let master = store.nodes.find_by_key("master").await.unwrap().unwrap();
        assert!(master.is_online());

        let events = sink.wait_for(3).await;
        assert!(matches!(
            events.last(),
            Some(NotificationEvent::NodeStatusChanged { status: NodeStatus::Offline, .. })
        ));

        // 已离线的节点不再重复通知
        monitor.tick().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(sink.events().len(), 3);
    }

    #[tokio::test]
    async fn test_reachable_node_runner_count_refreshed() {
        let (_db, store) = test_store().await;
        let registry = Arc::new(NodeRegistry::new(store.clone(), RecordingSink::new()));
        registry.register(&request("master", true)).await.unwrap();
        let w1 = registry.register(&request("w1", false)).await.unwrap();
        let mut subscription = registry.subscribe("w1").await.unwrap();
        let drain = tokio::spawn(async move { while subscription.recv().await.is_some() {} });

        store
            .tasks
            .insert_with_stat(&Task::new(1).with_node(w1.id))
            .await
            .unwrap();
        store.tasks.claim_next(w1.id).await.unwrap();

        let monitor = MasterMonitor::new(
            store.clone(),
            Arc::clone(&registry),
            "master",
            MonitorConfig::default(),
        );
        monitor.tick().await.unwrap();

        let w1 = store.nodes.find_by_key("w1").await.unwrap().unwrap();
        assert!(w1.is_online());
        assert_eq!(w1.current_runners, 1);
        drain.abort();
    }
}
