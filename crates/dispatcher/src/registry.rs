use std::sync::Arc;

use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{
    dispatch_notification, NodeRecord, NodeRegistration, NodeStatus, NotificationEvent,
    NotificationSink, PushMessage, RegisterRequest, Store,
};
use tracing::{debug, info};

use crate::streams::{StreamTable, Subscription};

/// 节点注册、心跳与节点级推送流
pub struct NodeRegistry {
    store: Store,
    streams: Arc<StreamTable>,
    notifier: Arc<dyn NotificationSink>,
}

impl NodeRegistry {
    pub fn new(store: Store, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            streams: StreamTable::new("node"),
            notifier,
        }
    }

    /// 按 key 注册节点，重复注册只更新已有记录
    pub async fn register(&self, request: &RegisterRequest) -> ClusterResult<NodeRecord> {
        let previous = self.store.nodes.find_by_key(&request.node_key).await?;
        let node = self
            .store
            .nodes
            .upsert_online(&NodeRegistration {
                key: request.node_key.clone(),
                name: request.node_name.clone(),
                max_runners: request.max_runners,
                is_master: request.is_master,
            })
            .await?;

        info!(
            "节点已注册: key={}, name={}, max_runners={}",
            node.key, node.name, node.max_runners
        );
        if previous.map_or(true, |p| p.status != NodeStatus::Online) {
            self.notify_status(&node);
        }
        Ok(node)
    }

    /// 心跳；节点此前不在线时触发状态通知
    pub async fn heartbeat(&self, node_key: &str) -> ClusterResult<NodeRecord> {
        let previous = self
            .store
            .nodes
            .find_by_key(node_key)
            .await?
            .ok_or_else(|| ClusterError::NodeNotFound {
                key: node_key.to_string(),
            })?;

        let node = self
            .store
            .nodes
            .touch_online(node_key)
            .await?
            .ok_or_else(|| ClusterError::NodeNotFound {
                key: node_key.to_string(),
            })?;

        debug!("收到节点 {} 的心跳", node_key);
        if previous.status != NodeStatus::Online {
            info!("节点 {} 重新上线", node_key);
            self.notify_status(&node);
        }
        Ok(node)
    }

    /// 打开节点推送流，同一节点重复订阅时替换旧流
    pub async fn subscribe(&self, node_key: &str) -> ClusterResult<Subscription> {
        let node = self
            .store
            .nodes
            .find_by_key(node_key)
            .await?
            .ok_or_else(|| ClusterError::NodeNotFound {
                key: node_key.to_string(),
            })?;

        info!("节点 {} 已订阅推送流", node_key);
        Ok(self.streams.add(node.id))
    }

    /// 关闭全部节点推送流
    pub fn close_streams(&self) {
        self.streams.clear();
    }

    pub fn has_stream(&self, node_id: i64) -> bool {
        self.streams.contains(node_id)
    }

    pub async fn send(&self, node_id: i64, message: PushMessage) -> ClusterResult<()> {
        self.streams.send(node_id, message).await
    }

    pub async fn ping(&self, node_id: i64) -> ClusterResult<()> {
        self.send(node_id, PushMessage::Ping).await
    }

    pub fn notify_status(&self, node: &NodeRecord) {
        dispatch_notification(
            &self.notifier,
            NotificationEvent::NodeStatusChanged {
                node_key: node.key.clone(),
                node_name: node.name.clone(),
                status: node.status,
            },
        );
    }
}
