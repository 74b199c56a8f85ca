//! 工作节点代理：注册、心跳与节点推送流

use std::sync::Arc;
use std::time::Duration;

use cluster_core::config::FetcherConfig;
use cluster_core::identity::NodeIdentity;
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{LocalTaskCanceller, NodeRecord, PushMessage};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlaneClient;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub struct NodeAgent {
    client: Arc<ControlPlaneClient>,
    identity: NodeIdentity,
    config: FetcherConfig,
    canceller: Arc<dyn LocalTaskCanceller>,
}

impl NodeAgent {
    pub fn new(
        client: Arc<ControlPlaneClient>,
        identity: NodeIdentity,
        config: FetcherConfig,
        canceller: Arc<dyn LocalTaskCanceller>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            identity,
            config,
            canceller,
        })
    }

    pub async fn register(&self) -> ClusterResult<NodeRecord> {
        let node = self
            .client
            .register(
                &self.identity.name,
                self.identity.max_runners,
                self.identity.is_master,
            )
            .await?;
        info!(
            "节点已注册: key={}, name={}, maxRunners={}",
            node.key, node.name, node.max_runners
        );
        Ok(node)
    }

    /// 心跳一次；主节点不认识本节点时重新注册
    pub async fn heartbeat(&self) -> ClusterResult<NodeRecord> {
        match self.client.heartbeat().await {
            Err(ClusterError::NodeNotFound { .. }) => {
                warn!("主节点不认识本节点，重新注册");
                self.register().await
            }
            result => result,
        }
    }

    pub fn start(self: &Arc<Self>, shutdown_tx: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).run_heartbeat(shutdown_tx.subscribe())),
            tokio::spawn(Arc::clone(self).run_subscription(shutdown_tx.subscribe())),
        ]
    }

    async fn run_heartbeat(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.heartbeat().await {
                        Ok(node) => debug!("心跳已发送，status={}", node.status),
                        Err(e) => error!("发送心跳失败: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("心跳任务收到关闭信号");
                    break;
                }
            }
        }
    }

    async fn run_subscription(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                result = self.subscribe_once() => {
                    if let Err(e) = result {
                        warn!("节点推送流结束: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("节点推送流收到关闭信号");
                    break;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    async fn subscribe_once(&self) -> ClusterResult<()> {
        self.client.wait_for_ready().await?;
        let mut stream = self.client.subscribe_node().await?;
        info!("已订阅节点 {} 的推送流", self.identity.key);

        while let Some(message) = stream.next().await? {
            match message {
                PushMessage::Ping => debug!("收到 ping"),
                PushMessage::Cancel { task_id, force } => {
                    info!("收到任务 {} 的取消请求（force={}）", task_id, force);
                    let canceller = Arc::clone(&self.canceller);
                    tokio::spawn(async move {
                        if let Err(e) = canceller.cancel_local(task_id, force).await {
                            warn!("取消任务 {} 失败: {}", task_id, e);
                        }
                    });
                }
            }
        }
        Ok(())
    }
}
