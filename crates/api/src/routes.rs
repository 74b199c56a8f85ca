use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use cluster_dispatcher::{NodeRegistry, TaskDispatchService};
use cluster_infrastructure::DatabaseManager;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::handlers::{
    health::{health_check, metrics, ping},
    nodes::{heartbeat, register, subscribe_node},
    sync::{download, scan},
    tasks::{connect, fetch_task, send_notification, subscribe_task},
};
use crate::middleware::require_bearer;

/// 控制平面服务状态
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<NodeRegistry>,
    pub dispatch: Arc<TaskDispatchService>,
    pub database: DatabaseManager,
    /// 节点间共享密钥
    pub auth_key: Arc<str>,
    /// 文件同步根目录
    pub workspace_root: Arc<PathBuf>,
    pub metrics: Option<PrometheusHandle>,
}

/// 创建控制平面路由
pub fn create_routes(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/ping", get(ping))
        // NodeService
        .route("/api/v1/nodes/register", post(register))
        .route("/api/v1/nodes/heartbeat", post(heartbeat))
        .route("/api/v1/nodes/{node_key}/subscribe", get(subscribe_node))
        // TaskService
        .route("/api/v1/tasks/fetch", post(fetch_task))
        .route("/api/v1/tasks/connect", post(connect))
        .route("/api/v1/tasks/{task_id}/subscribe", get(subscribe_task))
        .route(
            "/api/v1/tasks/{task_id}/notification",
            post(send_notification),
        )
        // 文件同步
        .route("/sync/{owner_id}/scan", get(scan))
        .route("/sync/{owner_id}/download", get(download))
        .route_layer(from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .merge(protected)
        .with_state(state)
}
