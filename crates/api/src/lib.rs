//! # Cluster API
//!
//! 主节点的控制平面 HTTP 服务。
//!
//! ## 端点
//!
//! 以下路由需要 `Authorization: Bearer <authKey>`：
//!
//! - `POST /api/v1/nodes/register` - 节点注册
//! - `POST /api/v1/nodes/heartbeat` - 节点心跳
//! - `GET /api/v1/nodes/{nodeKey}/subscribe` - 节点推送流（NDJSON）
//! - `POST /api/v1/tasks/fetch` - 领取任务
//! - `POST /api/v1/tasks/connect` - 日志与结果数据流（NDJSON 请求体）
//! - `GET /api/v1/tasks/{taskId}/subscribe` - 任务推送流（NDJSON）
//! - `POST /api/v1/tasks/{taskId}/notification` - 触发任务通知
//! - `GET /api/v1/ping` - 连接探测
//! - `GET /sync/{ownerId}/scan?path=` - 文件清单
//! - `GET /sync/{ownerId}/download?path=` - 文件下载
//!
//! `GET /health` 与 `GET /metrics` 不需要认证。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;

use axum::Router;
use cluster_core::ClusterResult;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tracing::info;

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的控制平面应用
pub fn create_app(state: AppState) -> Router {
    create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}

/// 在给定监听器上运行服务，直到收到关闭信号
///
/// 推送流不会自行结束，关闭时先清空流表让所有流响应结束。
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ClusterResult<()> {
    let address = listener.local_addr()?;
    info!("控制平面服务监听于 {}", address);

    let registry = state.registry.clone();
    let task_streams = state.dispatch.task_streams();
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("控制平面服务收到关闭信号");
            registry.close_streams();
            task_streams.clear();
        })
        .await?;
    Ok(())
}
