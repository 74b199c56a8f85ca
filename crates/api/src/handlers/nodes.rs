use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use cluster_domain::{NodeKeyRequest, NodeRecord, RegisterRequest};

use super::push_stream_response;
use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<NodeRecord>> {
    if request.node_key.trim().is_empty() {
        return Err(ApiError::BadRequest("nodeKey is required".to_string()));
    }
    Ok(Json(state.registry.register(&request).await?))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<NodeKeyRequest>,
) -> ApiResult<Json<NodeRecord>> {
    Ok(Json(state.registry.heartbeat(&request.node_key).await?))
}

/// 节点级推送流，连接保持到节点断开
pub async fn subscribe_node(
    State(state): State<AppState>,
    Path(node_key): Path<String>,
) -> ApiResult<Response> {
    let subscription = state.registry.subscribe(&node_key).await?;
    Ok(push_stream_response(subscription))
}
