use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use cluster_core::ndjson::NdjsonDecoder;
use cluster_domain::{ConnectSummary, FetchTaskResponse, NodeKeyRequest, StreamMessage};
use futures::StreamExt;
use tracing::{debug, info};

use super::push_stream_response;
use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

pub async fn fetch_task(
    State(state): State<AppState>,
    Json(request): Json<NodeKeyRequest>,
) -> ApiResult<Json<FetchTaskResponse>> {
    let task_id = state.dispatch.fetch_task(&request.node_key).await?;
    Ok(Json(FetchTaskResponse { task_id }))
}

/// 数据流：请求体为逐行的日志/结果消息，读完后返回处理统计
pub async fn connect(
    State(state): State<AppState>,
    body: Body,
) -> ApiResult<Json<ConnectSummary>> {
    let mut summary = ConnectSummary::default();
    let mut decoder = NdjsonDecoder::new();
    let mut chunks = body.into_data_stream();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| ApiError::BadRequest(format!("stream read failed: {e}")))?;
        let messages: Vec<StreamMessage> = decoder
            .push(&chunk)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        for message in messages {
            state.dispatch.ingest(message, &mut summary).await?;
        }
    }

    let tail: Option<StreamMessage> = decoder
        .finish()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if let Some(message) = tail {
        state.dispatch.ingest(message, &mut summary).await?;
    }

    info!(
        "数据流结束: {} 条消息，{} 行日志，{} 条结果",
        summary.messages, summary.logs, summary.records
    );
    Ok(Json(summary))
}

/// 任务级推送流
pub async fn subscribe_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Response> {
    let subscription = state.dispatch.subscribe_task(task_id).await?;
    Ok(push_stream_response(subscription))
}

pub async fn send_notification(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.dispatch.send_notification(task_id).await?;
    debug!("任务 {} 的通知已发送", task_id);
    Ok(StatusCode::NO_CONTENT)
}
