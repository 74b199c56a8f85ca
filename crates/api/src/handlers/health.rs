use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::routes::AppState;

pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.database.health_check().await?;
    Ok(Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "cluster-master",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

/// 连接探测
pub async fn ping() -> Json<Value> {
    Json(json!({ "pong": true }))
}

/// Prometheus 文本格式指标
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics disabled".to_string()),
    }
}
