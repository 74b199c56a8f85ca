use axum::{
    extract::{Path, Query, State},
    http::header::CONTENT_TYPE,
    response::IntoResponse,
    Json,
};
use cluster_core::ClusterError;
use cluster_domain::FileListing;
use cluster_infrastructure::workspace::{resolve_within, scan_dir};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub path: String,
}

/// 递归列出 `<workspace>/<ownerId>/<path>` 下的文件
pub async fn scan(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<FileListing>> {
    let owner_root = resolve_within(&state.workspace_root, &owner_id)?;
    let dir = resolve_within(&owner_root, &query.path)?;
    debug!("扫描目录 {}", dir.display());

    let listing = tokio::task::spawn_blocking(move || scan_dir(&dir))
        .await
        .map_err(|e| ClusterError::Internal(format!("scan task failed: {e}")))??;
    Ok(Json(listing))
}

/// 下载单个文件的原始内容
pub async fn download(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<impl IntoResponse> {
    if query.path.is_empty() {
        return Err(ApiError::BadRequest("path is required".to_string()));
    }
    let owner_root = resolve_within(&state.workspace_root, &owner_id)?;
    let file = resolve_within(&owner_root, &query.path)?;

    let bytes = match tokio::fs::read(&file).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(query.path))
        }
        Err(e) => return Err(ClusterError::Io(e).into()),
    };
    Ok(([(CONTENT_TYPE, "application/octet-stream")], bytes))
}
