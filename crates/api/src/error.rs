use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cluster_core::ClusterError;
use serde_json::json;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("资源不存在: {0}")]
    NotFound(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Cluster(ClusterError::Unauthorized) => StatusCode::UNAUTHORIZED,
            ApiError::Cluster(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Cluster(ClusterError::TaskNotRunning { .. }) => StatusCode::CONFLICT,
            ApiError::Cluster(ClusterError::InvalidState(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Cluster(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::Cluster(ClusterError::Unauthorized) => "UNAUTHORIZED",
            ApiError::Cluster(ClusterError::TaskNotFound { .. }) => "TASK_NOT_FOUND",
            ApiError::Cluster(ClusterError::NodeNotFound { .. }) => "NODE_NOT_FOUND",
            ApiError::Cluster(ClusterError::SpiderNotFound { .. }) => "SPIDER_NOT_FOUND",
            ApiError::Cluster(ClusterError::TaskNotRunning { .. }) => "TASK_NOT_RUNNING",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Cluster(ClusterError::InvalidState(_)) | ApiError::BadRequest(_) => {
                "BAD_REQUEST"
            }
            ApiError::Cluster(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("请求处理失败: {}", self);
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
