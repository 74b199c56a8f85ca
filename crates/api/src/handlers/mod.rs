pub mod health;
pub mod nodes;
pub mod sync;
pub mod tasks;

use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use cluster_core::ndjson;
use cluster_dispatcher::Subscription;
use futures::stream;
use tracing::debug;

/// 将推送流订阅转换为 NDJSON 响应体，响应结束时订阅随之释放
pub(crate) fn push_stream_response(subscription: Subscription) -> Response {
    let frames = stream::unfold(subscription, |mut subscription| async move {
        let message = subscription.recv().await?;
        let frame = ndjson::encode_line(&message).map(Bytes::from);
        Some((frame, subscription))
    });

    let mut response = Body::from_stream(frames).into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        axum::http::HeaderValue::from_static(ndjson::CONTENT_TYPE),
    );
    debug!("推送流响应已建立");
    response
}
