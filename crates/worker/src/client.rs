//! 控制平面客户端
//!
//! 一元调用为 JSON 请求/响应；推送流与数据流使用 NDJSON。请求路径只记录
//! 调用结果，连接状态由后台监视器每秒采样一次得出，发现连接失效时投递重连信号。

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cluster_core::config::TransportConfig;
use cluster_core::ndjson::{self, NdjsonDecoder};
use cluster_core::{backoff, ClusterError, ClusterResult};
use cluster_domain::{
    ConnectSummary, FetchTaskResponse, FileListing, NodeKeyRequest, NodeRecord, PushMessage,
    RegisterRequest, StreamMessage,
};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectionState {
    /// 从 `previous` 变为 `self` 时是否需要重连
    pub fn needs_reconnect(self, previous: ConnectionState) -> bool {
        match self {
            ConnectionState::TransientFailure => previous != ConnectionState::TransientFailure,
            ConnectionState::Idle => previous == ConnectionState::Ready,
            _ => false,
        }
    }
}

/// 请求路径记录的最近一次调用结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Nothing,
    Connecting,
    Success,
    Failure,
}

#[derive(Debug)]
struct Health {
    last: Observation,
    last_success: Instant,
}

pub struct ControlPlaneClient {
    http: reqwest::Client,
    /// 推送流与数据流不设整体超时
    streaming_http: reqwest::Client,
    base_url: String,
    auth_key: String,
    node_key: String,
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    health: Mutex<Health>,
    closed: AtomicBool,
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ControlPlaneClient {
    pub fn new(
        address: &str,
        auth_key: &str,
        node_key: &str,
        config: TransportConfig,
    ) -> ClusterResult<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ClusterError::Configuration(format!("http client: {e}")))?;
        let streaming_http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| ClusterError::Configuration(format!("http client: {e}")))?;
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);

        Ok(Arc::new(Self {
            http,
            streaming_http,
            base_url: address.trim_end_matches('/').to_string(),
            auth_key: auth_key.to_string(),
            node_key: node_key.to_string(),
            config,
            state,
            health: Mutex::new(Health {
                last: Observation::Nothing,
                last_success: Instant::now(),
            }),
            closed: AtomicBool::new(false),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
        }))
    }

    pub fn address(&self) -> &str {
        &self.base_url
    }

    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 仅由监视器调用
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("连接状态 {:?} -> {:?}", previous, next);
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 文件同步地址；`owner_id` 可以包含 `/`，作为单个路径段编码
    fn sync_url(&self, owner_id: &str, action: &str) -> ClusterResult<reqwest::Url> {
        let invalid =
            || ClusterError::Configuration(format!("invalid master address: {}", self.base_url));
        let mut url = reqwest::Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|()| invalid())?
            .pop_if_empty()
            .extend(["sync", owner_id, action]);
        Ok(url)
    }

    /// 建立连接：探测直到成功，或在退避预算耗尽后返回错误
    pub async fn connect(&self) -> ClusterResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClusterError::Transport("client is closed".to_string()));
        }
        self.observe(Observation::Connecting);
        info!("连接控制平面: {}", self.base_url);

        let mut policy = self.config.reconnect_backoff();
        let result = backoff::retry(&mut policy, "连接控制平面", || self.ping()).await;
        match result {
            Ok(()) => {
                info!("控制平面已就绪: {}", self.base_url);
                Ok(())
            }
            Err(e) => {
                self.observe(Observation::Failure);
                Err(e)
            }
        }
    }

    /// 启动连接状态监视器与重连任务
    ///
    /// 重连预算耗尽时通过 `shutdown_tx` 触发进程关闭。
    pub fn start(
        self: &Arc<Self>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let monitor = Arc::clone(self);
        let mut shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.monitor_interval());
            let mut previous = monitor.state();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let current = monitor.sample_state();
                        if current.needs_reconnect(previous) {
                            monitor.request_reconnect();
                        }
                        previous = current;
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("连接状态监视器收到关闭信号");
                        break;
                    }
                }
            }
        }));

        let receiver = self
            .reconnect_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut receiver) = receiver {
            let worker = Arc::clone(self);
            let mut shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        signal = receiver.recv() => {
                            if signal.is_none() {
                                break;
                            }
                            warn!("控制平面连接失效，开始重连");
                            if let Err(e) = worker.connect().await {
                                error!("无法连接控制平面，节点将退出: {}", e);
                                let _ = shutdown_tx.send(());
                                break;
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("重连任务收到关闭信号");
                            break;
                        }
                    }
                }
            }));
        }

        handles
    }

    /// 根据最近的调用结果得出连接状态并写入
    ///
    /// 最近一次成功调用距今超过空闲窗口时为 Idle。
    fn sample_state(&self) -> ConnectionState {
        let next = if self.closed.load(Ordering::SeqCst) {
            ConnectionState::Shutdown
        } else {
            let health = self
                .health
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match health.last {
                Observation::Nothing => ConnectionState::Idle,
                Observation::Connecting => ConnectionState::Connecting,
                Observation::Failure => ConnectionState::TransientFailure,
                Observation::Success
                    if health.last_success.elapsed() >= self.config.idle_timeout() =>
                {
                    ConnectionState::Idle
                }
                Observation::Success => ConnectionState::Ready,
            }
        };
        self.set_state(next);
        next
    }

    /// 投递重连信号；已有待处理的信号时直接丢弃
    pub fn request_reconnect(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.reconnect_tx.try_send(()).is_ok()
    }

    /// 等待连接就绪，按采样间隔轮询
    pub async fn wait_for_ready(&self) -> ClusterResult<()> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ClusterError::Transport("client is closed".to_string()));
            }
            match self.state() {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Shutdown => {
                    return Err(ClusterError::Transport("client is closed".to_string()))
                }
                _ => tokio::time::sleep(self.config.monitor_interval()).await,
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        info!("控制平面客户端已关闭");
    }

    fn observe(&self, observation: Observation) {
        let mut health = self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        health.last = observation;
        if observation == Observation::Success {
            health.last_success = Instant::now();
        }
    }

    async fn send(&self, request: RequestBuilder) -> ClusterResult<Response> {
        match request.bearer_auth(&self.auth_key).send().await {
            Ok(response) => {
                self.observe(Observation::Success);
                check_status(response, &self.node_key).await
            }
            Err(e) => {
                self.observe(Observation::Failure);
                Err(ClusterError::Network(e.to_string()))
            }
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClusterResult<T> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ClusterError::Transport(format!("invalid response body: {e}")))
    }

    pub async fn ping(&self) -> ClusterResult<()> {
        self.send(self.http.get(self.url("/api/v1/ping"))).await?;
        Ok(())
    }

    pub async fn register(
        &self,
        node_name: &str,
        max_runners: i32,
        is_master: bool,
    ) -> ClusterResult<NodeRecord> {
        let request = RegisterRequest {
            node_key: self.node_key.clone(),
            node_name: node_name.to_string(),
            max_runners,
            is_master,
        };
        self.send_json(self.http.post(self.url("/api/v1/nodes/register")).json(&request))
            .await
    }

    pub async fn heartbeat(&self) -> ClusterResult<NodeRecord> {
        let request = NodeKeyRequest {
            node_key: self.node_key.clone(),
        };
        self.send_json(self.http.post(self.url("/api/v1/nodes/heartbeat")).json(&request))
            .await
    }

    pub async fn fetch_task(&self) -> ClusterResult<Option<i64>> {
        let request = NodeKeyRequest {
            node_key: self.node_key.clone(),
        };
        let response: FetchTaskResponse = self
            .send_json(self.http.post(self.url("/api/v1/tasks/fetch")).json(&request))
            .await?;
        Ok(response.task_id)
    }

    pub async fn send_notification(&self, task_id: i64) -> ClusterResult<()> {
        self.send(
            self.http
                .post(self.url(&format!("/api/v1/tasks/{task_id}/notification"))),
        )
        .await?;
        Ok(())
    }

    /// 打开节点级推送流
    pub async fn subscribe_node(&self) -> ClusterResult<MessageStream> {
        let path = format!("/api/v1/nodes/{}/subscribe", self.node_key);
        let response = self.send(self.streaming_http.get(self.url(&path))).await?;
        Ok(MessageStream::new(response))
    }

    /// 打开任务级推送流
    pub async fn subscribe_task(&self, task_id: i64) -> ClusterResult<MessageStream> {
        let path = format!("/api/v1/tasks/{task_id}/subscribe");
        let response = self.send(self.streaming_http.get(self.url(&path))).await?;
        Ok(MessageStream::new(response))
    }

    /// 打开数据流，用于上报日志与结果
    pub fn open_data_stream(&self) -> DataStream {
        let (sender, receiver) = mpsc::channel::<Vec<u8>>(64);
        let body = stream::unfold(receiver, |mut receiver| async move {
            let line = receiver.recv().await?;
            Some((Ok::<_, std::io::Error>(line), receiver))
        });

        let request = self
            .streaming_http
            .post(self.url("/api/v1/tasks/connect"))
            .bearer_auth(&self.auth_key)
            .header(CONTENT_TYPE, ndjson::CONTENT_TYPE)
            .body(reqwest::Body::wrap_stream(body));
        let node_key = self.node_key.clone();

        let response = tokio::spawn(async move {
            let response = request
                .send()
                .await
                .map_err(|e| ClusterError::Network(e.to_string()))?;
            let response = check_status(response, &node_key).await?;
            response
                .json::<ConnectSummary>()
                .await
                .map_err(|e| ClusterError::Transport(format!("invalid response body: {e}")))
        });

        DataStream { sender, response }
    }

    /// 获取主节点上 `ownerId` 目录的文件清单
    pub async fn scan(&self, owner_id: &str, path: &str) -> ClusterResult<FileListing> {
        let url = self.sync_url(owner_id, "scan")?;
        self.send_json(self.http.get(url).query(&[("path", path)]))
            .await
    }

    /// 下载单个文件并写入 `destination`
    pub async fn download_to(
        &self,
        owner_id: &str,
        path: &str,
        destination: &Path,
    ) -> ClusterResult<u64> {
        let url = self.sync_url(owner_id, "download")?;
        let response = self
            .send(self.streaming_http.get(url).query(&[("path", path)]))
            .await?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(destination).await?;
        let mut chunks = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| ClusterError::Network(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

/// 非 2xx 响应转换为错误
async fn check_status(response: Response, node_key: &str) -> ClusterResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body: serde_json::Value = response.json().await.unwrap_or_default();
    let error_type = body["error"]["type"].as_str().unwrap_or_default().to_string();
    let message = body["error"]["message"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    Err(match (status, error_type.as_str()) {
        (StatusCode::UNAUTHORIZED, _) => ClusterError::Unauthorized,
        (StatusCode::NOT_FOUND, "NODE_NOT_FOUND") => ClusterError::NodeNotFound {
            key: node_key.to_string(),
        },
        _ => ClusterError::Transport(format!("HTTP {status} {error_type}: {message}")),
    })
}

/// 推送流读取端
pub struct MessageStream {
    chunks: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<PushMessage>,
}

impl MessageStream {
    fn new(response: Response) -> Self {
        Self {
            chunks: response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed(),
            decoder: NdjsonDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    /// 下一条消息；服务端关闭流时返回 `None`
    pub async fn next(&mut self) -> ClusterResult<Option<PushMessage>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Ok(Some(message));
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.decoder.push::<PushMessage>(&chunk)?),
                Some(Err(e)) => return Err(ClusterError::Network(e.to_string())),
                None => return self.decoder.finish(),
            }
        }
    }
}

/// 数据流写入端
pub struct DataStream {
    sender: mpsc::Sender<Vec<u8>>,
    response: JoinHandle<ClusterResult<ConnectSummary>>,
}

impl DataStream {
    pub async fn send(&self, message: &StreamMessage) -> ClusterResult<()> {
        let line = ndjson::encode_line(message)?;
        self.sender
            .send(line)
            .await
            .map_err(|_| ClusterError::Transport("data stream is closed".to_string()))
    }

    /// 结束请求体并等待服务端的处理统计
    pub async fn finish(self) -> ClusterResult<ConnectSummary> {
        drop(self.sender);
        self.response
            .await
            .map_err(|e| ClusterError::Internal(format!("data stream task failed: {e}")))?
    }
}
