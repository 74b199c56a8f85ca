//! 任务领取循环与执行器池

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cluster_core::config::FetcherConfig;
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{LocalTaskCanceller, PushMessage, TaskStatus};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::runner::{RunnerContext, TaskRunner};

/// 任务 id 到执行器的映射，锁不跨越任何等待点
#[derive(Default)]
pub struct RunnerPool {
    runners: Mutex<HashMap<i64, Arc<TaskRunner>>>,
}

impl RunnerPool {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<TaskRunner>>> {
        self.runners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, runner: Arc<TaskRunner>) {
        self.lock().insert(runner.task_id(), runner);
    }

    pub fn get(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        self.lock().get(&task_id).cloned()
    }

    pub fn delete(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        self.lock().remove(&task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.lock().keys().copied().collect()
    }
}

pub struct TaskFetchLoop {
    ctx: Arc<RunnerContext>,
    config: FetcherConfig,
    pool: RunnerPool,
}

impl TaskFetchLoop {
    pub fn new(ctx: Arc<RunnerContext>, config: FetcherConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            pool: RunnerPool::default(),
        })
    }

    pub fn pool(&self) -> &RunnerPool {
        &self.pool
    }

    /// 运行领取与状态上报两个循环，收到关闭信号后强制取消所有执行中的任务
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("任务领取循环启动: node={}", self.ctx.node_key);

        let reporter = {
            let this = Arc::clone(&self);
            let mut shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(this.config.report_interval());
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = this.report_status().await {
                                warn!("上报执行器数量失败: {}", e);
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            debug!("状态上报循环收到关闭信号");
                            break;
                        }
                    }
                }
            })
        };

        let mut interval = tokio::time::interval(self.config.fetch_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.fetch_once().await {
                        warn!("领取任务失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("任务领取循环收到关闭信号");
                    break;
                }
            }
        }

        if let Err(e) = reporter.await {
            warn!("状态上报任务异常结束: {}", e);
        }
        self.shutdown().await;
    }

    /// 写入本节点当前执行中的任务数
    pub async fn report_status(&self) -> ClusterResult<()> {
        let Some(node) = self.ctx.store.nodes.find_by_key(&self.ctx.node_key).await? else {
            return Ok(());
        };
        let current = i32::try_from(self.pool.len()).unwrap_or(i32::MAX);
        self.ctx
            .store
            .nodes
            .update_current_runners(node.id, current)
            .await?;
        debug!(
            "节点 {} 正在执行 {}/{} 个任务",
            node.key, current, node.max_runners
        );
        Ok(())
    }

    /// 领取并启动一个任务；节点不可调度或已满时不领取
    pub async fn fetch_once(self: &Arc<Self>) -> ClusterResult<Option<i64>> {
        let Some(node) = self.ctx.store.nodes.find_by_key(&self.ctx.node_key).await? else {
            return Ok(None);
        };
        if !node.is_schedulable() {
            return Ok(None);
        }
        if self.pool.len() >= usize::try_from(node.max_runners).unwrap_or(0) {
            return Ok(None);
        }

        let Some(task_id) = self.ctx.client.fetch_task().await? else {
            return Ok(None);
        };
        info!("领取到任务 {}", task_id);
        self.launch(task_id).await;
        Ok(Some(task_id))
    }

    async fn launch(self: &Arc<Self>, task_id: i64) {
        let runner = match TaskRunner::init(task_id, Arc::clone(&self.ctx)).await {
            Ok(runner) => Arc::new(runner),
            Err(e) => {
                error!("初始化任务 {} 失败: {}", task_id, e);
                self.fail_unstarted(task_id, &e.to_string()).await;
                return;
            }
        };
        self.pool.add(Arc::clone(&runner));

        let watcher = self.watch_task(task_id);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match runner.run().await {
                Ok(status) => debug!("任务 {} 的执行器结束，状态 {}", task_id, status),
                Err(e) => error!("任务 {} 的执行器出错: {}", task_id, e),
            }
            watcher.abort();
            this.pool.delete(task_id);
        });
    }

    /// 执行器未能创建时直接结束任务
    async fn fail_unstarted(&self, task_id: i64, message: &str) {
        let store = &self.ctx.store;
        let result = async {
            if store
                .tasks
                .update_status(task_id, TaskStatus::Error, Some(message), &self.ctx.node_key)
                .await?
            {
                let mut stat = store.task_stats.get(task_id).await?;
                stat.mark_ended(Utc::now());
                store.task_stats.update(&stat).await?;
            }
            Ok::<_, ClusterError>(())
        }
        .await;
        if let Err(e) = result {
            error!("将任务 {} 标记为错误失败: {}", task_id, e);
        }
    }

    /// 打开任务级推送流并在任务结束前持续读取取消消息
    fn watch_task(self: &Arc<Self>, task_id: i64) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut stream = match this.ctx.client.subscribe_task(task_id).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("订阅任务 {} 的推送流失败: {}", task_id, e);
                    return;
                }
            };
            loop {
                match stream.next().await {
                    Ok(Some(PushMessage::Cancel { task_id, force })) => {
                        // 取消会结束执行器并中止本读取任务，不能在这里等待
                        let canceller = Arc::clone(&this);
                        tokio::spawn(async move {
                            if let Err(e) = canceller.handle_cancel(task_id, force).await {
                                warn!("取消任务 {} 失败: {}", task_id, e);
                            }
                        });
                    }
                    Ok(Some(PushMessage::Ping)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        debug!("任务 {} 的推送流已关闭: {}", task_id, e);
                        break;
                    }
                }
            }
        })
    }

    /// 转发到执行器；本节点没有该任务时返回 `TaskNotRunning`
    pub async fn cancel(&self, task_id: i64, force: bool) -> ClusterResult<()> {
        let runner = self
            .pool
            .get(task_id)
            .ok_or(ClusterError::TaskNotRunning { id: task_id })?;
        runner.cancel(force).await
    }

    /// 取消并写入状态：成功为 `Cancelled`，找不到执行器为 `Abnormal`
    pub async fn handle_cancel(&self, task_id: i64, force: bool) -> ClusterResult<()> {
        let store = &self.ctx.store;
        match self.cancel(task_id, force).await {
            Ok(()) => {
                store
                    .tasks
                    .update_status(task_id, TaskStatus::Cancelled, None, &self.ctx.node_key)
                    .await?;
                info!("任务 {} 已取消", task_id);
                Ok(())
            }
            Err(e @ ClusterError::TaskNotRunning { .. }) => {
                store
                    .tasks
                    .update_status(
                        task_id,
                        TaskStatus::Abnormal,
                        Some(&e.to_string()),
                        &self.ctx.node_key,
                    )
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self) {
        let ids = self.pool.ids();
        if ids.is_empty() {
            info!("任务领取循环已停止");
            return;
        }

        info!("关闭前取消 {} 个运行中的任务", ids.len());
        let cancels = ids.into_iter().map(|task_id| async move {
            if let Err(e) = self.handle_cancel(task_id, true).await {
                warn!("关闭时取消任务 {} 失败: {}", task_id, e);
            }
        });
        futures::future::join_all(cancels).await;

        // 等待执行器写完终止状态
        let deadline = tokio::time::Instant::now() + self.ctx.config.cancel_timeout() * 2;
        while !self.pool.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.pool.is_empty() {
            warn!("关闭后仍有 {} 个执行器未结束", self.pool.len());
        }
        info!("任务领取循环已停止");
    }
}

#[async_trait]
impl LocalTaskCanceller for TaskFetchLoop {
    async fn cancel_local(&self, task_id: i64, force: bool) -> ClusterResult<()> {
        self.handle_cancel(task_id, force).await
    }
}
