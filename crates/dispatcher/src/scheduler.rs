use std::sync::{Arc, RwLock};

use chrono::{Duration as ChronoDuration, Utc};
use cluster_core::config::SchedulerConfig;
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{
    dispatch_notification, LocalTaskCanceller, NodeRecord, NotificationEvent, NotificationSink,
    PushMessage, Store, Task, TaskMode, TaskStatus,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::registry::NodeRegistry;
use crate::streams::StreamTable;

/// 启动恢复时写入任务的错误信息
pub const RECOVERY_ERROR: &str = "master restarted while task was unfinished";

/// 一次爬虫运行的参数
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mode: TaskMode,
    /// 仅 `SelectedNodes` 模式使用
    pub node_ids: Vec<i64>,
    pub cmd: Option<String>,
    pub param: Option<String>,
    pub priority: Option<i32>,
}

/// 任务队列：入队、取消、启动恢复与过期清理
pub struct TaskScheduler {
    store: Store,
    registry: Arc<NodeRegistry>,
    task_streams: Arc<StreamTable>,
    notifier: Arc<dyn NotificationSink>,
    local_canceller: RwLock<Option<Arc<dyn LocalTaskCanceller>>>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(
        store: Store,
        registry: Arc<NodeRegistry>,
        task_streams: Arc<StreamTable>,
        notifier: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            task_streams,
            notifier,
            local_canceller: RwLock::new(None),
            config,
        }
    }

    /// 主节点本地的取消入口，由本节点的任务拉取循环提供
    pub fn set_local_canceller(&self, canceller: Arc<dyn LocalTaskCanceller>) {
        let mut slot = self
            .local_canceller
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(canceller);
    }

    fn local_canceller(&self) -> Option<Arc<dyn LocalTaskCanceller>> {
        self.local_canceller
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 任务入队，同时写入零值统计
    pub async fn enqueue(&self, mut task: Task, actor: &str) -> ClusterResult<Task> {
        task.status = TaskStatus::Pending;
        task.created_by = actor.to_string();
        task.updated_by = actor.to_string();
        let task = self.store.tasks.insert_with_stat(&task).await?;
        info!(
            "任务 {} 已入队，爬虫 {}（优先级 {}，节点 {}）",
            task.id, task.spider_id, task.priority, task.node_id
        );
        Ok(task)
    }

    /// 按运行模式为爬虫创建任务
    pub async fn run_spider(
        &self,
        spider_id: i64,
        options: RunOptions,
        actor: &str,
    ) -> ClusterResult<Vec<Task>> {
        self.store.spiders.get(spider_id).await?;

        let node_ids: Vec<i64> = match options.mode {
            TaskMode::Random => vec![0],
            TaskMode::AllNodes => self
                .store
                .nodes
                .list_active()
                .await?
                .into_iter()
                .filter(NodeRecord::is_schedulable)
                .map(|node| node.id)
                .collect(),
            TaskMode::SelectedNodes => {
                for node_id in options.node_ids.iter().copied() {
                    self.store.nodes.get(node_id).await?;
                }
                options.node_ids.clone()
            }
        };

        if node_ids.is_empty() {
            return Err(ClusterError::InvalidState(format!(
                "no target node for spider {} in mode {}",
                spider_id, options.mode
            )));
        }

        let mut tasks = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let mut task = Task::new(spider_id).with_mode(options.mode).with_node(node_id);
            if let Some(cmd) = &options.cmd {
                task.cmd = cmd.clone();
            }
            if let Some(param) = &options.param {
                task.param = param.clone();
            }
            if let Some(priority) = options.priority {
                task.priority = priority;
            }
            tasks.push(self.enqueue(task, actor).await?);
        }
        Ok(tasks)
    }

    /// 取消任务
    ///
    /// 待执行任务直接置为已取消；运行中的任务交给所属节点处理，
    /// 远程节点收到取消消息后自行更新状态，这里不等待确认。
    pub async fn cancel(&self, task_id: i64, actor: &str, force: bool) -> ClusterResult<()> {
        let mut task = self.store.tasks.get(task_id).await?;

        if task.status == TaskStatus::Pending {
            if self.store.tasks.cancel_pending(task_id, actor).await? {
                self.close_stat(task_id).await;
                info!("待执行任务 {} 已被 {} 取消", task_id, actor);
                self.notify_task(task_id).await;
                return Ok(());
            }
            // 读取之后被节点领取，按运行中的任务处理
            task = self.store.tasks.get(task_id).await?;
            debug!("任务 {} 在取消前已被领取，当前状态 {}", task_id, task.status);
        }

        if task.status.is_terminal() {
            debug!("任务 {} 已是 {} 状态，无需取消", task_id, task.status);
            return Ok(());
        }

        let node = match self.store.nodes.get(task.node_id).await {
            Ok(node) => node,
            Err(e) => {
                let message = format!("cannot resolve node {}: {}", task.node_id, e);
                self.mark_abnormal(task_id, &message, actor).await?;
                return Err(e);
            }
        };

        if node.is_master {
            let canceller = self.local_canceller().ok_or_else(|| {
                ClusterError::InvalidState("local task canceller is not configured".to_string())
            });
            let result = match canceller {
                Ok(canceller) => canceller.cancel_local(task_id, force).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                if matches!(e, ClusterError::TaskNotRunning { .. } | ClusterError::InvalidState(_)) {
                    self.mark_abnormal(task_id, &e.to_string(), actor).await?;
                }
            }
            return result;
        }

        self.cancel_remote(&node, task_id, actor, force).await
    }

    async fn cancel_remote(
        &self,
        node: &NodeRecord,
        task_id: i64,
        actor: &str,
        force: bool,
    ) -> ClusterResult<()> {
        let message = PushMessage::Cancel { task_id, force };

        match self.registry.send(node.id, message.clone()).await {
            Ok(()) => {
                info!("任务 {} 的取消请求已发送到节点 {}", task_id, node.key);
                return Ok(());
            }
            Err(e) => warn!(
                "节点 {} 的推送流不可用（{}），改用任务推送流",
                node.key, e
            ),
        }

        match self.task_streams.send(task_id, message).await {
            Ok(()) => {
                info!("任务 {} 的取消请求已通过任务推送流发送", task_id);
                Ok(())
            }
            Err(e) => {
                let text = format!("no live stream to node {}: {}", node.key, e);
                self.mark_abnormal(task_id, &text, actor).await?;
                Err(ClusterError::Transport(text))
            }
        }
    }

    async fn mark_abnormal(&self, task_id: i64, message: &str, actor: &str) -> ClusterResult<()> {
        warn!("任务 {} 标记为异常: {}", task_id, message);
        if self
            .store
            .tasks
            .update_status(task_id, TaskStatus::Abnormal, Some(message), actor)
            .await?
        {
            self.close_stat(task_id).await;
            self.notify_task(task_id).await;
        }
        Ok(())
    }

    async fn close_stat(&self, task_id: i64) {
        let result = async {
            let mut stat = self.store.task_stats.get(task_id).await?;
            stat.mark_ended(Utc::now());
            self.store.task_stats.update(&stat).await
        }
        .await;
        if let Err(e) = result {
            warn!("更新任务 {} 的统计失败: {}", task_id, e);
        }
    }

    async fn notify_task(&self, task_id: i64) {
        match self.store.tasks.get(task_id).await {
            Ok(task) => dispatch_notification(
                &self.notifier,
                NotificationEvent::TaskStatusChanged {
                    task_id: task.id,
                    spider_id: task.spider_id,
                    status: task.status,
                    error: task.error,
                },
            ),
            Err(e) => warn!("加载任务 {} 以发送通知失败: {}", task_id, e),
        }
    }

    /// 主节点启动时，把所有未结束的任务置为异常
    pub async fn recover_on_startup(&self) -> ClusterResult<u64> {
        let recovered = self
            .store
            .tasks
            .mark_unfinished_abnormal(RECOVERY_ERROR)
            .await?;
        if recovered > 0 {
            warn!("启动恢复: {} 个未结束的任务已标记为异常", recovered);
        } else {
            info!("启动恢复: 没有未结束的任务");
        }
        Ok(recovered)
    }

    /// 删除超过保留期限的已结束任务
    pub async fn cleanup_once(&self) -> ClusterResult<u64> {
        let before = Utc::now() - ChronoDuration::days(self.config.retention_days);
        let deleted = self.store.tasks.delete_finished_before(before).await?;
        if deleted > 0 {
            info!("已清理 {} 个在 {} 之前结束的任务", deleted, before);
        }
        Ok(deleted)
    }

    pub async fn run_cleanup(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.cleanup_once().await {
                        error!("任务清理失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("任务清理循环收到关闭信号");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_store, RecordingSink};
    use async_trait::async_trait;
    use cluster_domain::{RegisterRequest, Spider};
    use std::sync::Mutex;

    struct Fixture {
        _db: cluster_infrastructure::DatabaseManager,
        store: Store,
        registry: Arc<NodeRegistry>,
        task_streams: Arc<StreamTable>,
        sink: Arc<RecordingSink>,
        scheduler: TaskScheduler,
    }

    async fn fixture() -> Fixture {
        let (db, store) = test_store().await;
        let sink = RecordingSink::new();
        let registry = Arc::new(NodeRegistry::new(store.clone(), sink.clone()));
        let task_streams = StreamTable::new("task");
        let scheduler = TaskScheduler::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&task_streams),
            sink.clone(),
            SchedulerConfig::default(),
        );
        Fixture {
            _db: db,
            store,
            registry,
            task_streams,
            sink,
            scheduler,
        }
    }

    async fn register(registry: &NodeRegistry, key: &str, is_master: bool) -> NodeRecord {
        registry
            .register(&RegisterRequest {
                node_key: key.to_string(),
                node_name: key.to_string(),
                max_runners: 2,
                is_master,
            })
            .await
            .unwrap()
    }

    async fn running_task(f: &Fixture, node_id: i64) -> i64 {
        let task = f
            .scheduler
            .enqueue(Task::new(1).with_node(node_id), "tester")
            .await
            .unwrap();
        f.store.tasks.claim_next(node_id).await.unwrap();
        f.store.tasks.mark_running(task.id, 4242).await.unwrap();
        task.id
    }

    #[derive(Default)]
    struct RecordingCanceller {
        calls: Mutex<Vec<(i64, bool)>>,
    }

    #[async_trait]
    impl LocalTaskCanceller for RecordingCanceller {
        async fn cancel_local(&self, task_id: i64, force: bool) -> ClusterResult<()> {
            self.calls.lock().unwrap().push((task_id, force));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_enqueue_sets_pending_and_actor() {
        let f = fixture().await;
        let mut task = Task::new(7);
        task.status = TaskStatus::Running;

        let task = f.scheduler.enqueue(task, "alice").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.created_by, "alice");
        assert!(f.store.task_stats.find_by_id(task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_pending_is_direct() {
        let f = fixture().await;
        let task = f.scheduler.enqueue(Task::new(1), "tester").await.unwrap();

        f.scheduler.cancel(task.id, "tester", true).await.unwrap();

        let task = f.store.tasks.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.pid.is_none());
        let events = f.sink.wait_for(1).await;
        assert!(matches!(
            events.last(),
            Some(NotificationEvent::TaskStatusChanged { status: TaskStatus::Cancelled, .. })
        ));

        // 再次取消是空操作
        f.scheduler.cancel(task.id, "tester", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_remote_uses_node_stream() {
        let f = fixture().await;
        let w1 = register(&f.registry, "w1", false).await;
        let task_id = running_task(&f, w1.id).await;
        let mut subscription = f.registry.subscribe("w1").await.unwrap();

        f.scheduler.cancel(task_id, "tester", true).await.unwrap();

        assert_eq!(
            subscription.recv().await,
            Some(PushMessage::Cancel { task_id, force: true })
        );
        let task = f.store.tasks.get(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_remote_falls_back_to_task_stream() {
        let f = fixture().await;
        let w1 = register(&f.registry, "w1", false).await;
        let task_id = running_task(&f, w1.id).await;
        let mut subscription = f.task_streams.add(task_id);

        f.scheduler.cancel(task_id, "tester", false).await.unwrap();

        assert_eq!(
            subscription.recv().await,
            Some(PushMessage::Cancel { task_id, force: false })
        );
    }

    #[tokio::test]
    async fn test_cancel_without_stream_marks_abnormal() {
        let f = fixture().await;
        let w1 = register(&f.registry, "w1", false).await;
        let task_id = running_task(&f, w1.id).await;

        assert!(f.scheduler.cancel(task_id, "tester", true).await.is_err());

        let task = f.store.tasks.get(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Abnormal);
        assert!(task.error.contains("w1"));
    }

    #[tokio::test]
    async fn test_cancel_with_unknown_node_marks_abnormal() {
        let f = fixture().await;
        let task_id = running_task(&f, 99).await;

        assert!(f.scheduler.cancel(task_id, "tester", true).await.is_err());
        let task = f.store.tasks.get(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Abnormal);
        assert!(!task.error.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_on_master_goes_local() {
        let f = fixture().await;
        let master = register(&f.registry, "master", true).await;
        let task_id = running_task(&f, master.id).await;
        let canceller = Arc::new(RecordingCanceller::default());
        f.scheduler.set_local_canceller(canceller.clone());

        f.scheduler.cancel(task_id, "tester", true).await.unwrap();
        assert_eq!(*canceller.calls.lock().unwrap(), vec![(task_id, true)]);
    }

    #[tokio::test]
    async fn test_run_spider_modes() {
        let f = fixture().await;
        let spider = f
            .store
            .spiders
            .insert(&Spider::new("quotes", "echo hi"))
            .await
            .unwrap();
        let w1 = register(&f.registry, "w1", false).await;
        let w2 = register(&f.registry, "w2", false).await;

        let random = f
            .scheduler
            .run_spider(spider.id, RunOptions::default(), "tester")
            .await
            .unwrap();
        assert_eq!(random.len(), 1);
        assert!(!random[0].is_assigned());

        let all = f
            .scheduler
            .run_spider(
                spider.id,
                RunOptions {
                    mode: TaskMode::AllNodes,
                    priority: Some(1),
                    ..Default::default()
                },
                "tester",
            )
            .await
            .unwrap();
        let mut nodes: Vec<i64> = all.iter().map(|t| t.node_id).collect();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![w1.id, w2.id]);
        assert!(all.iter().all(|t| t.priority == 1));

        let selected = f
            .scheduler
            .run_spider(
                spider.id,
                RunOptions {
                    mode: TaskMode::SelectedNodes,
                    node_ids: vec![w2.id],
                    cmd: Some("echo override".to_string()),
                    ..Default::default()
                },
                "tester",
            )
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].node_id, w2.id);
        assert_eq!(selected[0].cmd, "echo override");

        assert!(f
            .scheduler
            .run_spider(999, RunOptions::default(), "tester")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_recover_on_startup() {
        let f = fixture().await;
        let w1 = register(&f.registry, "w1", false).await;
        let running = running_task(&f, w1.id).await;
        let pending = f.scheduler.enqueue(Task::new(1), "tester").await.unwrap();
        let done = f.scheduler.enqueue(Task::new(1), "tester").await.unwrap();
        f.store
            .tasks
            .update_status(done.id, TaskStatus::Finished, None, "tester")
            .await
            .unwrap();

        assert_eq!(f.scheduler.recover_on_startup().await.unwrap(), 2);
        for id in [running, pending.id] {
            let task = f.store.tasks.get(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Abnormal);
            assert_eq!(task.error, RECOVERY_ERROR);
        }
        let done = f.store.tasks.get(done.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Finished);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_tasks() {
        let f = fixture().await;
        let task = f.scheduler.enqueue(Task::new(1), "tester").await.unwrap();
        f.store
            .tasks
            .update_status(task.id, TaskStatus::Finished, None, "tester")
            .await
            .unwrap();

        assert_eq!(f.scheduler.cleanup_once().await.unwrap(), 0);
        assert!(f.store.tasks.find_by_id(task.id).await.unwrap().is_some());
    }
}
