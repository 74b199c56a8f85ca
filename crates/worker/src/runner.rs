//! 任务执行器
//!
//! 一个 `TaskRunner` 负责一个任务的完整生命周期：同步文件、启动进程、转发日志、
//! 监视进程存活、归类退出原因并写回终止状态与统计。

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cluster_core::config::RunnerConfig;
use cluster_core::identity::expand_home;
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{Spider, Store, Task, TaskStatus};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::ControlPlaneClient;
use crate::log_forwarder::forward_logs;
use crate::process;
use crate::sync::sync_files;

/// 进程消失后等待退出回调的宽限时间
const LOST_GRACE: Duration = Duration::from_millis(500);

/// 执行器共享的节点级依赖
pub struct RunnerContext {
    pub store: Store,
    pub client: Arc<ControlPlaneClient>,
    pub node_key: String,
    pub is_master: bool,
    pub auth_key: String,
    pub config: RunnerConfig,
}

impl RunnerContext {
    pub fn workspace_root(&self) -> PathBuf {
        expand_home(&self.config.workspace_dir)
    }
}

/// 进程结束的归类结果，每次执行只投递一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerSignal {
    Finish,
    Cancel,
    Error(String),
    Lost,
}

impl RunnerSignal {
    fn into_outcome(self) -> (TaskStatus, Option<String>) {
        match self {
            RunnerSignal::Finish => (TaskStatus::Finished, None),
            RunnerSignal::Cancel => (TaskStatus::Cancelled, None),
            RunnerSignal::Error(message) => (TaskStatus::Error, Some(message)),
            RunnerSignal::Lost => (TaskStatus::Error, Some(ClusterError::ProcessLost.to_string())),
        }
    }
}

/// 根据退出状态归类
///
/// 请求过取消时，被信号终止或非零退出都视为取消。
pub fn classify_exit(status: ExitStatus, cancel_requested: bool) -> RunnerSignal {
    match status.code() {
        Some(0) => RunnerSignal::Finish,
        _ if cancel_requested => RunnerSignal::Cancel,
        Some(code) => RunnerSignal::Error(format!("exit status {code}")),
        None => RunnerSignal::Lost,
    }
}

pub struct TaskRunner {
    task: Task,
    spider: Spider,
    ctx: Arc<RunnerContext>,
    /// 0 表示进程尚未启动
    pid: AtomicU32,
    cancel_requested: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
}

impl TaskRunner {
    /// 加载任务与爬虫
    pub async fn init(task_id: i64, ctx: Arc<RunnerContext>) -> ClusterResult<Self> {
        let task = ctx.store.tasks.get(task_id).await?;
        let spider = ctx.store.spiders.get(task.spider_id).await?;
        Ok(Self {
            task,
            spider,
            ctx,
            pid: AtomicU32::new(0),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn task_id(&self) -> i64 {
        self.task.id
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn working_dir(&self) -> PathBuf {
        self.ctx.workspace_root().join(self.spider.working_dir())
    }

    /// 执行任务直到终止，返回写入的终止状态
    pub async fn run(&self) -> ClusterResult<TaskStatus> {
        info!(
            "开始执行任务 {}，爬虫 {} ({})",
            self.task.id, self.spider.id, self.spider.name
        );
        let signal = self.execute().await;
        debug!("任务 {} 的结束信号: {:?}", self.task.id, signal);
        self.finalize(signal).await
    }

    async fn execute(&self) -> RunnerSignal {
        let working_dir = self.working_dir();

        if self.ctx.is_master {
            if let Err(e) = tokio::fs::create_dir_all(&working_dir).await {
                return RunnerSignal::Error(format!("cannot create working directory: {e}"));
            }
        } else if let Err(e) = sync_files(
            &self.ctx.client,
            &self.spider.working_dir(),
            &working_dir,
            self.ctx.config.sync_concurrency,
        )
        .await
        {
            return RunnerSignal::Error(format!("file sync failed: {e}"));
        }

        if self.is_cancel_requested() {
            return RunnerSignal::Cancel;
        }

        // 领取之后任务可能已被取消或标记为异常
        match self.ctx.store.tasks.get(self.task.id).await {
            Ok(task) if task.status.is_terminal() => {
                info!("任务 {} 已是 {} 状态，不再启动进程", self.task.id, task.status);
                return RunnerSignal::Cancel;
            }
            Ok(_) => {}
            Err(e) => return RunnerSignal::Error(format!("cannot load task: {e}")),
        }

        let mut command = match self.build_command(&working_dir).await {
            Ok(command) => command,
            Err(e) => return RunnerSignal::Error(e.to_string()),
        };
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("任务 {} 启动进程失败: {}", self.task.id, e);
                return RunnerSignal::Error(e.to_string());
            }
        };
        let pid = child.id().unwrap_or_default();
        self.pid.store(pid, Ordering::SeqCst);
        info!("任务 {} 已启动，进程号 {}", self.task.id, pid);

        // 启动期间到达的取消请求，或任务在启动期间进入终止状态
        let claimable = self.mark_started(pid).await;
        if !claimable {
            self.cancel_requested.store(true, Ordering::SeqCst);
        }
        if self.is_cancel_requested() {
            if let Err(e) = process::kill_tree(pid, true).await {
                warn!("任务 {} 启动期间终止进程失败: {}", self.task.id, e);
            }
        }

        let (line_tx, line_rx) = mpsc::channel::<String>(1024);
        let forwarder = tokio::spawn(forward_logs(
            self.task.id,
            line_rx,
            self.ctx.client.open_data_stream(),
            self.ctx.config.log_batch_size,
            self.ctx.config.log_flush_interval(),
        ));
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(stdout, line_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(stderr, line_tx.clone())));
        }
        drop(line_tx);

        let (signal_tx, mut signal_rx) = mpsc::channel::<RunnerSignal>(1);

        let wait_tx = signal_tx.clone();
        let exited = Arc::clone(&self.exited);
        let cancel_requested = Arc::clone(&self.cancel_requested);
        let waiter = tokio::spawn(async move {
            let signal = match child.wait().await {
                Ok(status) => classify_exit(status, cancel_requested.load(Ordering::SeqCst)),
                Err(e) => RunnerSignal::Error(e.to_string()),
            };
            exited.store(true, Ordering::SeqCst);
            let _ = wait_tx.try_send(signal);
        });

        let health = tokio::spawn(health_check(
            pid,
            self.ctx.config.health_check_interval(),
            Arc::clone(&self.exited),
            Arc::clone(&self.cancel_requested),
            signal_tx,
        ));

        let signal = signal_rx.recv().await.unwrap_or(RunnerSignal::Lost);
        health.abort();
        if signal == RunnerSignal::Lost {
            waiter.abort();
        }

        // 后台遗留的子进程可能一直占用管道
        let drained = tokio::time::timeout(
            self.ctx.config.cancel_timeout(),
            futures::future::join_all(readers.iter_mut()),
        )
        .await;
        if drained.is_err() {
            warn!("任务 {} 退出后输出管道仍未关闭，放弃读取", self.task.id);
            readers.iter().for_each(JoinHandle::abort);
        }
        if let Err(e) = forwarder.await {
            warn!("任务 {} 的日志转发异常结束: {}", self.task.id, e);
        }

        signal
    }

    async fn build_command(&self, working_dir: &Path) -> ClusterResult<Command> {
        let command_line = self.spider.command_line(&self.task);
        if command_line.trim().is_empty() {
            return Err(ClusterError::InvalidState(format!(
                "spider {} has no command",
                self.spider.id
            )));
        }

        let mut command = shell_command(&command_line);
        command
            .current_dir(working_dir)
            .env("CLUSTER_TASK_ID", self.task.id.to_string())
            .env("CLUSTER_NODE_KEY", &self.ctx.node_key)
            .env("CLUSTER_CONTROL_PLANE_ADDRESS", self.ctx.client.address())
            .env("CLUSTER_AUTH_KEY", &self.ctx.auth_key)
            .env("CLUSTER_WORKSPACE", self.ctx.workspace_root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for variable in self.ctx.store.environments.list().await? {
            command.env(variable.key, variable.value);
        }
        debug!("任务 {} 的命令: {}", self.task.id, command_line);
        Ok(command)
    }

    /// 置为运行中并记录开始时间；任务已处于终止状态时返回 `false`
    async fn mark_started(&self, pid: u32) -> bool {
        let store = &self.ctx.store;
        match store.tasks.mark_running(self.task.id, i64::from(pid)).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("任务 {} 在进程启动时已处于终止状态，终止进程", self.task.id);
                return false;
            }
            Err(e) => error!("更新任务 {} 为运行中失败: {}", self.task.id, e),
        }
        let stat = match store.task_stats.get(self.task.id).await {
            Ok(mut stat) => {
                stat.mark_started(Utc::now());
                store.task_stats.update(&stat).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = stat {
            error!("记录任务 {} 开始时间失败: {}", self.task.id, e);
        }
        true
    }

    /// 写入终止状态、统计并发送通知
    async fn finalize(&self, signal: RunnerSignal) -> ClusterResult<TaskStatus> {
        let store = &self.ctx.store;
        let (status, message) = signal.into_outcome();

        let updated = store
            .tasks
            .update_status(self.task.id, status, message.as_deref(), &self.ctx.node_key)
            .await?;
        let status = if updated {
            status
        } else {
            // 调度器或取消路径已经写入了终止状态
            store.tasks.get(self.task.id).await?.status
        };

        let mut stat = store.task_stats.get(self.task.id).await?;
        stat.mark_ended(Utc::now());
        store.task_stats.update(&stat).await?;
        store
            .spiders
            .accumulate_stat(self.task.spider_id, self.task.id, &stat)
            .await?;

        metrics::counter!("cluster_task_finished_total", "status" => status.as_str()).increment(1);
        match &message {
            Some(message) => warn!("任务 {} 结束，状态 {}: {}", self.task.id, status, message),
            None => info!(
                "任务 {} 结束，状态 {}，耗时 {}ms",
                self.task.id, status, stat.total_duration
            ),
        }

        let client = Arc::clone(&self.ctx.client);
        let task_id = self.task.id;
        tokio::spawn(async move {
            if let Err(e) = client.send_notification(task_id).await {
                warn!("发送任务 {} 的通知失败: {}", task_id, e);
            }
        });

        Ok(status)
    }

    /// 终止进程树并等待确认退出
    ///
    /// 超过取消超时仍有进程存在时返回 `ProcessStillExists`。
    pub async fn cancel(&self, force: bool) -> ClusterResult<()> {
        self.cancel_requested.store(true, Ordering::SeqCst);
        let Some(pid) = self.pid() else {
            info!("任务 {} 尚未启动进程，已记录取消请求", self.task.id);
            return Ok(());
        };
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut tree = process::descendants(pid);
        tree.push(pid);
        info!(
            "取消任务 {}（进程号 {}，force={}，共 {} 个进程）",
            self.task.id,
            pid,
            force,
            tree.len()
        );
        if let Err(e) = process::kill_tree(pid, force).await {
            warn!("终止任务 {} 的进程树出错: {}", self.task.id, e);
        }

        let deadline = Instant::now() + self.ctx.config.cancel_timeout();
        let mut interval = tokio::time::interval(self.ctx.config.health_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if process::all_gone(&tree) {
                info!("任务 {} 的进程已全部退出", self.task.id);
                return Ok(());
            }
            if Instant::now() >= deadline {
                error!("任务 {} 的进程 {} 在取消超时后仍然存在", self.task.id, pid);
                return Err(ClusterError::ProcessStillExists { pid });
            }
        }
    }
}

/// 进程存活检查；进程消失而退出回调未到达时投递 `Lost`
async fn health_check(
    pid: u32,
    period: Duration,
    exited: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
    signal_tx: mpsc::Sender<RunnerSignal>,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        if exited.load(Ordering::SeqCst) {
            return;
        }
        if cancel_requested.load(Ordering::SeqCst) {
            continue;
        }
        if !process::exists(pid) {
            tokio::time::sleep(LOST_GRACE).await;
            if !exited.load(Ordering::SeqCst) {
                warn!("进程 {} 已消失但未收到退出状态", pid);
                let _ = signal_tx.try_send(RunnerSignal::Lost);
            }
            return;
        }
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R, lines: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if lines.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("输出读取结束: {}", e);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_classify_exit() {
        let ok = ExitStatus::from_raw(0);
        let failed = ExitStatus::from_raw(3 << 8);
        let killed = ExitStatus::from_raw(9);

        assert_eq!(classify_exit(ok, false), RunnerSignal::Finish);
        assert_eq!(classify_exit(ok, true), RunnerSignal::Finish);
        assert_eq!(
            classify_exit(failed, false),
            RunnerSignal::Error("exit status 3".to_string())
        );
        assert_eq!(classify_exit(failed, true), RunnerSignal::Cancel);
        assert_eq!(classify_exit(killed, false), RunnerSignal::Lost);
        assert_eq!(classify_exit(killed, true), RunnerSignal::Cancel);
    }

    #[test]
    fn test_lost_is_recorded_as_error() {
        let (status, message) = RunnerSignal::Lost.into_outcome();
        assert_eq!(status, TaskStatus::Error);
        assert_eq!(message.as_deref(), Some("process lost"));
    }

    #[tokio::test]
    async fn test_health_check_reports_lost_process() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let exited = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(health_check(
            pid,
            Duration::from_millis(100),
            Arc::clone(&exited),
            Arc::new(AtomicBool::new(false)),
            tx,
        ));

        child.kill().await.unwrap();
        assert_eq!(rx.recv().await, Some(RunnerSignal::Lost));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_lines_splits_output() {
        let (tx, mut rx) = mpsc::channel(8);
        read_lines(&b"first\r\nsecond\nlast"[..], tx).await;
        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        assert_eq!(rx.recv().await.as_deref(), Some("second"));
        assert_eq!(rx.recv().await.as_deref(), Some("last"));
        assert_eq!(rx.recv().await, None);
    }
}
