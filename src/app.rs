use std::sync::Arc;

use anyhow::{Context, Result};
use cluster_api::AppState;
use cluster_core::config::AppConfig;
use cluster_core::identity::{expand_home, NodeIdentity};
use cluster_dispatcher::{MasterMonitor, NodeRegistry, TaskDispatchService, TaskScheduler};
use cluster_domain::{NotificationSink, RegisterRequest};
use cluster_infrastructure::{DatabaseManager, FileLogDriver, TracingNotificationSink};
use cluster_worker::{ControlPlaneClient, NodeAgent, RunnerContext, TaskFetchLoop};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::shutdown::ShutdownManager;

/// 节点运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 控制平面、监控、调度，同时在本机执行任务
    Master,
    /// 只执行任务
    Worker,
}

/// 组合根：按运行模式构建并启动全部组件
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    identity: NodeIdentity,
    database: DatabaseManager,
}

impl Application {
    pub async fn new(mut config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        config.node.is_master = mode == AppMode::Master;

        let identity_path = expand_home(&config.node.identity_path);
        let identity = NodeIdentity::load_or_create(&identity_path, &config.node)
            .with_context(|| format!("加载节点身份失败: {}", identity_path.display()))?;
        info!("节点身份: key={}, name={}", identity.key, identity.name);

        let database = DatabaseManager::connect(&config.database)
            .await
            .context("连接数据库失败")?;

        Ok(Self {
            config,
            mode,
            identity,
            database,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, shutdown: &ShutdownManager) -> Result<()> {
        let result = match self.mode {
            AppMode::Master => self.run_master(shutdown).await,
            AppMode::Worker => self.run_worker(shutdown).await,
        };
        self.database.close().await;
        result
    }

    fn client(&self) -> Result<Arc<ControlPlaneClient>> {
        ControlPlaneClient::new(
            &self.config.server.master_address,
            &self.identity.auth_key,
            &self.identity.key,
            self.config.transport.clone(),
        )
        .context("创建控制平面客户端失败")
    }

    fn runner_context(&self, client: Arc<ControlPlaneClient>) -> Arc<RunnerContext> {
        Arc::new(RunnerContext {
            store: self.database.store(),
            client,
            node_key: self.identity.key.clone(),
            is_master: self.identity.is_master,
            auth_key: self.identity.auth_key.clone(),
            config: self.config.runner.clone(),
        })
    }

    async fn run_master(&self, shutdown: &ShutdownManager) -> Result<()> {
        info!("启动主节点");
        let store = self.database.store();
        let notifier: Arc<dyn NotificationSink> = Arc::new(TracingNotificationSink);

        let registry = Arc::new(NodeRegistry::new(store.clone(), Arc::clone(&notifier)));
        let logs = Arc::new(FileLogDriver::new(expand_home(&self.config.log.dir)));
        let dispatch = Arc::new(TaskDispatchService::new(
            store.clone(),
            logs,
            Arc::clone(&notifier),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            store.clone(),
            Arc::clone(&registry),
            dispatch.task_streams(),
            notifier,
            self.config.scheduler.clone(),
        ));

        let recovered = scheduler
            .recover_on_startup()
            .await
            .context("恢复未完成任务失败")?;
        if recovered > 0 {
            warn!("{} 个未完成任务已标记为 abnormal", recovered);
        }

        registry
            .register(&RegisterRequest {
                node_key: self.identity.key.clone(),
                node_name: self.identity.name.clone(),
                max_runners: self.identity.max_runners,
                is_master: true,
            })
            .await
            .context("注册主节点失败")?;

        let metrics = if self.config.observability.metrics_enabled {
            Some(
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("安装Prometheus指标导出器失败")?,
            )
        } else {
            None
        };

        let workspace_root = expand_home(&self.config.runner.workspace_dir);
        std::fs::create_dir_all(&workspace_root)
            .with_context(|| format!("创建工作目录失败: {}", workspace_root.display()))?;

        let state = AppState {
            registry: Arc::clone(&registry),
            dispatch,
            database: self.database.clone(),
            auth_key: Arc::from(self.identity.auth_key.as_str()),
            workspace_root: Arc::new(workspace_root),
            metrics,
        };
        let listener = TcpListener::bind(&self.config.server.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.server.bind_address))?;

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let shutdown_rx = shutdown.subscribe().await;
        handles.push(tokio::spawn(async move {
            if let Err(e) = cluster_api::serve(listener, state, shutdown_rx).await {
                error!("控制平面服务异常退出: {}", e);
            }
        }));

        let monitor = MasterMonitor::new(
            store,
            registry,
            self.identity.key.clone(),
            self.config.monitor.clone(),
        );
        let shutdown_rx = shutdown.subscribe().await;
        handles.push(tokio::spawn(async move { monitor.run(shutdown_rx).await }));

        let cleanup = Arc::clone(&scheduler);
        let shutdown_rx = shutdown.subscribe().await;
        handles.push(tokio::spawn(async move { cleanup.run_cleanup(shutdown_rx).await }));

        // 主节点通过回环地址访问自身的控制平面
        let client = self.client()?;
        client
            .connect()
            .await
            .context("无法连接本机控制平面")?;
        if let Some(shutdown_tx) = shutdown.sender().await {
            handles.extend(client.start(shutdown_tx));
        }
        let fetch_loop = TaskFetchLoop::new(
            self.runner_context(Arc::clone(&client)),
            self.config.fetcher.clone(),
        );
        scheduler.set_local_canceller(fetch_loop.clone());
        handles.push(tokio::spawn(
            Arc::clone(&fetch_loop).run(shutdown.subscribe().await),
        ));

        info!("主节点已启动，监听 {}", self.config.server.bind_address);
        futures::future::join_all(handles).await;
        client.close();
        info!("主节点已停止");
        Ok(())
    }

    async fn run_worker(&self, shutdown: &ShutdownManager) -> Result<()> {
        info!("启动工作节点，主节点地址: {}", self.config.server.master_address);
        let Some(shutdown_tx) = shutdown.sender().await else {
            return Ok(());
        };

        let client = self.client()?;
        client.connect().await.context("无法连接控制平面")?;
        let mut handles = client.start(shutdown_tx.clone());

        let fetch_loop = TaskFetchLoop::new(
            self.runner_context(Arc::clone(&client)),
            self.config.fetcher.clone(),
        );
        let agent = NodeAgent::new(
            Arc::clone(&client),
            self.identity.clone(),
            self.config.fetcher.clone(),
            fetch_loop.clone(),
        );
        agent.register().await.context("节点注册失败")?;
        handles.extend(agent.start(&shutdown_tx));
        handles.push(tokio::spawn(
            Arc::clone(&fetch_loop).run(shutdown.subscribe().await),
        ));

        info!("工作节点已启动");
        futures::future::join_all(handles).await;
        client.close();
        info!("工作节点已停止");
        Ok(())
    }
}
