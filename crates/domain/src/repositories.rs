//! 领域仓储抽象
//!
//! 所有节点共享同一个任务存储；除常规读写外，存储必须提供事务性的
//! "查找并更新"原语用于任务领取。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_core::{ClusterError, ClusterResult};

use crate::entities::{
    EnvironmentVariable, NodeRecord, NodeRegistration, Spider, SpiderStat, Task, TaskStat,
    TaskStatus,
};

/// 可持久化实体，表名在编译期确定
pub trait Entity: Send + Sync + Unpin + 'static {
    const TABLE: &'static str;

    fn not_found(id: i64) -> ClusterError {
        ClusterError::Internal(format!("{} record {} not found", Self::TABLE, id))
    }
}

impl Entity for NodeRecord {
    const TABLE: &'static str = "nodes";

    fn not_found(id: i64) -> ClusterError {
        ClusterError::NodeNotFound { key: id.to_string() }
    }
}

impl Entity for Task {
    const TABLE: &'static str = "tasks";

    fn not_found(id: i64) -> ClusterError {
        ClusterError::TaskNotFound { id }
    }
}

impl Entity for TaskStat {
    const TABLE: &'static str = "task_stats";

    fn not_found(id: i64) -> ClusterError {
        ClusterError::TaskNotFound { id }
    }
}

impl Entity for Spider {
    const TABLE: &'static str = "spiders";

    fn not_found(id: i64) -> ClusterError {
        ClusterError::SpiderNotFound { id }
    }
}

impl Entity for SpiderStat {
    const TABLE: &'static str = "spider_stats";
}

impl Entity for EnvironmentVariable {
    const TABLE: &'static str = "environments";
}

/// 按主键的通用读写
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    async fn find_by_id(&self, id: i64) -> ClusterResult<Option<T>>;
    async fn list(&self) -> ClusterResult<Vec<T>>;
    async fn count(&self) -> ClusterResult<i64>;
    async fn delete_by_id(&self, id: i64) -> ClusterResult<bool>;

    /// 记录不存在时返回对应的"未找到"错误
    async fn get(&self, id: i64) -> ClusterResult<T> {
        self.find_by_id(id).await?.ok_or_else(|| T::not_found(id))
    }
}

#[async_trait]
pub trait NodeRepository: Repository<NodeRecord> {
    async fn find_by_key(&self, key: &str) -> ClusterResult<Option<NodeRecord>>;
    /// 按 key 插入或更新，同时置为在线
    async fn upsert_online(&self, registration: &NodeRegistration) -> ClusterResult<NodeRecord>;
    /// 心跳：刷新在线状态与活跃时间，节点不存在时返回 `None`
    async fn touch_online(&self, key: &str) -> ClusterResult<Option<NodeRecord>>;
    async fn mark_offline(&self, id: i64) -> ClusterResult<()>;
    async fn update_current_runners(&self, id: i64, current_runners: i32) -> ClusterResult<()>;
    async fn set_enabled(&self, id: i64, enabled: bool) -> ClusterResult<()>;
    /// `active = true` 的节点
    async fn list_active(&self) -> ClusterResult<Vec<NodeRecord>>;
}

#[async_trait]
pub trait TaskRepository: Repository<Task> {
    /// 插入任务及其零值统计记录
    async fn insert_with_stat(&self, task: &Task) -> ClusterResult<Task>;

    /// 原子领取：先找已分配给本节点的待执行任务，再找未分配的任务，
    /// 按 `priority`、`id` 升序取第一个并置为 `Assigned`
    async fn claim_next(&self, node_id: i64) -> ClusterResult<Option<i64>>;

    /// 节点上处于 `Assigned`/`Running` 的任务数
    async fn count_occupying(&self, node_id: i64) -> ClusterResult<i64>;

    /// 更新状态；任务已处于终止状态时不做修改并返回 `false`
    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        error: Option<&str>,
        actor: &str,
    ) -> ClusterResult<bool>;

    /// 仅当任务仍为 `Pending` 时置为 `Cancelled`
    async fn cancel_pending(&self, id: i64, actor: &str) -> ClusterResult<bool>;

    /// 置为 `Running` 并记录进程号
    async fn mark_running(&self, id: i64, pid: i64) -> ClusterResult<bool>;

    /// 启动恢复：所有未结束的任务置为 `Abnormal`
    async fn mark_unfinished_abnormal(&self, error: &str) -> ClusterResult<u64>;

    /// 删除统计记录早于 `before` 且已结束的任务及其统计
    async fn delete_finished_before(&self, before: DateTime<Utc>) -> ClusterResult<u64>;

    async fn list_by_status(&self, status: TaskStatus) -> ClusterResult<Vec<Task>>;
}

#[async_trait]
pub trait TaskStatRepository: Repository<TaskStat> {
    async fn update(&self, stat: &TaskStat) -> ClusterResult<()>;
    async fn increment_result_count(&self, task_id: i64, delta: i64) -> ClusterResult<()>;
}

#[async_trait]
pub trait SpiderRepository: Repository<Spider> {
    async fn insert(&self, spider: &Spider) -> ClusterResult<Spider>;
    async fn find_stat(&self, spider_id: i64) -> ClusterResult<Option<SpiderStat>>;
    /// 一个任务结束后累加爬虫统计
    async fn accumulate_stat(&self, spider_id: i64, task_id: i64, stat: &TaskStat)
        -> ClusterResult<()>;
}

#[async_trait]
pub trait EnvironmentRepository: Repository<EnvironmentVariable> {
    async fn upsert(&self, key: &str, value: &str) -> ClusterResult<EnvironmentVariable>;
}

#[async_trait]
pub trait TaskResultRepository: Send + Sync {
    async fn insert_many(&self, task_id: i64, records: &[serde_json::Value]) -> ClusterResult<u64>;
    async fn count_by_task(&self, task_id: i64) -> ClusterResult<i64>;
}

/// 共享存储的全部仓储
#[derive(Clone)]
pub struct Store {
    pub nodes: Arc<dyn NodeRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub task_stats: Arc<dyn TaskStatRepository>,
    pub spiders: Arc<dyn SpiderRepository>,
    pub environments: Arc<dyn EnvironmentRepository>,
    pub results: Arc<dyn TaskResultRepository>,
}
