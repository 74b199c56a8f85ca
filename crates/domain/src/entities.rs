use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 以字符串形式存入 SQLite 的枚举
macro_rules! sqlite_text_enum {
    ($ty:ident) => {
        impl sqlx::Type<sqlx::Sqlite> for $ty {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(s.parse::<$ty>()?)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            _ => Err(format!("Invalid node status: {s}")),
        }
    }
}

sqlite_text_enum!(NodeStatus);

/// 集群节点记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub status: NodeStatus,
    pub active: bool,
    pub active_at: DateTime<Utc>,
    pub is_master: bool,
    pub enabled: bool,
    pub current_runners: i32,
    pub max_runners: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }

    /// 节点是否可以领取新任务
    pub fn is_schedulable(&self) -> bool {
        self.active && self.enabled
    }

    pub fn available_runners(&self) -> i32 {
        (self.max_runners - self.current_runners).max(0)
    }
}

/// 节点注册参数
#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub key: String,
    pub name: String,
    pub max_runners: i32,
    pub is_master: bool,
}

/// 任务状态
///
/// `Pending -> Assigned -> Running -> {Finished | Error | Cancelled | Abnormal}`，
/// 终止状态之后不再发生任何转换。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Finished,
    Error,
    Cancelled,
    Abnormal,
}

impl TaskStatus {
    /// 尚未结束的状态
    pub const UNFINISHED: [TaskStatus; 3] =
        [TaskStatus::Pending, TaskStatus::Assigned, TaskStatus::Running];

    /// 占用节点执行器的状态
    pub const OCCUPYING: [TaskStatus; 2] = [TaskStatus::Assigned, TaskStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Abnormal => "abnormal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Error | TaskStatus::Cancelled | TaskStatus::Abnormal
        )
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "finished" => Ok(TaskStatus::Finished),
            "error" => Ok(TaskStatus::Error),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "abnormal" => Ok(TaskStatus::Abnormal),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

sqlite_text_enum!(TaskStatus);

/// 任务运行模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskMode {
    /// 任意一个节点领取
    #[default]
    Random,
    /// 每个在线且启用的节点各一个任务
    AllNodes,
    /// 指定节点各一个任务
    SelectedNodes,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Random => "random",
            TaskMode::AllNodes => "all-nodes",
            TaskMode::SelectedNodes => "selected-nodes",
        }
    }
}

impl FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(TaskMode::Random),
            "all-nodes" => Ok(TaskMode::AllNodes),
            "selected-nodes" => Ok(TaskMode::SelectedNodes),
            _ => Err(format!("Invalid task mode: {s}")),
        }
    }
}

sqlite_text_enum!(TaskMode);

/// 一次爬虫执行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,
    pub spider_id: i64,
    /// 未分配时为 0
    pub node_id: i64,
    pub status: TaskStatus,
    /// 为空时使用爬虫自身的命令
    pub cmd: String,
    pub param: String,
    /// 数值越小越优先
    pub priority: i32,
    pub pid: Option<i64>,
    pub error: String,
    pub schedule_id: i64,
    pub mode: TaskMode,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(spider_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            spider_id,
            node_id: 0,
            status: TaskStatus::Pending,
            cmd: String::new(),
            param: String::new(),
            priority: 5,
            pid: None,
            error: String::new(),
            schedule_id: 0,
            mode: TaskMode::Random,
            created_by: String::new(),
            updated_by: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_node(mut self, node_id: i64) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_command(mut self, cmd: impl Into<String>, param: impl Into<String>) -> Self {
        self.cmd = cmd.into();
        self.param = param.into();
        self
    }

    pub fn with_mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_assigned(&self) -> bool {
        self.node_id != 0
    }
}

/// 任务耗时与结果统计，主键与任务相同
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStat {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// 以下时长单位均为毫秒
    pub wait_duration: i64,
    pub runtime_duration: i64,
    pub total_duration: i64,
    pub result_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl TaskStat {
    pub fn new(task_id: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: task_id,
            created_at,
            started_at: None,
            ended_at: None,
            wait_duration: 0,
            runtime_duration: 0,
            total_duration: 0,
            result_count: 0,
            updated_at: created_at,
        }
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.started_at = Some(at);
        self.wait_duration = (at - self.created_at).num_milliseconds().max(0);
        self.updated_at = at;
    }

    /// 记录结束时间并计算各项时长；从未启动的任务等待时长即总时长
    pub fn mark_ended(&mut self, at: DateTime<Utc>) {
        self.ended_at = Some(at);
        self.total_duration = (at - self.created_at).num_milliseconds().max(1);
        match self.started_at {
            Some(started_at) => {
                self.runtime_duration = (at - started_at).num_milliseconds().max(0);
            }
            None => {
                self.wait_duration = self.total_duration;
                self.runtime_duration = 0;
            }
        }
        self.updated_at = at;
    }
}

/// 爬虫定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Spider {
    pub id: i64,
    pub name: String,
    pub cmd: String,
    pub param: String,
    /// 托管在版本库中的爬虫，工作目录为 `<gitId>/<gitRootPath>`
    pub git_id: Option<String>,
    pub git_root_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Spider {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            cmd: cmd.into(),
            param: String::new(),
            git_id: None,
            git_root_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 相对于工作区根目录的爬虫目录
    pub fn working_dir(&self) -> String {
        match &self.git_id {
            Some(git_id) if !git_id.is_empty() => match self.git_root_path.as_deref() {
                Some(root) if !root.trim_matches('/').is_empty() => {
                    format!("{}/{}", git_id, root.trim_matches('/'))
                }
                _ => git_id.clone(),
            },
            _ => self.id.to_string(),
        }
    }

    /// 任务未覆盖时使用爬虫自身的命令与参数
    pub fn command_line(&self, task: &Task) -> String {
        let cmd = if task.cmd.is_empty() { &self.cmd } else { &task.cmd };
        let param = if task.param.is_empty() {
            &self.param
        } else {
            &task.param
        };
        if param.is_empty() {
            cmd.clone()
        } else {
            format!("{cmd} {param}")
        }
    }
}

/// 爬虫累计统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpiderStat {
    pub id: i64,
    pub last_task_id: i64,
    pub tasks: i64,
    pub results: i64,
    pub wait_duration: i64,
    pub runtime_duration: i64,
    pub total_duration: i64,
}

/// 全局环境变量，注入到每个任务进程
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentVariable {
    pub id: i64,
    pub key: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Abnormal.is_terminal());
        assert_eq!("cancelled".parse::<TaskStatus>().unwrap(), TaskStatus::Cancelled);
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskMode::SelectedNodes).unwrap(),
            "\"selected-nodes\""
        );
        assert_eq!("all-nodes".parse::<TaskMode>().unwrap(), TaskMode::AllNodes);
    }

    #[test]
    fn test_stat_durations() {
        let created = Utc::now();
        let mut stat = TaskStat::new(1, created);
        stat.mark_started(created + Duration::milliseconds(300));
        stat.mark_ended(created + Duration::milliseconds(1300));

        assert_eq!(stat.wait_duration, 300);
        assert_eq!(stat.runtime_duration, 1000);
        assert_eq!(stat.total_duration, 1300);
    }

    #[test]
    fn test_stat_for_task_that_never_started() {
        let created = Utc::now();
        let mut stat = TaskStat::new(1, created);
        stat.mark_ended(created + Duration::milliseconds(50));

        assert_eq!(stat.wait_duration, 50);
        assert_eq!(stat.runtime_duration, 0);
    }

    #[test]
    fn test_spider_working_dir_and_command() {
        let mut spider = Spider::new("quotes", "python main.py");
        spider.id = 12;
        spider.param = "--pages 3".to_string();
        assert_eq!(spider.working_dir(), "12");

        spider.git_id = Some("repo-1".to_string());
        spider.git_root_path = Some("/spiders/quotes/".to_string());
        assert_eq!(spider.working_dir(), "repo-1/spiders/quotes");

        let task = Task::new(12);
        assert_eq!(spider.command_line(&task), "python main.py --pages 3");

        let task = Task::new(12).with_command("", "--pages 1");
        assert_eq!(spider.command_line(&task), "python main.py --pages 1");
    }

    #[test]
    fn test_available_runners_never_negative() {
        let now = Utc::now();
        let node = NodeRecord {
            id: 1,
            key: "w1".into(),
            name: "w1".into(),
            status: NodeStatus::Online,
            active: true,
            active_at: now,
            is_master: false,
            enabled: true,
            current_runners: 5,
            max_runners: 3,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(node.available_runners(), 0);
        assert!(node.is_schedulable());
    }
}
