use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cluster_core::{config::DatabaseConfig, ClusterResult};
use cluster_domain::Store;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use super::{
    SqliteEnvironmentRepository, SqliteNodeRepository, SqliteSpiderRepository,
    SqliteTaskRepository, SqliteTaskResultRepository, SqliteTaskStatRepository,
};

/// 表结构，启动时按顺序执行
const SCHEMA: &[(&str, &str)] = &[
    (
        "nodes",
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'offline',
            active INTEGER NOT NULL DEFAULT 0,
            active_at TEXT NOT NULL,
            is_master INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            current_runners INTEGER NOT NULL DEFAULT 0,
            max_runners INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "tasks",
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            spider_id INTEGER NOT NULL,
            node_id INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            cmd TEXT NOT NULL DEFAULT '',
            param TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 5,
            pid INTEGER,
            error TEXT NOT NULL DEFAULT '',
            schedule_id INTEGER NOT NULL DEFAULT 0,
            mode TEXT NOT NULL DEFAULT 'random',
            created_by TEXT NOT NULL DEFAULT '',
            updated_by TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "task_stats",
        r#"
        CREATE TABLE IF NOT EXISTS task_stats (
            id INTEGER PRIMARY KEY,
            created_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            wait_duration INTEGER NOT NULL DEFAULT 0,
            runtime_duration INTEGER NOT NULL DEFAULT 0,
            total_duration INTEGER NOT NULL DEFAULT 0,
            result_count INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "spiders",
        r#"
        CREATE TABLE IF NOT EXISTS spiders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            cmd TEXT NOT NULL,
            param TEXT NOT NULL DEFAULT '',
            git_id TEXT,
            git_root_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "spider_stats",
        r#"
        CREATE TABLE IF NOT EXISTS spider_stats (
            id INTEGER PRIMARY KEY,
            last_task_id INTEGER NOT NULL DEFAULT 0,
            tasks INTEGER NOT NULL DEFAULT 0,
            results INTEGER NOT NULL DEFAULT 0,
            wait_duration INTEGER NOT NULL DEFAULT 0,
            runtime_duration INTEGER NOT NULL DEFAULT 0,
            total_duration INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "environments",
        r#"
        CREATE TABLE IF NOT EXISTS environments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL UNIQUE,
            value TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "task_results",
        r#"
        CREATE TABLE IF NOT EXISTS task_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "idx_tasks_claim",
        "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, node_id, priority, id)",
    ),
    (
        "idx_task_results_task_id",
        "CREATE INDEX IF NOT EXISTS idx_task_results_task_id ON task_results(task_id)",
    ),
];

/// SQLite 连接池与表结构管理
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 创建连接池并初始化表结构
    pub async fn connect(config: &DatabaseConfig) -> ClusterResult<Self> {
        info!("创建SQLite数据库连接池: {}", config.url);

        let connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await?;

        let manager = Self { pool };
        manager.migrate().await?;
        Ok(manager)
    }

    /// 单连接内存数据库，测试使用
    pub async fn in_memory() -> ClusterResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let manager = Self { pool };
        manager.migrate().await?;
        Ok(manager)
    }

    async fn migrate(&self) -> ClusterResult<()> {
        for (name, sql) in SCHEMA {
            sqlx::query(sql).execute(&self.pool).await?;
            debug!("数据表已就绪: {}", name);
        }
        info!("✅ 数据库表结构初始化完成");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> ClusterResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    /// 组装全部仓储
    pub fn store(&self) -> Store {
        Store {
            nodes: Arc::new(SqliteNodeRepository::new(self.pool.clone())),
            tasks: Arc::new(SqliteTaskRepository::new(self.pool.clone())),
            task_stats: Arc::new(SqliteTaskStatRepository::new(self.pool.clone())),
            spiders: Arc::new(SqliteSpiderRepository::new(self.pool.clone())),
            environments: Arc::new(SqliteEnvironmentRepository::new(self.pool.clone())),
            results: Arc::new(SqliteTaskResultRepository::new(self.pool.clone())),
        }
    }
}
