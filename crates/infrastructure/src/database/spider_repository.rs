use async_trait::async_trait;
use chrono::Utc;
use cluster_core::ClusterResult;
use cluster_domain::{
    EnvironmentRepository, EnvironmentVariable, Spider, SpiderRepository, SpiderStat, TaskStat,
    TaskResultRepository,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::repository::{FromSqliteRow, SqliteRepository};

pub type SqliteSpiderRepository = SqliteRepository<Spider>;
pub type SqliteEnvironmentRepository = SqliteRepository<EnvironmentVariable>;

impl FromSqliteRow for Spider {
    const COLUMNS: &'static str =
        "id, name, cmd, param, git_id, git_root_path, created_at, updated_at";

    fn from_row(row: &SqliteRow) -> ClusterResult<Self> {
        Ok(Spider {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            cmd: row.try_get("cmd")?,
            param: row.try_get("param")?,
            git_id: row.try_get("git_id")?,
            git_root_path: row.try_get("git_root_path")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl FromSqliteRow for SpiderStat {
    const COLUMNS: &'static str =
        "id, last_task_id, tasks, results, wait_duration, runtime_duration, total_duration";

    fn from_row(row: &SqliteRow) -> ClusterResult<Self> {
        Ok(SpiderStat {
            id: row.try_get("id")?,
            last_task_id: row.try_get("last_task_id")?,
            tasks: row.try_get("tasks")?,
            results: row.try_get("results")?,
            wait_duration: row.try_get("wait_duration")?,
            runtime_duration: row.try_get("runtime_duration")?,
            total_duration: row.try_get("total_duration")?,
        })
    }
}

impl FromSqliteRow for EnvironmentVariable {
    const COLUMNS: &'static str = "id, key, value";

    fn from_row(row: &SqliteRow) -> ClusterResult<Self> {
        Ok(EnvironmentVariable {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            value: row.try_get("value")?,
        })
    }
}

#[async_trait]
impl SpiderRepository for SqliteRepository<Spider> {
    async fn insert(&self, spider: &Spider) -> ClusterResult<Spider> {
        let sql = format!(
            "INSERT INTO spiders (name, cmd, param, git_id, git_root_path, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {}",
            Spider::COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&spider.name)
            .bind(&spider.cmd)
            .bind(&spider.param)
            .bind(&spider.git_id)
            .bind(&spider.git_root_path)
            .bind(spider.created_at)
            .bind(spider.updated_at)
            .fetch_one(&self.pool)
            .await?;
        Spider::from_row(&row)
    }

    async fn find_stat(&self, spider_id: i64) -> ClusterResult<Option<SpiderStat>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?",
            SpiderStat::COLUMNS,
            <SpiderStat as cluster_domain::Entity>::TABLE
        );
        let row = sqlx::query(&sql)
            .bind(spider_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(SpiderStat::from_row).transpose()
    }

    async fn accumulate_stat(
        &self,
        spider_id: i64,
        task_id: i64,
        stat: &TaskStat,
    ) -> ClusterResult<()> {
        sqlx::query(
            r#"
            INSERT INTO spider_stats (id, last_task_id, tasks, results, wait_duration,
                                      runtime_duration, total_duration, updated_at)
            VALUES (?, ?, 1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                last_task_id = excluded.last_task_id,
                tasks = tasks + 1,
                results = results + excluded.results,
                wait_duration = wait_duration + excluded.wait_duration,
                runtime_duration = runtime_duration + excluded.runtime_duration,
                total_duration = total_duration + excluded.total_duration,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(spider_id)
        .bind(task_id)
        .bind(stat.result_count)
        .bind(stat.wait_duration)
        .bind(stat.runtime_duration)
        .bind(stat.total_duration)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!("爬虫 {} 统计已累加任务 {}", spider_id, task_id);
        Ok(())
    }
}

#[async_trait]
impl EnvironmentRepository for SqliteRepository<EnvironmentVariable> {
    async fn upsert(&self, key: &str, value: &str) -> ClusterResult<EnvironmentVariable> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO environments (key, value, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at \
             RETURNING {}",
            EnvironmentVariable::COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        EnvironmentVariable::from_row(&row)
    }
}

/// 任务结果记录，每条结果以 JSON 文本存储
#[derive(Clone)]
pub struct SqliteTaskResultRepository {
    pool: SqlitePool,
}

impl SqliteTaskResultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskResultRepository for SqliteTaskResultRepository {
    async fn insert_many(&self, task_id: i64, records: &[serde_json::Value]) -> ClusterResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query("INSERT INTO task_results (task_id, data, created_at) VALUES (?, ?, ?)")
                .bind(task_id)
                .bind(serde_json::to_string(record)?)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }

    async fn count_by_task(&self, task_id: i64) -> ClusterResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_results WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use cluster_domain::Repository;

    #[tokio::test]
    async fn test_spider_stats_accumulate_per_task() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let spiders = SqliteSpiderRepository::new(db.pool().clone());
        let spider = spiders.insert(&Spider::new("quotes", "echo hi")).await.unwrap();
        assert_eq!(spiders.get(spider.id).await.unwrap().name, "quotes");
        assert!(spiders.find_stat(spider.id).await.unwrap().is_none());

        let mut stat = TaskStat::new(1, Utc::now());
        stat.wait_duration = 10;
        stat.runtime_duration = 100;
        stat.total_duration = 110;
        stat.result_count = 4;
        spiders.accumulate_stat(spider.id, 1, &stat).await.unwrap();
        spiders.accumulate_stat(spider.id, 2, &stat).await.unwrap();

        let aggregated = spiders.find_stat(spider.id).await.unwrap().unwrap();
        assert_eq!(aggregated.tasks, 2);
        assert_eq!(aggregated.results, 8);
        assert_eq!(aggregated.total_duration, 220);
        assert_eq!(aggregated.last_task_id, 2);
    }

    #[tokio::test]
    async fn test_environment_upsert_replaces_value() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let envs = SqliteEnvironmentRepository::new(db.pool().clone());

        envs.upsert("PROXY", "a").await.unwrap();
        envs.upsert("PROXY", "b").await.unwrap();
        envs.upsert("REGION", "eu").await.unwrap();

        let all = envs.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "PROXY");
        assert_eq!(all[0].value, "b");
    }

    #[tokio::test]
    async fn test_results_are_counted_per_task() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let results = SqliteTaskResultRepository::new(db.pool().clone());

        let inserted = results
            .insert_many(
                5,
                &[serde_json::json!({"title": "a"}), serde_json::json!({"title": "b"})],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(results.insert_many(5, &[]).await.unwrap(), 0);
        assert_eq!(results.count_by_task(5).await.unwrap(), 2);
        assert_eq!(results.count_by_task(6).await.unwrap(), 0);
    }
}
