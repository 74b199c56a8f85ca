use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_core::{ClusterError, ClusterResult};
use cluster_domain::{Task, TaskRepository, TaskStat, TaskStatRepository, TaskStatus};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::{debug, instrument};

use super::repository::{FromSqliteRow, SqliteRepository};

pub type SqliteTaskRepository = SqliteRepository<Task>;
pub type SqliteTaskStatRepository = SqliteRepository<TaskStat>;

const TERMINAL_STATUSES: &str = "('finished', 'error', 'cancelled', 'abnormal')";
const UNFINISHED_STATUSES: &str = "('pending', 'assigned', 'running')";

impl FromSqliteRow for Task {
    const COLUMNS: &'static str = "id, spider_id, node_id, status, cmd, param, priority, pid, \
         error, schedule_id, mode, created_by, updated_by, created_at, updated_at";

    fn from_row(row: &SqliteRow) -> ClusterResult<Self> {
        Ok(Task {
            id: row.try_get("id")?,
            spider_id: row.try_get("spider_id")?,
            node_id: row.try_get("node_id")?,
            status: row.try_get("status")?,
            cmd: row.try_get("cmd")?,
            param: row.try_get("param")?,
            priority: row.try_get("priority")?,
            pid: row.try_get("pid")?,
            error: row.try_get("error")?,
            schedule_id: row.try_get("schedule_id")?,
            mode: row.try_get("mode")?,
            created_by: row.try_get("created_by")?,
            updated_by: row.try_get("updated_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl FromSqliteRow for TaskStat {
    const COLUMNS: &'static str = "id, created_at, started_at, ended_at, wait_duration, \
         runtime_duration, total_duration, result_count, updated_at";

    fn from_row(row: &SqliteRow) -> ClusterResult<Self> {
        Ok(TaskStat {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            wait_duration: row.try_get("wait_duration")?,
            runtime_duration: row.try_get("runtime_duration")?,
            total_duration: row.try_get("total_duration")?,
            result_count: row.try_get("result_count")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl SqliteRepository<Task> {
    /// 在已开启的写事务中依次尝试两种候选
    async fn claim_in_transaction(
        conn: &mut SqliteConnection,
        node_id: i64,
    ) -> ClusterResult<Option<i64>> {
        let now = Utc::now();
        for candidate_node in [node_id, 0] {
            let claimed: Option<i64> = sqlx::query_scalar(
                r#"
                UPDATE tasks SET status = 'assigned', node_id = ?, updated_at = ?
                WHERE id = (
                    SELECT id FROM tasks
                    WHERE status = 'pending' AND node_id = ?
                    ORDER BY priority ASC, id ASC
                    LIMIT 1
                ) AND status = 'pending'
                RETURNING id
                "#,
            )
            .bind(node_id)
            .bind(now)
            .bind(candidate_node)
            .fetch_optional(&mut *conn)
            .await?;

            if claimed.is_some() {
                return Ok(claimed);
            }
        }
        Ok(None)
    }

    async fn ensure_exists(&self, id: i64) -> ClusterResult<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(()),
            None => Err(ClusterError::TaskNotFound { id }),
        }
    }
}

#[async_trait]
impl TaskRepository for SqliteRepository<Task> {
    #[instrument(skip(self, task), fields(spider_id = task.spider_id))]
    async fn insert_with_stat(&self, task: &Task) -> ClusterResult<Task> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO tasks (spider_id, node_id, status, cmd, param, priority, pid, error,
                               schedule_id, mode, created_by, updated_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            Task::COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(task.spider_id)
            .bind(task.node_id)
            .bind(task.status)
            .bind(&task.cmd)
            .bind(&task.param)
            .bind(task.priority)
            .bind(task.pid)
            .bind(&task.error)
            .bind(task.schedule_id)
            .bind(task.mode)
            .bind(&task.created_by)
            .bind(&task.updated_by)
            .bind(task.created_at)
            .bind(task.updated_at)
            .fetch_one(&mut *tx)
            .await?;
        let created = Task::from_row(&row)?;

        let stat = TaskStat::new(created.id, created.created_at);
        sqlx::query(
            r#"
            INSERT INTO task_stats (id, created_at, wait_duration, runtime_duration,
                                    total_duration, result_count, updated_at)
            VALUES (?, ?, 0, 0, 0, 0, ?)
            "#,
        )
        .bind(stat.id)
        .bind(stat.created_at)
        .bind(stat.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("任务已写入: {}", created.id);
        Ok(created)
    }

    /// `BEGIN IMMEDIATE` 先拿到写锁，并发的领取在锁上排队
    ///
    /// 事务在提交前被丢弃（出错或调用方被取消）时由 sqlx 回滚，连接归还连接池时不会持有写锁。
    #[instrument(skip(self))]
    async fn claim_next(&self, node_id: i64) -> ClusterResult<Option<i64>> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let claimed = Self::claim_in_transaction(&mut tx, node_id).await?;
        tx.commit().await?;

        if let Some(task_id) = claimed {
            debug!("节点 {} 领取任务 {}", node_id, task_id);
        }
        Ok(claimed)
    }

    async fn count_occupying(&self, node_id: i64) -> ClusterResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE node_id = ? AND status IN ('assigned', 'running')",
        )
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    #[instrument(skip(self, error))]
    async fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        error: Option<&str>,
        actor: &str,
    ) -> ClusterResult<bool> {
        let sql = format!(
            "UPDATE tasks SET status = ?, error = COALESCE(?, error), updated_by = ?, updated_at = ? \
             WHERE id = ? AND status NOT IN {TERMINAL_STATUSES}"
        );
        let result = sqlx::query(&sql)
            .bind(status)
            .bind(error)
            .bind(actor)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            self.ensure_exists(id).await?;
            debug!("任务 {} 已处于终止状态，忽略状态更新 {}", id, status);
            return Ok(false);
        }
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn cancel_pending(&self, id: i64, actor: &str) -> ClusterResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'cancelled', updated_by = ?, updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(actor)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.ensure_exists(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn mark_running(&self, id: i64, pid: i64) -> ClusterResult<bool> {
        let sql = format!(
            "UPDATE tasks SET status = 'running', pid = ?, updated_at = ? \
             WHERE id = ? AND status NOT IN {TERMINAL_STATUSES}"
        );
        let result = sqlx::query(&sql)
            .bind(pid)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            self.ensure_exists(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn mark_unfinished_abnormal(&self, error: &str) -> ClusterResult<u64> {
        let sql = format!(
            "UPDATE tasks SET status = 'abnormal', error = ?, updated_at = ? \
             WHERE status IN {UNFINISHED_STATUSES}"
        );
        let result = sqlx::query(&sql)
            .bind(error)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_finished_before(&self, before: DateTime<Utc>) -> ClusterResult<u64> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT t.id FROM tasks t JOIN task_stats s ON s.id = t.id \
             WHERE s.created_at < ? AND t.status IN {TERMINAL_STATUSES}"
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(before)
            .fetch_all(&mut *tx)
            .await?;

        for id in ids.iter().copied() {
            sqlx::query("DELETE FROM task_results WHERE task_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM task_stats WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ids.len() as u64)
    }

    async fn list_by_status(&self, status: TaskStatus) -> ClusterResult<Vec<Task>> {
        let rows = sqlx::query(&Self::select_sql("WHERE status = ? ORDER BY id"))
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        Self::map_rows(&rows)
    }
}

#[async_trait]
impl TaskStatRepository for SqliteRepository<TaskStat> {
    async fn update(&self, stat: &TaskStat) -> ClusterResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_stats SET started_at = ?, ended_at = ?, wait_duration = ?,
                runtime_duration = ?, total_duration = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(stat.started_at)
        .bind(stat.ended_at)
        .bind(stat.wait_duration)
        .bind(stat.runtime_duration)
        .bind(stat.total_duration)
        .bind(stat.updated_at)
        .bind(stat.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ClusterError::TaskNotFound { id: stat.id });
        }
        Ok(())
    }

    async fn increment_result_count(&self, task_id: i64, delta: i64) -> ClusterResult<()> {
        sqlx::query(
            "UPDATE task_stats SET result_count = result_count + ?, updated_at = ? WHERE id = ?",
        )
        .bind(delta)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use chrono::Duration;
    use cluster_domain::Repository;

    async fn repo() -> (DatabaseManager, SqliteTaskRepository) {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = SqliteTaskRepository::new(db.pool().clone());
        (db, repo)
    }

    #[tokio::test]
    async fn test_claims_follow_priority_order() {
        let (_db, repo) = repo().await;
        let mut ids = Vec::new();
        for priority in [5, 1, 3] {
            let task = repo
                .insert_with_stat(&Task::new(1).with_priority(priority))
                .await
                .unwrap();
            ids.push(task.id);
        }

        assert_eq!(repo.claim_next(7).await.unwrap(), Some(ids[1]));
        assert_eq!(repo.claim_next(7).await.unwrap(), Some(ids[2]));
        assert_eq!(repo.claim_next(7).await.unwrap(), Some(ids[0]));
        assert_eq!(repo.claim_next(7).await.unwrap(), None);

        let claimed = repo.find_by_id(ids[1]).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Assigned);
        assert_eq!(claimed.node_id, 7);
    }

    #[tokio::test]
    async fn test_tasks_assigned_to_this_node_come_first() {
        let (_db, repo) = repo().await;
        let unassigned = repo
            .insert_with_stat(&Task::new(1).with_priority(1))
            .await
            .unwrap();
        let mine = repo
            .insert_with_stat(&Task::new(1).with_priority(9).with_node(3))
            .await
            .unwrap();
        let other = repo
            .insert_with_stat(&Task::new(1).with_priority(0).with_node(4))
            .await
            .unwrap();

        assert_eq!(repo.claim_next(3).await.unwrap(), Some(mine.id));
        assert_eq!(repo.claim_next(3).await.unwrap(), Some(unassigned.id));
        assert_eq!(repo.claim_next(3).await.unwrap(), None);
        assert_eq!(repo.claim_next(4).await.unwrap(), Some(other.id));
    }

    #[tokio::test]
    async fn test_terminal_status_is_never_left() {
        let (_db, repo) = repo().await;
        let task = repo.insert_with_stat(&Task::new(1)).await.unwrap();

        assert!(repo
            .update_status(task.id, TaskStatus::Cancelled, None, "tester")
            .await
            .unwrap());
        assert!(!repo
            .update_status(task.id, TaskStatus::Running, None, "tester")
            .await
            .unwrap());
        assert!(!repo.mark_running(task.id, 1234).await.unwrap());

        let stored = repo.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.updated_by, "tester");

        assert!(matches!(
            repo.update_status(999, TaskStatus::Error, None, "tester").await,
            Err(ClusterError::TaskNotFound { id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_skips_claimed_task() {
        let (_db, repo) = repo().await;
        let claimed = repo.insert_with_stat(&Task::new(1)).await.unwrap();
        let pending = repo.insert_with_stat(&Task::new(1)).await.unwrap();
        assert_eq!(repo.claim_next(7).await.unwrap(), Some(claimed.id));

        assert!(!repo.cancel_pending(claimed.id, "tester").await.unwrap());
        let stored = repo.find_by_id(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);

        assert!(repo.cancel_pending(pending.id, "tester").await.unwrap());
        let stored = repo.find_by_id(pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert_eq!(stored.updated_by, "tester");

        assert!(matches!(
            repo.cancel_pending(999, "tester").await,
            Err(ClusterError::TaskNotFound { id: 999 })
        ));
    }

    #[tokio::test]
    async fn test_error_text_is_recorded() {
        let (_db, repo) = repo().await;
        let task = repo.insert_with_stat(&Task::new(1)).await.unwrap();
        repo.mark_running(task.id, 42).await.unwrap();
        repo.update_status(task.id, TaskStatus::Error, Some("exit status 2"), "node")
            .await
            .unwrap();

        let stored = repo.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.pid, Some(42));
        assert_eq!(stored.error, "exit status 2");
    }

    #[tokio::test]
    async fn test_recovery_marks_unfinished_tasks_abnormal() {
        let (_db, repo) = repo().await;
        let pending = repo.insert_with_stat(&Task::new(1)).await.unwrap();
        let running = repo.insert_with_stat(&Task::new(1)).await.unwrap();
        repo.mark_running(running.id, 10).await.unwrap();
        let finished = repo.insert_with_stat(&Task::new(1)).await.unwrap();
        repo.update_status(finished.id, TaskStatus::Finished, None, "node")
            .await
            .unwrap();

        let affected = repo.mark_unfinished_abnormal("node lost").await.unwrap();
        assert_eq!(affected, 2);

        let abnormal = repo.list_by_status(TaskStatus::Abnormal).await.unwrap();
        let ids: Vec<i64> = abnormal.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![pending.id, running.id]);
        assert!(abnormal.iter().all(|t| t.error == "node lost"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_finished_tasks() {
        let (db, repo) = repo().await;
        let stats = SqliteTaskStatRepository::new(db.pool().clone());

        let mut old = Task::new(1);
        old.created_at = Utc::now() - Duration::days(40);
        let old = repo.insert_with_stat(&old).await.unwrap();
        repo.update_status(old.id, TaskStatus::Finished, None, "node")
            .await
            .unwrap();

        let mut old_running = Task::new(1);
        old_running.created_at = Utc::now() - Duration::days(40);
        let old_running = repo.insert_with_stat(&old_running).await.unwrap();

        let recent = repo.insert_with_stat(&Task::new(1)).await.unwrap();
        repo.update_status(recent.id, TaskStatus::Finished, None, "node")
            .await
            .unwrap();

        let deleted = repo
            .delete_finished_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.find_by_id(old.id).await.unwrap().is_none());
        assert!(stats.find_by_id(old.id).await.unwrap().is_none());
        assert!(repo.find_by_id(old_running.id).await.unwrap().is_some());
        assert!(repo.find_by_id(recent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stat_update_and_result_count() {
        let (db, repo) = repo().await;
        let stats = SqliteTaskStatRepository::new(db.pool().clone());
        let task = repo.insert_with_stat(&Task::new(1)).await.unwrap();

        let mut stat = stats.get(task.id).await.unwrap();
        assert_eq!(stat.result_count, 0);

        stat.mark_started(task.created_at + Duration::milliseconds(100));
        stat.mark_ended(task.created_at + Duration::milliseconds(600));
        stats.update(&stat).await.unwrap();
        stats.increment_result_count(task.id, 3).await.unwrap();

        let stored = stats.get(task.id).await.unwrap();
        assert_eq!(stored.result_count, 3);
        assert_eq!(stored.runtime_duration, 500);
        assert_eq!(stored.total_duration, 600);
        assert!(stats.get(999).await.is_err());
    }
}
