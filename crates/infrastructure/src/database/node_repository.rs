use async_trait::async_trait;
use chrono::Utc;
use cluster_core::ClusterResult;
use cluster_domain::{NodeRecord, NodeRegistration, NodeRepository, NodeStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, instrument};

use super::repository::{FromSqliteRow, SqliteRepository};

pub type SqliteNodeRepository = SqliteRepository<NodeRecord>;

impl FromSqliteRow for NodeRecord {
    const COLUMNS: &'static str = "id, key, name, status, active, active_at, is_master, enabled, \
         current_runners, max_runners, created_at, updated_at";

    fn from_row(row: &SqliteRow) -> ClusterResult<Self> {
        Ok(NodeRecord {
            id: row.try_get("id")?,
            key: row.try_get("key")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            active: row.try_get("active")?,
            active_at: row.try_get("active_at")?,
            is_master: row.try_get("is_master")?,
            enabled: row.try_get("enabled")?,
            current_runners: row.try_get("current_runners")?,
            max_runners: row.try_get("max_runners")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl NodeRepository for SqliteRepository<NodeRecord> {
    async fn find_by_key(&self, key: &str) -> ClusterResult<Option<NodeRecord>> {
        let row = sqlx::query(&Self::select_sql("WHERE key = ?"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(NodeRecord::from_row).transpose()
    }

    #[instrument(skip(self, registration), fields(key = %registration.key))]
    async fn upsert_online(&self, registration: &NodeRegistration) -> ClusterResult<NodeRecord> {
        let now = Utc::now();
        let sql = format!(
            r#"
            INSERT INTO nodes (key, name, status, active, active_at, is_master, enabled,
                               current_runners, max_runners, created_at, updated_at)
            VALUES (?, ?, ?, 1, ?, ?, 1, 0, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                active = 1,
                active_at = excluded.active_at,
                is_master = excluded.is_master,
                max_runners = excluded.max_runners,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            NodeRecord::COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&registration.key)
            .bind(&registration.name)
            .bind(NodeStatus::Online)
            .bind(now)
            .bind(registration.is_master)
            .bind(registration.max_runners)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        debug!("节点注册成功: {}", registration.key);
        NodeRecord::from_row(&row)
    }

    async fn touch_online(&self, key: &str) -> ClusterResult<Option<NodeRecord>> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE nodes SET status = ?, active = 1, active_at = ?, updated_at = ? \
             WHERE key = ? RETURNING {}",
            NodeRecord::COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(NodeStatus::Online)
            .bind(now)
            .bind(now)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(NodeRecord::from_row).transpose()
    }

    async fn mark_offline(&self, id: i64) -> ClusterResult<()> {
        let result =
            sqlx::query("UPDATE nodes SET status = ?, active = 0, updated_at = ? WHERE id = ?")
                .bind(NodeStatus::Offline)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(cluster_core::ClusterError::NodeNotFound {
                key: id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_current_runners(&self, id: i64, current_runners: i32) -> ClusterResult<()> {
        sqlx::query("UPDATE nodes SET current_runners = ?, updated_at = ? WHERE id = ?")
            .bind(current_runners)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> ClusterResult<()> {
        sqlx::query("UPDATE nodes SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active(&self) -> ClusterResult<Vec<NodeRecord>> {
        let rows = sqlx::query(&Self::select_sql("WHERE active = 1 ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Self::map_rows(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use cluster_domain::Repository;

    fn registration(key: &str, max_runners: i32) -> NodeRegistration {
        NodeRegistration {
            key: key.to_string(),
            name: format!("{key}-host"),
            max_runners,
            is_master: false,
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent_by_key() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = SqliteNodeRepository::new(db.pool().clone());

        let first = repo.upsert_online(&registration("w1", 2)).await.unwrap();
        let second = repo.upsert_online(&registration("w1", 4)).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.max_runners, 4);
        assert_eq!(second.status, NodeStatus::Online);
        assert!(second.active && second.enabled);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offline_then_heartbeat_restores_online() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = SqliteNodeRepository::new(db.pool().clone());
        let node = repo.upsert_online(&registration("w1", 1)).await.unwrap();

        repo.mark_offline(node.id).await.unwrap();
        let stored = repo.find_by_id(node.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Offline);
        assert!(!stored.active);
        assert!(repo.list_active().await.unwrap().is_empty());

        let touched = repo.touch_online("w1").await.unwrap().unwrap();
        assert!(touched.is_online());
        assert!(touched.active_at >= stored.active_at);

        assert!(repo.touch_online("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runner_count_and_enabled_flag() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let repo = SqliteNodeRepository::new(db.pool().clone());
        let node = repo.upsert_online(&registration("w1", 3)).await.unwrap();

        repo.update_current_runners(node.id, 2).await.unwrap();
        repo.set_enabled(node.id, false).await.unwrap();

        let stored = repo.find_by_key("w1").await.unwrap().unwrap();
        assert_eq!(stored.current_runners, 2);
        assert_eq!(stored.available_runners(), 1);
        assert!(!stored.is_schedulable());
    }
}
