use std::marker::PhantomData;

use async_trait::async_trait;
use cluster_core::ClusterResult;
use cluster_domain::{Entity, Repository};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// 从查询结果行构造实体
pub trait FromSqliteRow: Entity + Sized {
    /// `SELECT` 使用的列清单
    const COLUMNS: &'static str;

    fn from_row(row: &SqliteRow) -> ClusterResult<Self>;
}

/// 按实体类型参数化的 SQLite 仓储
///
/// 通用的按主键读写在这里实现，各实体特有的操作以
/// `impl XxxRepository for SqliteRepository<Xxx>` 的形式补充。
pub struct SqliteRepository<T> {
    pub(crate) pool: SqlitePool,
    _entity: PhantomData<fn() -> T>,
}

impl<T> SqliteRepository<T> {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            _entity: PhantomData,
        }
    }
}

impl<T> Clone for SqliteRepository<T> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

impl<T: FromSqliteRow> SqliteRepository<T> {
    pub(crate) fn select_sql(filter: &str) -> String {
        format!("SELECT {} FROM {} {}", T::COLUMNS, T::TABLE, filter)
    }

    pub(crate) fn map_rows(rows: &[SqliteRow]) -> ClusterResult<Vec<T>> {
        rows.iter().map(T::from_row).collect()
    }
}

#[async_trait]
impl<T: FromSqliteRow> Repository<T> for SqliteRepository<T> {
    async fn find_by_id(&self, id: i64) -> ClusterResult<Option<T>> {
        let row = sqlx::query(&Self::select_sql("WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(T::from_row).transpose()
    }

    async fn list(&self) -> ClusterResult<Vec<T>> {
        let rows = sqlx::query(&Self::select_sql("ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Self::map_rows(&rows)
    }

    async fn count(&self) -> ClusterResult<i64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS count FROM {}", T::TABLE))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn delete_by_id(&self, id: i64) -> ClusterResult<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", T::TABLE))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
