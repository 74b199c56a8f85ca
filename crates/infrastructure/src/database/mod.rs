pub mod manager;
pub mod node_repository;
pub mod repository;
pub mod spider_repository;
pub mod task_repository;

pub use manager::DatabaseManager;
pub use node_repository::SqliteNodeRepository;
pub use repository::{FromSqliteRow, SqliteRepository};
pub use spider_repository::{
    SqliteEnvironmentRepository, SqliteSpiderRepository, SqliteTaskResultRepository,
};
pub use task_repository::{SqliteTaskRepository, SqliteTaskStatRepository};
