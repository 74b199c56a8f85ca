//! # Cluster Infrastructure
//!
//! SQLite 共享存储、任务日志文件、工作区清单与通知输出。

pub mod database;
pub mod log_driver;
pub mod notification;
pub mod workspace;

pub use database::DatabaseManager;
pub use log_driver::FileLogDriver;
pub use notification::TracingNotificationSink;
