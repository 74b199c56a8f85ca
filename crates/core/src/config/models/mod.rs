pub mod app_config;
pub mod database;
pub mod node;
pub mod observability;
pub mod runtime;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use node::{NodeConfig, ServerConfig};
pub use observability::{LogConfig, ObservabilityConfig};
pub use runtime::{FetcherConfig, MonitorConfig, RunnerConfig, SchedulerConfig, TransportConfig};
