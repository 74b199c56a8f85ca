//! # Cluster Core
//!
//! 集群各组件共享的基础设施：错误类型、配置加载、节点身份、
//! 指数退避以及 NDJSON 流编解码。

pub mod backoff;
pub mod config;
pub mod errors;
pub mod identity;
pub mod logging;
pub mod ndjson;

pub use backoff::ExponentialBackoff;
pub use config::AppConfig;
pub use errors::*;
pub use identity::NodeIdentity;

/// 统一的Result类型
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;
