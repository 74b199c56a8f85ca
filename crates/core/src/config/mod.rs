//! 集群配置
//!
//! 加载顺序：内置默认值 → TOML 配置文件 → `CLUSTER__` 前缀的环境变量。
//! 例如 `CLUSTER__NODE__MAX_RUNNERS=4` 覆盖 `node.max_runners`。

pub mod models;

pub use models::*;
