//! # Cluster Dispatcher
//!
//! 主节点侧的服务：节点注册与推送流、节点巡检、任务队列与任务领取。

pub mod dispatch;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod streams;

#[cfg(test)]
mod test_utils;

pub use dispatch::TaskDispatchService;
pub use monitor::MasterMonitor;
pub use registry::NodeRegistry;
pub use scheduler::{RunOptions, TaskScheduler, RECOVERY_ERROR};
pub use streams::{StreamTable, Subscription};
