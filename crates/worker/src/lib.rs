//! # Cluster Worker
//!
//! 节点侧组件：控制平面客户端、节点代理、任务领取循环与任务执行器。
//! 主节点也运行任务领取循环，通过回环地址访问自身的控制平面。

pub mod agent;
pub mod client;
pub mod fetcher;
pub mod log_forwarder;
pub mod process;
pub mod runner;
pub mod sync;

pub use agent::NodeAgent;
pub use client::{ConnectionState, ControlPlaneClient, DataStream, MessageStream};
pub use fetcher::{RunnerPool, TaskFetchLoop};
pub use runner::{classify_exit, RunnerContext, RunnerSignal, TaskRunner};
pub use sync::{sync_files, SyncReport};
