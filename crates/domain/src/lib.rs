//! # Cluster Domain
//!
//! 实体、控制平面消息与仓储抽象。

pub mod entities;
pub mod messages;
pub mod repositories;
pub mod services;

pub use entities::*;
pub use messages::*;
pub use repositories::*;
pub use services::*;
