//! 共享库
//!
//! 包含引擎各组件共用的配置、错误处理、事件信封、重试策略、
//! 数据库连接与日志初始化等基础设施代码。

pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod observability;
pub mod retry;
pub mod test_utils;
