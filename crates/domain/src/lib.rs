//! 调度器领域模型
//!
//! 作业、周期计划、Bucket 与 Worker 的状态机，以及主存储仓储、
//! 传输层和本地执行引擎的端口定义。

pub mod handler;
pub mod messaging;
pub mod models;
pub mod ports;
pub mod repositories;
pub mod value_objects;

// SQLx 实现（仅在启用 sqlx-support feature 时编译）
#[cfg(feature = "sqlx-support")]
pub mod sqlx_impls;

pub use handler::*;
pub use messaging::*;
pub use models::*;
pub use ports::*;
pub use repositories::*;
pub use scheduler_errors::{SchedulerError, SchedulerResult};
pub use value_objects::*;
