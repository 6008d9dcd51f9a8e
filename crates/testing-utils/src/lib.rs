//! # Scheduler Testing Utils
//!
//! 工作区共享的测试工具：
//!
//! - **Builders**: `JobBuilder`、`ScheduleBuilder`、`BucketBuilder`、`WorkerBuilder`
//! - **Mocks**: 可注入发布超时/失败的 `ScriptedTransport`，`RecordingHandler`，`RecordingEngine`
//! - **Helpers**: 基于内存后端的 `TestCluster` 与 `TestEnv::wait_for`
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
