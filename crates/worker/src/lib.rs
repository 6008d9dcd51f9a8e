//! Worker 进程侧组件
//!
//! 本地执行队列与执行引擎、心跳、Bucket 排空、停止请求监视，以及把它们
//! 与调度协调层组装起来的 [`WorkerNode`]。

pub mod drain;
pub mod engine;
pub mod heartbeat;
pub mod node;
pub mod stop_watcher;
pub mod task_queue;

pub use drain::BucketDrainer;
pub use engine::{EnginePoller, EngineSettings, EngineSweeper, EngineTicker, ExecutionEngine, MessageOutcome};
pub use heartbeat::HeartbeatTask;
pub use node::{default_worker_id, WorkerNode};
pub use stop_watcher::{wait_for_immediate, wait_for_stop, StopWatcher};
pub use task_queue::{AdmissionCheck, EnqueueOutcome, TaskQueueControl, TaskStarter, WAITING_QUEUE_FACTOR};
