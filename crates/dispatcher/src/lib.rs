//! 调度协调层
//!
//! 作业与周期计划的派发决策、Bucket 生命周期、分区扫描与各类恢复任务。

pub mod bucket_lifecycle;
pub mod bucket_selector;
pub mod dead_worker_detector;
pub mod dispatch_service;
pub mod expression;
pub mod recovery;
pub mod recurring_planner;
pub mod retention;
pub mod runner;
pub mod scan_planner;
pub mod scan_targets;
pub mod static_schedules;
pub mod stop_requests;

pub use bucket_lifecycle::{AssignedLostBucketsRunner, BucketLifecycle, FlushOutcome};
pub use bucket_selector::{eligible_buckets, BucketSelector, RandomBucketSelector, RoundRobinBucketSelector};
pub use dead_worker_detector::DeadWorkerDetector;
pub use dispatch_service::{DispatchOutcome, DispatchService, DispatchSettings};
pub use expression::CompiledExpression;
pub use recovery::{
    DeadlineProcessor, DueOnMasterProcessor, JobCancellationProcessor, ScheduleCancellationProcessor,
};
pub use recurring_planner::{MaterializeOutcome, RecurringPlanProcessor, RecurringPlanner, RecurringSettings};
pub use retention::{PurgeReport, RetentionRunner};
pub use runner::{spawn_periodic, PeriodicTask};
pub use scan_planner::{PartitionedScanner, ScanLane, ScanPlan, ScanSettings, TickOutcome};
pub use scan_targets::{JobProcessor, JobScan, ScheduleProcessor, ScheduleScan};
pub use static_schedules::{EnsureReport, StaticOrphanProcessor, StaticScheduleKeeper};
pub use stop_requests::{request_stop, stop_lock_key, StopKind};
