pub mod bucket;
pub mod cluster;
pub mod job;
pub mod lock;
pub mod recurring_schedule;
pub mod worker;

pub use bucket::{Bucket, BucketStatus};
pub use cluster::{ClusterConfiguration, ClusterMode};
pub use job::{CancelOutcome, Job, JobStatus, RetryDecision, RETRY_BASE_DELAY_SECONDS};
pub use lock::{LockRecord, LockToken};
pub use recurring_schedule::{
    ExpressionKind, RecurrenceExpression, RecurringSchedule, RecurringScheduleStatus,
    StaticScheduleDefinition,
};
pub use worker::{Worker, WorkerMode};
