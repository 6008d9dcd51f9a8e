//! Test data builders
//!
//! 默认值足以通过领域校验，测试只需覆盖关心的字段。

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use scheduler_domain::{
    Bucket, BucketAssignment, BucketStatus, HandlerMetadata, Job, JobPriority, JobStatus,
    RecurrenceExpression, RecurringSchedule, RecurringScheduleStatus, Worker, WorkerMode,
};

pub const TEST_CLUSTER: &str = "test-cluster";
pub const TEST_AGENT: &str = "agent-test";

/// Builder for Job entities
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        let meta = HandlerMetadata::new("test-handler").with_timeout_seconds(30);
        Self {
            job: Job::new(TEST_CLUSTER, &meta, json!({}), Utc::now()),
        }
    }

    pub fn with_cluster(mut self, cluster_id: &str) -> Self {
        self.job.cluster_id = cluster_id.to_string();
        self
    }

    pub fn with_handler(mut self, handler_id: &str) -> Self {
        self.job.handler_id = handler_id.to_string();
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.job.priority = priority;
        self
    }

    pub fn with_lane(mut self, lane: &str) -> Self {
        self.job.lane = Some(lane.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.job.payload = payload;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.scheduled_at = at;
        self.job.original_scheduled_at = at;
        self
    }

    pub fn scheduled_in(self, offset: Duration) -> Self {
        self.scheduled_at(Utc::now() + offset)
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.job.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_retries(mut self, max_retries: i32, failure_count: i32) -> Self {
        self.job.max_retries = max_retries;
        self.job.failure_count = failure_count;
        self
    }

    pub fn held_on_master(mut self) -> Self {
        self.job.status = JobStatus::HeldOnMaster;
        self.job.assignment = None;
        self
    }

    pub fn assigned_to(mut self, bucket: &Bucket) -> Self {
        self.job.status = JobStatus::AssignedToBucket;
        self.job.assignment = Some(bucket.assignment());
        self
    }

    /// 已被 Worker 取走消息并进入本地队列的作业
    pub fn queued_on(mut self, bucket: &Bucket) -> Self {
        self.job.status = JobStatus::Queued;
        self.job.assignment = Some(bucket.assignment());
        self
    }

    /// 以 `Processing` 状态分配到指定 Bucket，截止时间为 `deadline`
    pub fn processing_on(mut self, assignment: BucketAssignment, deadline: DateTime<Utc>) -> Self {
        self.job.status = JobStatus::Processing;
        self.job.assignment = Some(assignment);
        self.job.processing_at = Some(deadline - self.job.timeout());
        self.job.process_deadline = Some(deadline);
        self
    }

    pub fn for_schedule(mut self, schedule_id: uuid::Uuid) -> Self {
        self.job.recurring_schedule_id = Some(schedule_id);
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for RecurringSchedule entities
pub struct ScheduleBuilder {
    schedule: RecurringSchedule,
}

impl ScheduleBuilder {
    pub fn new() -> Self {
        let meta = HandlerMetadata::new("test-handler").with_timeout_seconds(30);
        Self {
            schedule: RecurringSchedule::new(
                TEST_CLUSTER,
                &meta,
                RecurrenceExpression::interval("every 5 seconds"),
                "UTC",
                json!({}),
            ),
        }
    }

    pub fn with_cluster(mut self, cluster_id: &str) -> Self {
        self.schedule.cluster_id = cluster_id.to_string();
        self
    }

    pub fn with_handler(mut self, handler_id: &str) -> Self {
        self.schedule.handler_id = handler_id.to_string();
        self
    }

    pub fn cron(mut self, text: &str) -> Self {
        self.schedule.expression = RecurrenceExpression::cron(text);
        self
    }

    pub fn every(mut self, text: &str) -> Self {
        self.schedule.expression = RecurrenceExpression::interval(text);
        self
    }

    pub fn with_timezone(mut self, timezone: &str) -> Self {
        self.schedule.timezone = timezone.to_string();
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule.created_at = at;
        self.schedule.updated_at = at;
        self
    }

    pub fn end_before(mut self, at: DateTime<Utc>) -> Self {
        self.schedule.end_before = Some(at);
        self
    }

    pub fn covered_until(mut self, at: DateTime<Utc>) -> Self {
        self.schedule.last_plan_coverage_until = Some(at);
        self
    }

    pub fn with_failed_last_plan(mut self) -> Self {
        self.schedule.has_failed_on_last_plan = true;
        self
    }

    pub fn active(mut self) -> Self {
        self.schedule.status = RecurringScheduleStatus::Active;
        self
    }

    pub fn with_status(mut self, status: RecurringScheduleStatus) -> Self {
        self.schedule.status = status;
        self
    }

    pub fn static_definition(mut self, profile_id: &str, definition_id: &str) -> Self {
        self.schedule.profile_id = Some(profile_id.to_string());
        self.schedule.static_definition_id = Some(definition_id.to_string());
        self
    }

    pub fn build(self) -> RecurringSchedule {
        self.schedule
    }
}

impl Default for ScheduleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for Worker entities
pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            worker: Worker::new(TEST_CLUSTER, id, TEST_AGENT, None, WorkerMode::Normal),
        }
    }

    pub fn with_cluster(mut self, cluster_id: &str) -> Self {
        self.worker.cluster_id = cluster_id.to_string();
        self
    }

    pub fn with_agent(mut self, agent_connection_id: &str) -> Self {
        self.worker.agent_connection_id = agent_connection_id.to_string();
        self
    }

    pub fn with_lane(mut self, lane: &str) -> Self {
        self.worker.lane = Some(lane.to_string());
        self
    }

    pub fn drain_mode(mut self) -> Self {
        self.worker.mode = WorkerMode::Drain;
        self
    }

    /// 最后一次心跳发生在 `ago` 之前
    pub fn last_seen(mut self, ago: Duration) -> Self {
        self.worker.last_heartbeat = Utc::now() - ago;
        self
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}

/// Builder for Bucket entities
pub struct BucketBuilder {
    bucket: Bucket,
}

impl BucketBuilder {
    pub fn for_worker(worker: &Worker) -> Self {
        Self {
            bucket: Bucket::new(worker, JobPriority::Normal),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.bucket.priority = priority;
        self
    }

    pub fn with_status(mut self, status: BucketStatus) -> Self {
        self.bucket.status = status;
        self
    }

    pub fn with_lane(mut self, lane: &str) -> Self {
        self.bucket.lane = Some(lane.to_string());
        self
    }

    pub fn build(self) -> Bucket {
        self.bucket
    }
}
