use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::handler::HandlerMetadata;
use crate::value_objects::{correlation_id, BucketAssignment, JobPriority, PartitionClaim};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 首次重试的基础退避
pub const RETRY_BASE_DELAY_SECONDS: i64 = 30;

/// 作业状态
///
/// `SavePending → AssignedToBucket → Queued → Processing → {Succeeded | Failed | Cancelled}`，
/// 任意非终态都可以回到 `HeldOnMaster`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    SavePending,
    HeldOnMaster,
    AssignedToBucket,
    Queued,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::SavePending => "SAVE_PENDING",
            JobStatus::HeldOnMaster => "HELD_ON_MASTER",
            JobStatus::AssignedToBucket => "ASSIGNED_TO_BUCKET",
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// 处于这些状态时必须携带完整的 Bucket 分配
    pub fn requires_assignment(&self) -> bool {
        matches!(
            self,
            JobStatus::AssignedToBucket | JobStatus::Queued | JobStatus::Processing
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_final() {
            return false;
        }
        match (self, next) {
            (_, HeldOnMaster) | (_, Cancelled) => true,
            (SavePending, AssignedToBucket) | (HeldOnMaster, AssignedToBucket) => true,
            (AssignedToBucket, Queued) => true,
            (AssignedToBucket, Processing) | (Queued, Processing) => true,
            (Processing, Succeeded) | (Processing, Failed) => true,
            // 重试耗尽时可从任意非终态直接失败
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SAVE_PENDING" => Ok(JobStatus::SavePending),
            "HELD_ON_MASTER" => Ok(JobStatus::HeldOnMaster),
            "ASSIGNED_TO_BUCKET" => Ok(JobStatus::AssignedToBucket),
            "QUEUED" => Ok(JobStatus::Queued),
            "PROCESSING" => Ok(JobStatus::Processing),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            _ => Err(SchedulerError::validation_error(format!(
                "Invalid job status: {s}"
            ))),
        }
    }
}

/// 失败后的重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 已退回主存储，在 `at` 之后重新调度
    Rescheduled { at: DateTime<Utc> },
    /// 重试预算耗尽，作业进入终态 `Failed`
    Exhausted,
}

/// 取消请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// 作业正在执行，已标记取消请求，由取消传播扫描器中止
    Requested,
    AlreadyFinal,
}

/// 一次性作业
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub cluster_id: String,
    pub handler_id: String,
    pub priority: JobPriority,
    pub lane: Option<String>,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, String>,
    pub scheduled_at: DateTime<Utc>,
    pub original_scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    pub assignment: Option<BucketAssignment>,
    pub timeout_seconds: i64,
    pub max_retries: i32,
    pub failure_count: i32,
    pub partition_claim: Option<PartitionClaim>,
    pub process_deadline: Option<DateTime<Utc>>,
    pub cancellation_requested: bool,
    /// 传输超时时预分配的消息 id，用于后续重复投递对账
    pub supposed_published_id: Option<String>,
    pub last_error: Option<String>,
    pub recurring_schedule_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub processing_at: Option<DateTime<Utc>>,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 乐观并发版本号
    pub version: i64,
}

impl Job {
    /// 按处理器元数据创建新作业，初始状态为 `SavePending`
    pub fn new(
        cluster_id: impl Into<String>,
        handler: &HandlerMetadata,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id: cluster_id.into(),
            handler_id: handler.handler_id.clone(),
            priority: handler.priority,
            lane: handler.lane.clone(),
            payload,
            metadata: HashMap::new(),
            scheduled_at,
            original_scheduled_at: scheduled_at,
            status: JobStatus::SavePending,
            assignment: None,
            timeout_seconds: handler.timeout_seconds,
            max_retries: handler.max_retries,
            failure_count: 0,
            partition_claim: None,
            process_deadline: None,
            cancellation_requested: false,
            supposed_published_id: None,
            last_error: None,
            recurring_schedule_id: None,
            created_at: Utc::now(),
            processing_at: None,
            succeeded_at: None,
            finished_at: None,
            version: 0,
        }
    }

    pub fn correlation_id(&self) -> String {
        correlation_id(self.id)
    }

    pub fn timeout(&self) -> Duration {
        Duration::seconds(self.timeout_seconds)
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    /// 作业是否即将开始（计划时间落在 on-boarding 窗口内）
    pub fn is_within_onboarding_window(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.scheduled_at <= now + window
    }

    /// 分配字段与状态是否一致
    pub fn assignment_is_consistent(&self) -> bool {
        if self.status.requires_assignment() {
            self.assignment.is_some()
        } else {
            self.assignment.is_none()
        }
    }

    fn transition(&mut self, next: JobStatus) -> SchedulerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::invalid_transition("Job", self.status, next));
        }
        self.status = next;
        Ok(())
    }

    pub fn assign_to_bucket(&mut self, assignment: BucketAssignment) -> SchedulerResult<()> {
        self.transition(JobStatus::AssignedToBucket)?;
        self.assignment = Some(assignment);
        self.supposed_published_id = None;
        Ok(())
    }

    /// 退回主存储：清除分配与执行截止时间
    pub fn hold_on_master(&mut self) -> SchedulerResult<()> {
        self.transition(JobStatus::HeldOnMaster)?;
        self.assignment = None;
        self.process_deadline = None;
        Ok(())
    }

    /// 传输结果未知时退回主存储，并记住预分配的消息 id
    pub fn hold_on_master_with_supposed_id(&mut self, supposed_id: String) -> SchedulerResult<()> {
        self.hold_on_master()?;
        self.supposed_published_id = Some(supposed_id);
        Ok(())
    }

    pub fn mark_queued(&mut self) -> SchedulerResult<()> {
        self.transition(JobStatus::Queued)
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.transition(JobStatus::Processing)?;
        self.processing_at = Some(now);
        self.process_deadline = Some(now + self.timeout());
        Ok(())
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.transition(JobStatus::Succeeded)?;
        self.succeeded_at = Some(now);
        self.finished_at = Some(now);
        self.process_deadline = None;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.transition(JobStatus::Cancelled)?;
        self.assignment = None;
        self.process_deadline = None;
        self.finished_at = Some(now);
        Ok(())
    }

    /// 第 `failure_count` 次失败后的退避：`30s * 2^(failure_count-1) + timeout`
    pub fn retry_delay(failure_count: i32, timeout: Duration) -> Duration {
        let exponent = (failure_count.max(1) - 1).min(20) as u32;
        Duration::seconds(RETRY_BASE_DELAY_SECONDS * 2_i64.pow(exponent)) + timeout
    }

    /// 记录一次失败并决定是否重试
    pub fn try_retry(
        &mut self,
        now: DateTime<Utc>,
        error: impl Into<String>,
    ) -> SchedulerResult<RetryDecision> {
        self.last_error = Some(error.into());

        if self.failure_count >= self.max_retries {
            self.transition(JobStatus::Failed)?;
            self.assignment = None;
            self.process_deadline = None;
            self.finished_at = Some(now);
            return Ok(RetryDecision::Exhausted);
        }

        self.failure_count += 1;
        self.hold_on_master()?;
        let at = now + Self::retry_delay(self.failure_count, self.timeout());
        self.scheduled_at = at;
        Ok(RetryDecision::Rescheduled { at })
    }

    /// 请求取消；即将开始的作业拒绝取消，执行中的作业只打取消标记
    pub fn request_cancellation(
        &mut self,
        now: DateTime<Utc>,
        onboarding_window: Duration,
    ) -> SchedulerResult<CancelOutcome> {
        if self.is_final() {
            return Ok(CancelOutcome::AlreadyFinal);
        }
        if self.status == JobStatus::Processing {
            self.cancellation_requested = true;
            return Ok(CancelOutcome::Requested);
        }
        if self.is_within_onboarding_window(now, onboarding_window) {
            return Err(SchedulerError::CancellationRefused {
                job_id: self.id.to_string(),
            });
        }
        self.mark_cancelled(now)?;
        Ok(CancelOutcome::Cancelled)
    }
}
