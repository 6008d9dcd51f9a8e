use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::handler::HandlerMetadata;
use crate::value_objects::{correlation_id, BucketAssignment, JobPriority, PartitionClaim};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 周期计划状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurringScheduleStatus {
    PendingSave,
    Active,
    Inactive,
    Canceled,
    Completed,
}

impl RecurringScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurringScheduleStatus::PendingSave => "PENDING_SAVE",
            RecurringScheduleStatus::Active => "ACTIVE",
            RecurringScheduleStatus::Inactive => "INACTIVE",
            RecurringScheduleStatus::Canceled => "CANCELED",
            RecurringScheduleStatus::Completed => "COMPLETED",
        }
    }

    /// 不再参与计划的状态
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            RecurringScheduleStatus::Inactive
                | RecurringScheduleStatus::Canceled
                | RecurringScheduleStatus::Completed
        )
    }
}

impl fmt::Display for RecurringScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecurringScheduleStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_SAVE" => Ok(RecurringScheduleStatus::PendingSave),
            "ACTIVE" => Ok(RecurringScheduleStatus::Active),
            "INACTIVE" => Ok(RecurringScheduleStatus::Inactive),
            "CANCELED" => Ok(RecurringScheduleStatus::Canceled),
            "COMPLETED" => Ok(RecurringScheduleStatus::Completed),
            _ => Err(SchedulerError::validation_error(format!(
                "Invalid recurring schedule status: {s}"
            ))),
        }
    }
}

/// 周期表达式类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpressionKind {
    /// 带秒字段的 cron 表达式
    Cron,
    /// `every N seconds|minutes|hours`
    Interval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceExpression {
    pub kind: ExpressionKind,
    pub text: String,
}

impl RecurrenceExpression {
    pub fn cron(text: impl Into<String>) -> Self {
        Self {
            kind: ExpressionKind::Cron,
            text: text.into(),
        }
    }

    pub fn interval(text: impl Into<String>) -> Self {
        Self {
            kind: ExpressionKind::Interval,
            text: text.into(),
        }
    }
}

/// profile 声明的静态周期计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticScheduleDefinition {
    /// profile 内唯一的定义 id
    pub definition_id: String,
    pub handler_id: String,
    pub expression: RecurrenceExpression,
    /// 缺省使用集群时区
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub start_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_before: Option<DateTime<Utc>>,
}

/// 周期计划定义
///
/// 动态计划由接口创建；静态计划由 profile 声明，每次启动时重新确认。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurringSchedule {
    pub id: Uuid,
    pub cluster_id: String,
    pub handler_id: String,
    pub priority: JobPriority,
    pub lane: Option<String>,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, String>,
    pub expression: RecurrenceExpression,
    /// IANA 时区名
    pub timezone: String,
    pub status: RecurringScheduleStatus,
    pub assignment: Option<BucketAssignment>,
    /// 已物化为作业的 UTC 计划边界，只能前移
    pub last_plan_coverage_until: Option<DateTime<Utc>>,
    pub last_executed_plan: Option<DateTime<Utc>>,
    pub has_failed_on_last_plan: bool,
    pub is_job_cancellation_pending: bool,
    pub start_after: Option<DateTime<Utc>>,
    pub end_before: Option<DateTime<Utc>>,
    pub static_definition_id: Option<String>,
    pub profile_id: Option<String>,
    pub static_last_ensured: Option<DateTime<Utc>>,
    pub partition_claim: Option<PartitionClaim>,
    pub timeout_seconds: i64,
    pub max_retries: i32,
    pub supposed_published_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl RecurringSchedule {
    pub fn new(
        cluster_id: impl Into<String>,
        handler: &HandlerMetadata,
        expression: RecurrenceExpression,
        timezone: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cluster_id: cluster_id.into(),
            handler_id: handler.handler_id.clone(),
            priority: handler.priority,
            lane: handler.lane.clone(),
            payload,
            metadata: HashMap::new(),
            expression,
            timezone: timezone.into(),
            status: RecurringScheduleStatus::PendingSave,
            assignment: None,
            last_plan_coverage_until: None,
            last_executed_plan: None,
            has_failed_on_last_plan: false,
            is_job_cancellation_pending: false,
            start_after: None,
            end_before: None,
            static_definition_id: None,
            profile_id: None,
            static_last_ensured: None,
            partition_claim: None,
            timeout_seconds: handler.timeout_seconds,
            max_retries: handler.max_retries,
            supposed_published_id: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            version: 0,
        }
    }

    pub fn correlation_id(&self) -> String {
        correlation_id(self.id)
    }

    pub fn is_static(&self) -> bool {
        self.static_definition_id.is_some()
    }

    pub fn is_plannable(&self) -> bool {
        self.status == RecurringScheduleStatus::Active
    }

    /// 下一次计划的起点：上次覆盖边界、开始时间与创建时间中最晚者
    pub fn planning_base(&self) -> DateTime<Utc> {
        let mut base = self.created_at;
        if let Some(start) = self.start_after {
            base = base.max(start);
        }
        if let Some(coverage) = self.last_plan_coverage_until {
            base = base.max(coverage);
        }
        base
    }

    pub fn assign_to_bucket(&mut self, assignment: BucketAssignment) -> SchedulerResult<()> {
        if self.status != RecurringScheduleStatus::PendingSave {
            return Err(SchedulerError::invalid_transition(
                "RecurringSchedule",
                self.status,
                "AssignedToBucket",
            ));
        }
        self.assignment = Some(assignment);
        self.supposed_published_id = None;
        Ok(())
    }

    pub fn activate(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        match self.status {
            RecurringScheduleStatus::PendingSave | RecurringScheduleStatus::Active => {
                self.status = RecurringScheduleStatus::Active;
                self.updated_at = now;
                Ok(())
            }
            other => Err(SchedulerError::invalid_transition(
                "RecurringSchedule",
                other,
                RecurringScheduleStatus::Active,
            )),
        }
    }

    /// 没有可用 Bucket 时留在主存储，由扫描器直接计划
    pub fn hold_on_master(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.assignment = None;
        self.activate(now)
    }

    /// 只前移计划覆盖边界，返回是否发生了变化
    pub fn advance_coverage(&mut self, until: DateTime<Utc>) -> bool {
        match self.last_plan_coverage_until {
            Some(current) if current >= until => false,
            _ => {
                self.last_plan_coverage_until = Some(until);
                true
            }
        }
    }

    fn finish(&mut self, status: RecurringScheduleStatus, now: DateTime<Utc>) -> SchedulerResult<()> {
        if self.status.is_final() {
            return Err(SchedulerError::invalid_transition(
                "RecurringSchedule",
                self.status,
                status,
            ));
        }
        self.status = status;
        self.updated_at = now;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.finish(RecurringScheduleStatus::Completed, now)
    }

    /// 取消计划；已物化但未开始的作业由取消扫描器随后取消
    pub fn cancel(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.finish(RecurringScheduleStatus::Canceled, now)?;
        self.is_job_cancellation_pending = true;
        Ok(())
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.finish(RecurringScheduleStatus::Inactive, now)?;
        self.is_job_cancellation_pending = true;
        Ok(())
    }

    /// 静态计划被 profile 重新声明时恢复；只有 `Inactive` 可以恢复
    pub fn reactivate(&mut self, now: DateTime<Utc>) -> SchedulerResult<()> {
        if self.status != RecurringScheduleStatus::Inactive {
            return Err(SchedulerError::invalid_transition(
                "RecurringSchedule",
                self.status,
                RecurringScheduleStatus::Active,
            ));
        }
        self.status = RecurringScheduleStatus::Active;
        self.finished_at = None;
        self.is_job_cancellation_pending = false;
        self.has_failed_on_last_plan = true;
        self.updated_at = now;
        Ok(())
    }
}
