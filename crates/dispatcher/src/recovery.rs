//! 主存储上的恢复扫描
//!
//! 每种处理器挂在 [`JobScan`](crate::scan_targets::JobScan) 或
//! [`ScheduleScan`](crate::scan_targets::ScheduleScan) 上，由分区扫描器认领后逐条处理。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use scheduler_core::to_chrono;
use scheduler_domain::{
    Job, JobScanKind, JobStatus, RecurringSchedule, RetryDecision, ScheduleScanKind, SchedulerResult,
};

use crate::dispatch_service::DispatchService;
use crate::scan_planner::ScanLane;
use crate::scan_targets::{JobProcessor, ScheduleProcessor};

/// 派发留存在主存储且即将到期的作业
pub struct DueOnMasterProcessor {
    dispatcher: Arc<DispatchService>,
}

impl DueOnMasterProcessor {
    pub fn new(dispatcher: Arc<DispatchService>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobProcessor for DueOnMasterProcessor {
    fn name(&self) -> &'static str {
        "due-on-master"
    }

    fn lane(&self) -> ScanLane {
        ScanLane::DueOnMaster
    }

    fn kind(&self, now: DateTime<Utc>) -> JobScanKind {
        JobScanKind::DueOnMaster {
            horizon: now + self.dispatcher.settings().onboarding_window_chrono(),
        }
    }

    async fn process(&self, job: Job, now: DateTime<Utc>) -> SchedulerResult<()> {
        let job_id = job.id;
        let outcome = self.dispatcher.dispatch_job(job, now).await?;
        debug!("主存储作业 {} 派发结果: {:?}", job_id, outcome);
        Ok(())
    }
}

/// 超过执行截止时间的作业按重试策略退回主存储或标记失败
pub struct DeadlineProcessor {
    dispatcher: Arc<DispatchService>,
}

impl DeadlineProcessor {
    pub fn new(dispatcher: Arc<DispatchService>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobProcessor for DeadlineProcessor {
    fn name(&self) -> &'static str {
        "deadline-exceeded"
    }

    fn lane(&self) -> ScanLane {
        ScanLane::Deadline
    }

    fn kind(&self, _now: DateTime<Utc>) -> JobScanKind {
        JobScanKind::DeadlineExceeded
    }

    async fn process(&self, mut job: Job, now: DateTime<Utc>) -> SchedulerResult<()> {
        let owner = job.assignment.as_ref().map(|a| a.worker_id.clone());
        let decision = job.try_retry(now, "执行超时")?;
        if !self.dispatcher.context().jobs().update(&mut job).await? {
            debug!("超时作业 {} 已被并发修改，跳过", job.id);
            return Ok(());
        }

        metrics::counter!("scheduler_jobs_timed_out_total").increment(1);
        match decision {
            RetryDecision::Rescheduled { at } => {
                info!("作业 {} 执行超时，第 {} 次重试安排在 {}", job.id, job.failure_count, at)
            }
            RetryDecision::Exhausted => warn!("作业 {} 执行超时且重试次数已用尽", job.id),
        }

        if let (Some(engine), Some(owner)) = (self.dispatcher.local_engine(), owner) {
            if owner == engine.worker_id() {
                engine.abort(job.id).await;
            }
        }
        Ok(())
    }
}

/// 处理带取消标记的作业
///
/// 执行中且归属存活远端 Worker 的作业由那个 Worker 的超时巡检自行中止，这里跳过。
pub struct JobCancellationProcessor {
    dispatcher: Arc<DispatchService>,
}

impl JobCancellationProcessor {
    pub fn new(dispatcher: Arc<DispatchService>) -> Self {
        Self { dispatcher }
    }

    async fn owner_is_alive(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let context = self.dispatcher.context();
        let threshold = to_chrono(self.dispatcher.settings().heartbeat_threshold);
        Ok(context
            .workers()
            .get(context.cluster_id(), worker_id)
            .await?
            .is_some_and(|worker| worker.is_alive(now, threshold)))
    }
}

#[async_trait]
impl JobProcessor for JobCancellationProcessor {
    fn name(&self) -> &'static str {
        "job-cancellation"
    }

    fn lane(&self) -> ScanLane {
        ScanLane::JobCancellation
    }

    fn kind(&self, _now: DateTime<Utc>) -> JobScanKind {
        JobScanKind::CancellationRequested
    }

    async fn process(&self, mut job: Job, now: DateTime<Utc>) -> SchedulerResult<()> {
        if job.status == JobStatus::Processing {
            let Some(owner) = job.assignment.as_ref().map(|a| a.worker_id.clone()) else {
                return Ok(());
            };
            if let Some(engine) = self.dispatcher.local_engine() {
                if owner == engine.worker_id() {
                    if engine.abort(job.id).await {
                        debug!("已中止本地执行中的作业 {}", job.id);
                    }
                    return Ok(());
                }
            }
            if self.owner_is_alive(&owner, now).await? {
                return Ok(());
            }
            debug!("作业 {} 的执行者 {} 已失联，直接取消", job.id, owner);
        }

        job.mark_cancelled(now)?;
        if self.dispatcher.context().jobs().update(&mut job).await? {
            info!("作业 {} 已取消", job.id);
        }
        Ok(())
    }
}

/// 周期计划取消或停用后，取消其已物化但尚未开始的作业
pub struct ScheduleCancellationProcessor {
    dispatcher: Arc<DispatchService>,
}

impl ScheduleCancellationProcessor {
    pub fn new(dispatcher: Arc<DispatchService>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl ScheduleProcessor for ScheduleCancellationProcessor {
    fn name(&self) -> &'static str {
        "schedule-cancellation"
    }

    fn lane(&self) -> ScanLane {
        ScanLane::ScheduleCancellation
    }

    fn kind(&self, _now: DateTime<Utc>) -> ScheduleScanKind {
        ScheduleScanKind::JobCancellationPending
    }

    async fn process(&self, mut schedule: RecurringSchedule, now: DateTime<Utc>) -> SchedulerResult<()> {
        let context = self.dispatcher.context();
        let pending = context
            .jobs()
            .list_pending_by_recurring_schedule(&schedule.cluster_id, schedule.id)
            .await?;

        let mut conflicts = 0;
        let mut cancelled = 0;
        for mut job in pending {
            job.mark_cancelled(now)?;
            if context.jobs().update(&mut job).await? {
                cancelled += 1;
            } else {
                conflicts += 1;
            }
        }

        if conflicts > 0 {
            debug!(
                "周期计划 {} 有 {} 个作业取消时版本冲突，下一轮重试",
                schedule.id, conflicts
            );
            return Ok(());
        }

        schedule.is_job_cancellation_pending = false;
        schedule.updated_at = now;
        if context.schedules().update(&mut schedule).await? {
            info!("周期计划 {} 的 {} 个待执行作业已取消", schedule.id, cancelled);
        }
        Ok(())
    }
}
