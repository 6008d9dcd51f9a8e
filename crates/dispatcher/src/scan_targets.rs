//! 作业表与周期计划表上的扫描目标
//!
//! 具体的恢复逻辑只需实现 [`JobProcessor`] 或 [`ScheduleProcessor`]，
//! 认领与读回由这里统一委托给主存储仓储。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scheduler_core::ClusterContext;
use scheduler_domain::{Job, JobScanKind, RecurringSchedule, ScheduleScanKind, SchedulerResult};

use crate::scan_planner::{ScanLane, ScanTarget};

#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn lane(&self) -> ScanLane;

    fn kind(&self, now: DateTime<Utc>) -> JobScanKind;

    async fn process(&self, job: Job, now: DateTime<Utc>) -> SchedulerResult<()>;
}

#[async_trait]
pub trait ScheduleProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn lane(&self) -> ScanLane;

    fn kind(&self, now: DateTime<Utc>) -> ScheduleScanKind;

    async fn process(&self, schedule: RecurringSchedule, now: DateTime<Utc>) -> SchedulerResult<()>;
}

pub struct JobScan<P> {
    context: Arc<ClusterContext>,
    processor: P,
}

impl<P: JobProcessor> JobScan<P> {
    pub fn new(context: Arc<ClusterContext>, processor: P) -> Self {
        Self { context, processor }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }
}

#[async_trait]
impl<P: JobProcessor> ScanTarget for JobScan<P> {
    type Item = Job;

    fn name(&self) -> &'static str {
        self.processor.name()
    }

    fn lane(&self) -> ScanLane {
        self.processor.lane()
    }

    fn key(&self, item: &Job) -> String {
        item.id.to_string()
    }

    async fn backlog(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        self.context
            .jobs()
            .count_claimable(self.context.cluster_id(), self.processor.kind(now), now)
            .await
    }

    async fn claim(
        &self,
        lock_id: i64,
        expires_at: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        self.context
            .jobs()
            .claim(
                self.context.cluster_id(),
                self.processor.kind(now),
                lock_id,
                expires_at,
                limit,
                now,
            )
            .await
    }

    async fn load_claimed(&self, lock_id: i64, now: DateTime<Utc>) -> SchedulerResult<Vec<Job>> {
        self.context
            .jobs()
            .list_claimed(self.context.cluster_id(), lock_id, now)
            .await
    }

    async fn process(&self, item: Job, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.processor.process(item, now).await
    }

    async fn release(&self, lock_id: i64) -> SchedulerResult<u64> {
        self.context
            .jobs()
            .release_claim(self.context.cluster_id(), lock_id)
            .await
    }
}

pub struct ScheduleScan<P> {
    context: Arc<ClusterContext>,
    processor: P,
}

impl<P: ScheduleProcessor> ScheduleScan<P> {
    pub fn new(context: Arc<ClusterContext>, processor: P) -> Self {
        Self { context, processor }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }
}

#[async_trait]
impl<P: ScheduleProcessor> ScanTarget for ScheduleScan<P> {
    type Item = RecurringSchedule;

    fn name(&self) -> &'static str {
        self.processor.name()
    }

    fn lane(&self) -> ScanLane {
        self.processor.lane()
    }

    fn key(&self, item: &RecurringSchedule) -> String {
        item.id.to_string()
    }

    async fn backlog(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        self.context
            .schedules()
            .count_claimable(self.context.cluster_id(), self.processor.kind(now), now)
            .await
    }

    async fn claim(
        &self,
        lock_id: i64,
        expires_at: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        self.context
            .schedules()
            .claim(
                self.context.cluster_id(),
                self.processor.kind(now),
                lock_id,
                expires_at,
                limit,
                now,
            )
            .await
    }

    async fn load_claimed(
        &self,
        lock_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<RecurringSchedule>> {
        self.context
            .schedules()
            .list_claimed(self.context.cluster_id(), lock_id, now)
            .await
    }

    async fn process(&self, item: RecurringSchedule, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.processor.process(item, now).await
    }

    async fn release(&self, lock_id: i64) -> SchedulerResult<u64> {
        self.context
            .schedules()
            .release_claim(self.context.cluster_id(), lock_id)
            .await
    }
}
