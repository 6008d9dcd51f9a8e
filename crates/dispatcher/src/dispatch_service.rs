//! 作业与周期计划的派发决策
//!
//! 集群处于被动模式或没有可用 Bucket 时留存在主存储；否则持久化分配后，
//! 目标 Bucket 属于本进程、本地队列有空位且作业即将开始时直接交给本地执行引擎，
//! 其余情况经传输层发布。发布超时（结果未知）时带着预分配的消息 id 退回主存储。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scheduler_core::{to_chrono, ClusterContext, ExponentialBackoff, TransportConfig, WorkerConfig};
use scheduler_domain::{
    validate_id, Bucket, BucketAddress, CancelOutcome, DispatchEnvelope, Job, JobPriority,
    JobStatus, LocalExecutionEngine, QueueKind, RecurringSchedule, SchedulerError, SchedulerResult,
};

use crate::bucket_selector::{eligible_buckets, BucketSelector, RandomBucketSelector};
use crate::recurring_planner::RecurringPlanner;

/// 并发修改时取消操作的重试次数
const CANCEL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub onboarding_window: Duration,
    pub heartbeat_threshold: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub max_publish_attempts: u32,
}

impl DispatchSettings {
    pub fn from_config(worker: &WorkerConfig, transport: &TransportConfig) -> Self {
        Self {
            onboarding_window: worker.onboarding_window(),
            heartbeat_threshold: worker.heartbeat_threshold(),
            retry_base: transport.retry_base(),
            retry_max: transport.retry_max(),
            max_publish_attempts: transport.max_publish_attempts,
        }
    }

    pub fn onboarding_window_chrono(&self) -> chrono::Duration {
        to_chrono(self.onboarding_window)
    }

    fn heartbeat_threshold_chrono(&self) -> chrono::Duration {
        to_chrono(self.heartbeat_threshold)
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default(), &TransportConfig::default())
    }
}

/// 派发结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 跳过传输层直接交给本地执行引擎
    ShortCircuited { bucket_id: String },
    Published { bucket_id: String, message_id: String },
    HeldOnMaster,
    /// 实体已被并发修改，本次派发放弃
    Conflict,
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::ShortCircuited { .. } => "short_circuited",
            DispatchOutcome::Published { .. } => "published",
            DispatchOutcome::HeldOnMaster => "held_on_master",
            DispatchOutcome::Conflict => "conflict",
        }
    }
}

pub struct DispatchService {
    context: Arc<ClusterContext>,
    selector: Arc<dyn BucketSelector>,
    local_engine: Option<Arc<dyn LocalExecutionEngine>>,
    settings: DispatchSettings,
    backoff: ExponentialBackoff,
}

impl DispatchService {
    pub fn new(context: Arc<ClusterContext>, settings: DispatchSettings) -> Self {
        let backoff = ExponentialBackoff::new(settings.retry_base, settings.retry_max);
        Self {
            context,
            selector: Arc::new(RandomBucketSelector::new()),
            local_engine: None,
            settings,
            backoff,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn BucketSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_local_engine(mut self, engine: Arc<dyn LocalExecutionEngine>) -> Self {
        self.local_engine = Some(engine);
        self
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn local_engine(&self) -> Option<&Arc<dyn LocalExecutionEngine>> {
        self.local_engine.as_ref()
    }

    /// 按注册的处理器元数据创建作业（尚未持久化）
    pub fn create_job(
        &self,
        handler_id: &str,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
        metadata: HashMap<String, String>,
    ) -> SchedulerResult<Job> {
        let handler = self.context.handlers().metadata(handler_id)?;
        let mut job = Job::new(self.context.cluster_id(), handler, payload, scheduled_at);
        job.metadata = metadata;
        Ok(job)
    }

    /// 持久化并派发一个新作业
    pub async fn schedule_job(&self, job: Job) -> SchedulerResult<DispatchOutcome> {
        validate_id(&job.handler_id)?;
        self.check_payload_size(&job.payload).await?;
        self.context.jobs().insert(&job).await?;
        debug!("作业 {} 已保存 (处理器 {})", job.id, job.handler_id);
        self.dispatch_job(job, Utc::now()).await
    }

    /// 为已持久化的作业选择 Bucket 并派发
    pub async fn dispatch_job(&self, mut job: Job, now: DateTime<Utc>) -> SchedulerResult<DispatchOutcome> {
        let outcome = self.dispatch_job_inner(&mut job, now).await;
        match &outcome {
            Ok(result) => record(result.label()),
            Err(e) if e.is_ambiguous() => record("ambiguous"),
            Err(_) => record("error"),
        }
        outcome
    }

    async fn dispatch_job_inner(&self, job: &mut Job, now: DateTime<Utc>) -> SchedulerResult<DispatchOutcome> {
        if job.is_final() {
            return Ok(DispatchOutcome::Conflict);
        }

        let configuration = self.context.configuration().await?;
        let bucket = if configuration.dispatch_enabled() {
            self.select_bucket(job.priority, job.lane.as_deref(), now).await?
        } else {
            debug!("集群 {} 处于 {} 模式，作业留存在主存储", self.context.cluster_id(), configuration.mode);
            None
        };

        let Some(bucket) = bucket else {
            return self.hold_job(job).await;
        };

        job.assign_to_bucket(bucket.assignment())?;
        if !self.context.jobs().update(job).await? {
            debug!("作业 {} 在分配时发生版本冲突", job.id);
            return Ok(DispatchOutcome::Conflict);
        }

        if let Some(engine) = self.short_circuit_target(&bucket, job, now) {
            match engine.inject(&bucket.id, job.clone()).await {
                Ok(()) => {
                    debug!("作业 {} 短路派发到本地Bucket {}", job.id, bucket.id);
                    return Ok(DispatchOutcome::ShortCircuited { bucket_id: bucket.id });
                }
                Err(e) => debug!("作业 {} 短路派发失败，改为经传输层发布: {}", job.id, e),
            }
        }

        self.publish_job(job, &bucket).await
    }

    fn short_circuit_target(
        &self,
        bucket: &Bucket,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Option<&Arc<dyn LocalExecutionEngine>> {
        let engine = self.local_engine.as_ref()?;
        let eligible = bucket.is_owned_by(engine.worker_id())
            && engine.has_capacity(&bucket.id)
            && job.is_within_onboarding_window(now, self.settings.onboarding_window_chrono());
        eligible.then_some(engine)
    }

    async fn hold_job(&self, job: &mut Job) -> SchedulerResult<DispatchOutcome> {
        if job.status == JobStatus::HeldOnMaster && job.assignment.is_none() {
            return Ok(DispatchOutcome::HeldOnMaster);
        }
        job.hold_on_master()?;
        if self.context.jobs().update(job).await? {
            Ok(DispatchOutcome::HeldOnMaster)
        } else {
            Ok(DispatchOutcome::Conflict)
        }
    }

    async fn publish_job(&self, job: &mut Job, bucket: &Bucket) -> SchedulerResult<DispatchOutcome> {
        let payload = DispatchEnvelope::Job { job_id: job.id }.to_bytes()?;
        let address = BucketAddress::for_bucket(bucket, QueueKind::SavePending);

        match self
            .publish_with_retry(&address, &payload, job.scheduled_at, &job.correlation_id())
            .await
        {
            Ok(message_id) => Ok(DispatchOutcome::Published {
                bucket_id: bucket.id.clone(),
                message_id,
            }),
            Err(e) if e.is_ambiguous() => {
                let supposed_id = e.supposed_published_id().unwrap_or_default().to_string();
                warn!("作业 {} 发布结果未知，带预分配id {} 退回主存储", job.id, supposed_id);
                job.hold_on_master_with_supposed_id(supposed_id)?;
                self.persist_hold(job).await;
                Err(e)
            }
            Err(e) => {
                warn!("作业 {} 发布到 {} 失败，退回主存储: {}", job.id, address, e);
                job.hold_on_master()?;
                match self.context.jobs().update(job).await {
                    Ok(true) => Ok(DispatchOutcome::HeldOnMaster),
                    Ok(false) => Ok(DispatchOutcome::Conflict),
                    Err(update_error) => {
                        error!("作业 {} 发布失败后退回主存储也失败，可能丢失: {}", job.id, update_error);
                        Err(update_error)
                    }
                }
            }
        }
    }

    async fn persist_hold(&self, job: &mut Job) {
        match self.context.jobs().update(job).await {
            Ok(true) => {}
            Ok(false) => warn!("作业 {} 退回主存储时版本冲突", job.id),
            Err(e) => error!("作业 {} 退回主存储失败，可能丢失: {}", job.id, e),
        }
    }

    /// 传输错误按抖动指数退避重试；结果未知时立即返回，不再重试
    async fn publish_with_retry(
        &self,
        address: &BucketAddress,
        payload: &[u8],
        reference_time: DateTime<Utc>,
        correlation_id: &str,
    ) -> SchedulerResult<String> {
        let attempts = self.settings.max_publish_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .context
                .transport()
                .publish(address, payload, reference_time, correlation_id)
                .await
            {
                Ok(message_id) => return Ok(message_id),
                Err(e) if e.is_ambiguous() => return Err(e),
                Err(e @ SchedulerError::Transport(_)) if attempt < attempts => {
                    let delay = self.backoff.delay(attempt);
                    debug!("发布到 {} 失败 (第 {} 次)，{:?} 后重试: {}", address, attempt, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn select_bucket(
        &self,
        priority: JobPriority,
        lane: Option<&str>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Bucket>> {
        let cluster_id = self.context.cluster_id();
        let buckets = self.context.buckets().list(cluster_id).await?;
        let workers = self.context.workers().list(cluster_id).await?;
        let candidates = eligible_buckets(
            buckets,
            &workers,
            priority,
            lane,
            now,
            self.settings.heartbeat_threshold_chrono(),
        );
        let selected = self.selector.select(&candidates).cloned();
        if selected.is_none() {
            debug!("没有可用的Bucket (优先级 {}, lane {:?})", priority, lane);
        }
        Ok(selected)
    }

    async fn check_payload_size(&self, payload: &serde_json::Value) -> SchedulerResult<()> {
        let size = serde_json::to_vec(payload)?.len();
        let limit = self.context.configuration().await?.max_message_bytes;
        if size > limit {
            return Err(SchedulerError::CapacityExceeded { size, limit });
        }
        Ok(())
    }

    /// 持久化并派发一个新的周期计划
    pub async fn schedule_recurring(&self, mut schedule: RecurringSchedule) -> SchedulerResult<DispatchOutcome> {
        validate_id(&schedule.handler_id)?;
        RecurringPlanner::compile(&schedule)?;
        self.check_payload_size(&schedule.payload).await?;
        self.context.schedules().insert(&schedule).await?;

        let now = Utc::now();
        let outcome = self.dispatch_schedule(&mut schedule, now).await;
        if let Ok(result) = &outcome {
            info!("周期计划 {} 已保存: {:?}", schedule.id, result);
        }
        outcome
    }

    async fn dispatch_schedule(
        &self,
        schedule: &mut RecurringSchedule,
        now: DateTime<Utc>,
    ) -> SchedulerResult<DispatchOutcome> {
        let configuration = self.context.configuration().await?;
        let bucket = if configuration.dispatch_enabled() {
            self.select_bucket(schedule.priority, schedule.lane.as_deref(), now).await?
        } else {
            None
        };

        let Some(bucket) = bucket else {
            schedule.hold_on_master(now)?;
            return Ok(if self.context.schedules().update(schedule).await? {
                DispatchOutcome::HeldOnMaster
            } else {
                DispatchOutcome::Conflict
            });
        };

        schedule.assign_to_bucket(bucket.assignment())?;
        let local = self
            .local_engine
            .as_ref()
            .is_some_and(|engine| bucket.is_owned_by(engine.worker_id()));
        if local {
            schedule.activate(now)?;
        }
        if !self.context.schedules().update(schedule).await? {
            return Ok(DispatchOutcome::Conflict);
        }
        if local {
            return Ok(DispatchOutcome::ShortCircuited { bucket_id: bucket.id });
        }

        let payload = DispatchEnvelope::Schedule {
            schedule_id: schedule.id,
        }
        .to_bytes()?;
        let address = BucketAddress::for_bucket(&bucket, QueueKind::RecurringSave);
        match self
            .publish_with_retry(&address, &payload, now, &schedule.correlation_id())
            .await
        {
            Ok(message_id) => Ok(DispatchOutcome::Published {
                bucket_id: bucket.id,
                message_id,
            }),
            Err(e) => {
                warn!("周期计划 {} 发布失败，留存在主存储: {}", schedule.id, e);
                schedule.hold_on_master(now)?;
                schedule.supposed_published_id = e.supposed_published_id().map(str::to_string);
                match self.context.schedules().update(schedule).await {
                    Ok(_) if e.is_ambiguous() => Err(e),
                    Ok(true) => Ok(DispatchOutcome::HeldOnMaster),
                    Ok(false) => Ok(DispatchOutcome::Conflict),
                    Err(update_error) => {
                        error!("周期计划 {} 留存主存储失败: {}", schedule.id, update_error);
                        Err(update_error)
                    }
                }
            }
        }
    }

    /// 取消作业；即将开始的作业拒绝取消，执行中的作业只打取消标记
    pub async fn cancel_job(&self, job_id: Uuid) -> SchedulerResult<CancelOutcome> {
        let cluster_id = self.context.cluster_id();
        for _ in 0..CANCEL_ATTEMPTS {
            let mut job = self
                .context
                .jobs()
                .get(cluster_id, job_id)
                .await?
                .ok_or_else(|| SchedulerError::not_found("Job", job_id.to_string()))?;

            let now = Utc::now();
            let assignment = job.assignment.clone();
            let outcome = job.request_cancellation(now, self.settings.onboarding_window_chrono())?;
            if outcome == CancelOutcome::AlreadyFinal {
                return Ok(outcome);
            }
            if !self.context.jobs().update(&mut job).await? {
                continue;
            }

            if outcome == CancelOutcome::Requested {
                if let (Some(engine), Some(assignment)) = (&self.local_engine, assignment) {
                    if assignment.worker_id == engine.worker_id() {
                        engine.abort(job_id).await;
                    }
                }
            }
            info!("作业 {} 取消请求结果: {:?}", job_id, outcome);
            return Ok(outcome);
        }
        Err(SchedulerError::database_error(format!("作业 {job_id} 取消时持续版本冲突")))
    }

    /// 取消周期计划；已物化但尚未开始的作业由取消扫描器随后处理
    pub async fn cancel_schedule(&self, schedule_id: Uuid) -> SchedulerResult<bool> {
        let cluster_id = self.context.cluster_id();
        for _ in 0..CANCEL_ATTEMPTS {
            let mut schedule = self
                .context
                .schedules()
                .get(cluster_id, schedule_id)
                .await?
                .ok_or_else(|| SchedulerError::not_found("RecurringSchedule", schedule_id.to_string()))?;
            if schedule.status.is_final() {
                return Ok(false);
            }
            schedule.cancel(Utc::now())?;
            if self.context.schedules().update(&mut schedule).await? {
                info!("周期计划 {} 已取消", schedule_id);
                return Ok(true);
            }
        }
        Err(SchedulerError::database_error(format!(
            "周期计划 {schedule_id} 取消时持续版本冲突"
        )))
    }
}

fn record(outcome: &'static str) {
    metrics::counter!("scheduler_dispatch_total", "outcome" => outcome).increment(1);
}
