//! 本地执行引擎
//!
//! 每个本 Worker 拥有的 Bucket 对应一个 [`TaskQueueControl`]。轮询器从 Bucket 的
//! 传输队列取出即将开始的作业放入本地队列；派发服务也可以通过
//! [`LocalExecutionEngine::inject`] 跳过传输层直接注入。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scheduler_core::{to_chrono, ClusterContext, TaskQueueConfig, WorkerConfig};
use scheduler_dispatcher::PeriodicTask;
use scheduler_domain::{
    Bucket, BucketAddress, DispatchEnvelope, ExecutionContext, Job, JobStatus, LocalExecutionEngine,
    QueueKind, RecurringContext, RecurringScheduleStatus, RetryDecision, SchedulerError,
    SchedulerResult, TransportMessage,
};

use crate::task_queue::{EnqueueOutcome, TaskQueueControl, TaskStarter};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub parallelism_factor: usize,
    pub onboarding_window: Duration,
    pub poll_interval: Duration,
    pub poll_batch_size: usize,
    pub tick_interval: Duration,
    pub timeout_sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl EngineSettings {
    pub fn from_config(worker: &WorkerConfig, task_queue: &TaskQueueConfig) -> Self {
        Self {
            parallelism_factor: worker.parallelism_factor,
            onboarding_window: worker.onboarding_window(),
            poll_interval: worker.poll_interval(),
            poll_batch_size: worker.poll_batch_size,
            tick_interval: task_queue.tick_interval(),
            timeout_sweep_interval: task_queue.timeout_sweep_interval(),
            shutdown_grace: task_queue.shutdown_grace(),
        }
    }

    fn onboarding_window_chrono(&self) -> chrono::Duration {
        to_chrono(self.onboarding_window)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default(), &TaskQueueConfig::default())
    }
}

/// 一条队列消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Accepted,
    /// 发布结果未知后退回主存储的作业，凭预分配 id 认领回来
    Adopted,
    /// 已在本地队列中
    Duplicate,
    /// 本地队列已满，转入 Processing 队列稍后再取
    Deferred,
    /// 处理出错，消息已放回 Bucket 队列
    Requeued,
    Discarded,
}

impl MessageOutcome {
    fn label(&self) -> &'static str {
        match self {
            MessageOutcome::Accepted => "accepted",
            MessageOutcome::Adopted => "adopted",
            MessageOutcome::Duplicate => "duplicate",
            MessageOutcome::Deferred => "deferred",
            MessageOutcome::Requeued => "requeued",
            MessageOutcome::Discarded => "discarded",
        }
    }
}

struct AttachedBucket {
    bucket: Bucket,
    queue: Arc<TaskQueueControl<Job>>,
    polling: AtomicBool,
}

pub struct ExecutionEngine {
    worker_id: String,
    context: Arc<ClusterContext>,
    settings: EngineSettings,
    buckets: RwLock<HashMap<String, Arc<AttachedBucket>>>,
}

impl ExecutionEngine {
    pub fn new(context: Arc<ClusterContext>, worker_id: impl Into<String>, settings: EngineSettings) -> Self {
        Self {
            worker_id: worker_id.into(),
            context,
            settings,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn attached(&self, bucket_id: &str) -> Option<Arc<AttachedBucket>> {
        self.buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(bucket_id)
            .cloned()
    }

    fn all_attached(&self) -> Vec<Arc<AttachedBucket>> {
        self.buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// 为 Bucket 建立本地执行队列；已存在时不做任何事
    pub fn attach_bucket(&self, bucket: Bucket) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        if buckets.contains_key(&bucket.id) {
            return;
        }
        let runner = Arc::new(JobRunner {
            context: self.context.clone(),
            bucket_id: bucket.id.clone(),
        });
        let starter: TaskStarter<Job> =
            Arc::new(move |job: Job, token: CancellationToken| runner.clone().run(job, token).boxed());
        let queue = TaskQueueControl::for_priority(
            bucket.id.clone(),
            bucket.priority,
            self.settings.parallelism_factor,
            starter,
        );
        info!(
            "Bucket {} 接入本地执行引擎 (槽位 {}, 队列容量 {})",
            bucket.id,
            queue.slots(),
            queue.queue_capacity()
        );
        buckets.insert(
            bucket.id.clone(),
            Arc::new(AttachedBucket {
                bucket,
                queue: Arc::new(queue),
                polling: AtomicBool::new(true),
            }),
        );
    }

    pub fn detach_bucket(&self, bucket_id: &str) -> bool {
        let removed = self
            .buckets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(bucket_id);
        if removed.is_some() {
            info!("Bucket {} 从本地执行引擎移除", bucket_id);
        }
        removed.is_some()
    }

    /// 停止从 Bucket 的传输队列取新消息，已在本地的作业继续执行
    pub fn stop_polling(&self, bucket_id: &str) {
        if let Some(attached) = self.attached(bucket_id) {
            attached.polling.store(false, Ordering::SeqCst);
        }
    }

    pub fn bucket_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .buckets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn is_bucket_idle(&self, bucket_id: &str) -> bool {
        self.attached(bucket_id).map_or(true, |a| a.queue.is_idle())
    }

    pub fn is_idle(&self) -> bool {
        self.all_attached().iter().all(|a| a.queue.is_idle())
    }

    pub fn running_jobs(&self) -> Vec<Uuid> {
        self.all_attached()
            .iter()
            .flat_map(|a| a.queue.running_ids())
            .collect()
    }

    /// 轮询所有接入的 Bucket，返回接收的作业数
    pub async fn poll(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let mut accepted = 0;
        for attached in self.all_attached() {
            if !attached.polling.load(Ordering::SeqCst) {
                continue;
            }
            match self.poll_bucket(&attached, now).await {
                Ok(count) => accepted += count,
                Err(e) => warn!("轮询Bucket {} 失败: {}", attached.bucket.id, e),
            }
        }
        Ok(accepted)
    }

    async fn poll_bucket(&self, attached: &AttachedBucket, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let transport = self.context.transport();
        let schedule_to = now + self.settings.onboarding_window_chrono();
        let mut accepted = 0;

        // Processing 队列里是此前因本地队列已满而延后的作业，先取
        for kind in [QueueKind::Processing, QueueKind::SavePending] {
            let available = attached.queue.available().min(self.settings.poll_batch_size);
            if available == 0 {
                break;
            }
            let address = BucketAddress::for_bucket(&attached.bucket, kind);
            let messages = transport.dequeue(&address, available, Some(schedule_to)).await?;
            for message in messages {
                let outcome = match self.handle_job_message(attached, &message).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            "Bucket {} 处理作业消息 {} ({}) 失败: {}",
                            attached.bucket.id,
                            message.id,
                            message.correlation_id,
                            e
                        );
                        self.requeue(&attached.bucket, QueueKind::Processing, &message).await;
                        MessageOutcome::Requeued
                    }
                };
                metrics::counter!("scheduler_worker_messages_total", "outcome" => outcome.label()).increment(1);
                if matches!(outcome, MessageOutcome::Accepted | MessageOutcome::Adopted) {
                    accepted += 1;
                }
            }
        }

        let address = BucketAddress::for_bucket(&attached.bucket, QueueKind::RecurringSave);
        let messages = transport
            .dequeue(&address, self.settings.poll_batch_size, None)
            .await?;
        for message in messages {
            if let Err(e) = self.handle_schedule_message(&attached.bucket, &message, now).await {
                error!(
                    "Bucket {} 处理周期计划消息 {} ({}) 失败: {}",
                    attached.bucket.id, message.id, message.correlation_id, e
                );
                self.requeue(&attached.bucket, QueueKind::RecurringSave, &message).await;
            }
        }
        Ok(accepted)
    }

    /// 处理失败的消息重新放回 Bucket 队列，下次轮询再取
    async fn requeue(&self, bucket: &Bucket, queue: QueueKind, message: &TransportMessage) {
        let address = BucketAddress::for_bucket(bucket, queue);
        if let Err(e) = self
            .context
            .transport()
            .publish(&address, &message.payload, message.reference_time, &message.correlation_id)
            .await
        {
            // 主存储中的分配仍指向该 Bucket，排空时会被退回
            error!("消息 {} 无法放回 {}: {}", message.id, address, e);
        }
    }

    async fn handle_job_message(
        &self,
        attached: &AttachedBucket,
        message: &TransportMessage,
    ) -> SchedulerResult<MessageOutcome> {
        let job_id = match DispatchEnvelope::from_bytes(&message.payload) {
            Ok(DispatchEnvelope::Job { job_id }) => job_id,
            Ok(other) => {
                warn!("Bucket {} 的作业队列中出现非作业消息: {:?}", attached.bucket.id, other);
                return Ok(MessageOutcome::Discarded);
            }
            Err(e) => {
                warn!("丢弃无法解析的消息 {}: {}", message.id, e);
                return Ok(MessageOutcome::Discarded);
            }
        };

        if attached.queue.contains(job_id) {
            return Ok(MessageOutcome::Duplicate);
        }

        let Some(mut job) = self.context.jobs().get(self.context.cluster_id(), job_id).await? else {
            debug!("消息 {} 对应的作业 {} 已不存在", message.id, job_id);
            return Ok(MessageOutcome::Discarded);
        };

        let assigned_here = job
            .assignment
            .as_ref()
            .is_some_and(|a| a.bucket_id == attached.bucket.id);

        match job.status {
            JobStatus::AssignedToBucket | JobStatus::Queued if assigned_here => {
                self.enqueue(attached, job).await
            }
            JobStatus::HeldOnMaster
                if job.supposed_published_id.as_deref() == Some(message.id.as_str()) =>
            {
                job.assign_to_bucket(attached.bucket.assignment())?;
                if !self.context.jobs().update(&mut job).await? {
                    debug!("认领退回的作业 {} 时版本冲突", job.id);
                    return Ok(MessageOutcome::Discarded);
                }
                info!("作业 {} 的未知发布实际已送达，由Bucket {} 认领", job.id, attached.bucket.id);
                match self.enqueue(attached, job).await? {
                    MessageOutcome::Accepted => Ok(MessageOutcome::Adopted),
                    other => Ok(other),
                }
            }
            _ => {
                debug!(
                    "丢弃过期的重复消息 {} (作业 {} 状态 {})",
                    message.id, job.id, job.status
                );
                Ok(MessageOutcome::Discarded)
            }
        }
    }

    /// 先持久化 `Queued` 再放入本地队列；本地队列满时转入 Processing 队列
    async fn enqueue(&self, attached: &AttachedBucket, mut job: Job) -> SchedulerResult<MessageOutcome> {
        if job.status == JobStatus::AssignedToBucket {
            job.mark_queued()?;
            if !self.context.jobs().update(&mut job).await? {
                debug!("作业 {} 标记排队时版本冲突", job.id);
                return Ok(MessageOutcome::Discarded);
            }
        }

        let timeout = queue_timeout(&job, self.settings.onboarding_window);
        match attached.queue.enqueue(job.id, job.clone(), timeout) {
            Ok(EnqueueOutcome::Enqueued) => Ok(MessageOutcome::Accepted),
            Ok(EnqueueOutcome::AlreadyQueued) => Ok(MessageOutcome::Duplicate),
            Err(SchedulerError::QueueFull(_)) => {
                self.defer(attached, &job).await?;
                Ok(MessageOutcome::Deferred)
            }
            Err(e) => {
                warn!("作业 {} 无法进入本地队列，退回主存储: {}", job.id, e);
                self.release_to_master(&mut job).await?;
                Ok(MessageOutcome::Discarded)
            }
        }
    }

    /// 退回主存储；版本冲突时不写入并返回 false
    async fn release_to_master(&self, job: &mut Job) -> SchedulerResult<bool> {
        job.hold_on_master()?;
        let applied = self.context.jobs().update(job).await?;
        if !applied {
            warn!("作业 {} 退回主存储时版本冲突，未写入", job.id);
        }
        Ok(applied)
    }

    async fn defer(&self, attached: &AttachedBucket, job: &Job) -> SchedulerResult<()> {
        let address = BucketAddress::for_bucket(&attached.bucket, QueueKind::Processing);
        let payload = DispatchEnvelope::Job { job_id: job.id }.to_bytes()?;
        self.context
            .transport()
            .publish(&address, &payload, job.scheduled_at, &job.correlation_id())
            .await?;
        debug!("Bucket {} 本地队列已满，作业 {} 转入 {}", attached.bucket.id, job.id, address);
        Ok(())
    }

    async fn handle_schedule_message(
        &self,
        bucket: &Bucket,
        message: &TransportMessage,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let schedule_id = match DispatchEnvelope::from_bytes(&message.payload) {
            Ok(DispatchEnvelope::Schedule { schedule_id }) => schedule_id,
            Ok(other) => {
                warn!("Bucket {} 的周期计划队列中出现非计划消息: {:?}", bucket.id, other);
                return Ok(());
            }
            Err(e) => {
                warn!("丢弃无法解析的消息 {}: {}", message.id, e);
                return Ok(());
            }
        };

        let Some(mut schedule) = self
            .context
            .schedules()
            .get(self.context.cluster_id(), schedule_id)
            .await?
        else {
            return Ok(());
        };

        let assigned_here = schedule.assignment.as_ref().is_some_and(|a| a.bucket_id == bucket.id);
        if schedule.status != RecurringScheduleStatus::PendingSave || !assigned_here {
            debug!("丢弃周期计划 {} 的过期消息 {} (状态 {})", schedule.id, message.id, schedule.status);
            return Ok(());
        }

        schedule.activate(now)?;
        if self.context.schedules().update(&mut schedule).await? {
            info!("周期计划 {} 由Bucket {} 激活", schedule.id, bucket.id);
        }
        Ok(())
    }

    /// 回收结束的槽位并启动排队中的作业
    pub fn tick(&self) -> usize {
        self.all_attached().iter().map(|a| a.queue.tick()).sum()
    }

    /// 超时清扫，并中止主存储中已被请求取消的运行中作业
    pub async fn sweep(&self) -> SchedulerResult<usize> {
        let mut cancelled = 0;
        for attached in self.all_attached() {
            let timed_out = attached.queue.sweep_timeouts();
            if !timed_out.is_empty() {
                metrics::counter!("scheduler_jobs_timed_out_total").increment(timed_out.len() as u64);
            }
            cancelled += timed_out.len();

            for job_id in attached.queue.running_ids() {
                let requested = self
                    .context
                    .jobs()
                    .get(self.context.cluster_id(), job_id)
                    .await?
                    .is_some_and(|job| job.cancellation_requested);
                if requested && attached.queue.abort(job_id) {
                    info!("作业 {} 已被请求取消，中止本地执行", job_id);
                    cancelled += 1;
                }
            }
        }
        Ok(cancelled)
    }

    /// 关闭全部本地队列，排队中尚未开始的作业退回主存储
    pub async fn shutdown(&self) -> SchedulerResult<usize> {
        let mut returned = 0;
        for attached in self.all_attached() {
            let queued = attached.queue.shutdown(self.settings.shutdown_grace).await;
            for (job_id, _) in queued {
                if self.return_to_master(job_id, &attached.bucket.id).await? {
                    returned += 1;
                }
            }
        }
        if returned > 0 {
            info!("本地执行引擎关闭，{} 个排队中的作业退回主存储", returned);
        }
        Ok(returned)
    }

    async fn return_to_master(&self, job_id: Uuid, bucket_id: &str) -> SchedulerResult<bool> {
        let Some(mut job) = self.context.jobs().get(self.context.cluster_id(), job_id).await? else {
            return Ok(false);
        };
        let assigned_here = job.assignment.as_ref().is_some_and(|a| a.bucket_id == bucket_id);
        if job.is_final() || !assigned_here {
            return Ok(false);
        }
        job.hold_on_master()?;
        self.context.jobs().update(&mut job).await
    }
}

#[async_trait]
impl LocalExecutionEngine for ExecutionEngine {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn has_capacity(&self, bucket_id: &str) -> bool {
        self.attached(bucket_id)
            .is_some_and(|a| a.polling.load(Ordering::SeqCst) && a.queue.has_capacity())
    }

    async fn inject(&self, bucket_id: &str, job: Job) -> SchedulerResult<()> {
        let attached = self
            .attached(bucket_id)
            .ok_or_else(|| SchedulerError::not_found("Bucket", bucket_id))?;
        if !attached.queue.has_capacity() {
            return Err(SchedulerError::QueueFull(bucket_id.to_string()));
        }
        let outcome = self.enqueue(&attached, job).await?;
        metrics::counter!("scheduler_worker_messages_total", "outcome" => outcome.label()).increment(1);
        Ok(())
    }

    async fn abort(&self, job_id: Uuid) -> bool {
        self.all_attached().iter().any(|a| a.queue.abort(job_id))
    }
}

/// 本地队列超时：作业超时加上等待计划时间的 on-boarding 窗口
fn queue_timeout(job: &Job, onboarding_window: Duration) -> Duration {
    job.timeout()
        .to_std()
        .unwrap_or(Duration::from_secs(300))
        .saturating_add(onboarding_window)
}

/// 执行单个作业并把结果写回主存储
struct JobRunner {
    context: Arc<ClusterContext>,
    bucket_id: String,
}

enum RunResult {
    Succeeded,
    Failed(String),
    Interrupted,
}

impl JobRunner {
    async fn run(self: Arc<Self>, job: Job, cancellation: CancellationToken) {
        let job_id = job.id;
        if let Err(e) = self.execute(job_id, cancellation).await {
            error!("执行作业 {} 时出错: {}", job_id, e);
        }
    }

    async fn execute(&self, job_id: Uuid, cancellation: CancellationToken) -> SchedulerResult<()> {
        let cluster_id = self.context.cluster_id();
        let Some(mut job) = self.context.jobs().get(cluster_id, job_id).await? else {
            return Ok(());
        };
        let assigned_here = job.assignment.as_ref().is_some_and(|a| a.bucket_id == self.bucket_id);
        if job.is_final() || !assigned_here {
            debug!("作业 {} 已不属于Bucket {}，跳过执行", job.id, self.bucket_id);
            return Ok(());
        }

        let wait = (job.scheduled_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            tokio::select! {
                _ = cancellation.cancelled() => return self.finish(job_id, RunResult::Interrupted).await,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let started = Utc::now();
        job.mark_processing(started)?;
        if !self.context.jobs().update(&mut job).await? {
            debug!("作业 {} 标记执行时版本冲突", job.id);
            return Ok(());
        }

        let Some(registered) = self.context.handlers().get(&job.handler_id) else {
            let message = format!("处理器 {} 未注册", job.handler_id);
            return self.finish(job_id, RunResult::Failed(message)).await;
        };

        let ctx = self.execution_context(&job, cancellation.clone()).await?;
        let timer = std::time::Instant::now();
        let result = tokio::select! {
            _ = cancellation.cancelled() => RunResult::Interrupted,
            outcome = registered.handler.handle(&ctx) => match outcome {
                Ok(()) => RunResult::Succeeded,
                Err(_) if cancellation.is_cancelled() => RunResult::Interrupted,
                Err(e) => RunResult::Failed(format!("{e:#}")),
            },
        };
        metrics::histogram!("scheduler_job_duration_seconds", "handler" => job.handler_id.clone())
            .record(timer.elapsed().as_secs_f64());

        self.finish(job_id, result).await
    }

    async fn execution_context(&self, job: &Job, cancellation: CancellationToken) -> SchedulerResult<ExecutionContext> {
        let recurring = match job.recurring_schedule_id {
            Some(schedule_id) => self
                .context
                .schedules()
                .get(self.context.cluster_id(), schedule_id)
                .await?
                .map(|schedule| RecurringContext {
                    schedule_id,
                    expression: schedule.expression.text,
                    occurrence: job.original_scheduled_at,
                }),
            None => None,
        };

        Ok(ExecutionContext {
            job_id: job.id,
            handler_id: job.handler_id.clone(),
            scheduled_at: job.scheduled_at,
            priority: job.priority,
            failure_count: job.failure_count,
            payload: job.payload.clone(),
            metadata: job.metadata.clone(),
            recurring,
            cancellation,
        })
    }

    /// 重新读取作业后写回结果，基于最新版本
    async fn finish(&self, job_id: Uuid, result: RunResult) -> SchedulerResult<()> {
        let Some(mut job) = self.context.jobs().get(self.context.cluster_id(), job_id).await? else {
            return Ok(());
        };
        if job.is_final() {
            return Ok(());
        }

        let now = Utc::now();
        let label = match result {
            RunResult::Succeeded => {
                job.mark_succeeded(now)?;
                "succeeded"
            }
            RunResult::Failed(message) => {
                warn!("作业 {} 执行失败: {}", job.id, message);
                self.retry(&mut job, now, message)?
            }
            RunResult::Interrupted if job.cancellation_requested => {
                job.mark_cancelled(now)?;
                "cancelled"
            }
            RunResult::Interrupted if job.process_deadline.is_some_and(|deadline| deadline <= now) => {
                self.retry(&mut job, now, "执行超时")?
            }
            RunResult::Interrupted => {
                job.hold_on_master()?;
                "returned"
            }
        };

        if self.context.jobs().update(&mut job).await? {
            debug!("作业 {} 执行结束: {}", job.id, label);
            metrics::counter!("scheduler_jobs_executed_total", "outcome" => label).increment(1);
        } else {
            debug!("作业 {} 写回结果 {} 时版本冲突", job.id, label);
        }
        Ok(())
    }

    fn retry(&self, job: &mut Job, now: DateTime<Utc>, message: impl Into<String>) -> SchedulerResult<&'static str> {
        Ok(match job.try_retry(now, message)? {
            RetryDecision::Rescheduled { at } => {
                debug!("作业 {} 将在 {} 重试 (第 {} 次失败)", job.id, at, job.failure_count);
                "retried"
            }
            RetryDecision::Exhausted => "failed",
        })
    }
}

/// 定期轮询 Bucket 队列的后台任务
pub struct EnginePoller {
    engine: Arc<ExecutionEngine>,
}

impl EnginePoller {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PeriodicTask for EnginePoller {
    fn name(&self) -> &str {
        "engine-poller"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> SchedulerResult<Duration> {
        self.engine.poll(now).await?;
        Ok(self.engine.settings.poll_interval)
    }
}

/// 推进本地队列的后台任务
pub struct EngineTicker {
    engine: Arc<ExecutionEngine>,
}

impl EngineTicker {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PeriodicTask for EngineTicker {
    fn name(&self) -> &str {
        "engine-ticker"
    }

    async fn run_once(&self, _now: DateTime<Utc>) -> SchedulerResult<Duration> {
        self.engine.tick();
        Ok(self.engine.settings.tick_interval)
    }
}

/// 超时与取消请求清扫
pub struct EngineSweeper {
    engine: Arc<ExecutionEngine>,
}

impl EngineSweeper {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PeriodicTask for EngineSweeper {
    fn name(&self) -> &str {
        "engine-sweeper"
    }

    async fn run_once(&self, _now: DateTime<Utc>) -> SchedulerResult<Duration> {
        self.engine.sweep().await?;
        Ok(self.engine.settings.timeout_sweep_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_testing_utils::{JobBuilder, TestCluster, WorkerBuilder, TEST_CLUSTER};

    #[tokio::test]
    async fn test_release_to_master_reports_version_conflict() {
        let cluster = TestCluster::new();
        let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
        let bucket = cluster.add_bucket(&worker, scheduler_domain::JobPriority::Normal).await;
        let engine = ExecutionEngine::new(cluster.context.clone(), "worker-1", EngineSettings::default());

        let job = JobBuilder::new().queued_on(&bucket).build();
        cluster.context.jobs().insert(&job).await.unwrap();

        // 其他节点先写入，手里的副本版本已过期
        let mut stale = job.clone();
        let mut current = job.clone();
        current.metadata.insert("touched-by".to_string(), "worker-2".to_string());
        assert!(cluster.context.jobs().update(&mut current).await.unwrap());

        assert!(!engine.release_to_master(&mut stale).await.unwrap());
        let stored = cluster.context.jobs().get(TEST_CLUSTER, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.assignment, Some(bucket.assignment()));

        let mut fresh = stored;
        assert!(engine.release_to_master(&mut fresh).await.unwrap());
        let stored = cluster.context.jobs().get(TEST_CLUSTER, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::HeldOnMaster);
        assert!(stored.assignment.is_none());
    }
}
