//! Test doubles for transport, handler, jobs repository and execution engine ports

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use scheduler_domain::{
    AgentTransport, BucketAddress, ExecutionContext, Job, JobHandler, JobScanKind,
    LocalExecutionEngine, MasterJobsRepository, SchedulerError, SchedulerResult, TransportMessage,
};
use scheduler_infrastructure::memory::{InMemoryMasterStore, InMemoryTransport};

/// 预设的发布结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishScript {
    /// 超时：返回带预分配 id 的不确定结果，消息不入队
    Timeout,
    /// 明确失败
    Fail(String),
}

/// 可按脚本注入发布超时或失败的传输，其余行为委托给内存传输
pub struct ScriptedTransport {
    inner: InMemoryTransport,
    script: Mutex<VecDeque<PublishScript>>,
    publish_attempts: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(agent_connection_id: &str) -> Self {
        Self {
            inner: InMemoryTransport::new(agent_connection_id),
            script: Mutex::new(VecDeque::new()),
            publish_attempts: AtomicUsize::new(0),
        }
    }

    pub fn push_script(&self, outcome: PublishScript) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn timeout_next_publishes(&self, count: usize) {
        for _ in 0..count {
            self.push_script(PublishScript::Timeout);
        }
    }

    pub fn fail_next_publishes(&self, count: usize) {
        for _ in 0..count {
            self.push_script(PublishScript::Fail("scripted failure".to_string()));
        }
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub async fn pending_count(&self, address: &BucketAddress) -> usize {
        self.inner.pending_count(address).await
    }

    pub async fn address_exists(&self, address: &BucketAddress) -> bool {
        self.inner.address_exists(address).await
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    fn agent_connection_id(&self) -> &str {
        self.inner.agent_connection_id()
    }

    async fn publish(
        &self,
        address: &BucketAddress,
        payload: &[u8],
        reference_time: DateTime<Utc>,
        correlation_id: &str,
    ) -> SchedulerResult<String> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(PublishScript::Timeout) => Err(SchedulerError::AmbiguousPublish {
                supposed_id: Uuid::new_v4().simple().to_string(),
                message: "scripted timeout".to_string(),
            }),
            Some(PublishScript::Fail(message)) => Err(SchedulerError::transport(message)),
            None => {
                self.inner
                    .publish(address, payload, reference_time, correlation_id)
                    .await
            }
        }
    }

    async fn dequeue(
        &self,
        address: &BucketAddress,
        count: usize,
        schedule_to: Option<DateTime<Utc>>,
    ) -> SchedulerResult<Vec<TransportMessage>> {
        self.inner.dequeue(address, count, schedule_to).await
    }

    async fn has_pending(&self, address: &BucketAddress) -> SchedulerResult<bool> {
        self.inner.has_pending(address).await
    }

    async fn create_address(&self, address: &BucketAddress) -> SchedulerResult<()> {
        self.inner.create_address(address).await
    }

    async fn destroy_address(&self, address: &BucketAddress) -> SchedulerResult<()> {
        self.inner.destroy_address(address).await
    }
}

/// 记录每次调用的处理器，可配置前 N 次失败或每次执行耗时
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<Uuid>>,
    failures_left: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize) -> Self {
        let handler = Self::default();
        handler.failures_left.store(times, Ordering::SeqCst);
        handler
    }

    pub fn slow(delay: Duration) -> Self {
        let handler = Self::default();
        *handler.delay.lock().unwrap() = Some(delay);
        handler
    }

    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(ctx.job_id);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation.cancelled() => anyhow::bail!("cancelled"),
            }
        }

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            anyhow::bail!("scripted handler failure");
        }
        Ok(())
    }
}

/// 记录注入与中止请求的本地执行引擎
pub struct RecordingEngine {
    worker_id: String,
    capacity: AtomicBool,
    fail_inject: AtomicBool,
    injected: Mutex<Vec<(String, Job)>>,
    aborted: Mutex<Vec<Uuid>>,
}

impl RecordingEngine {
    pub fn new(worker_id: &str) -> Arc<Self> {
        Arc::new(Self {
            worker_id: worker_id.to_string(),
            capacity: AtomicBool::new(true),
            fail_inject: AtomicBool::new(false),
            injected: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
        })
    }

    pub fn set_capacity(&self, has_capacity: bool) {
        self.capacity.store(has_capacity, Ordering::SeqCst);
    }

    pub fn fail_injections(&self, fail: bool) {
        self.fail_inject.store(fail, Ordering::SeqCst);
    }

    pub fn injected(&self) -> Vec<(String, Job)> {
        self.injected.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<Uuid> {
        self.aborted.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalExecutionEngine for RecordingEngine {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn has_capacity(&self, _bucket_id: &str) -> bool {
        self.capacity.load(Ordering::SeqCst)
    }

    async fn inject(&self, bucket_id: &str, job: Job) -> SchedulerResult<()> {
        if self.fail_inject.load(Ordering::SeqCst) {
            return Err(SchedulerError::QueueFull(bucket_id.to_string()));
        }
        self.injected
            .lock()
            .unwrap()
            .push((bucket_id.to_string(), job));
        Ok(())
    }

    async fn abort(&self, job_id: Uuid) -> bool {
        self.aborted.lock().unwrap().push(job_id);
        true
    }
}

/// 委托给内存主存储的作业仓储，可让指定作业的读写失败
pub struct FaultyJobsRepository {
    inner: Arc<InMemoryMasterStore>,
    failing: Mutex<HashSet<Uuid>>,
}

impl FaultyJobsRepository {
    pub fn new(inner: Arc<InMemoryMasterStore>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_job(&self, job_id: Uuid) {
        self.failing.lock().unwrap().insert(job_id);
    }

    pub fn heal_job(&self, job_id: Uuid) {
        self.failing.lock().unwrap().remove(&job_id);
    }

    fn check(&self, job_id: Uuid) -> SchedulerResult<()> {
        if self.failing.lock().unwrap().contains(&job_id) {
            return Err(SchedulerError::Internal(format!("scripted store failure for {job_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl MasterJobsRepository for FaultyJobsRepository {
    async fn insert(&self, job: &Job) -> SchedulerResult<()> {
        MasterJobsRepository::insert(self.inner.as_ref(), job).await
    }

    async fn insert_batch(&self, jobs: &[Job]) -> SchedulerResult<()> {
        MasterJobsRepository::insert_batch(self.inner.as_ref(), jobs).await
    }

    async fn get(&self, cluster_id: &str, id: Uuid) -> SchedulerResult<Option<Job>> {
        self.check(id)?;
        MasterJobsRepository::get(self.inner.as_ref(), cluster_id, id).await
    }

    async fn update(&self, job: &mut Job) -> SchedulerResult<bool> {
        self.check(job.id)?;
        MasterJobsRepository::update(self.inner.as_ref(), job).await
    }

    async fn count_claimable(
        &self,
        cluster_id: &str,
        kind: JobScanKind,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        MasterJobsRepository::count_claimable(self.inner.as_ref(), cluster_id, kind, now).await
    }

    async fn claim(
        &self,
        cluster_id: &str,
        kind: JobScanKind,
        lock_id: i64,
        expires_at: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        MasterJobsRepository::claim(self.inner.as_ref(), cluster_id, kind, lock_id, expires_at, limit, now)
            .await
    }

    async fn list_claimed(
        &self,
        cluster_id: &str,
        lock_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Job>> {
        MasterJobsRepository::list_claimed(self.inner.as_ref(), cluster_id, lock_id, now).await
    }

    async fn release_claim(&self, cluster_id: &str, lock_id: i64) -> SchedulerResult<u64> {
        MasterJobsRepository::release_claim(self.inner.as_ref(), cluster_id, lock_id).await
    }

    async fn list_by_recurring_schedule(
        &self,
        cluster_id: &str,
        schedule_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Job>> {
        self.inner
            .list_by_recurring_schedule(cluster_id, schedule_id, from, to)
            .await
    }

    async fn list_pending_by_recurring_schedule(
        &self,
        cluster_id: &str,
        schedule_id: Uuid,
    ) -> SchedulerResult<Vec<Job>> {
        self.inner
            .list_pending_by_recurring_schedule(cluster_id, schedule_id)
            .await
    }

    async fn list_assigned_to_bucket(
        &self,
        cluster_id: &str,
        bucket_id: &str,
    ) -> SchedulerResult<Vec<Job>> {
        MasterJobsRepository::list_assigned_to_bucket(self.inner.as_ref(), cluster_id, bucket_id).await
    }

    async fn purge_finished(
        &self,
        cluster_id: &str,
        older_than: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        MasterJobsRepository::purge_finished(self.inner.as_ref(), cluster_id, older_than).await
    }
}
