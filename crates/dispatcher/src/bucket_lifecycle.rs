//! Bucket 生命周期
//!
//! `Active → Completing → Draining → ReadyToDrain → (删除)`。失联 Worker 的 Bucket
//! 进入 `Lost`，由同一 agent 连接下的存活 Worker 接手（75% 概率优先排空模式的
//! Worker）后直接进入 `ReadyToDrain`，再由排空流程清空队列并删除。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scheduler_core::{to_chrono, ClusterContext};
use scheduler_domain::{
    Bucket, BucketAddress, BucketStatus, DispatchEnvelope, JobPriority, QueueKind, SchedulerResult,
    Worker, WorkerMode,
};

use crate::runner::PeriodicTask;

/// 两类候选都存在时选择排空模式 Worker 的概率
pub const DRAIN_MODE_PREFERENCE: f64 = 0.75;

/// 单次从队列取出的消息数
const FLUSH_BATCH: usize = 100;

const LOST_BUCKETS_LOCK: &str = "assigned-lost-buckets";

/// 为失联 Bucket 选择新属主
pub fn choose_lost_bucket_owner<'a, R: Rng + ?Sized>(
    candidates: &[&'a Worker],
    rng: &mut R,
) -> Option<&'a Worker> {
    let (drain, normal): (Vec<&Worker>, Vec<&Worker>) = candidates
        .iter()
        .copied()
        .partition(|w| w.mode == WorkerMode::Drain);

    let pool = match (drain.is_empty(), normal.is_empty()) {
        (true, true) => return None,
        (false, true) => drain,
        (true, false) => normal,
        (false, false) => {
            if rng.random_bool(DRAIN_MODE_PREFERENCE) {
                drain
            } else {
                normal
            }
        }
    };
    pool.get(rng.random_range(0..pool.len())).copied()
}

/// 一次排空的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    pub jobs_returned: usize,
    pub schedules_returned: usize,
    /// 退回主存储失败的记录数；不为 0 时 Bucket 保留
    pub failures: usize,
    /// 队列已空，地址与 Bucket 已删除
    pub deleted: bool,
}

pub struct BucketLifecycle {
    context: Arc<ClusterContext>,
}

impl BucketLifecycle {
    pub fn new(context: Arc<ClusterContext>) -> Self {
        Self { context }
    }

    /// 为 Worker 的每个优先级创建 Bucket 及其全部队列地址
    pub async fn create_buckets(
        &self,
        worker: &Worker,
        priorities: &[JobPriority],
    ) -> SchedulerResult<Vec<Bucket>> {
        let mut created = Vec::with_capacity(priorities.len());
        for priority in priorities {
            let bucket = Bucket::new(worker, *priority);
            for address in BucketAddress::all_for_bucket(&bucket) {
                self.context.transport().create_address(&address).await?;
            }
            self.context.buckets().insert(&bucket).await?;
            info!(
                "创建Bucket {} (Worker {}, 优先级 {})",
                bucket.id, worker.id, bucket.priority
            );
            created.push(bucket);
        }
        Ok(created)
    }

    /// 条件迁移：存储中的状态与属主仍与 `bucket` 一致时才写入
    pub async fn transition(
        &self,
        bucket: &Bucket,
        next: BucketStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Bucket>> {
        let mut updated = bucket.clone();
        updated.transition(next, now)?;
        if self
            .context
            .buckets()
            .update_if(&updated, bucket.status, &bucket.worker_id)
            .await?
        {
            debug!("Bucket {} 状态 {} -> {}", bucket.id, bucket.status, next);
            Ok(Some(updated))
        } else {
            debug!("Bucket {} 已被并发修改，跳过迁移到 {}", bucket.id, next);
            Ok(None)
        }
    }

    /// 停止接收新工作并进入排空：`Active → Completing → Draining`
    pub async fn begin_drain(&self, bucket: &Bucket, now: DateTime<Utc>) -> SchedulerResult<Option<Bucket>> {
        let mut current = bucket.clone();
        if current.status == BucketStatus::Active {
            match self.transition(&current, BucketStatus::Completing, now).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        if current.status == BucketStatus::Completing {
            return self.transition(&current, BucketStatus::Draining, now).await;
        }
        Ok(Some(current))
    }

    /// 把属于已死亡 Worker 的 Bucket 标记为 `Lost`
    pub async fn mark_lost(&self, worker_id: &str, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let buckets = self
            .context
            .buckets()
            .list_by_worker(self.context.cluster_id(), worker_id)
            .await?;

        let mut marked = 0;
        for bucket in buckets {
            if bucket.status == BucketStatus::Lost {
                continue;
            }
            if self.transition(&bucket, BucketStatus::Lost, now).await?.is_some() {
                warn!("Worker {} 失联，Bucket {} 标记为 Lost", worker_id, bucket.id);
                marked += 1;
            }
        }
        Ok(marked)
    }

    /// 清空一个 Bucket：队列中的作业与周期计划退回主存储，再退回仍指向它的其余
    /// 记录（例如已被失联 Worker 取走消息的 `Queued` 作业），全部成功且队列为空后删除
    pub async fn flush_bucket(&self, bucket: &Bucket, now: DateTime<Utc>) -> SchedulerResult<FlushOutcome> {
        let mut outcome = FlushOutcome::default();

        for queue in [QueueKind::SavePending, QueueKind::Processing, QueueKind::RecurringSave] {
            let address = BucketAddress::for_bucket(bucket, queue);
            loop {
                let messages = self
                    .context
                    .transport()
                    .dequeue(&address, FLUSH_BATCH, None)
                    .await?;
                if messages.is_empty() {
                    break;
                }
                for message in messages {
                    match DispatchEnvelope::from_bytes(&message.payload) {
                        Ok(DispatchEnvelope::Job { job_id }) => {
                            self.return_job_counted(job_id, bucket, &mut outcome).await
                        }
                        Ok(DispatchEnvelope::Schedule { schedule_id }) => {
                            self.return_schedule_counted(schedule_id, bucket, now, &mut outcome)
                                .await
                        }
                        Err(e) => warn!("丢弃无法解析的消息 {} ({}): {}", message.id, address, e),
                    }
                }
            }
        }

        let cluster_id = self.context.cluster_id();
        for job in self.context.jobs().list_assigned_to_bucket(cluster_id, &bucket.id).await? {
            self.return_job_counted(job.id, bucket, &mut outcome).await;
        }
        for schedule in self
            .context
            .schedules()
            .list_assigned_to_bucket(cluster_id, &bucket.id)
            .await?
        {
            self.return_schedule_counted(schedule.id, bucket, now, &mut outcome)
                .await;
        }

        if outcome.failures > 0 {
            warn!(
                "Bucket {} 有 {} 条记录退回主存储失败，保留Bucket等待下次排空",
                bucket.id, outcome.failures
            );
            return Ok(outcome);
        }
        if self.has_pending(bucket).await? {
            return Ok(outcome);
        }

        for address in BucketAddress::all_for_bucket(bucket) {
            self.context.transport().destroy_address(&address).await?;
        }
        outcome.deleted = self.context.buckets().delete(cluster_id, &bucket.id).await?;
        if outcome.deleted {
            info!(
                "Bucket {} 已排空并删除 (退回作业 {}, 周期计划 {})",
                bucket.id, outcome.jobs_returned, outcome.schedules_returned
            );
        }
        Ok(outcome)
    }

    async fn return_job_counted(&self, job_id: Uuid, bucket: &Bucket, outcome: &mut FlushOutcome) {
        match self.return_job(job_id, bucket).await {
            Ok(true) => outcome.jobs_returned += 1,
            Ok(false) => {}
            Err(e) => {
                error!("排空Bucket {} 时作业 {} 退回主存储失败: {}", bucket.id, job_id, e);
                outcome.failures += 1;
            }
        }
    }

    async fn return_schedule_counted(
        &self,
        schedule_id: Uuid,
        bucket: &Bucket,
        now: DateTime<Utc>,
        outcome: &mut FlushOutcome,
    ) {
        match self.return_schedule(schedule_id, bucket, now).await {
            Ok(true) => outcome.schedules_returned += 1,
            Ok(false) => {}
            Err(e) => {
                error!("排空Bucket {} 时周期计划 {} 退回主存储失败: {}", bucket.id, schedule_id, e);
                outcome.failures += 1;
            }
        }
    }

    async fn has_pending(&self, bucket: &Bucket) -> SchedulerResult<bool> {
        for address in BucketAddress::all_for_bucket(bucket) {
            if self.context.transport().has_pending(&address).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn return_job(&self, job_id: Uuid, bucket: &Bucket) -> SchedulerResult<bool> {
        let Some(mut job) = self.context.jobs().get(self.context.cluster_id(), job_id).await? else {
            debug!("排空时作业 {} 已不存在", job_id);
            return Ok(false);
        };
        let still_here = job
            .assignment
            .as_ref()
            .is_some_and(|a| a.bucket_id == bucket.id);
        if job.is_final() || !still_here {
            return Ok(false);
        }
        job.hold_on_master()?;
        self.context.jobs().update(&mut job).await
    }

    async fn return_schedule(
        &self,
        schedule_id: Uuid,
        bucket: &Bucket,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let Some(mut schedule) = self
            .context
            .schedules()
            .get(self.context.cluster_id(), schedule_id)
            .await?
        else {
            return Ok(false);
        };
        let still_here = schedule
            .assignment
            .as_ref()
            .is_some_and(|a| a.bucket_id == bucket.id);
        if schedule.status.is_final() || !still_here {
            return Ok(false);
        }
        schedule.hold_on_master(now)?;
        self.context.schedules().update(&mut schedule).await
    }
}

/// 把 `Lost` Bucket 重新分配给同一 agent 连接下的存活 Worker
pub struct AssignedLostBucketsRunner {
    context: Arc<ClusterContext>,
    heartbeat_threshold: Duration,
    interval: Duration,
}

impl AssignedLostBucketsRunner {
    pub fn new(context: Arc<ClusterContext>, heartbeat_threshold: Duration, interval: Duration) -> Self {
        Self {
            context,
            heartbeat_threshold,
            interval,
        }
    }

    /// 返回重新分配的 Bucket 数；拿不到锁时返回 0
    pub async fn reassign(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let Some(token) = self
            .context
            .locks()
            .try_lock(LOST_BUCKETS_LOCK, self.interval.max(Duration::from_secs(1)) * 2)
            .await?
        else {
            debug!("其他节点正在重新分配失联Bucket");
            return Ok(0);
        };

        let result = self.reassign_locked(now).await;
        self.context.locks().release_lock(&token).await;
        result
    }

    async fn reassign_locked(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let cluster_id = self.context.cluster_id();
        let lost = self
            .context
            .buckets()
            .list_by_status(cluster_id, BucketStatus::Lost)
            .await?;
        if lost.is_empty() {
            return Ok(0);
        }

        let threshold = to_chrono(self.heartbeat_threshold);
        let workers = self.context.workers().list(cluster_id).await?;

        let mut reassigned = 0;
        for mut bucket in lost {
            let candidates: Vec<&Worker> = workers
                .iter()
                .filter(|w| w.agent_connection_id == bucket.agent_connection_id)
                .filter(|w| w.is_alive(now, threshold))
                .collect();

            let owner = choose_lost_bucket_owner(&candidates, &mut rand::rng()).cloned();
            let Some(owner) = owner else {
                debug!("Bucket {} 暂无可接手的存活Worker", bucket.id);
                continue;
            };

            let previous_owner = bucket.worker_id.clone();
            bucket.reassign_lost(&owner, now)?;
            if self
                .context
                .buckets()
                .update_if(&bucket, BucketStatus::Lost, &previous_owner)
                .await?
            {
                info!(
                    "失联Bucket {} 由 {} 转交给 {} 排空",
                    bucket.id, previous_owner, owner.id
                );
                reassigned += 1;
            }
        }
        Ok(reassigned)
    }
}

#[async_trait]
impl PeriodicTask for AssignedLostBucketsRunner {
    fn name(&self) -> &str {
        "assigned-lost-buckets"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> SchedulerResult<Duration> {
        self.reassign(now).await?;
        Ok(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn worker(id: &str, mode: WorkerMode) -> Worker {
        Worker::new("c1", id, "a1", None, mode)
    }

    #[test]
    fn test_owner_choice_prefers_drain_mode() {
        let drain = worker("drain", WorkerMode::Drain);
        let normal = worker("normal", WorkerMode::Normal);
        let candidates = vec![&drain, &normal];
        let mut rng = StdRng::seed_from_u64(42);

        let picks = 4_000;
        let drained = (0..picks)
            .filter(|_| choose_lost_bucket_owner(&candidates, &mut rng).unwrap().id == "drain")
            .count();
        let ratio = drained as f64 / picks as f64;
        assert!((0.70..0.80).contains(&ratio), "ratio = {ratio}");
    }

    #[test]
    fn test_owner_choice_with_single_group() {
        let normal = worker("normal", WorkerMode::Normal);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            choose_lost_bucket_owner(&[&normal], &mut rng).map(|w| w.id.as_str()),
            Some("normal")
        );
        assert!(choose_lost_bucket_owner(&[], &mut rng).is_none());
    }
}
