use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use scheduler_domain::{
    Bucket, BucketAssignment, BucketRepository, BucketStatus, ClusterConfigRepository,
    ClusterConfiguration, Job, JobScanKind, JobStatus, LockRecord, LockRepository, MasterJobsRepository,
    MasterRecurringSchedulesRepository, PartitionClaim, RecurringSchedule, ScheduleScanKind,
    SchedulerError, SchedulerResult, Worker, WorkerRepository,
};

type Key<T> = (String, T);

/// 内存主存储
///
/// 用于嵌入式部署与测试。所有仓储接口由同一个对象实现，
/// 条件更新与认领的语义与 PostgreSQL 后端一致。
#[derive(Debug, Default)]
pub struct InMemoryMasterStore {
    jobs: RwLock<HashMap<Key<Uuid>, Job>>,
    schedules: RwLock<HashMap<Key<Uuid>, RecurringSchedule>>,
    buckets: RwLock<HashMap<Key<String>, Bucket>>,
    workers: RwLock<HashMap<Key<String>, Worker>>,
    locks: RwLock<HashMap<Key<String>, LockRecord>>,
    cluster_configs: RwLock<HashMap<String, ClusterConfiguration>>,
    sentinels: RwLock<HashMap<Key<String>, DateTime<Utc>>>,
}

impl InMemoryMasterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

fn key<T>(cluster_id: &str, id: T) -> Key<T> {
    (cluster_id.to_string(), id)
}

fn is_unclaimed(claim: &Option<PartitionClaim>, now: DateTime<Utc>) -> bool {
    claim.map_or(true, |claim| !claim.is_active(now))
}

fn assigned_to(assignment: &Option<BucketAssignment>, bucket_id: &str) -> bool {
    assignment.as_ref().is_some_and(|a| a.bucket_id == bucket_id)
}

fn job_matches(kind: JobScanKind, job: &Job, now: DateTime<Utc>) -> bool {
    match kind {
        JobScanKind::DueOnMaster { horizon } => {
            job.status == JobStatus::HeldOnMaster && job.scheduled_at <= horizon
        }
        JobScanKind::DeadlineExceeded => {
            job.status == JobStatus::Processing
                && job.process_deadline.is_some_and(|deadline| deadline <= now)
        }
        JobScanKind::CancellationRequested => job.cancellation_requested && !job.is_final(),
    }
}

fn schedule_matches(kind: ScheduleScanKind, schedule: &RecurringSchedule) -> bool {
    match kind {
        ScheduleScanKind::PlanningDue { horizon } => {
            schedule.is_plannable()
                && schedule
                    .last_plan_coverage_until
                    .map_or(true, |coverage| coverage < horizon)
        }
        ScheduleScanKind::JobCancellationPending => schedule.is_job_cancellation_pending,
        ScheduleScanKind::StaticOrphaned { ensured_before } => {
            schedule.is_static()
                && !schedule.status.is_final()
                && schedule
                    .static_last_ensured
                    .map_or(true, |ensured| ensured < ensured_before)
        }
    }
}

#[async_trait]
impl MasterJobsRepository for InMemoryMasterStore {
    async fn insert(&self, job: &Job) -> SchedulerResult<()> {
        let mut jobs = self.jobs.write().await;
        let k = key(&job.cluster_id, job.id);
        if jobs.contains_key(&k) {
            return Err(SchedulerError::already_exists(format!("Job {}", job.id)));
        }
        jobs.insert(k, job.clone());
        Ok(())
    }

    async fn insert_batch(&self, batch: &[Job]) -> SchedulerResult<()> {
        let mut jobs = self.jobs.write().await;
        for job in batch {
            if jobs.contains_key(&key(&job.cluster_id, job.id)) {
                return Err(SchedulerError::already_exists(format!("Job {}", job.id)));
            }
        }
        for job in batch {
            jobs.insert(key(&job.cluster_id, job.id), job.clone());
        }
        Ok(())
    }

    async fn get(&self, cluster_id: &str, id: Uuid) -> SchedulerResult<Option<Job>> {
        Ok(self.jobs.read().await.get(&key(cluster_id, id)).cloned())
    }

    async fn update(&self, job: &mut Job) -> SchedulerResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(&key(&job.cluster_id, job.id)) else {
            return Err(SchedulerError::not_found("Job", job.id.to_string()));
        };
        if stored.version != job.version {
            debug!("作业 {} 版本冲突: {} != {}", job.id, stored.version, job.version);
            return Ok(false);
        }
        job.version += 1;
        // 认领标记只由 claim/release_claim 维护
        job.partition_claim = stored.partition_claim;
        *stored = job.clone();
        Ok(true)
    }

    async fn count_claimable(
        &self,
        cluster_id: &str,
        kind: JobScanKind,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.cluster_id == cluster_id)
            .filter(|job| job_matches(kind, job, now) && is_unclaimed(&job.partition_claim, now))
            .count() as u64)
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
        let mut jobs = self.jobs.write().await;
        let mut candidates: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|job| job.cluster_id == cluster_id)
            .filter(|job| job_matches(kind, job, now) && is_unclaimed(&job.partition_claim, now))
            .collect();
        candidates.sort_by_key(|job| job.scheduled_at);

        let mut claimed = 0;
        for job in candidates.into_iter().take(limit) {
            job.partition_claim = Some(PartitionClaim {
                lock_id,
                expires_at,
            });
            claimed += 1;
        }
        Ok(claimed)
    }

    async fn list_claimed(
        &self,
        cluster_id: &str,
        lock_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Job>> {
        let mut claimed: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.cluster_id == cluster_id)
            .filter(|job| {
                job.partition_claim
                    .is_some_and(|claim| claim.lock_id == lock_id && claim.is_active(now))
            })
            .cloned()
            .collect();
        claimed.sort_by_key(|job| job.scheduled_at);
        Ok(claimed)
    }

    async fn release_claim(&self, cluster_id: &str, lock_id: i64) -> SchedulerResult<u64> {
        let mut released = 0;
        for job in self.jobs.write().await.values_mut() {
            if job.cluster_id == cluster_id
                && job.partition_claim.is_some_and(|claim| claim.lock_id == lock_id)
            {
                job.partition_claim = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn list_by_recurring_schedule(
        &self,
        cluster_id: &str,
        schedule_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.cluster_id == cluster_id)
            .filter(|job| job.recurring_schedule_id == Some(schedule_id))
            .filter(|job| job.original_scheduled_at >= from && job.original_scheduled_at <= to)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.original_scheduled_at);
        Ok(jobs)
    }

    async fn list_pending_by_recurring_schedule(
        &self,
        cluster_id: &str,
        schedule_id: Uuid,
    ) -> SchedulerResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.cluster_id == cluster_id)
            .filter(|job| job.recurring_schedule_id == Some(schedule_id))
            .filter(|job| !job.is_final() && job.status != JobStatus::Processing)
            .cloned()
            .collect())
    }

    async fn list_assigned_to_bucket(
        &self,
        cluster_id: &str,
        bucket_id: &str,
    ) -> SchedulerResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.cluster_id == cluster_id)
            .filter(|job| matches!(job.status, JobStatus::AssignedToBucket | JobStatus::Queued))
            .filter(|job| assigned_to(&job.assignment, bucket_id))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.scheduled_at);
        Ok(jobs)
    }

    async fn purge_finished(
        &self,
        cluster_id: &str,
        older_than: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|(cluster, _), job| {
            !(cluster == cluster_id
                && job.is_final()
                && job.finished_at.is_some_and(|finished| finished < older_than))
        });
        Ok((before - jobs.len()) as u64)
    }
}

#[async_trait]
impl MasterRecurringSchedulesRepository for InMemoryMasterStore {
    async fn insert(&self, schedule: &RecurringSchedule) -> SchedulerResult<()> {
        let mut schedules = self.schedules.write().await;
        let k = key(&schedule.cluster_id, schedule.id);
        if schedules.contains_key(&k) {
            return Err(SchedulerError::already_exists(format!(
                "RecurringSchedule {}",
                schedule.id
            )));
        }
        if let (Some(profile), Some(definition)) =
            (&schedule.profile_id, &schedule.static_definition_id)
        {
            let duplicate = schedules.values().any(|existing| {
                existing.cluster_id == schedule.cluster_id
                    && existing.profile_id.as_ref() == Some(profile)
                    && existing.static_definition_id.as_ref() == Some(definition)
            });
            if duplicate {
                return Err(SchedulerError::already_exists(format!(
                    "静态计划 {profile}/{definition}"
                )));
            }
        }
        schedules.insert(k, schedule.clone());
        Ok(())
    }

    async fn get(&self, cluster_id: &str, id: Uuid) -> SchedulerResult<Option<RecurringSchedule>> {
        Ok(self.schedules.read().await.get(&key(cluster_id, id)).cloned())
    }

    async fn update(&self, schedule: &mut RecurringSchedule) -> SchedulerResult<bool> {
        let mut schedules = self.schedules.write().await;
        let Some(stored) = schedules.get_mut(&key(&schedule.cluster_id, schedule.id)) else {
            return Err(SchedulerError::not_found(
                "RecurringSchedule",
                schedule.id.to_string(),
            ));
        };
        if stored.version != schedule.version {
            return Ok(false);
        }
        schedule.version += 1;
        schedule.partition_claim = stored.partition_claim;
        *stored = schedule.clone();
        Ok(true)
    }

    async fn count_claimable(
        &self,
        cluster_id: &str,
        kind: ScheduleScanKind,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        Ok(self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.cluster_id == cluster_id)
            .filter(|s| schedule_matches(kind, s) && is_unclaimed(&s.partition_claim, now))
            .count() as u64)
    }

    async fn claim(
        &self,
        cluster_id: &str,
        kind: ScheduleScanKind,
        lock_id: i64,
        expires_at: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut schedules = self.schedules.write().await;
        let mut candidates: Vec<&mut RecurringSchedule> = schedules
            .values_mut()
            .filter(|s| s.cluster_id == cluster_id)
            .filter(|s| schedule_matches(kind, s) && is_unclaimed(&s.partition_claim, now))
            .collect();
        candidates.sort_by_key(|s| s.last_plan_coverage_until.unwrap_or(s.created_at));

        let mut claimed = 0;
        for schedule in candidates.into_iter().take(limit) {
            schedule.partition_claim = Some(PartitionClaim {
                lock_id,
                expires_at,
            });
            claimed += 1;
        }
        Ok(claimed)
    }

    async fn list_claimed(
        &self,
        cluster_id: &str,
        lock_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<RecurringSchedule>> {
        Ok(self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.cluster_id == cluster_id)
            .filter(|s| {
                s.partition_claim
                    .is_some_and(|claim| claim.lock_id == lock_id && claim.is_active(now))
            })
            .cloned()
            .collect())
    }

    async fn release_claim(&self, cluster_id: &str, lock_id: i64) -> SchedulerResult<u64> {
        let mut released = 0;
        for schedule in self.schedules.write().await.values_mut() {
            if schedule.cluster_id == cluster_id
                && schedule.partition_claim.is_some_and(|claim| claim.lock_id == lock_id)
            {
                schedule.partition_claim = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get_static(
        &self,
        cluster_id: &str,
        profile_id: &str,
        definition_id: &str,
    ) -> SchedulerResult<Option<RecurringSchedule>> {
        Ok(self
            .schedules
            .read()
            .await
            .values()
            .find(|s| {
                s.cluster_id == cluster_id
                    && s.profile_id.as_deref() == Some(profile_id)
                    && s.static_definition_id.as_deref() == Some(definition_id)
            })
            .cloned())
    }

    async fn list_assigned_to_bucket(
        &self,
        cluster_id: &str,
        bucket_id: &str,
    ) -> SchedulerResult<Vec<RecurringSchedule>> {
        Ok(self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.cluster_id == cluster_id && !s.status.is_final())
            .filter(|s| assigned_to(&s.assignment, bucket_id))
            .cloned()
            .collect())
    }

    async fn purge_finished(
        &self,
        cluster_id: &str,
        older_than: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut schedules = self.schedules.write().await;
        let before = schedules.len();
        schedules.retain(|(cluster, _), s| {
            !(cluster == cluster_id
                && s.status.is_final()
                && !s.is_job_cancellation_pending
                && s.finished_at.is_some_and(|finished| finished < older_than))
        });
        Ok((before - schedules.len()) as u64)
    }
}

#[async_trait]
impl BucketRepository for InMemoryMasterStore {
    async fn insert(&self, bucket: &Bucket) -> SchedulerResult<()> {
        let mut buckets = self.buckets.write().await;
        let k = key(&bucket.cluster_id, bucket.id.clone());
        if buckets.contains_key(&k) {
            return Err(SchedulerError::already_exists(format!("Bucket {}", bucket.id)));
        }
        buckets.insert(k, bucket.clone());
        Ok(())
    }

    async fn get(&self, cluster_id: &str, bucket_id: &str) -> SchedulerResult<Option<Bucket>> {
        Ok(self
            .buckets
            .read()
            .await
            .get(&key(cluster_id, bucket_id.to_string()))
            .cloned())
    }

    async fn update_if(
        &self,
        bucket: &Bucket,
        expected_status: BucketStatus,
        expected_worker: &str,
    ) -> SchedulerResult<bool> {
        let mut buckets = self.buckets.write().await;
        match buckets.get_mut(&key(&bucket.cluster_id, bucket.id.clone())) {
            Some(stored)
                if stored.status == expected_status && stored.worker_id == expected_worker =>
            {
                *stored = bucket.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, cluster_id: &str, bucket_id: &str) -> SchedulerResult<bool> {
        Ok(self
            .buckets
            .write()
            .await
            .remove(&key(cluster_id, bucket_id.to_string()))
            .is_some())
    }

    async fn list(&self, cluster_id: &str) -> SchedulerResult<Vec<Bucket>> {
        let mut buckets: Vec<Bucket> = self
            .buckets
            .read()
            .await
            .values()
            .filter(|b| b.cluster_id == cluster_id)
            .cloned()
            .collect();
        buckets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(buckets)
    }

    async fn list_by_worker(&self, cluster_id: &str, worker_id: &str) -> SchedulerResult<Vec<Bucket>> {
        let buckets = BucketRepository::list(self, cluster_id).await?;
        Ok(buckets.into_iter().filter(|b| b.worker_id == worker_id).collect())
    }

    async fn list_by_status(
        &self,
        cluster_id: &str,
        status: BucketStatus,
    ) -> SchedulerResult<Vec<Bucket>> {
        let buckets = BucketRepository::list(self, cluster_id).await?;
        Ok(buckets.into_iter().filter(|b| b.status == status).collect())
    }
}

#[async_trait]
impl WorkerRepository for InMemoryMasterStore {
    async fn register(&self, worker: &Worker) -> SchedulerResult<()> {
        self.workers
            .write()
            .await
            .insert(key(&worker.cluster_id, worker.id.clone()), worker.clone());
        Ok(())
    }

    async fn heartbeat(
        &self,
        cluster_id: &str,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        match self
            .workers
            .write()
            .await
            .get_mut(&key(cluster_id, worker_id.to_string()))
        {
            Some(worker) => {
                worker.last_heartbeat = worker.last_heartbeat.max(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, cluster_id: &str, worker_id: &str) -> SchedulerResult<Option<Worker>> {
        Ok(self
            .workers
            .read()
            .await
            .get(&key(cluster_id, worker_id.to_string()))
            .cloned())
    }

    async fn list(&self, cluster_id: &str) -> SchedulerResult<Vec<Worker>> {
        let mut workers: Vec<Worker> = self
            .workers
            .read()
            .await
            .values()
            .filter(|w| w.cluster_id == cluster_id)
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn unregister(&self, cluster_id: &str, worker_id: &str) -> SchedulerResult<bool> {
        Ok(self
            .workers
            .write()
            .await
            .remove(&key(cluster_id, worker_id.to_string()))
            .is_some())
    }
}

#[async_trait]
impl LockRepository for InMemoryMasterStore {
    async fn try_acquire(
        &self,
        cluster_id: &str,
        lock_key: &str,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut locks = self.locks.write().await;
        let k = key(cluster_id, lock_key.to_string());
        if locks.get(&k).is_some_and(|record| !record.is_expired(now)) {
            return Ok(false);
        }
        locks.insert(
            k,
            LockRecord {
                cluster_id: cluster_id.to_string(),
                key: lock_key.to_string(),
                token: token.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release(&self, cluster_id: &str, lock_key: &str, token: &str) -> SchedulerResult<bool> {
        let mut locks = self.locks.write().await;
        let k = key(cluster_id, lock_key.to_string());
        if locks.get(&k).is_some_and(|record| record.token == token) {
            locks.remove(&k);
            return Ok(true);
        }
        Ok(false)
    }

    async fn force_release(&self, cluster_id: &str, lock_key: &str) -> SchedulerResult<bool> {
        Ok(self
            .locks
            .write()
            .await
            .remove(&key(cluster_id, lock_key.to_string()))
            .is_some())
    }

    async fn get(&self, cluster_id: &str, lock_key: &str) -> SchedulerResult<Option<LockRecord>> {
        Ok(self
            .locks
            .read()
            .await
            .get(&key(cluster_id, lock_key.to_string()))
            .cloned())
    }
}

#[async_trait]
impl ClusterConfigRepository for InMemoryMasterStore {
    async fn get(&self, cluster_id: &str) -> SchedulerResult<Option<ClusterConfiguration>> {
        Ok(self.cluster_configs.read().await.get(cluster_id).cloned())
    }

    async fn save(&self, config: &ClusterConfiguration) -> SchedulerResult<()> {
        self.cluster_configs
            .write()
            .await
            .insert(config.cluster_id.clone(), config.clone());
        Ok(())
    }

    async fn notify_changes(
        &self,
        cluster_id: &str,
        sentinel_key: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let mut sentinels = self.sentinels.write().await;
        let entry = sentinels
            .entry(key(cluster_id, sentinel_key.to_string()))
            .or_insert(at);
        *entry = (*entry).max(at);
        Ok(())
    }

    async fn last_change(
        &self,
        cluster_id: &str,
        sentinel_key: &str,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        Ok(self
            .sentinels
            .read()
            .await
            .get(&key(cluster_id, sentinel_key.to_string()))
            .copied())
    }
}
