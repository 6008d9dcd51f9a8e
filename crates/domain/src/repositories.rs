//! 主存储仓储接口
//!
//! 每个后端（内存、PostgreSQL）提供一组实现，在启动时按配置选择。
//! 所有方法都显式携带集群 id，不同集群之间不共享任何行。
//!
//! 需要排他的写操作只有两种方式：
//!
//! - 通过 [`LockRepository`] 获取分布式锁
//! - 条件更新：`update` 基于版本号的乐观并发，`claim` 只认领尚未被认领（或认领已过期）的行

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Bucket, BucketStatus, ClusterConfiguration, Job, LockRecord, RecurringSchedule, Worker};
use scheduler_errors::SchedulerResult;

/// 作业扫描类别，决定 `claim` 匹配哪些行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobScanKind {
    /// `HeldOnMaster` 且计划时间不晚于 `horizon`
    DueOnMaster { horizon: DateTime<Utc> },
    /// `Processing` 且执行截止时间已过
    DeadlineExceeded,
    /// 执行中且带有取消请求
    CancellationRequested,
}

/// 周期计划扫描类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleScanKind {
    /// `Active` 且计划覆盖边界早于 `horizon`（或从未计划）
    PlanningDue { horizon: DateTime<Utc> },
    /// 已停止但仍有待取消的已物化作业
    JobCancellationPending,
    /// 静态计划且最后确认时间早于 `ensured_before`
    StaticOrphaned { ensured_before: DateTime<Utc> },
}

/// 主存储作业仓储
#[async_trait]
pub trait MasterJobsRepository: Send + Sync {
    /// 插入作业；主键冲突返回 `AlreadyExists`
    async fn insert(&self, job: &Job) -> SchedulerResult<()>;

    /// 原子地批量插入：任一冲突则整批不生效
    async fn insert_batch(&self, jobs: &[Job]) -> SchedulerResult<()>;

    async fn get(&self, cluster_id: &str, id: Uuid) -> SchedulerResult<Option<Job>>;

    /// 乐观并发更新：仅当存储中的版本与 `job.version` 相同才写入，
    /// 成功后 `job.version` 自增。版本冲突返回 `Ok(false)`。
    async fn update(&self, job: &mut Job) -> SchedulerResult<bool>;

    /// 满足扫描条件且未被认领的行数
    async fn count_claimable(
        &self,
        cluster_id: &str,
        kind: JobScanKind,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64>;

    /// 用 `(lock_id, expires_at)` 批量标记最多 `limit` 行，返回受影响行数
    async fn claim(
        &self,
        cluster_id: &str,
        kind: JobScanKind,
        lock_id: i64,
        expires_at: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64>;

    /// 只读回带有指定认领标记的行
    async fn list_claimed(
        &self,
        cluster_id: &str,
        lock_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Job>>;

    async fn release_claim(&self, cluster_id: &str, lock_id: i64) -> SchedulerResult<u64>;

    /// 某个周期计划在 `[from, to]` 内已物化的作业（按原始计划时间）
    async fn list_by_recurring_schedule(
        &self,
        cluster_id: &str,
        schedule_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Job>>;

    /// 某个周期计划尚未开始的作业
    async fn list_pending_by_recurring_schedule(
        &self,
        cluster_id: &str,
        schedule_id: Uuid,
    ) -> SchedulerResult<Vec<Job>>;

    /// 仍分配在该 Bucket 上、尚未开始执行的作业（`AssignedToBucket` / `Queued`）
    async fn list_assigned_to_bucket(
        &self,
        cluster_id: &str,
        bucket_id: &str,
    ) -> SchedulerResult<Vec<Job>>;

    /// 删除 `finished_at` 早于 `older_than` 的终态作业
    async fn purge_finished(
        &self,
        cluster_id: &str,
        older_than: DateTime<Utc>,
    ) -> SchedulerResult<u64>;
}

/// 主存储周期计划仓储
#[async_trait]
pub trait MasterRecurringSchedulesRepository: Send + Sync {
    async fn insert(&self, schedule: &RecurringSchedule) -> SchedulerResult<()>;

    async fn get(&self, cluster_id: &str, id: Uuid) -> SchedulerResult<Option<RecurringSchedule>>;

    async fn update(&self, schedule: &mut RecurringSchedule) -> SchedulerResult<bool>;

    async fn count_claimable(
        &self,
        cluster_id: &str,
        kind: ScheduleScanKind,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64>;

    async fn claim(
        &self,
        cluster_id: &str,
        kind: ScheduleScanKind,
        lock_id: i64,
        expires_at: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64>;

    async fn list_claimed(
        &self,
        cluster_id: &str,
        lock_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<RecurringSchedule>>;

    async fn release_claim(&self, cluster_id: &str, lock_id: i64) -> SchedulerResult<u64>;

    async fn get_static(
        &self,
        cluster_id: &str,
        profile_id: &str,
        definition_id: &str,
    ) -> SchedulerResult<Option<RecurringSchedule>>;

    /// 仍分配在该 Bucket 上的非终态计划
    async fn list_assigned_to_bucket(
        &self,
        cluster_id: &str,
        bucket_id: &str,
    ) -> SchedulerResult<Vec<RecurringSchedule>>;

    /// 删除 `finished_at` 早于 `older_than` 且无待取消作业的计划
    async fn purge_finished(
        &self,
        cluster_id: &str,
        older_than: DateTime<Utc>,
    ) -> SchedulerResult<u64>;
}

/// Bucket 仓储
#[async_trait]
pub trait BucketRepository: Send + Sync {
    async fn insert(&self, bucket: &Bucket) -> SchedulerResult<()>;

    async fn get(&self, cluster_id: &str, bucket_id: &str) -> SchedulerResult<Option<Bucket>>;

    /// 条件更新：仅当存储中的状态与属主仍为 `expected_status`/`expected_worker` 时写入
    async fn update_if(
        &self,
        bucket: &Bucket,
        expected_status: BucketStatus,
        expected_worker: &str,
    ) -> SchedulerResult<bool>;

    async fn delete(&self, cluster_id: &str, bucket_id: &str) -> SchedulerResult<bool>;

    async fn list(&self, cluster_id: &str) -> SchedulerResult<Vec<Bucket>>;

    async fn list_by_worker(&self, cluster_id: &str, worker_id: &str) -> SchedulerResult<Vec<Bucket>>;

    async fn list_by_status(
        &self,
        cluster_id: &str,
        status: BucketStatus,
    ) -> SchedulerResult<Vec<Bucket>>;
}

/// Worker 注册与心跳仓储
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn register(&self, worker: &Worker) -> SchedulerResult<()>;

    async fn heartbeat(
        &self,
        cluster_id: &str,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn get(&self, cluster_id: &str, worker_id: &str) -> SchedulerResult<Option<Worker>>;

    async fn list(&self, cluster_id: &str) -> SchedulerResult<Vec<Worker>>;

    async fn unregister(&self, cluster_id: &str, worker_id: &str) -> SchedulerResult<bool>;
}

/// 分布式锁表
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// 原子地“不存在则插入，已过期则覆盖”；只有赢家返回 `true`
    async fn try_acquire(
        &self,
        cluster_id: &str,
        key: &str,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 仅当 token 匹配时删除
    async fn release(&self, cluster_id: &str, key: &str, token: &str) -> SchedulerResult<bool>;

    /// 忽略 token 强制删除
    async fn force_release(&self, cluster_id: &str, key: &str) -> SchedulerResult<bool>;

    async fn get(&self, cluster_id: &str, key: &str) -> SchedulerResult<Option<LockRecord>>;
}

/// 集群配置与变更哨兵
#[async_trait]
pub trait ClusterConfigRepository: Send + Sync {
    async fn get(&self, cluster_id: &str) -> SchedulerResult<Option<ClusterConfiguration>>;

    async fn save(&self, config: &ClusterConfiguration) -> SchedulerResult<()>;

    /// 写入 `key` 的变更哨兵
    async fn notify_changes(&self, cluster_id: &str, key: &str, at: DateTime<Utc>) -> SchedulerResult<()>;

    /// `key` 最近一次变更时间
    async fn last_change(&self, cluster_id: &str, key: &str) -> SchedulerResult<Option<DateTime<Utc>>>;
}
