//! 分区扫描计划
//!
//! 多个 Worker 周期性扫描同一张表时，每个 Worker 每轮从本 lane 的分区锁 id
//! 区间里随机取一个 id，加锁后用 `(lock_id, 到期时间)` 批量认领匹配的行，
//! 只处理带有该认领标记的行。认领为 0 行按锁竞争处理，短暂退避。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, error, warn};

use scheduler_core::{
    to_chrono, ClusterContext, ConsecutiveFailures, ExponentialBackoff, ScanConfig, WorkerConfig,
};
use scheduler_domain::SchedulerResult;

use crate::runner::PeriodicTask;

/// 每个 lane 独占的分区锁 id 数量
pub const LANE_STRIDE: u64 = 1 << 20;

/// 单轮批量的上下限
pub const MIN_BATCH_SIZE: usize = 10;
pub const MAX_BATCH_SIZE: usize = 1000;

/// 连续失败达到该次数后按最高级别记录
const FAILURE_ALERT_THRESHOLD: u32 = 5;

/// 扫描器所在的分区锁 lane，不同 lane 的 id 区间互不重叠
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanLane {
    DueOnMaster = 0,
    Deadline = 1,
    JobCancellation = 2,
    RecurringPlanning = 3,
    StaticOrphan = 4,
    ScheduleCancellation = 5,
}

impl ScanLane {
    pub fn index(self) -> u64 {
        self as u64
    }
}

/// 一次计算出的扫描参数，在 `valid_until` 之前复用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanPlan {
    pub batch_size: usize,
    pub partitions: u64,
    pub locker_min: u64,
    pub locker_max: u64,
    pub interval: Duration,
    pub valid_until: DateTime<Utc>,
}

impl ScanPlan {
    /// 根据积压量与存活 Worker 数计算分区区间与扫描间隔
    ///
    /// 全体 Worker 在一个覆盖窗口内合计恰好扫过每个分区一次。
    pub fn calculate(
        backlog: u64,
        alive_workers: usize,
        batch_size: usize,
        coverage_window: Duration,
        lane: ScanLane,
        now: DateTime<Utc>,
    ) -> Self {
        let batch_size = batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        let workers = alive_workers.max(1) as u64;

        let partitions = backlog
            .div_ceil(batch_size as u64)
            .clamp(1, workers * 2)
            .min(LANE_STRIDE / 2);

        let locker_min = lane.index() * LANE_STRIDE + 1;
        let locker_max = locker_min + partitions - 1;

        let window_ms = coverage_window.as_millis().max(1) as u64;
        let interval_ms = (window_ms.saturating_mul(workers) / partitions).clamp(window_ms.min(1000), window_ms);

        let valid_until = now + to_chrono(coverage_window);

        Self {
            batch_size,
            partitions,
            locker_min,
            locker_max,
            interval: Duration::from_millis(interval_ms),
            valid_until,
        }
    }

    pub fn should_calculate_again(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    pub fn pick_lock_id<R: Rng + ?Sized>(&self, rng: &mut R) -> i64 {
        rng.random_range(self.locker_min..=self.locker_max) as i64
    }
}

/// 扫描参数
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub batch_size: usize,
    pub coverage_window: Duration,
    pub claim_ttl: Duration,
    pub contention_backoff: Duration,
    pub heartbeat_threshold: Duration,
}

impl ScanSettings {
    pub fn from_config(scan: &ScanConfig, worker: &WorkerConfig) -> Self {
        Self {
            batch_size: scan.batch_size,
            coverage_window: scan.coverage_window(),
            claim_ttl: scan.claim_ttl(),
            contention_backoff: scan.contention_backoff(),
            heartbeat_threshold: worker.heartbeat_threshold(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from_config(&ScanConfig::default(), &WorkerConfig::default())
    }
}

/// 一类可分区扫描的行
#[async_trait]
pub trait ScanTarget: Send + Sync {
    type Item: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn lane(&self) -> ScanLane;

    /// 连续失败计数使用的键
    fn key(&self, item: &Self::Item) -> String;

    async fn backlog(&self, now: DateTime<Utc>) -> SchedulerResult<u64>;

    async fn claim(
        &self,
        lock_id: i64,
        expires_at: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64>;

    async fn load_claimed(&self, lock_id: i64, now: DateTime<Utc>) -> SchedulerResult<Vec<Self::Item>>;

    async fn process(&self, item: Self::Item, now: DateTime<Utc>) -> SchedulerResult<()>;

    async fn release(&self, lock_id: i64) -> SchedulerResult<u64>;
}

/// 单轮扫描的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// 没有积压
    Idle,
    /// 分区锁被占用或没有认领到行
    Contention,
    Processed { succeeded: usize, failed: usize, skipped: usize },
}

/// 基于分区锁与批量认领的周期扫描器
pub struct PartitionedScanner<T: ScanTarget> {
    context: Arc<ClusterContext>,
    target: T,
    settings: ScanSettings,
    plan: Mutex<Option<ScanPlan>>,
    failures: Mutex<ConsecutiveFailures<String>>,
}

impl<T: ScanTarget> PartitionedScanner<T> {
    pub fn new(context: Arc<ClusterContext>, target: T, settings: ScanSettings) -> Self {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), settings.coverage_window.max(Duration::from_secs(1)) * 4);
        Self {
            context,
            target,
            settings,
            plan: Mutex::new(None),
            failures: Mutex::new(ConsecutiveFailures::new(backoff)),
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn current_plan(&self) -> Option<ScanPlan> {
        *self.plan.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn alive_workers(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let threshold = to_chrono(self.settings.heartbeat_threshold);
        let workers = self.context.workers().list(self.context.cluster_id()).await?;
        Ok(workers.iter().filter(|w| w.is_alive(now, threshold)).count())
    }

    async fn plan_for(&self, backlog: u64, now: DateTime<Utc>) -> SchedulerResult<ScanPlan> {
        if let Some(plan) = self.current_plan() {
            if !plan.should_calculate_again(now) {
                return Ok(plan);
            }
        }
        let alive = self.alive_workers(now).await?;
        let plan = ScanPlan::calculate(
            backlog,
            alive,
            self.settings.batch_size,
            self.settings.coverage_window,
            self.target.lane(),
            now,
        );
        debug!(
            "{} 重新计算扫描计划: 积压 {}, 存活Worker {}, 分区 [{}, {}], 间隔 {:?}",
            self.target.name(),
            backlog,
            alive,
            plan.locker_min,
            plan.locker_max,
            plan.interval
        );
        *self.plan.lock().unwrap_or_else(|e| e.into_inner()) = Some(plan);
        Ok(plan)
    }

    /// 执行一轮：选分区、加锁、认领、处理、释放
    pub async fn tick(&self, now: DateTime<Utc>) -> SchedulerResult<TickOutcome> {
        let backlog = self.target.backlog(now).await?;
        if backlog == 0 {
            debug!("{} 没有待处理的行", self.target.name());
            return Ok(TickOutcome::Idle);
        }

        let plan = self.plan_for(backlog, now).await?;
        let lock_id = plan.pick_lock_id(&mut rand::rng());
        let key = format!("scan-partition:{lock_id}");

        let Some(token) = self.context.locks().try_lock(&key, self.settings.claim_ttl).await? else {
            debug!("{} 分区锁 {} 被占用", self.target.name(), lock_id);
            return Ok(TickOutcome::Contention);
        };

        let outcome = self.process_partition(lock_id, &plan, now).await;
        self.context.locks().release_lock(&token).await;
        outcome
    }

    async fn process_partition(
        &self,
        lock_id: i64,
        plan: &ScanPlan,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TickOutcome> {
        let ttl = to_chrono(self.settings.claim_ttl);
        let claimed = self
            .target
            .claim(lock_id, now + ttl, plan.batch_size, now)
            .await?;
        if claimed == 0 {
            debug!("{} 分区 {} 没有认领到行", self.target.name(), lock_id);
            return Ok(TickOutcome::Contention);
        }

        let items = match self.target.load_claimed(lock_id, now).await {
            Ok(items) => items,
            Err(e) => {
                self.release_claims(lock_id).await;
                return Err(e);
            }
        };

        let (mut succeeded, mut failed, mut skipped) = (0, 0, 0);
        for item in items {
            let key = self.target.key(&item);
            if self.failures_guard().should_skip(&key, now) {
                skipped += 1;
                continue;
            }

            match self.target.process(item, now).await {
                Ok(()) => {
                    self.failures_guard().record_success(&key);
                    succeeded += 1;
                }
                Err(e) => {
                    failed += 1;
                    let consecutive = self.failures_guard().record_failure(&key, now);
                    if consecutive >= FAILURE_ALERT_THRESHOLD {
                        error!(
                            "{} 处理 {} 连续失败 {} 次，可能丢失工作: {}",
                            self.target.name(),
                            key,
                            consecutive,
                            e
                        );
                    } else {
                        warn!("{} 处理 {} 失败 (第 {} 次): {}", self.target.name(), key, consecutive, e);
                    }
                }
            }
        }

        self.release_claims(lock_id).await;
        metrics::counter!("scheduler_scan_processed_total", "scanner" => self.target.name())
            .increment(succeeded as u64);

        Ok(TickOutcome::Processed {
            succeeded,
            failed,
            skipped,
        })
    }

    async fn release_claims(&self, lock_id: i64) {
        if let Err(e) = self.target.release(lock_id).await {
            warn!("{} 释放分区 {} 的认领失败: {}", self.target.name(), lock_id, e);
        }
    }

    fn failures_guard(&self) -> std::sync::MutexGuard<'_, ConsecutiveFailures<String>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<T: ScanTarget> PeriodicTask for PartitionedScanner<T> {
    fn name(&self) -> &str {
        self.target.name()
    }

    async fn run_once(&self, now: DateTime<Utc>) -> SchedulerResult<Duration> {
        let outcome = self.tick(now).await?;
        let interval = self
            .current_plan()
            .map_or(self.settings.coverage_window, |plan| plan.interval);
        Ok(match outcome {
            TickOutcome::Contention => self.settings.contention_backoff,
            TickOutcome::Idle | TickOutcome::Processed { .. } => interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const ALL_LANES: [ScanLane; 6] = [
        ScanLane::DueOnMaster,
        ScanLane::Deadline,
        ScanLane::JobCancellation,
        ScanLane::RecurringPlanning,
        ScanLane::StaticOrphan,
        ScanLane::ScheduleCancellation,
    ];

    #[test]
    fn test_lane_ranges_are_disjoint() {
        let now = Utc::now();
        // 极端积压与 Worker 数，让区间尽量大
        let plans: Vec<ScanPlan> = ALL_LANES
            .iter()
            .map(|lane| ScanPlan::calculate(u64::MAX / 2, 10_000_000, 10, Duration::from_secs(30), *lane, now))
            .collect();

        for (i, a) in plans.iter().enumerate() {
            assert!(a.locker_max - a.locker_min < LANE_STRIDE / 2);
            for b in plans.iter().skip(i + 1) {
                assert!(a.locker_max < b.locker_min || b.locker_max < a.locker_min);
            }
        }
    }

    #[test]
    fn test_partitions_follow_backlog_and_fleet_size() {
        let now = Utc::now();
        let window = Duration::from_secs(30);

        let small = ScanPlan::calculate(5, 4, 100, window, ScanLane::Deadline, now);
        assert_eq!(small.partitions, 1);
        assert_eq!(small.locker_min, LANE_STRIDE + 1);
        assert_eq!(small.locker_max, small.locker_min);

        let large = ScanPlan::calculate(10_000, 4, 100, window, ScanLane::Deadline, now);
        assert_eq!(large.partitions, 8);
        assert_eq!(large.locker_max - large.locker_min + 1, 8);
        // 4 个 Worker 各扫 8 个分区中的一个：30s * 4 / 8
        assert_eq!(large.interval, Duration::from_secs(15));
    }

    #[test]
    fn test_batch_and_interval_are_clamped() {
        let now = Utc::now();
        let plan = ScanPlan::calculate(1, 0, 5_000, Duration::from_secs(10), ScanLane::DueOnMaster, now);
        assert_eq!(plan.batch_size, MAX_BATCH_SIZE);
        assert_eq!(plan.interval, Duration::from_secs(10));

        let plan = ScanPlan::calculate(1_000_000, 100, 1, Duration::from_secs(2), ScanLane::DueOnMaster, now);
        assert_eq!(plan.batch_size, MIN_BATCH_SIZE);
        assert!(plan.interval >= Duration::from_secs(1));
    }

    #[test]
    fn test_recalculate_after_validity_window() {
        let now = Utc::now();
        let plan = ScanPlan::calculate(100, 2, 50, Duration::from_secs(30), ScanLane::Deadline, now);
        assert!(!plan.should_calculate_again(now));
        assert!(!plan.should_calculate_again(now + chrono::Duration::seconds(29)));
        assert!(plan.should_calculate_again(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_pick_lock_id_stays_in_window() {
        let now = Utc::now();
        let plan = ScanPlan::calculate(10_000, 8, 100, Duration::from_secs(30), ScanLane::StaticOrphan, now);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let id = plan.pick_lock_id(&mut rng) as u64;
            assert!(id >= plan.locker_min && id <= plan.locker_max);
        }
    }
}
