use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::debug;

use scheduler_domain::{Bucket, JobPriority, Worker};

/// 新作业/周期计划的 Bucket 选择策略
pub trait BucketSelector: Send + Sync {
    /// 从已过滤的候选中选一个；候选为空时返回 `None`
    fn select<'a>(&self, candidates: &'a [Bucket]) -> Option<&'a Bucket>;

    fn name(&self) -> &str;
}

/// 默认策略：在候选中均匀随机选择
#[derive(Debug, Default)]
pub struct RandomBucketSelector;

impl RandomBucketSelector {
    pub fn new() -> Self {
        Self
    }
}

impl BucketSelector for RandomBucketSelector {
    fn select<'a>(&self, candidates: &'a [Bucket]) -> Option<&'a Bucket> {
        match candidates.len() {
            0 => None,
            1 => candidates.first(),
            len => candidates.get(rand::rng().random_range(0..len)),
        }
    }

    fn name(&self) -> &str {
        "Random"
    }
}

/// 轮询策略
pub struct RoundRobinBucketSelector {
    counter: AtomicUsize,
}

impl RoundRobinBucketSelector {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinBucketSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketSelector for RoundRobinBucketSelector {
    fn select<'a>(&self, candidates: &'a [Bucket]) -> Option<&'a Bucket> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        debug!("轮询策略选择Bucket: 索引 {}/{}", index, candidates.len());
        candidates.get(index)
    }

    fn name(&self) -> &str {
        "RoundRobin"
    }
}

/// 可以接收新工作的 Bucket：`Active`、优先级与 lane 完全匹配、属主存活
pub fn eligible_buckets(
    buckets: Vec<Bucket>,
    workers: &[Worker],
    priority: JobPriority,
    lane: Option<&str>,
    now: DateTime<Utc>,
    heartbeat_threshold: Duration,
) -> Vec<Bucket> {
    let alive: HashSet<&str> = workers
        .iter()
        .filter(|w| w.is_alive(now, heartbeat_threshold))
        .map(|w| w.id.as_str())
        .collect();

    buckets
        .into_iter()
        .filter(|b| b.accepts_new_work())
        .filter(|b| b.priority == priority)
        .filter(|b| b.lane.as_deref() == lane)
        .filter(|b| alive.contains(b.worker_id.as_str()))
        .collect()
}
