//! 失联 Worker 检测
//!
//! 超过心跳阈值加宽限期仍无心跳的 Worker 判定死亡：其 Bucket 标记为 `Lost`，
//! Worker 记录随后删除。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use scheduler_core::{to_chrono, ClusterContext, ScanConfig, WorkerConfig};
use scheduler_domain::SchedulerResult;

use crate::bucket_lifecycle::BucketLifecycle;
use crate::runner::PeriodicTask;

const DEAD_WORKER_LOCK: &str = "dead-worker-detector";

pub struct DeadWorkerDetector {
    context: Arc<ClusterContext>,
    lifecycle: BucketLifecycle,
    threshold: chrono::Duration,
    grace: chrono::Duration,
    interval: Duration,
}

impl DeadWorkerDetector {
    pub fn new(context: Arc<ClusterContext>, threshold: Duration, grace: Duration, interval: Duration) -> Self {
        Self {
            lifecycle: BucketLifecycle::new(context.clone()),
            context,
            threshold: to_chrono(threshold),
            grace: to_chrono(grace),
            interval,
        }
    }

    pub fn from_config(context: Arc<ClusterContext>, worker: &WorkerConfig, scan: &ScanConfig) -> Self {
        Self::new(
            context,
            worker.heartbeat_threshold(),
            worker.dead_worker_grace(),
            scan.dead_worker_interval(),
        )
    }

    /// 返回本轮清理的 Worker 数；拿不到锁时返回 0
    pub async fn detect(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let Some(token) = self
            .context
            .locks()
            .try_lock(DEAD_WORKER_LOCK, self.interval.max(Duration::from_secs(1)) * 2)
            .await?
        else {
            debug!("其他节点正在检测失联Worker");
            return Ok(0);
        };

        let result = self.detect_locked(now).await;
        self.context.locks().release_lock(&token).await;
        result
    }

    async fn detect_locked(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let cluster_id = self.context.cluster_id();
        let workers = self.context.workers().list(cluster_id).await?;

        let mut removed = 0;
        for worker in workers.iter().filter(|w| w.is_dead(now, self.threshold, self.grace)) {
            let lost = self.lifecycle.mark_lost(&worker.id, now).await?;
            if self.context.workers().unregister(cluster_id, &worker.id).await? {
                info!(
                    "Worker {} 最后心跳于 {}，判定死亡，{} 个Bucket转为 Lost",
                    worker.id, worker.last_heartbeat, lost
                );
                metrics::counter!("scheduler_dead_workers_total").increment(1);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl PeriodicTask for DeadWorkerDetector {
    fn name(&self) -> &str {
        "dead-worker-detector"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> SchedulerResult<Duration> {
        self.detect(now).await?;
        Ok(self.interval)
    }
}
