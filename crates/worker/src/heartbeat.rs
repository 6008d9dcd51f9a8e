use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use scheduler_core::ClusterContext;
use scheduler_dispatcher::{BucketLifecycle, PeriodicTask};
use scheduler_domain::{BucketStatus, JobPriority, SchedulerResult, Worker, WorkerMode};

use crate::engine::ExecutionEngine;

/// 周期性刷新 Worker 心跳；注册记录丢失（例如被判定死亡后注销）时重新注册并重建 Bucket
pub struct HeartbeatTask {
    context: Arc<ClusterContext>,
    worker: Worker,
    priorities: Vec<JobPriority>,
    engine: Arc<ExecutionEngine>,
    interval: Duration,
}

impl HeartbeatTask {
    pub fn new(
        context: Arc<ClusterContext>,
        worker: Worker,
        priorities: Vec<JobPriority>,
        engine: Arc<ExecutionEngine>,
        interval: Duration,
    ) -> Self {
        Self {
            context,
            worker,
            priorities,
            engine,
            interval,
        }
    }

    pub async fn beat(&self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let alive = self
            .context
            .workers()
            .heartbeat(self.context.cluster_id(), &self.worker.id, now)
            .await?;
        if alive {
            debug!("Worker {} 心跳 {}", self.worker.id, now);
            metrics::counter!("scheduler_worker_heartbeats_total").increment(1);
            return Ok(true);
        }

        warn!("Worker {} 的注册记录已丢失，重新注册", self.worker.id);
        self.reregister(now).await?;
        Ok(false)
    }

    async fn reregister(&self, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut worker = self.worker.clone();
        worker.last_heartbeat = now;
        self.context.workers().register(&worker).await?;

        // 旧 Bucket 已被标记为 Lost 或转交他人
        for bucket_id in self.engine.bucket_ids() {
            let still_ours = self
                .context
                .buckets()
                .get(self.context.cluster_id(), &bucket_id)
                .await?
                .is_some_and(|b| b.is_owned_by(&worker.id) && b.status == BucketStatus::Active);
            if !still_ours {
                self.engine.detach_bucket(&bucket_id);
            }
        }

        if worker.mode == WorkerMode::Normal && self.engine.bucket_ids().is_empty() {
            let buckets = BucketLifecycle::new(self.context.clone())
                .create_buckets(&worker, &self.priorities)
                .await?;
            for bucket in buckets {
                self.engine.attach_bucket(bucket);
            }
        }

        metrics::counter!("scheduler_worker_reregistrations_total").increment(1);
        info!("Worker {} 已重新注册", worker.id);
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for HeartbeatTask {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> SchedulerResult<Duration> {
        self.beat(now).await?;
        Ok(self.interval)
    }
}
