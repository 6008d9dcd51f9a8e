//! 本 Worker 名下 Bucket 的排空
//!
//! `Draining` 的 Bucket 在本地队列全部结束后进入 `ReadyToDrain`；
//! `ReadyToDrain` 的 Bucket（包括接手的失联 Bucket）清空传输队列后删除。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use scheduler_core::ClusterContext;
use scheduler_dispatcher::{BucketLifecycle, PeriodicTask};
use scheduler_domain::{BucketStatus, SchedulerResult};

use crate::engine::ExecutionEngine;

pub struct BucketDrainer {
    context: Arc<ClusterContext>,
    lifecycle: BucketLifecycle,
    engine: Arc<ExecutionEngine>,
    worker_id: String,
    interval: Duration,
}

impl BucketDrainer {
    pub fn new(
        context: Arc<ClusterContext>,
        engine: Arc<ExecutionEngine>,
        worker_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            lifecycle: BucketLifecycle::new(context.clone()),
            context,
            engine,
            worker_id: worker_id.into(),
            interval,
        }
    }

    /// 停止本 Worker 所有仍在接收工作的 Bucket
    pub async fn begin_drain_all(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let buckets = self
            .context
            .buckets()
            .list_by_worker(self.context.cluster_id(), &self.worker_id)
            .await?;
        let mut started = 0;
        for bucket in buckets {
            if !matches!(bucket.status, BucketStatus::Active | BucketStatus::Completing) {
                continue;
            }
            self.engine.stop_polling(&bucket.id);
            if self.lifecycle.begin_drain(&bucket, now).await?.is_some() {
                started += 1;
            }
        }
        info!("Worker {} 开始排空 {} 个Bucket", self.worker_id, started);
        Ok(started)
    }

    /// 推进一轮排空，返回删除的 Bucket 数
    pub async fn advance(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let buckets = self
            .context
            .buckets()
            .list_by_worker(self.context.cluster_id(), &self.worker_id)
            .await?;

        let mut deleted = 0;
        for bucket in buckets {
            let current = match bucket.status {
                BucketStatus::Completing => {
                    self.engine.stop_polling(&bucket.id);
                    match self.lifecycle.transition(&bucket, BucketStatus::Draining, now).await? {
                        Some(next) => next,
                        None => continue,
                    }
                }
                BucketStatus::Draining | BucketStatus::ReadyToDrain => {
                    self.engine.stop_polling(&bucket.id);
                    bucket
                }
                _ => continue,
            };

            if !self.engine.is_bucket_idle(&current.id) {
                debug!("Bucket {} 仍有本地作业在执行", current.id);
                continue;
            }

            let ready = if current.status == BucketStatus::Draining {
                match self.lifecycle.transition(&current, BucketStatus::ReadyToDrain, now).await? {
                    Some(next) => next,
                    None => continue,
                }
            } else {
                current
            };

            let outcome = self.lifecycle.flush_bucket(&ready, now).await?;
            if outcome.deleted {
                self.engine.detach_bucket(&ready.id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// 本 Worker 名下已没有任何 Bucket
    pub async fn is_drained(&self) -> SchedulerResult<bool> {
        Ok(self
            .context
            .buckets()
            .list_by_worker(self.context.cluster_id(), &self.worker_id)
            .await?
            .is_empty())
    }
}

#[async_trait]
impl PeriodicTask for BucketDrainer {
    fn name(&self) -> &str {
        "bucket-drainer"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> SchedulerResult<Duration> {
        self.advance(now).await?;
        Ok(self.interval)
    }
}
