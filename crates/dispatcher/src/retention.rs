//! 过期数据清理
//!
//! 删除终态超过集群数据保留期的作业与周期计划。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use scheduler_core::ClusterContext;
use scheduler_domain::SchedulerResult;

use crate::runner::PeriodicTask;

const RETENTION_LOCK: &str = "retention-purge";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub jobs: u64,
    pub schedules: u64,
}

pub struct RetentionRunner {
    context: Arc<ClusterContext>,
    interval: Duration,
}

impl RetentionRunner {
    pub fn new(context: Arc<ClusterContext>, interval: Duration) -> Self {
        Self { context, interval }
    }

    pub async fn purge(&self, now: DateTime<Utc>) -> SchedulerResult<PurgeReport> {
        let Some(token) = self
            .context
            .locks()
            .try_lock(RETENTION_LOCK, self.interval.max(Duration::from_secs(1)) * 2)
            .await?
        else {
            debug!("其他节点正在清理过期数据");
            return Ok(PurgeReport::default());
        };

        let result = self.purge_locked(now).await;
        self.context.locks().release_lock(&token).await;
        result
    }

    async fn purge_locked(&self, now: DateTime<Utc>) -> SchedulerResult<PurgeReport> {
        let cluster_id = self.context.cluster_id();
        let older_than = now - self.context.configuration().await?.data_retention_ttl();

        let report = PurgeReport {
            jobs: self.context.jobs().purge_finished(cluster_id, older_than).await?,
            schedules: self.context.schedules().purge_finished(cluster_id, older_than).await?,
        };
        if report.jobs > 0 || report.schedules > 0 {
            info!(
                "已清理 {} 之前结束的 {} 个作业和 {} 个周期计划",
                older_than, report.jobs, report.schedules
            );
            metrics::counter!("scheduler_retention_purged_total", "entity" => "job").increment(report.jobs);
            metrics::counter!("scheduler_retention_purged_total", "entity" => "schedule")
                .increment(report.schedules);
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicTask for RetentionRunner {
    fn name(&self) -> &str {
        "retention"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> SchedulerResult<Duration> {
        self.purge(now).await?;
        Ok(self.interval)
    }
}
