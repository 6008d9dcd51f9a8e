//! 通过分布式锁请求 Worker 停止
//!
//! 外部系统持有 `worker-stop:{kind}:{worker_id}` 锁即表示请求停止，
//! Worker 的停止监视器轮询锁是否存在。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use scheduler_core::DistributedLockService;
use scheduler_domain::{LockToken, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopKind {
    /// 立即终止
    Immediate,
    /// 等待宽限期并排空 Bucket 后终止
    Friendly,
}

impl StopKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopKind::Immediate => "immediate",
            StopKind::Friendly => "friendly",
        }
    }
}

impl fmt::Display for StopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn stop_lock_key(kind: StopKind, worker_id: &str) -> String {
    format!("worker-stop:{}:{}", kind.as_str(), worker_id)
}

/// 请求停止 Worker；同类请求已存在时返回 `None`
pub async fn request_stop(
    locks: &DistributedLockService,
    worker_id: &str,
    kind: StopKind,
    lease: Duration,
) -> SchedulerResult<Option<LockToken>> {
    let token = locks.try_lock(&stop_lock_key(kind, worker_id), lease).await?;
    if token.is_some() {
        info!("已请求Worker {} 停止 ({})", worker_id, kind);
    }
    Ok(token)
}
