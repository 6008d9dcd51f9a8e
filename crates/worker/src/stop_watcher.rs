//! 停止请求监视
//!
//! 轮询 `worker-stop:{kind}:{worker_id}` 锁；立即停止优先于友好停止，
//! 已发出立即停止后不再降级。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

use scheduler_core::ClusterContext;
use scheduler_dispatcher::{stop_lock_key, PeriodicTask, StopKind};
use scheduler_domain::SchedulerResult;

pub struct StopWatcher {
    context: Arc<ClusterContext>,
    worker_id: String,
    interval: Duration,
    signal: watch::Sender<Option<StopKind>>,
}

impl StopWatcher {
    pub fn new(
        context: Arc<ClusterContext>,
        worker_id: impl Into<String>,
        interval: Duration,
    ) -> (Self, watch::Receiver<Option<StopKind>>) {
        let (signal, receiver) = watch::channel(None);
        let watcher = Self {
            context,
            worker_id: worker_id.into(),
            interval,
            signal,
        };
        (watcher, receiver)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StopKind>> {
        self.signal.subscribe()
    }

    pub async fn requested(&self) -> Option<StopKind> {
        for kind in [StopKind::Immediate, StopKind::Friendly] {
            if self
                .context
                .locks()
                .is_locked(&stop_lock_key(kind, &self.worker_id))
                .await
            {
                return Some(kind);
            }
        }
        None
    }

    /// 返回本次是否发出了新的停止信号
    pub async fn check(&self) -> bool {
        let Some(kind) = self.requested().await else {
            return false;
        };
        let changed = self.signal.send_if_modified(|current| match current {
            Some(StopKind::Immediate) => false,
            Some(existing) if *existing == kind => false,
            _ => {
                *current = Some(kind);
                true
            }
        });
        if changed {
            info!("Worker {} 收到停止请求: {}", self.worker_id, kind);
        }
        changed
    }

    /// 清除本 Worker 的停止请求，避免同 id 的新进程启动后立即停止
    pub async fn clear(&self) -> SchedulerResult<()> {
        for kind in [StopKind::Immediate, StopKind::Friendly] {
            self.context
                .locks()
                .force_release_lock(&stop_lock_key(kind, &self.worker_id))
                .await?;
        }
        Ok(())
    }
}

/// 等待停止信号，发送端关闭时永远挂起
pub async fn wait_for_stop(receiver: &mut watch::Receiver<Option<StopKind>>) -> StopKind {
    loop {
        if let Some(kind) = *receiver.borrow_and_update() {
            return kind;
        }
        if receiver.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// 等待立即停止信号
pub async fn wait_for_immediate(receiver: &mut watch::Receiver<Option<StopKind>>) {
    loop {
        if *receiver.borrow_and_update() == Some(StopKind::Immediate) {
            return;
        }
        if receiver.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl PeriodicTask for StopWatcher {
    fn name(&self) -> &str {
        "stop-watcher"
    }

    async fn run_once(&self, _now: DateTime<Utc>) -> SchedulerResult<Duration> {
        self.check().await;
        Ok(self.interval)
    }
}
