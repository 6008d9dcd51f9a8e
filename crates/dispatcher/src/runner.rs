//! 周期性后台任务
//!
//! 每个任务自行决定下一次运行前的等待时间；取消令牌在任意等待点生效。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scheduler_domain::SchedulerResult;

/// 出错后的重试等待
const ERROR_DELAY: Duration = Duration::from_secs(5);

#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &str;

    /// 执行一轮，返回距下一轮的等待时间
    async fn run_once(&self, now: DateTime<Utc>) -> SchedulerResult<Duration>;
}

/// 在后台循环运行任务直到取消
pub fn spawn_periodic(task: Arc<dyn PeriodicTask>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("启动后台任务: {}", task.name());
        loop {
            let delay = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = task.run_once(Utc::now()) => match result {
                    Ok(delay) => delay,
                    Err(e) => {
                        warn!("后台任务 {} 执行失败: {}", task.name(), e);
                        metrics::counter!("scheduler_runner_errors_total", "runner" => task.name().to_string())
                            .increment(1);
                        ERROR_DELAY
                    }
                },
            };

            debug!("后台任务 {} 将在 {:?} 后再次运行", task.name(), delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("后台任务已停止: {}", task.name());
    })
}
