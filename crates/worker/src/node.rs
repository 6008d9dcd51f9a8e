//! Worker 节点
//!
//! 启动时注册 Worker、创建 Bucket 并接入本地执行引擎，确认静态周期计划，
//! 然后启动心跳、轮询、排空、停止监视以及各类分区扫描后台任务。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use scheduler_core::{AppConfig, ClusterContext};
use scheduler_dispatcher::{
    spawn_periodic, AssignedLostBucketsRunner, BucketLifecycle, DeadWorkerDetector, DeadlineProcessor,
    DispatchService, DispatchSettings, DueOnMasterProcessor, JobCancellationProcessor, JobScan,
    PartitionedScanner, PeriodicTask, RecurringPlanProcessor, RecurringPlanner, RecurringSettings,
    RetentionRunner, ScanSettings, ScheduleCancellationProcessor, ScheduleScan, StaticOrphanProcessor,
    StaticScheduleKeeper, StopKind,
};
use scheduler_domain::{validate_id, LocalExecutionEngine, SchedulerResult, Worker, WorkerMode};

use crate::drain::BucketDrainer;
use crate::engine::{EngineSettings, EnginePoller, EngineSweeper, EngineTicker, ExecutionEngine};
use crate::heartbeat::HeartbeatTask;
use crate::stop_watcher::{wait_for_immediate, wait_for_stop, StopWatcher};

/// 未配置 Worker id 时使用 `{hostname}-{随机后缀}`
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());

    let mut id = String::with_capacity(host.len() + 9);
    for c in host.chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' && (id.is_empty() || id.ends_with('-')) {
            continue;
        }
        id.push(c);
    }
    if id.is_empty() || id.ends_with('-') {
        id.push_str("worker");
    }
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", id, &suffix[..8])
}

pub struct WorkerNode {
    worker: Worker,
    context: Arc<ClusterContext>,
    config: AppConfig,
    engine: Arc<ExecutionEngine>,
    dispatcher: Arc<DispatchService>,
    drainer: Arc<BucketDrainer>,
    stop_watcher: Arc<StopWatcher>,
    stop_signal: watch::Receiver<Option<StopKind>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerNode {
    pub async fn start(context: Arc<ClusterContext>, config: AppConfig) -> SchedulerResult<Self> {
        let worker_id = config.worker.id.clone().unwrap_or_else(default_worker_id);
        validate_id(&worker_id)?;

        let worker = Worker::new(
            context.cluster_id(),
            worker_id.clone(),
            context.transport().agent_connection_id(),
            config.worker.lane.clone(),
            config.worker.mode,
        );
        context.workers().register(&worker).await?;
        info!(
            "Worker {} 已注册 (集群 {}, agent {}, 模式 {})",
            worker.id,
            context.cluster_id(),
            worker.agent_connection_id,
            worker.mode
        );

        let engine = Arc::new(ExecutionEngine::new(
            context.clone(),
            worker_id.clone(),
            EngineSettings::from_config(&config.worker, &config.task_queue),
        ));
        if worker.mode == WorkerMode::Normal {
            let buckets = BucketLifecycle::new(context.clone())
                .create_buckets(&worker, &config.worker.bucket_priorities)
                .await?;
            for bucket in buckets {
                engine.attach_bucket(bucket);
            }
        }

        let dispatcher = Arc::new(
            DispatchService::new(
                context.clone(),
                DispatchSettings::from_config(&config.worker, &config.transport),
            )
            .with_local_engine(engine.clone() as Arc<dyn LocalExecutionEngine>),
        );

        if !config.recurring.static_schedules.is_empty() {
            let report = StaticScheduleKeeper::new(dispatcher.clone())
                .ensure(&config.recurring.profile_id, &config.recurring.static_schedules)
                .await?;
            info!("静态周期计划确认完成: {:?}", report);
        }

        let drainer = Arc::new(BucketDrainer::new(
            context.clone(),
            engine.clone(),
            worker_id.clone(),
            config.worker.drain_poll_interval(),
        ));
        let (stop_watcher, stop_signal) =
            StopWatcher::new(context.clone(), worker_id.clone(), config.worker.stop_poll_interval());

        let node = Self {
            worker,
            context,
            config,
            engine,
            dispatcher,
            drainer,
            stop_watcher: Arc::new(stop_watcher),
            stop_signal,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        node.spawn_background_tasks().await;
        Ok(node)
    }

    async fn spawn_background_tasks(&self) {
        let context = &self.context;
        let config = &self.config;
        let scan = ScanSettings::from_config(&config.scan, &config.worker);
        let dispatcher = &self.dispatcher;

        let mut runners: Vec<Arc<dyn PeriodicTask>> = vec![
            Arc::new(HeartbeatTask::new(
                context.clone(),
                self.worker.clone(),
                config.worker.bucket_priorities.clone(),
                self.engine.clone(),
                config.worker.heartbeat_interval(),
            )),
            Arc::new(EnginePoller::new(self.engine.clone())),
            Arc::new(EngineTicker::new(self.engine.clone())),
            Arc::new(EngineSweeper::new(self.engine.clone())),
            self.drainer.clone(),
            self.stop_watcher.clone(),
            Arc::new(AssignedLostBucketsRunner::new(
                context.clone(),
                config.worker.heartbeat_threshold(),
                config.scan.dead_worker_interval(),
            )),
            Arc::new(DeadWorkerDetector::from_config(context.clone(), &config.worker, &config.scan)),
            Arc::new(RetentionRunner::new(context.clone(), config.scan.retention_interval())),
        ];

        runners.push(Arc::new(PartitionedScanner::new(
            context.clone(),
            JobScan::new(context.clone(), DueOnMasterProcessor::new(dispatcher.clone())),
            scan.clone(),
        )));
        runners.push(Arc::new(PartitionedScanner::new(
            context.clone(),
            JobScan::new(context.clone(), DeadlineProcessor::new(dispatcher.clone())),
            scan.clone(),
        )));
        runners.push(Arc::new(PartitionedScanner::new(
            context.clone(),
            JobScan::new(context.clone(), JobCancellationProcessor::new(dispatcher.clone())),
            scan.clone(),
        )));
        runners.push(Arc::new(PartitionedScanner::new(
            context.clone(),
            ScheduleScan::new(
                context.clone(),
                RecurringPlanProcessor::new(RecurringPlanner::new(
                    context.clone(),
                    RecurringSettings::from_config(&config.recurring),
                )),
            ),
            scan.clone(),
        )));
        runners.push(Arc::new(PartitionedScanner::new(
            context.clone(),
            ScheduleScan::new(context.clone(), ScheduleCancellationProcessor::new(dispatcher.clone())),
            scan.clone(),
        )));
        runners.push(Arc::new(PartitionedScanner::new(
            context.clone(),
            ScheduleScan::new(
                context.clone(),
                StaticOrphanProcessor::new(dispatcher.clone(), config.recurring.static_orphan_threshold()),
            ),
            scan,
        )));

        let mut tasks = self.tasks.lock().await;
        for runner in runners {
            tasks.push(spawn_periodic(runner, self.shutdown.clone()));
        }
        info!("Worker {} 启动了 {} 个后台任务", self.worker.id, tasks.len());
    }

    pub fn worker_id(&self) -> &str {
        &self.worker.id
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    pub fn dispatcher(&self) -> &Arc<DispatchService> {
        &self.dispatcher
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn stop_signal(&self) -> watch::Receiver<Option<StopKind>> {
        self.stop_signal.clone()
    }

    /// 运行直到收到停止请求（分布式锁或进程信号），然后按请求的方式停止
    pub async fn run_until_stopped<F>(self, external: F) -> SchedulerResult<()>
    where
        F: std::future::Future<Output = StopKind>,
    {
        let mut signal = self.stop_signal();
        let kind = tokio::select! {
            kind = external => kind,
            kind = wait_for_stop(&mut signal) => kind,
        };
        self.stop(kind).await
    }

    pub async fn stop(self, kind: StopKind) -> SchedulerResult<()> {
        info!("Worker {} 开始停止: {}", self.worker.id, kind);
        if kind == StopKind::Friendly {
            let mut signal = self.stop_signal();
            tokio::select! {
                result = self.drain_gracefully() => {
                    if let Err(e) = result {
                        warn!("Worker {} 友好停止时排空失败: {}", self.worker.id, e);
                    }
                }
                _ = wait_for_immediate(&mut signal) => {
                    info!("Worker {} 的友好停止升级为立即停止", self.worker.id);
                }
            }
        }
        self.stop_immediately().await
    }

    async fn drain_gracefully(&self) -> SchedulerResult<()> {
        tokio::time::sleep(self.config.worker.friendly_stop_grace()).await;
        self.drainer.begin_drain_all(Utc::now()).await?;
        let poll = self.config.worker.drain_poll_interval().max(Duration::from_millis(10));
        while !self.drainer.is_drained().await? {
            tokio::time::sleep(poll).await;
        }
        info!("Worker {} 的全部Bucket已排空", self.worker.id);
        Ok(())
    }

    async fn stop_immediately(self) -> SchedulerResult<()> {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        join_all(tasks).await;

        self.engine.shutdown().await?;
        let lost = BucketLifecycle::new(self.context.clone())
            .mark_lost(&self.worker.id, Utc::now())
            .await?;
        if lost > 0 {
            info!("Worker {} 停止时仍有 {} 个Bucket，交由其他Worker排空", self.worker.id, lost);
        }
        self.context
            .workers()
            .unregister(self.context.cluster_id(), &self.worker.id)
            .await?;
        self.stop_watcher.clear().await?;
        info!("Worker {} 已停止", self.worker.id);
        Ok(())
    }
}
