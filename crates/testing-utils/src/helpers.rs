//! Test helper utilities

use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{ClusterContext, ClusterRepositories, HandlerRegistry};
use scheduler_domain::{
    BucketAddress, BucketRepository, ClusterConfiguration, HandlerMetadata, JobHandler,
    JobPriority, AgentTransport, Bucket, Worker, WorkerRepository,
};
use scheduler_infrastructure::memory::InMemoryMasterStore;
use tokio::time::sleep;

use crate::builders::{BucketBuilder, WorkerBuilder, TEST_AGENT, TEST_CLUSTER};
use crate::mocks::{FaultyJobsRepository, RecordingHandler, ScriptedTransport};

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// 基于内存主存储与脚本化传输的单集群测试环境
pub struct TestCluster {
    pub context: Arc<ClusterContext>,
    pub store: Arc<InMemoryMasterStore>,
    /// 上下文使用的作业仓储，默认不注入任何故障
    pub jobs: Arc<FaultyJobsRepository>,
    pub transport: Arc<ScriptedTransport>,
    pub handler: Arc<RecordingHandler>,
}

impl TestCluster {
    /// 注册一个名为 `test-handler` 的 `RecordingHandler`
    pub fn new() -> Self {
        Self::with_handler(RecordingHandler::new())
    }

    pub fn with_handler(handler: RecordingHandler) -> Self {
        Self::build(handler, ClusterConfiguration::new(TEST_CLUSTER))
    }

    pub fn with_configuration(configuration: ClusterConfiguration) -> Self {
        Self::build(RecordingHandler::new(), configuration)
    }

    fn build(handler: RecordingHandler, configuration: ClusterConfiguration) -> Self {
        let store = Arc::new(InMemoryMasterStore::new());
        let transport = Arc::new(ScriptedTransport::new(TEST_AGENT));
        let handler = Arc::new(handler);

        let mut handlers = HandlerRegistry::new();
        handlers
            .register(
                HandlerMetadata::new("test-handler").with_timeout_seconds(30),
                handler.clone() as Arc<dyn JobHandler>,
            )
            .expect("register test handler");

        let jobs = Arc::new(FaultyJobsRepository::new(store.clone()));
        let mut repositories = ClusterRepositories::from_store(store.clone());
        repositories.jobs = jobs.clone();

        let context = ClusterContext::builder(TEST_CLUSTER)
            .repositories(repositories)
            .transport(transport.clone() as Arc<dyn AgentTransport>)
            .handlers(Arc::new(handlers))
            .default_configuration(configuration)
            .build()
            .expect("build test cluster context");

        Self {
            context: Arc::new(context),
            store,
            jobs,
            transport,
            handler,
        }
    }

    /// 注册 Worker（心跳为当前时间）
    pub async fn add_worker(&self, builder: WorkerBuilder) -> Worker {
        let worker = builder.build();
        WorkerRepository::register(self.store.as_ref(), &worker)
            .await
            .expect("register worker");
        worker
    }

    /// 为 Worker 创建一个 Bucket 及其传输地址
    pub async fn add_bucket(&self, worker: &Worker, priority: JobPriority) -> Bucket {
        let bucket = BucketBuilder::for_worker(worker)
            .with_priority(priority)
            .build();
        self.insert_bucket(&bucket).await;
        bucket
    }

    pub async fn insert_bucket(&self, bucket: &Bucket) {
        BucketRepository::insert(self.store.as_ref(), bucket)
            .await
            .expect("insert bucket");
        for address in BucketAddress::all_for_bucket(bucket) {
            self.transport
                .create_address(&address)
                .await
                .expect("create address");
        }
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
