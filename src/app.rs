//! 进程组装
//!
//! 按配置选择主存储与传输后端，构建集群上下文，然后启动一个 Worker 节点。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use scheduler_core::{
    AppConfig, ClusterContext, ClusterRegistry, ClusterRepositories, HandlerRegistry, StorageBackend,
    TransportBackend,
};
use scheduler_dispatcher::{request_stop, StopKind};
use scheduler_domain::AgentTransport;
use scheduler_infrastructure::{
    connect_postgres, ensure_schema, InMemoryMasterStore, InMemoryTransport, PostgresBucketRepository,
    PostgresClusterConfigRepository, PostgresJobRepository, PostgresLockRepository,
    PostgresScheduleRepository, PostgresWorkerRepository, RedisStreamConfig, RedisStreamTransport,
};
use scheduler_worker::WorkerNode;

pub struct Application {
    config: AppConfig,
    clusters: ClusterRegistry,
    context: Arc<ClusterContext>,
}

impl Application {
    pub async fn build(config: AppConfig, handlers: HandlerRegistry) -> Result<Self> {
        let repositories = build_repositories(&config).await?;
        let transport = build_transport(&config).await?;

        let context = ClusterContext::builder(config.cluster.id.clone())
            .repositories(repositories)
            .transport(transport)
            .handlers(Arc::new(handlers))
            .default_configuration(config.cluster.default_configuration())
            .clock_skew(config.lock.clock_skew())
            .build()
            .context("构建集群上下文失败")?;

        let clusters = ClusterRegistry::new();
        let context = clusters.register(context).await?;
        info!(
            "集群 {} 已就绪 (存储 {:?}, 传输 {:?}, {} 个处理器)",
            context.cluster_id(),
            config.storage.backend,
            config.transport.backend,
            context.handlers().len()
        );

        Ok(Self {
            config,
            clusters,
            context,
        })
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    pub fn clusters(&self) -> &ClusterRegistry {
        &self.clusters
    }

    pub async fn start_node(&self) -> Result<WorkerNode> {
        let node = WorkerNode::start(self.context.clone(), self.config.clone())
            .await
            .context("启动Worker节点失败")?;
        Ok(node)
    }

    /// 启动节点并运行到收到停止请求
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = StopKind>,
    {
        let node = self.start_node().await?;
        info!("Worker {} 开始运行", node.worker_id());
        node.run_until_stopped(shutdown).await?;
        Ok(())
    }

    /// 通过停止锁请求某个 Worker 停止；锁已被持有时返回 false
    pub async fn request_stop(&self, worker_id: &str, kind: StopKind, lease: Duration) -> Result<bool> {
        let token = request_stop(self.context.locks(), worker_id, kind, lease).await?;
        Ok(token.is_some())
    }
}

async fn build_repositories(config: &AppConfig) -> Result<ClusterRepositories> {
    let storage = &config.storage;
    match storage.backend {
        StorageBackend::Memory => {
            info!("使用内存主存储");
            Ok(ClusterRepositories::from_store(Arc::new(InMemoryMasterStore::new())))
        }
        StorageBackend::Postgres => {
            let url = storage
                .url
                .as_deref()
                .context("postgres后端需要数据库URL")?;
            let pool = connect_postgres(url, storage.max_connections, storage.connection_timeout())
                .await
                .context("连接PostgreSQL失败")?;
            ensure_schema(&pool).await.context("初始化数据库表结构失败")?;
            Ok(ClusterRepositories {
                jobs: Arc::new(PostgresJobRepository::new(pool.clone())),
                schedules: Arc::new(PostgresScheduleRepository::new(pool.clone())),
                buckets: Arc::new(PostgresBucketRepository::new(pool.clone())),
                workers: Arc::new(PostgresWorkerRepository::new(pool.clone())),
                locks: Arc::new(PostgresLockRepository::new(pool.clone())),
                cluster_config: Arc::new(PostgresClusterConfigRepository::new(pool)),
            })
        }
    }
}

async fn build_transport(config: &AppConfig) -> Result<Arc<dyn AgentTransport>> {
    let agent = config.cluster.agent_connection_id.clone();
    match config.transport.backend {
        TransportBackend::Memory => {
            info!("使用内存传输 (agent {})", agent);
            Ok(Arc::new(InMemoryTransport::new(agent)))
        }
        TransportBackend::Redis => {
            let url = config.transport.url.as_deref().context("redis传输需要URL")?;
            let mut redis = RedisStreamConfig::new(url, agent);
            redis.publish_timeout_ms = config.transport.publish_timeout_ms;
            let transport = RedisStreamTransport::connect(redis)
                .await
                .context("连接Redis传输失败")?;
            Ok(Arc::new(transport))
        }
    }
}
