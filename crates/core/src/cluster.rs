//! 集群上下文与注册表
//!
//! 每个集群拥有独立的一组仓储、传输与锁服务，组件之间通过
//! [`ClusterContext`] 显式传递，不使用任何全局可变状态。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use scheduler_domain::{
    validate_id, AgentTransport, BucketRepository, ClusterConfigRepository, ClusterConfiguration,
    LockRepository, MasterJobsRepository, MasterRecurringSchedulesRepository, SchedulerError,
    SchedulerResult, WorkerRepository,
};

use crate::cluster_config::ClusterConfigCache;
use crate::handler_registry::HandlerRegistry;
use crate::lock_service::DistributedLockService;

/// 一个后端提供的全部仓储
#[derive(Clone)]
pub struct ClusterRepositories {
    pub jobs: Arc<dyn MasterJobsRepository>,
    pub schedules: Arc<dyn MasterRecurringSchedulesRepository>,
    pub buckets: Arc<dyn BucketRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub locks: Arc<dyn LockRepository>,
    pub cluster_config: Arc<dyn ClusterConfigRepository>,
}

impl ClusterRepositories {
    /// 同一个对象实现了全部仓储接口时使用
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: MasterJobsRepository
            + MasterRecurringSchedulesRepository
            + BucketRepository
            + WorkerRepository
            + LockRepository
            + ClusterConfigRepository
            + 'static,
    {
        Self {
            jobs: store.clone(),
            schedules: store.clone(),
            buckets: store.clone(),
            workers: store.clone(),
            locks: store.clone(),
            cluster_config: store,
        }
    }
}

/// 单个集群的运行上下文
pub struct ClusterContext {
    cluster_id: String,
    repositories: ClusterRepositories,
    transport: Arc<dyn AgentTransport>,
    handlers: Arc<HandlerRegistry>,
    locks: DistributedLockService,
    config_cache: ClusterConfigCache,
}

impl ClusterContext {
    pub fn builder(cluster_id: impl Into<String>) -> ClusterContextBuilder {
        ClusterContextBuilder::new(cluster_id)
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn repositories(&self) -> &ClusterRepositories {
        &self.repositories
    }

    pub fn jobs(&self) -> &Arc<dyn MasterJobsRepository> {
        &self.repositories.jobs
    }

    pub fn schedules(&self) -> &Arc<dyn MasterRecurringSchedulesRepository> {
        &self.repositories.schedules
    }

    pub fn buckets(&self) -> &Arc<dyn BucketRepository> {
        &self.repositories.buckets
    }

    pub fn workers(&self) -> &Arc<dyn WorkerRepository> {
        &self.repositories.workers
    }

    pub fn transport(&self) -> &Arc<dyn AgentTransport> {
        &self.transport
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn locks(&self) -> &DistributedLockService {
        &self.locks
    }

    pub fn config_cache(&self) -> &ClusterConfigCache {
        &self.config_cache
    }

    pub async fn configuration(&self) -> SchedulerResult<ClusterConfiguration> {
        self.config_cache.get().await
    }
}

pub struct ClusterContextBuilder {
    cluster_id: String,
    repositories: Option<ClusterRepositories>,
    transport: Option<Arc<dyn AgentTransport>>,
    handlers: Arc<HandlerRegistry>,
    defaults: Option<ClusterConfiguration>,
    clock_skew: Duration,
}

impl ClusterContextBuilder {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            repositories: None,
            transport: None,
            handlers: Arc::new(HandlerRegistry::new()),
            defaults: None,
            clock_skew: crate::lock_service::DEFAULT_CLOCK_SKEW,
        }
    }

    pub fn repositories(mut self, repositories: ClusterRepositories) -> Self {
        self.repositories = Some(repositories);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn AgentTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn default_configuration(mut self, defaults: ClusterConfiguration) -> Self {
        self.defaults = Some(defaults);
        self
    }

    pub fn clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    pub fn build(self) -> SchedulerResult<ClusterContext> {
        validate_id(&self.cluster_id)?;
        let repositories = self
            .repositories
            .ok_or_else(|| SchedulerError::config_error("集群上下文缺少仓储"))?;
        let transport = self
            .transport
            .ok_or_else(|| SchedulerError::config_error("集群上下文缺少传输"))?;

        let mut defaults = self
            .defaults
            .unwrap_or_else(|| ClusterConfiguration::new(self.cluster_id.clone()));
        defaults.cluster_id = self.cluster_id.clone();

        Ok(ClusterContext {
            locks: DistributedLockService::new(
                self.cluster_id.clone(),
                repositories.locks.clone(),
                self.clock_skew,
            ),
            config_cache: ClusterConfigCache::new(repositories.cluster_config.clone(), defaults),
            cluster_id: self.cluster_id,
            repositories,
            transport,
            handlers: self.handlers,
        })
    }
}

/// 进程内所有集群上下文
#[derive(Default)]
pub struct ClusterRegistry {
    contexts: RwLock<HashMap<String, Arc<ClusterContext>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, context: ClusterContext) -> SchedulerResult<Arc<ClusterContext>> {
        let mut contexts = self.contexts.write().await;
        if contexts.contains_key(context.cluster_id()) {
            return Err(SchedulerError::already_exists(format!(
                "集群 {}",
                context.cluster_id()
            )));
        }
        let context = Arc::new(context);
        contexts.insert(context.cluster_id().to_string(), context.clone());
        info!("注册集群上下文: {}", context.cluster_id());
        Ok(context)
    }

    pub async fn get(&self, cluster_id: &str) -> SchedulerResult<Arc<ClusterContext>> {
        self.contexts
            .read()
            .await
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| SchedulerError::not_found("Cluster", cluster_id))
    }

    pub async fn remove(&self, cluster_id: &str) -> Option<Arc<ClusterContext>> {
        self.contexts.write().await.remove(cluster_id)
    }

    pub async fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.contexts.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
