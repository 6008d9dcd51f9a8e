use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use scheduler_domain::{ClusterConfigRepository, ClusterConfiguration, SchedulerResult};

/// 集群配置的变更哨兵键
pub const CLUSTER_CONFIG_KEY: &str = "cluster-configuration";

#[derive(Debug, Clone)]
struct CachedConfiguration {
    configuration: ClusterConfiguration,
    cached_at: DateTime<Utc>,
}

/// 读多写少的集群配置缓存
///
/// 只有哨兵时间晚于缓存时间时才重新读取主存储。
pub struct ClusterConfigCache {
    cluster_id: String,
    repository: Arc<dyn ClusterConfigRepository>,
    defaults: ClusterConfiguration,
    cached: RwLock<Option<CachedConfiguration>>,
}

impl ClusterConfigCache {
    pub fn new(
        repository: Arc<dyn ClusterConfigRepository>,
        defaults: ClusterConfiguration,
    ) -> Self {
        Self {
            cluster_id: defaults.cluster_id.clone(),
            repository,
            defaults,
            cached: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> SchedulerResult<ClusterConfiguration> {
        if let Some(cached) = self.cached.read().await.as_ref() {
            if !self.has_changes_after(CLUSTER_CONFIG_KEY, cached.cached_at).await? {
                return Ok(cached.configuration.clone());
            }
        }

        // 读取之前记下时间，读取期间发生的变更会在下一次被发现
        let read_started = Utc::now();
        let configuration = self
            .repository
            .get(&self.cluster_id)
            .await?
            .unwrap_or_else(|| self.defaults.clone());

        debug!("刷新集群配置缓存: {}", self.cluster_id);
        *self.cached.write().await = Some(CachedConfiguration {
            configuration: configuration.clone(),
            cached_at: read_started,
        });
        Ok(configuration)
    }

    pub async fn save(&self, configuration: &ClusterConfiguration) -> SchedulerResult<()> {
        self.repository.save(configuration).await?;
        self.notify_changes(CLUSTER_CONFIG_KEY).await
    }

    pub async fn notify_changes(&self, key: &str) -> SchedulerResult<()> {
        self.repository
            .notify_changes(&self.cluster_id, key, Utc::now())
            .await
    }

    pub async fn has_changes_after(&self, key: &str, since: DateTime<Utc>) -> SchedulerResult<bool> {
        Ok(self
            .repository
            .last_change(&self.cluster_id, key)
            .await?
            .is_some_and(|changed| changed > since))
    }
}
