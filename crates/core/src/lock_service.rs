//! 基于租约的集群级分布式锁
//!
//! 获取锁从不阻塞：锁被占用时返回 `Ok(None)`，调用方按正常结果处理并稍后重试。
//! 释放失败只记录日志，租约到期后锁会自然失效。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use scheduler_domain::{LockRepository, LockToken, SchedulerError, SchedulerResult};

/// 单次租约上限
pub const MAX_LOCK_LEASE: Duration = Duration::from_secs(49 * 3600);

/// 默认时钟偏差补偿
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(2);

pub struct DistributedLockService {
    cluster_id: String,
    repository: Arc<dyn LockRepository>,
    clock_skew: Duration,
}

impl DistributedLockService {
    pub fn new(
        cluster_id: impl Into<String>,
        repository: Arc<dyn LockRepository>,
        clock_skew: Duration,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            repository,
            clock_skew,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// 尝试获取锁，成功时返回持有凭据
    pub async fn try_lock(&self, key: &str, lease: Duration) -> SchedulerResult<Option<LockToken>> {
        if lease > MAX_LOCK_LEASE {
            return Err(SchedulerError::LeaseTooLong {
                requested_secs: lease.as_secs() as i64,
                max_secs: MAX_LOCK_LEASE.as_secs() as i64,
            });
        }

        let padded = chrono::Duration::from_std(lease + self.clock_skew)
            .map_err(|e| SchedulerError::Internal(format!("租约时长转换失败: {e}")))?;
        let now = Utc::now();
        let expires_at = now + padded;
        let token = Uuid::new_v4().simple().to_string();

        let acquired = self
            .repository
            .try_acquire(&self.cluster_id, key, &token, expires_at, now)
            .await?;

        if acquired {
            debug!("获取分布式锁成功: {} (到期 {})", key, expires_at);
            Ok(Some(LockToken {
                key: key.to_string(),
                token,
                expires_at,
            }))
        } else {
            debug!("分布式锁已被占用: {}", key);
            metrics::counter!("scheduler_lock_contention_total").increment(1);
            Ok(None)
        }
    }

    /// 释放锁；token 不匹配或存储出错时返回 `false`
    pub async fn release_lock(&self, token: &LockToken) -> bool {
        match self
            .repository
            .release(&self.cluster_id, &token.key, &token.token)
            .await
        {
            Ok(released) => {
                if !released {
                    debug!("释放锁时凭据不匹配或锁已过期: {}", token.key);
                }
                released
            }
            Err(e) => {
                warn!("释放分布式锁失败 {}: {}", token.key, e);
                false
            }
        }
    }

    /// 忽略持有者强制释放
    pub async fn force_release_lock(&self, key: &str) -> SchedulerResult<bool> {
        let released = self.repository.force_release(&self.cluster_id, key).await?;
        if released {
            warn!("强制释放分布式锁: {}", key);
        }
        Ok(released)
    }

    /// 非权威读取，只能用于快速路径判断
    pub async fn is_locked(&self, key: &str) -> bool {
        match self.repository.get(&self.cluster_id, key).await {
            Ok(Some(record)) => !record.is_expired(Utc::now()),
            Ok(None) => false,
            Err(e) => {
                debug!("读取锁状态失败 {}: {}", key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_infrastructure::memory::InMemoryMasterStore;

    fn service() -> DistributedLockService {
        let store = Arc::new(InMemoryMasterStore::new());
        DistributedLockService::new("c1", store, Duration::from_millis(0))
    }

    #[tokio::test]
    async fn test_second_caller_does_not_acquire() {
        let locks = service();
        let first = locks.try_lock("scan:1", Duration::from_secs(30)).await.unwrap();
        assert!(first.is_some());
        let second = locks.try_lock("scan:1", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_none());
        assert!(locks.is_locked("scan:1").await);
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let locks = service();
        let token = locks
            .try_lock("scan:2", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let forged = LockToken {
            token: "forged".to_string(),
            ..token.clone()
        };
        assert!(!locks.release_lock(&forged).await);
        assert!(locks.release_lock(&token).await);
        assert!(!locks.is_locked("scan:2").await);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let locks = service();
        let first = locks.try_lock("scan:3", Duration::from_millis(20)).await.unwrap();
        assert!(first.is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = locks.try_lock("scan:3", Duration::from_secs(5)).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn test_lease_ceiling() {
        let locks = service();
        let err = locks
            .try_lock("scan:4", MAX_LOCK_LEASE + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::LeaseTooLong { .. }));
    }

    #[tokio::test]
    async fn test_force_release() {
        let locks = service();
        locks.try_lock("worker-stop:immediate:w1", Duration::from_secs(60)).await.unwrap();
        assert!(locks.force_release_lock("worker-stop:immediate:w1").await.unwrap());
        assert!(!locks.is_locked("worker-stop:immediate:w1").await);
    }
}
