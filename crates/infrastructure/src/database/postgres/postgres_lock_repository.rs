use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use scheduler_domain::{
    ClusterConfigRepository, ClusterConfiguration, LockRecord, LockRepository, SchedulerResult,
};

/// PostgreSQL 分布式锁表
pub struct PostgresLockRepository {
    pool: PgPool,
}

impl PostgresLockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockRepository for PostgresLockRepository {
    async fn try_acquire(
        &self,
        cluster_id: &str,
        key: &str,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        // 行不存在时插入；已存在时只覆盖已过期的租约
        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_locks (cluster_id, key, token, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (cluster_id, key) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE scheduler_locks.expires_at <= $5
            "#,
        )
        .bind(cluster_id)
        .bind(key)
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, cluster_id: &str, key: &str, token: &str) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM scheduler_locks WHERE cluster_id = $1 AND key = $2 AND token = $3",
        )
        .bind(cluster_id)
        .bind(key)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn force_release(&self, cluster_id: &str, key: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM scheduler_locks WHERE cluster_id = $1 AND key = $2")
            .bind(cluster_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, cluster_id: &str, key: &str) -> SchedulerResult<Option<LockRecord>> {
        let row = sqlx::query(
            "SELECT cluster_id, key, token, expires_at FROM scheduler_locks WHERE cluster_id = $1 AND key = $2",
        )
        .bind(cluster_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(LockRecord {
                cluster_id: row.try_get("cluster_id")?,
                key: row.try_get("key")?,
                token: row.try_get("token")?,
                expires_at: row.try_get("expires_at")?,
            })),
            None => Ok(None),
        }
    }
}

/// PostgreSQL 集群配置与变更哨兵
pub struct PostgresClusterConfigRepository {
    pool: PgPool,
}

impl PostgresClusterConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClusterConfigRepository for PostgresClusterConfigRepository {
    async fn get(&self, cluster_id: &str) -> SchedulerResult<Option<ClusterConfiguration>> {
        let body: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT body FROM scheduler_cluster_configurations WHERE cluster_id = $1",
        )
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(body.map(serde_json::from_value).transpose()?)
    }

    async fn save(&self, config: &ClusterConfiguration) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_cluster_configurations (cluster_id, body, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (cluster_id) DO UPDATE SET body = EXCLUDED.body, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&config.cluster_id)
        .bind(serde_json::to_value(config)?)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn notify_changes(&self, cluster_id: &str, key: &str, at: DateTime<Utc>) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_change_sentinels (cluster_id, key, changed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (cluster_id, key) DO UPDATE
                SET changed_at = GREATEST(scheduler_change_sentinels.changed_at, EXCLUDED.changed_at)
            "#,
        )
        .bind(cluster_id)
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_change(&self, cluster_id: &str, key: &str) -> SchedulerResult<Option<DateTime<Utc>>> {
        let changed_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT changed_at FROM scheduler_change_sentinels WHERE cluster_id = $1 AND key = $2",
        )
        .bind(cluster_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(changed_at)
    }
}
