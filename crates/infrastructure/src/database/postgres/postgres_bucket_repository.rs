use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::debug;

use scheduler_domain::{
    Bucket, BucketRepository, BucketStatus, SchedulerResult, Worker, WorkerRepository,
};

use super::map_insert_error;

const BUCKET_COLUMNS: &str =
    "id, cluster_id, agent_connection_id, worker_id, priority, lane, status, created_at, updated_at";

const WORKER_COLUMNS: &str = "id, cluster_id, agent_connection_id, lane, mode, last_heartbeat, created_at";

/// PostgreSQL Bucket仓储实现
pub struct PostgresBucketRepository {
    pool: PgPool,
}

impl PostgresBucketRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_bucket(row: &PgRow) -> SchedulerResult<Bucket> {
        Ok(Bucket {
            id: row.try_get("id")?,
            cluster_id: row.try_get("cluster_id")?,
            agent_connection_id: row.try_get("agent_connection_id")?,
            worker_id: row.try_get("worker_id")?,
            priority: row.try_get("priority")?,
            lane: row.try_get("lane")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn list_where(&self, clause: &str, cluster_id: &str, arg: Option<&str>) -> SchedulerResult<Vec<Bucket>> {
        let sql = format!(
            "SELECT {BUCKET_COLUMNS} FROM scheduler_buckets WHERE cluster_id = $1 {clause} ORDER BY created_at, id"
        );
        let mut query = sqlx::query(&sql).bind(cluster_id);
        if let Some(arg) = arg {
            query = query.bind(arg);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_bucket).collect()
    }
}

#[async_trait]
impl BucketRepository for PostgresBucketRepository {
    async fn insert(&self, bucket: &Bucket) -> SchedulerResult<()> {
        sqlx::query(&format!(
            "INSERT INTO scheduler_buckets ({BUCKET_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(&bucket.id)
        .bind(&bucket.cluster_id)
        .bind(&bucket.agent_connection_id)
        .bind(&bucket.worker_id)
        .bind(bucket.priority)
        .bind(&bucket.lane)
        .bind(bucket.status)
        .bind(bucket.created_at)
        .bind(bucket.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, format!("Bucket {}", bucket.id)))?;

        debug!("创建Bucket: {} (worker {})", bucket.id, bucket.worker_id);
        Ok(())
    }

    async fn get(&self, cluster_id: &str, bucket_id: &str) -> SchedulerResult<Option<Bucket>> {
        let row = sqlx::query(&format!(
            "SELECT {BUCKET_COLUMNS} FROM scheduler_buckets WHERE cluster_id = $1 AND id = $2"
        ))
        .bind(cluster_id)
        .bind(bucket_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_bucket).transpose()
    }

    async fn update_if(
        &self,
        bucket: &Bucket,
        expected_status: BucketStatus,
        expected_worker: &str,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_buckets
            SET agent_connection_id = $3, worker_id = $4, priority = $5, lane = $6, status = $7, updated_at = $8
            WHERE cluster_id = $1 AND id = $2 AND status = $9 AND worker_id = $10
            "#,
        )
        .bind(&bucket.cluster_id)
        .bind(&bucket.id)
        .bind(&bucket.agent_connection_id)
        .bind(&bucket.worker_id)
        .bind(bucket.priority)
        .bind(&bucket.lane)
        .bind(bucket.status)
        .bind(bucket.updated_at)
        .bind(expected_status)
        .bind(expected_worker)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, cluster_id: &str, bucket_id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM scheduler_buckets WHERE cluster_id = $1 AND id = $2")
            .bind(cluster_id)
            .bind(bucket_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, cluster_id: &str) -> SchedulerResult<Vec<Bucket>> {
        self.list_where("", cluster_id, None).await
    }

    async fn list_by_worker(&self, cluster_id: &str, worker_id: &str) -> SchedulerResult<Vec<Bucket>> {
        self.list_where("AND worker_id = $2", cluster_id, Some(worker_id))
            .await
    }

    async fn list_by_status(
        &self,
        cluster_id: &str,
        status: BucketStatus,
    ) -> SchedulerResult<Vec<Bucket>> {
        self.list_where("AND status = $2", cluster_id, Some(status.as_str()))
            .await
    }
}

/// PostgreSQL Worker仓储实现
pub struct PostgresWorkerRepository {
    pool: PgPool,
}

impl PostgresWorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_worker(row: &PgRow) -> SchedulerResult<Worker> {
        Ok(Worker {
            id: row.try_get("id")?,
            cluster_id: row.try_get("cluster_id")?,
            agent_connection_id: row.try_get("agent_connection_id")?,
            lane: row.try_get("lane")?,
            mode: row.try_get("mode")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl WorkerRepository for PostgresWorkerRepository {
    async fn register(&self, worker: &Worker) -> SchedulerResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO scheduler_workers ({WORKER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (cluster_id, id) DO UPDATE SET
                agent_connection_id = EXCLUDED.agent_connection_id,
                lane = EXCLUDED.lane,
                mode = EXCLUDED.mode,
                last_heartbeat = EXCLUDED.last_heartbeat
            "#
        ))
        .bind(&worker.id)
        .bind(&worker.cluster_id)
        .bind(&worker.agent_connection_id)
        .bind(&worker.lane)
        .bind(worker.mode)
        .bind(worker.last_heartbeat)
        .bind(worker.created_at)
        .execute(&self.pool)
        .await?;

        debug!("注册Worker成功: {}", worker.id);
        Ok(())
    }

    async fn heartbeat(
        &self,
        cluster_id: &str,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduler_workers SET last_heartbeat = GREATEST(last_heartbeat, $3)
             WHERE cluster_id = $1 AND id = $2",
        )
        .bind(cluster_id)
        .bind(worker_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, cluster_id: &str, worker_id: &str) -> SchedulerResult<Option<Worker>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM scheduler_workers WHERE cluster_id = $1 AND id = $2"
        ))
        .bind(cluster_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn list(&self, cluster_id: &str) -> SchedulerResult<Vec<Worker>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM scheduler_workers WHERE cluster_id = $1 ORDER BY id"
        ))
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn unregister(&self, cluster_id: &str, worker_id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM scheduler_workers WHERE cluster_id = $1 AND id = $2")
            .bind(cluster_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            debug!("注销Worker成功: {}", worker_id);
        }
        Ok(result.rows_affected() == 1)
    }
}
