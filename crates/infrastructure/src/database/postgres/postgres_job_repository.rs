use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use scheduler_domain::{
    Job, JobScanKind, MasterJobsRepository, SchedulerError, SchedulerResult,
};

use super::{claim_from_row, map_insert_error};

const JOB_COLUMNS: &str = "version, partition_lock_id, partition_lock_expires_at, body";

/// PostgreSQL 作业仓储
///
/// 扫描条件所需字段为独立列，完整实体存放在 `body` (JSONB)。
pub struct PostgresJobRepository {
    pool: PgPool,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &PgRow) -> SchedulerResult<Job> {
        let body: serde_json::Value = row.try_get("body")?;
        let mut job: Job = serde_json::from_value(body)?;
        job.version = row.try_get("version")?;
        job.partition_claim = claim_from_row(row)?;
        Ok(job)
    }

    fn push_scan_predicate(qb: &mut QueryBuilder<'_, Postgres>, kind: JobScanKind, now: DateTime<Utc>) {
        match kind {
            JobScanKind::DueOnMaster { horizon } => {
                qb.push(" AND status = 'HELD_ON_MASTER' AND scheduled_at <= ");
                qb.push_bind(horizon);
            }
            JobScanKind::DeadlineExceeded => {
                qb.push(" AND status = 'PROCESSING' AND process_deadline <= ");
                qb.push_bind(now);
            }
            JobScanKind::CancellationRequested => {
                qb.push(
                    " AND cancellation_requested AND status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELLED')",
                );
            }
        }
        qb.push(" AND (partition_lock_id IS NULL OR partition_lock_expires_at <= ");
        qb.push_bind(now);
        qb.push(")");
    }

    async fn insert_with<'e, E>(executor: E, job: &Job) -> SchedulerResult<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO scheduler_jobs (cluster_id, id, status, scheduled_at, original_scheduled_at,
                process_deadline, cancellation_requested, recurring_schedule_id, finished_at, version, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&job.cluster_id)
        .bind(job.id)
        .bind(job.status)
        .bind(job.scheduled_at)
        .bind(job.original_scheduled_at)
        .bind(job.process_deadline)
        .bind(job.cancellation_requested)
        .bind(job.recurring_schedule_id)
        .bind(job.finished_at)
        .bind(job.version)
        .bind(serde_json::to_value(job)?)
        .execute(executor)
        .await
        .map_err(|e| map_insert_error(e, format!("Job {}", job.id)))?;
        Ok(())
    }
}

#[async_trait]
impl MasterJobsRepository for PostgresJobRepository {
    async fn insert(&self, job: &Job) -> SchedulerResult<()> {
        Self::insert_with(&self.pool, job).await?;
        debug!("作业已写入主存储: {}", job.id);
        Ok(())
    }

    async fn insert_batch(&self, jobs: &[Job]) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            Self::insert_with(&mut *tx, job).await?;
        }
        tx.commit().await?;
        debug!("批量写入 {} 个作业", jobs.len());
        Ok(())
    }

    async fn get(&self, cluster_id: &str, id: Uuid) -> SchedulerResult<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs WHERE cluster_id = $1 AND id = $2"
        ))
        .bind(cluster_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update(&self, job: &mut Job) -> SchedulerResult<bool> {
        let mut next = job.clone();
        next.version += 1;
        next.partition_claim = None;

        let result = sqlx::query(
            r#"
            UPDATE scheduler_jobs
            SET status = $3, scheduled_at = $4, process_deadline = $5, cancellation_requested = $6,
                finished_at = $7, version = version + 1, body = $8
            WHERE cluster_id = $1 AND id = $2 AND version = $9
            "#,
        )
        .bind(&job.cluster_id)
        .bind(job.id)
        .bind(next.status)
        .bind(next.scheduled_at)
        .bind(next.process_deadline)
        .bind(next.cancellation_requested)
        .bind(next.finished_at)
        .bind(serde_json::to_value(&next)?)
        .bind(job.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            job.version = next.version;
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM scheduler_jobs WHERE cluster_id = $1 AND id = $2)",
        )
        .bind(&job.cluster_id)
        .bind(job.id)
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            return Err(SchedulerError::not_found("Job", job.id.to_string()));
        }
        debug!("作业 {} 版本冲突", job.id);
        Ok(false)
    }

    async fn count_claimable(
        &self,
        cluster_id: &str,
        kind: JobScanKind,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM scheduler_jobs WHERE cluster_id = ");
        qb.push_bind(cluster_id);
        Self::push_scan_predicate(&mut qb, kind, now);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn claim(
        &self,
        cluster_id: &str,
        kind: JobScanKind,
        lock_id: i64,
        expires_at: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut qb = QueryBuilder::new("UPDATE scheduler_jobs SET partition_lock_id = ");
        qb.push_bind(lock_id);
        qb.push(", partition_lock_expires_at = ");
        qb.push_bind(expires_at);
        qb.push(" WHERE (cluster_id, id) IN (SELECT cluster_id, id FROM scheduler_jobs WHERE cluster_id = ");
        qb.push_bind(cluster_id);
        Self::push_scan_predicate(&mut qb, kind, now);
        qb.push(" ORDER BY scheduled_at LIMIT ");
        qb.push_bind(limit as i64);
        qb.push(" FOR UPDATE SKIP LOCKED)");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn list_claimed(
        &self,
        cluster_id: &str,
        lock_id: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs
             WHERE cluster_id = $1 AND partition_lock_id = $2 AND partition_lock_expires_at > $3
             ORDER BY scheduled_at"
        ))
        .bind(cluster_id)
        .bind(lock_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn release_claim(&self, cluster_id: &str, lock_id: i64) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE scheduler_jobs SET partition_lock_id = NULL, partition_lock_expires_at = NULL
             WHERE cluster_id = $1 AND partition_lock_id = $2",
        )
        .bind(cluster_id)
        .bind(lock_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_by_recurring_schedule(
        &self,
        cluster_id: &str,
        schedule_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs
             WHERE cluster_id = $1 AND recurring_schedule_id = $2
               AND original_scheduled_at >= $3 AND original_scheduled_at <= $4
             ORDER BY original_scheduled_at"
        ))
        .bind(cluster_id)
        .bind(schedule_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn list_pending_by_recurring_schedule(
        &self,
        cluster_id: &str,
        schedule_id: Uuid,
    ) -> SchedulerResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs
             WHERE cluster_id = $1 AND recurring_schedule_id = $2
               AND status IN ('SAVE_PENDING', 'HELD_ON_MASTER', 'ASSIGNED_TO_BUCKET', 'QUEUED')"
        ))
        .bind(cluster_id)
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn list_assigned_to_bucket(
        &self,
        cluster_id: &str,
        bucket_id: &str,
    ) -> SchedulerResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduler_jobs
             WHERE cluster_id = $1 AND status IN ('ASSIGNED_TO_BUCKET', 'QUEUED')
               AND body->'assignment'->>'bucket_id' = $2
             ORDER BY scheduled_at"
        ))
        .bind(cluster_id)
        .bind(bucket_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn purge_finished(
        &self,
        cluster_id: &str,
        older_than: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_jobs
             WHERE cluster_id = $1 AND status IN ('SUCCEEDED', 'FAILED', 'CANCELLED') AND finished_at < $2",
        )
        .bind(cluster_id)
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
