use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use scheduler_domain::{
    MasterRecurringSchedulesRepository, RecurringSchedule, ScheduleScanKind, SchedulerError,
    SchedulerResult,
};

use super::{claim_from_row, map_insert_error};

const SCHEDULE_COLUMNS: &str = "version, partition_lock_id, partition_lock_expires_at, body";

/// PostgreSQL 周期计划仓储
pub struct PostgresScheduleRepository {
    pool: PgPool,
}

impl PostgresScheduleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_schedule(row: &PgRow) -> SchedulerResult<RecurringSchedule> {
        let body: serde_json::Value = row.try_get("body")?;
        let mut schedule: RecurringSchedule = serde_json::from_value(body)?;
        schedule.version = row.try_get("version")?;
        schedule.partition_claim = claim_from_row(row)?;
        Ok(schedule)
    }

    fn push_scan_predicate(
        qb: &mut QueryBuilder<'_, Postgres>,
        kind: ScheduleScanKind,
        now: DateTime<Utc>,
    ) {
        match kind {
            ScheduleScanKind::PlanningDue { horizon } => {
                qb.push(" AND status = 'ACTIVE' AND (last_plan_coverage_until IS NULL OR last_plan_coverage_until < ");
                qb.push_bind(horizon);
                qb.push(")");
            }
            ScheduleScanKind::JobCancellationPending => {
                qb.push(" AND is_job_cancellation_pending");
            }
            ScheduleScanKind::StaticOrphaned { ensured_before } => {
                qb.push(
                    " AND static_definition_id IS NOT NULL AND status NOT IN ('INACTIVE', 'CANCELED', 'COMPLETED')",
                );
                qb.push(" AND (static_last_ensured IS NULL OR static_last_ensured < ");
                qb.push_bind(ensured_before);
                qb.push(")");
            }
        }
        qb.push(" AND (partition_lock_id IS NULL OR partition_lock_expires_at <= ");
        qb.push_bind(now);
        qb.push(")");
    }
}

#[async_trait]
impl MasterRecurringSchedulesRepository for PostgresScheduleRepository {
    async fn insert(&self, schedule: &RecurringSchedule) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_recurring_schedules (cluster_id, id, status, last_plan_coverage_until,
                is_job_cancellation_pending, profile_id, static_definition_id, static_last_ensured,
                created_at, finished_at, version, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&schedule.cluster_id)
        .bind(schedule.id)
        .bind(schedule.status)
        .bind(schedule.last_plan_coverage_until)
        .bind(schedule.is_job_cancellation_pending)
        .bind(&schedule.profile_id)
        .bind(&schedule.static_definition_id)
        .bind(schedule.static_last_ensured)
        .bind(schedule.created_at)
        .bind(schedule.finished_at)
        .bind(schedule.version)
        .bind(serde_json::to_value(schedule)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, format!("RecurringSchedule {}", schedule.id)))?;

        debug!("周期计划已写入主存储: {}", schedule.id);
        Ok(())
    }

    async fn get(&self, cluster_id: &str, id: Uuid) -> SchedulerResult<Option<RecurringSchedule>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduler_recurring_schedules WHERE cluster_id = $1 AND id = $2"
        ))
        .bind(cluster_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_schedule).transpose()
    }

    async fn update(&self, schedule: &mut RecurringSchedule) -> SchedulerResult<bool> {
        let mut next = schedule.clone();
        next.version += 1;
        next.partition_claim = None;

        let result = sqlx::query(
            r#"
            UPDATE scheduler_recurring_schedules
            SET status = $3, last_plan_coverage_until = $4, is_job_cancellation_pending = $5,
                static_last_ensured = $6, finished_at = $7, version = version + 1, body = $8
            WHERE cluster_id = $1 AND id = $2 AND version = $9
            "#,
        )
        .bind(&schedule.cluster_id)
        .bind(schedule.id)
        .bind(next.status)
        .bind(next.last_plan_coverage_until)
        .bind(next.is_job_cancellation_pending)
        .bind(next.static_last_ensured)
        .bind(next.finished_at)
        .bind(serde_json::to_value(&next)?)
        .bind(schedule.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            schedule.version = next.version;
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM scheduler_recurring_schedules WHERE cluster_id = $1 AND id = $2)",
        )
        .bind(&schedule.cluster_id)
        .bind(schedule.id)
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            return Err(SchedulerError::not_found(
                "RecurringSchedule",
                schedule.id.to_string(),
            ));
        }
        Ok(false)
    }

    async fn count_claimable(
        &self,
        cluster_id: &str,
        kind: ScheduleScanKind,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut qb = QueryBuilder::new(
            "SELECT COUNT(*) FROM scheduler_recurring_schedules WHERE cluster_id = ",
        );
        qb.push_bind(cluster_id);
        Self::push_scan_predicate(&mut qb, kind, now);

        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn claim(
        &self,
        cluster_id: &str,
        kind: ScheduleScanKind,
        lock_id: i64,
        expires_at: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let mut qb = QueryBuilder::new("UPDATE scheduler_recurring_schedules SET partition_lock_id = ");
        qb.push_bind(lock_id);
        qb.push(", partition_lock_expires_at = ");
        qb.push_bind(expires_at);
        qb.push(
            " WHERE (cluster_id, id) IN (SELECT cluster_id, id FROM scheduler_recurring_schedules WHERE cluster_id = ",
        );
        qb.push_bind(cluster_id);
        Self::push_scan_predicate(&mut qb, kind, now);
        qb.push(" ORDER BY COALESCE(last_plan_coverage_until, created_at) LIMIT ");
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
    ) -> SchedulerResult<Vec<RecurringSchedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduler_recurring_schedules
             WHERE cluster_id = $1 AND partition_lock_id = $2 AND partition_lock_expires_at > $3"
        ))
        .bind(cluster_id)
        .bind(lock_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_schedule).collect()
    }

    async fn release_claim(&self, cluster_id: &str, lock_id: i64) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE scheduler_recurring_schedules SET partition_lock_id = NULL, partition_lock_expires_at = NULL
             WHERE cluster_id = $1 AND partition_lock_id = $2",
        )
        .bind(cluster_id)
        .bind(lock_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_static(
        &self,
        cluster_id: &str,
        profile_id: &str,
        definition_id: &str,
    ) -> SchedulerResult<Option<RecurringSchedule>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduler_recurring_schedules
             WHERE cluster_id = $1 AND profile_id = $2 AND static_definition_id = $3"
        ))
        .bind(cluster_id)
        .bind(profile_id)
        .bind(definition_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_schedule).transpose()
    }

    async fn list_assigned_to_bucket(
        &self,
        cluster_id: &str,
        bucket_id: &str,
    ) -> SchedulerResult<Vec<RecurringSchedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduler_recurring_schedules
             WHERE cluster_id = $1 AND status NOT IN ('INACTIVE', 'CANCELED', 'COMPLETED')
               AND body->'assignment'->>'bucket_id' = $2"
        ))
        .bind(cluster_id)
        .bind(bucket_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_schedule).collect()
    }

    async fn purge_finished(
        &self,
        cluster_id: &str,
        older_than: DateTime<Utc>,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_recurring_schedules
             WHERE cluster_id = $1 AND status IN ('INACTIVE', 'CANCELED', 'COMPLETED')
               AND NOT is_job_cancellation_pending AND finished_at < $2",
        )
        .bind(cluster_id)
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
