use sqlx::PgPool;
use tracing::info;

use scheduler_domain::SchedulerResult;

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_jobs (
        cluster_id VARCHAR(255) NOT NULL,
        id UUID NOT NULL,
        status VARCHAR(32) NOT NULL,
        scheduled_at TIMESTAMPTZ NOT NULL,
        original_scheduled_at TIMESTAMPTZ NOT NULL,
        process_deadline TIMESTAMPTZ NULL,
        cancellation_requested BOOLEAN NOT NULL DEFAULT FALSE,
        recurring_schedule_id UUID NULL,
        finished_at TIMESTAMPTZ NULL,
        partition_lock_id BIGINT NULL,
        partition_lock_expires_at TIMESTAMPTZ NULL,
        version BIGINT NOT NULL DEFAULT 0,
        body JSONB NOT NULL,
        PRIMARY KEY (cluster_id, id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_status ON scheduler_jobs (cluster_id, status, scheduled_at)",
    "CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_claim ON scheduler_jobs (cluster_id, partition_lock_id)",
    "CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_recurring ON scheduler_jobs (cluster_id, recurring_schedule_id, original_scheduled_at)",
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_recurring_schedules (
        cluster_id VARCHAR(255) NOT NULL,
        id UUID NOT NULL,
        status VARCHAR(32) NOT NULL,
        last_plan_coverage_until TIMESTAMPTZ NULL,
        is_job_cancellation_pending BOOLEAN NOT NULL DEFAULT FALSE,
        profile_id VARCHAR(255) NULL,
        static_definition_id VARCHAR(255) NULL,
        static_last_ensured TIMESTAMPTZ NULL,
        created_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ NULL,
        partition_lock_id BIGINT NULL,
        partition_lock_expires_at TIMESTAMPTZ NULL,
        version BIGINT NOT NULL DEFAULT 0,
        body JSONB NOT NULL,
        PRIMARY KEY (cluster_id, id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_scheduler_schedules_status ON scheduler_recurring_schedules (cluster_id, status, last_plan_coverage_until)",
    "CREATE INDEX IF NOT EXISTS idx_scheduler_schedules_claim ON scheduler_recurring_schedules (cluster_id, partition_lock_id)",
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_scheduler_schedules_static
        ON scheduler_recurring_schedules (cluster_id, profile_id, static_definition_id)
        WHERE static_definition_id IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_buckets (
        cluster_id VARCHAR(255) NOT NULL,
        id VARCHAR(255) NOT NULL,
        agent_connection_id VARCHAR(255) NOT NULL,
        worker_id VARCHAR(255) NOT NULL,
        priority VARCHAR(16) NOT NULL,
        lane VARCHAR(255) NULL,
        status VARCHAR(32) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (cluster_id, id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_scheduler_buckets_worker ON scheduler_buckets (cluster_id, worker_id)",
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_workers (
        cluster_id VARCHAR(255) NOT NULL,
        id VARCHAR(255) NOT NULL,
        agent_connection_id VARCHAR(255) NOT NULL,
        lane VARCHAR(255) NULL,
        mode VARCHAR(16) NOT NULL,
        last_heartbeat TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (cluster_id, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_locks (
        cluster_id VARCHAR(255) NOT NULL,
        key VARCHAR(255) NOT NULL,
        token VARCHAR(64) NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (cluster_id, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_cluster_configurations (
        cluster_id VARCHAR(255) PRIMARY KEY,
        body JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_change_sentinels (
        cluster_id VARCHAR(255) NOT NULL,
        key VARCHAR(255) NOT NULL,
        changed_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (cluster_id, key)
    )
    "#,
];

/// 创建主存储所需的表与索引（幂等）
pub async fn ensure_schema(pool: &PgPool) -> SchedulerResult<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("主存储表结构已就绪");
    Ok(())
}
