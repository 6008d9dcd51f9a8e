//! PostgreSQL 主存储

pub mod postgres_bucket_repository;
pub mod postgres_job_repository;
pub mod postgres_lock_repository;
pub mod postgres_schedule_repository;
pub mod schema;

use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use tracing::info;

use scheduler_domain::{PartitionClaim, SchedulerError, SchedulerResult};

pub use postgres_bucket_repository::{PostgresBucketRepository, PostgresWorkerRepository};
pub use postgres_job_repository::PostgresJobRepository;
pub use postgres_lock_repository::{PostgresClusterConfigRepository, PostgresLockRepository};
pub use postgres_schedule_repository::PostgresScheduleRepository;
pub use schema::ensure_schema;

/// 建立连接池
pub async fn connect(url: &str, max_connections: u32, timeout: Duration) -> SchedulerResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(timeout)
        .connect(url)
        .await?;
    info!("已连接PostgreSQL主存储 (最大连接数 {})", max_connections);
    Ok(pool)
}

pub(crate) fn claim_from_row(row: &PgRow) -> SchedulerResult<Option<PartitionClaim>> {
    let lock_id: Option<i64> = row.try_get("partition_lock_id")?;
    let expires_at = row.try_get("partition_lock_expires_at")?;
    Ok(match (lock_id, expires_at) {
        (Some(lock_id), Some(expires_at)) => Some(PartitionClaim {
            lock_id,
            expires_at,
        }),
        _ => None,
    })
}

/// 唯一约束冲突映射为 `AlreadyExists`
pub(crate) fn map_insert_error(error: sqlx::Error, what: String) -> SchedulerError {
    match error.as_database_error() {
        Some(db) if db.is_unique_violation() => SchedulerError::already_exists(what),
        _ => SchedulerError::Database(error),
    }
}
