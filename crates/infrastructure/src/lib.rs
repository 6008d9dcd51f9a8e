//! 调度器基础设施层
//!
//! - `memory`：嵌入式内存主存储与传输，用于单进程部署与测试
//! - `database`：PostgreSQL 主存储
//! - `redis_stream`：Redis Stream Agent 传输

pub mod database;
pub mod memory;
pub mod redis_stream;

pub use database::postgres::{
    connect as connect_postgres, ensure_schema, PostgresBucketRepository,
    PostgresClusterConfigRepository, PostgresJobRepository, PostgresLockRepository,
    PostgresScheduleRepository, PostgresWorkerRepository,
};
pub use memory::{InMemoryMasterStore, InMemoryTransport};
pub use redis_stream::{RedisStreamConfig, RedisStreamTransport};
