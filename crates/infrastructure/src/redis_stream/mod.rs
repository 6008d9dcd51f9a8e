//! 基于 Redis Stream 的 Agent 传输

pub mod config;
pub mod transport;

pub use config::RedisStreamConfig;
pub use transport::RedisStreamTransport;
