//! 调度器核心服务：配置、日志、集群上下文与分布式锁

pub mod backoff;
pub mod cluster;
pub mod cluster_config;
pub mod config;
pub mod duration;
pub mod handler_registry;
pub mod lock_service;
pub mod logging;

pub use backoff::{ConsecutiveFailures, ExponentialBackoff};
pub use cluster::{ClusterContext, ClusterContextBuilder, ClusterRegistry, ClusterRepositories};
pub use cluster_config::{ClusterConfigCache, CLUSTER_CONFIG_KEY};
pub use config::*;
pub use duration::to_chrono;
pub use handler_registry::{HandlerRegistry, RegisteredHandler};
pub use lock_service::{DistributedLockService, DEFAULT_CLOCK_SKEW, MAX_LOCK_LEASE};
pub use logging::init_logging;

pub use scheduler_domain::{SchedulerError, SchedulerResult};
