pub mod app_config;
pub mod backends;
pub mod cluster_worker;
pub mod scan_recurring;

pub use app_config::AppConfig;
pub use backends::{
    ObservabilityConfig, StorageBackend, StorageConfig, TransportBackend, TransportConfig,
};
pub use cluster_worker::{ClusterConfig, TaskQueueConfig, WorkerConfig, MAX_LIVENESS_WINDOW_MS};
pub use scan_recurring::{LockConfig, RecurringConfig, ScanConfig};
