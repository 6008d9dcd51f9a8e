use scheduler_core::config::*;
use scheduler_domain::{ClusterMode, JobPriority, WorkerMode};
use std::env;
use std::fs;
use tempfile::NamedTempFile;

#[test]
fn test_default_config() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());

    // 验证默认值
    assert_eq!(config.cluster.id, "default");
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.transport.backend, TransportBackend::Memory);
    assert_eq!(config.worker.onboarding_window_ms, 5_000);
    assert_eq!(config.lock.clock_skew_ms, 2_000);
}

#[test]
fn test_config_from_toml() {
    let toml_content = r#"
[cluster]
id = "payments"
agent_connection_id = "agent-eu-1"
mode = "PASSIVE"
timezone = "Europe/Berlin"

[worker]
id = "worker-7"
lane = "batch"
mode = "DRAIN"
bucket_priorities = ["HIGH", "LOWEST"]
parallelism_factor = 2

[storage]
backend = "postgres"
url = "postgresql://test:5432/scheduler_test"
max_connections = 15

[transport]
backend = "redis"
url = "redis://localhost:6379"
publish_timeout_ms = 750

[observability]
log_level = "debug"
log_format = "json"
"#;

    let config = AppConfig::from_toml(toml_content).unwrap();

    assert_eq!(config.cluster.id, "payments");
    assert_eq!(config.cluster.mode, ClusterMode::Passive);
    assert_eq!(config.worker.mode, WorkerMode::Drain);
    assert_eq!(
        config.worker.bucket_priorities,
        vec![JobPriority::High, JobPriority::Lowest]
    );
    assert_eq!(config.worker.parallelism_factor, 2);
    assert_eq!(config.storage.max_connections, 15);
    assert_eq!(config.transport.publish_timeout_ms, 750);
    // 未出现的段落使用默认值
    assert_eq!(config.scan.batch_size, 100);
    assert_eq!(config.observability.log_format, "json");
}

#[test]
fn test_invalid_configs_rejected() {
    let mut config = AppConfig::default();
    config.cluster.id = "bad id".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.cluster.timezone = "Mars/Olympus".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.storage.backend = StorageBackend::Postgres;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.worker.heartbeat_threshold_ms = config.worker.heartbeat_interval_ms;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.worker.heartbeat_threshold_ms = MAX_LIVENESS_WINDOW_MS + 1;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.worker.dead_worker_grace_ms = u64::MAX;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.worker.dead_worker_grace_ms = MAX_LIVENESS_WINDOW_MS;
    assert!(config.validate().is_ok());

    let mut config = AppConfig::default();
    config.recurring.horizon_seconds = 10;
    config.recurring.max_runner_interval_seconds = 60;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.observability.log_format = "xml".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_load_from_file_and_env() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().with_extension("toml");
    fs::write(
        &path,
        r#"
[cluster]
id = "from-file"

[scan]
batch_size = 250
"#,
    )
    .unwrap();

    env::set_var("SCHEDULER_SCAN__CONTENTION_BACKOFF_MS", "900");
    let config = AppConfig::load(path.to_str()).unwrap();
    env::remove_var("SCHEDULER_SCAN__CONTENTION_BACKOFF_MS");
    fs::remove_file(&path).ok();

    assert_eq!(config.cluster.id, "from-file");
    assert_eq!(config.scan.batch_size, 250);
    assert_eq!(config.scan.contention_backoff_ms, 900);
}

#[test]
fn test_missing_config_file() {
    assert!(AppConfig::load(Some("/nonexistent/scheduler.toml")).is_err());
}

#[test]
fn test_toml_round_trip_keeps_values() {
    let mut config = AppConfig::default();
    config.worker.lane = Some("reports".to_string());
    let text = config.to_toml().unwrap();
    let parsed = AppConfig::from_toml(&text).unwrap();
    assert_eq!(parsed.worker.lane.as_deref(), Some("reports"));
}

#[test]
fn test_sample_config_file_is_valid() {
    let config = AppConfig::from_toml(include_str!("../../../config/scheduler.toml")).unwrap();

    assert_eq!(config.worker.bucket_priorities, JobPriority::ALL.to_vec());
    assert_eq!(config.recurring.static_schedules.len(), 1);
    assert_eq!(config.recurring.static_schedules[0].handler_id, "builtin.log");
    assert!(config.observability.metrics_bind.is_none());
}
