use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use fleet_scheduler::handlers::LOG_HANDLER_ID;
use fleet_scheduler::{builtin_handlers, Application};
use scheduler_core::AppConfig;
use scheduler_dispatcher::{DispatchOutcome, StopKind};
use scheduler_domain::{JobPriority, JobStatus};
use scheduler_testing_utils::TestEnv;

fn config(worker_id: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.cluster.id = "app-test".to_string();
    config.worker.id = Some(worker_id.to_string());
    config.worker.bucket_priorities = vec![JobPriority::Normal];
    config.worker.poll_interval_ms = 20;
    config.worker.stop_poll_interval_ms = 20;
    config.worker.drain_poll_interval_ms = 20;
    config.worker.friendly_stop_grace_ms = 0;
    config.task_queue.tick_interval_ms = 10;
    config.task_queue.shutdown_grace_ms = 200;
    config
}

#[tokio::test]
async fn test_memory_application_runs_builtin_handler() {
    let app = Application::build(config("app-worker"), builtin_handlers().unwrap())
        .await
        .unwrap();
    assert_eq!(app.clusters().cluster_ids().await, vec!["app-test".to_string()]);
    assert_eq!(app.context().handlers().len(), 2);

    let node = app.start_node().await.unwrap();
    let job = node
        .dispatcher()
        .create_job(LOG_HANDLER_ID, json!({"hello": "world"}), Utc::now(), HashMap::new())
        .unwrap();
    let outcome = node.dispatcher().schedule_job(job.clone()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::ShortCircuited { .. }));

    let jobs = app.context().jobs().clone();
    assert!(
        TestEnv::wait_for(
            || {
                let jobs = jobs.clone();
                async move { jobs.get("app-test", job.id).await.unwrap().unwrap().status == JobStatus::Succeeded }
            },
            Duration::from_secs(5),
        )
        .await
    );

    node.stop(StopKind::Immediate).await.unwrap();
    assert!(app.context().workers().get("app-test", "app-worker").await.unwrap().is_none());
}

#[tokio::test]
async fn test_application_run_stops_on_signal() {
    let app = Application::build(config("app-run"), builtin_handlers().unwrap())
        .await
        .unwrap();
    let context = app.context().clone();

    tokio::time::timeout(Duration::from_secs(10), app.run(async { StopKind::Friendly }))
        .await
        .expect("application should stop")
        .unwrap();

    assert!(context.workers().get("app-test", "app-run").await.unwrap().is_none());
    assert!(context.buckets().list_by_worker("app-test", "app-run").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_request_stop_is_exclusive() {
    let app = Application::build(config("app-stop"), builtin_handlers().unwrap())
        .await
        .unwrap();

    assert!(app.request_stop("app-stop", StopKind::Friendly, Duration::from_secs(60)).await.unwrap());
    assert!(!app.request_stop("app-stop", StopKind::Friendly, Duration::from_secs(60)).await.unwrap());
    assert!(app.request_stop("app-stop", StopKind::Immediate, Duration::from_secs(60)).await.unwrap());
}
