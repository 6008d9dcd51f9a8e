use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::json;

use scheduler_core::AppConfig;
use scheduler_dispatcher::{request_stop, stop_lock_key, DispatchOutcome, StopKind};
use scheduler_domain::{
    BucketStatus, JobPriority, JobStatus, RecurrenceExpression, RecurringScheduleStatus,
    StaticScheduleDefinition, WorkerMode,
};
use scheduler_testing_utils::{TestCluster, TestEnv, TEST_CLUSTER};
use scheduler_worker::WorkerNode;

fn config(worker_id: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.worker.id = Some(worker_id.to_string());
    config.worker.bucket_priorities = vec![JobPriority::Normal];
    config.worker.poll_interval_ms = 20;
    config.worker.stop_poll_interval_ms = 20;
    config.worker.drain_poll_interval_ms = 20;
    config.worker.friendly_stop_grace_ms = 0;
    config.task_queue.tick_interval_ms = 10;
    config.task_queue.timeout_sweep_interval_ms = 50;
    config.task_queue.shutdown_grace_ms = 200;
    config
}

#[tokio::test]
async fn test_node_runs_short_circuited_job_and_stops_immediately() {
    let cluster = TestCluster::new();
    let node = WorkerNode::start(cluster.context.clone(), config("node-1")).await.unwrap();

    let buckets = cluster.context.buckets().list_by_worker(TEST_CLUSTER, "node-1").await.unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(node.engine().bucket_ids(), vec![buckets[0].id.clone()]);

    let job = node
        .dispatcher()
        .create_job("test-handler", json!({}), Utc::now(), HashMap::new())
        .unwrap();
    let outcome = node.dispatcher().schedule_job(job.clone()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::ShortCircuited { .. }));

    let jobs = cluster.context.jobs().clone();
    assert!(
        TestEnv::wait_for(
            || {
                let jobs = jobs.clone();
                async move {
                    jobs.get(TEST_CLUSTER, job.id).await.unwrap().unwrap().status == JobStatus::Succeeded
                }
            },
            StdDuration::from_secs(5),
        )
        .await
    );

    node.stop(StopKind::Immediate).await.unwrap();

    assert!(cluster.context.workers().get(TEST_CLUSTER, "node-1").await.unwrap().is_none());
    let buckets = cluster.context.buckets().list_by_worker(TEST_CLUSTER, "node-1").await.unwrap();
    assert!(buckets.iter().all(|b| b.status == BucketStatus::Lost));
}

#[tokio::test]
async fn test_friendly_stop_request_drains_buckets() {
    let cluster = TestCluster::new();
    let node = WorkerNode::start(cluster.context.clone(), config("node-2")).await.unwrap();
    let locks = cluster.context.locks();

    request_stop(locks, "node-2", StopKind::Friendly, StdDuration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    tokio::time::timeout(
        StdDuration::from_secs(10),
        node.run_until_stopped(std::future::pending()),
    )
    .await
    .expect("node should stop")
    .unwrap();

    let buckets = cluster.context.buckets().list_by_worker(TEST_CLUSTER, "node-2").await.unwrap();
    assert!(buckets.is_empty());
    assert!(cluster.context.workers().get(TEST_CLUSTER, "node-2").await.unwrap().is_none());
    assert!(!locks.is_locked(&stop_lock_key(StopKind::Friendly, "node-2")).await);
}

#[tokio::test]
async fn test_drain_mode_node_creates_no_buckets() {
    let cluster = TestCluster::new();
    let mut config = config("node-drain");
    config.worker.mode = WorkerMode::Drain;
    let node = WorkerNode::start(cluster.context.clone(), config).await.unwrap();

    let worker = cluster.context.workers().get(TEST_CLUSTER, "node-drain").await.unwrap().unwrap();
    assert_eq!(worker.mode, WorkerMode::Drain);
    assert!(node.engine().bucket_ids().is_empty());

    node.stop(StopKind::Immediate).await.unwrap();
}

#[tokio::test]
async fn test_node_ensures_static_schedules_on_start() {
    let cluster = TestCluster::new();
    let mut config = config("node-3");
    config.recurring.profile_id = "billing".to_string();
    config.recurring.static_schedules = vec![StaticScheduleDefinition {
        definition_id: "nightly".to_string(),
        handler_id: "test-handler".to_string(),
        expression: RecurrenceExpression::cron("0 0 3 * * *"),
        timezone: Some("Europe/Berlin".to_string()),
        payload: json!({"report": "daily"}),
        start_after: None,
        end_before: None,
    }];
    let node = WorkerNode::start(cluster.context.clone(), config).await.unwrap();

    let schedule = cluster
        .context
        .schedules()
        .get_static(TEST_CLUSTER, "billing", "nightly")
        .await
        .unwrap()
        .expect("static schedule");
    assert_eq!(schedule.status, RecurringScheduleStatus::Active);
    assert_eq!(schedule.timezone, "Europe/Berlin");
    assert!(schedule.static_last_ensured.is_some());

    node.stop(StopKind::Immediate).await.unwrap();
}
