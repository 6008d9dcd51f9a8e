use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;

use scheduler_core::ClusterContext;
use scheduler_domain::{
    BucketAddress, BucketStatus, CancelOutcome, ClusterConfiguration, ClusterMode, JobPriority,
    JobStatus, LocalExecutionEngine, QueueKind, RecurrenceExpression, RecurringScheduleStatus,
    SchedulerError,
};
use scheduler_testing_utils::{
    JobBuilder, RecordingEngine, ScheduleBuilder, TestCluster, WorkerBuilder, TEST_CLUSTER,
};

use scheduler_dispatcher::{
    DeadlineProcessor, DispatchOutcome, DispatchService, DispatchSettings, DueOnMasterProcessor,
    JobScan, PartitionedScanner, ScanSettings, TickOutcome,
};

fn fast_settings() -> DispatchSettings {
    DispatchSettings {
        onboarding_window: StdDuration::from_secs(5),
        heartbeat_threshold: StdDuration::from_secs(30),
        retry_base: StdDuration::from_millis(1),
        retry_max: StdDuration::from_millis(5),
        max_publish_attempts: 3,
    }
}

fn dispatcher(context: &Arc<ClusterContext>) -> DispatchService {
    DispatchService::new(context.clone(), fast_settings())
}

#[tokio::test]
async fn test_publish_to_remote_bucket() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    let bucket = cluster.add_bucket(&worker, JobPriority::Normal).await;
    let service = dispatcher(&cluster.context);

    let job = service
        .create_job("test-handler", json!({"n": 1}), Utc::now(), Default::default())
        .unwrap();
    let job_id = job.id;

    let outcome = service.schedule_job(job).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Published { ref bucket_id, .. } if *bucket_id == bucket.id));

    let stored = cluster.context.jobs().get(TEST_CLUSTER, job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::AssignedToBucket);
    assert_eq!(stored.assignment.unwrap().worker_id, "worker-1");
    let address = BucketAddress::for_bucket(&bucket, QueueKind::SavePending);
    assert_eq!(cluster.transport.pending_count(&address).await, 1);
}

#[tokio::test]
async fn test_publish_timeout_holds_job_with_supposed_id() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    cluster.add_bucket(&worker, JobPriority::Normal).await;
    let service = dispatcher(&cluster.context);
    cluster.transport.timeout_next_publishes(1);

    let job = service
        .create_job("test-handler", json!({}), Utc::now(), Default::default())
        .unwrap();
    let job_id = job.id;

    let err = service.schedule_job(job).await.unwrap_err();
    let SchedulerError::AmbiguousPublish { supposed_id, .. } = err else {
        panic!("expected ambiguous publish, got {err:?}");
    };

    let stored = cluster.context.jobs().get(TEST_CLUSTER, job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::HeldOnMaster);
    assert!(stored.assignment.is_none());
    assert_eq!(stored.supposed_published_id.as_deref(), Some(supposed_id.as_str()));
    // 结果未知时不重试
    assert_eq!(cluster.transport.publish_attempts(), 1);
}

#[tokio::test]
async fn test_transient_publish_failure_is_retried() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    cluster.add_bucket(&worker, JobPriority::Normal).await;
    let service = dispatcher(&cluster.context);
    cluster.transport.fail_next_publishes(2);

    let job = JobBuilder::new().build();
    let outcome = service.schedule_job(job).await.unwrap();

    assert!(matches!(outcome, DispatchOutcome::Published { .. }));
    assert_eq!(cluster.transport.publish_attempts(), 3);
}

#[tokio::test]
async fn test_confirmed_publish_failure_holds_on_master() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    cluster.add_bucket(&worker, JobPriority::Normal).await;
    let service = dispatcher(&cluster.context);
    cluster.transport.fail_next_publishes(3);

    let job = JobBuilder::new().build();
    let job_id = job.id;
    let outcome = service.schedule_job(job).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::HeldOnMaster);
    let stored = cluster.context.jobs().get(TEST_CLUSTER, job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::HeldOnMaster);
    assert!(stored.supposed_published_id.is_none());
}

#[tokio::test]
async fn test_short_circuit_to_local_engine() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    let bucket = cluster.add_bucket(&worker, JobPriority::Normal).await;
    let engine = RecordingEngine::new("worker-1");
    let service = dispatcher(&cluster.context).with_local_engine(engine.clone() as Arc<dyn LocalExecutionEngine>);

    let job = JobBuilder::new().scheduled_in(Duration::seconds(1)).build();
    let outcome = service.schedule_job(job).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::ShortCircuited { bucket_id: bucket.id.clone() });
    assert_eq!(engine.injected().len(), 1);
    assert_eq!(cluster.transport.publish_attempts(), 0);
}

#[tokio::test]
async fn test_far_future_job_is_published_even_when_local() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    cluster.add_bucket(&worker, JobPriority::Normal).await;
    let engine = RecordingEngine::new("worker-1");
    let service = dispatcher(&cluster.context).with_local_engine(engine.clone() as Arc<dyn LocalExecutionEngine>);

    let job = JobBuilder::new().scheduled_in(Duration::minutes(10)).build();
    let outcome = service.schedule_job(job).await.unwrap();

    assert!(matches!(outcome, DispatchOutcome::Published { .. }));
    assert!(engine.injected().is_empty());
}

#[tokio::test]
async fn test_full_local_queue_falls_back_to_transport() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    cluster.add_bucket(&worker, JobPriority::Normal).await;
    let engine = RecordingEngine::new("worker-1");
    engine.fail_injections(true);
    let service = dispatcher(&cluster.context).with_local_engine(engine.clone() as Arc<dyn LocalExecutionEngine>);

    let outcome = service.schedule_job(JobBuilder::new().build()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Published { .. }));
}

#[tokio::test]
async fn test_passive_cluster_holds_jobs() {
    let mut configuration = ClusterConfiguration::new(TEST_CLUSTER);
    configuration.mode = ClusterMode::Passive;
    let cluster = TestCluster::with_configuration(configuration);
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    cluster.add_bucket(&worker, JobPriority::Normal).await;
    let service = dispatcher(&cluster.context);

    let outcome = service.schedule_job(JobBuilder::new().build()).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::HeldOnMaster);
    assert_eq!(cluster.transport.publish_attempts(), 0);
}

#[tokio::test]
async fn test_no_matching_bucket_holds_job() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    cluster.add_bucket(&worker, JobPriority::Low).await;
    let service = dispatcher(&cluster.context);

    let job = JobBuilder::new().with_priority(JobPriority::Highest).build();
    assert_eq!(service.schedule_job(job).await.unwrap(), DispatchOutcome::HeldOnMaster);
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let mut configuration = ClusterConfiguration::new(TEST_CLUSTER);
    configuration.max_message_bytes = 16;
    let cluster = TestCluster::with_configuration(configuration);
    let service = dispatcher(&cluster.context);

    let job = JobBuilder::new()
        .with_payload(json!({"data": "x".repeat(64)}))
        .build();
    let job_id = job.id;

    let err = service.schedule_job(job).await.unwrap_err();
    assert!(matches!(err, SchedulerError::CapacityExceeded { limit: 16, .. }));
    assert!(cluster.context.jobs().get(TEST_CLUSTER, job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_job_respects_onboarding_window() {
    let cluster = TestCluster::new();
    let service = dispatcher(&cluster.context);

    let far = JobBuilder::new().held_on_master().scheduled_in(Duration::hours(1)).build();
    let near = JobBuilder::new().held_on_master().scheduled_in(Duration::seconds(1)).build();
    cluster.context.jobs().insert(&far).await.unwrap();
    cluster.context.jobs().insert(&near).await.unwrap();

    assert_eq!(service.cancel_job(far.id).await.unwrap(), CancelOutcome::Cancelled);
    assert!(matches!(
        service.cancel_job(near.id).await,
        Err(SchedulerError::CancellationRefused { .. })
    ));
    assert_eq!(service.cancel_job(far.id).await.unwrap(), CancelOutcome::AlreadyFinal);
}

#[tokio::test]
async fn test_cancel_processing_job_aborts_local_execution() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    let bucket = cluster.add_bucket(&worker, JobPriority::Normal).await;
    let engine = RecordingEngine::new("worker-1");
    let service = dispatcher(&cluster.context).with_local_engine(engine.clone() as Arc<dyn LocalExecutionEngine>);

    let job = JobBuilder::new()
        .processing_on(bucket.assignment(), Utc::now() + Duration::seconds(30))
        .build();
    cluster.context.jobs().insert(&job).await.unwrap();

    assert_eq!(service.cancel_job(job.id).await.unwrap(), CancelOutcome::Requested);
    assert_eq!(engine.aborted(), vec![job.id]);
    let stored = cluster.context.jobs().get(TEST_CLUSTER, job.id).await.unwrap().unwrap();
    assert!(stored.cancellation_requested);
    assert_eq!(stored.status, JobStatus::Processing);
}

#[tokio::test]
async fn test_due_on_master_jobs_are_dispatched_when_capacity_returns() {
    let cluster = TestCluster::new();
    let held = JobBuilder::new().held_on_master().build();
    let later = JobBuilder::new().held_on_master().scheduled_in(Duration::hours(1)).build();
    cluster.context.jobs().insert(&held).await.unwrap();
    cluster.context.jobs().insert(&later).await.unwrap();

    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    let bucket = cluster.add_bucket(&worker, JobPriority::Normal).await;

    let service = Arc::new(dispatcher(&cluster.context));
    let scanner = PartitionedScanner::new(
        cluster.context.clone(),
        JobScan::new(cluster.context.clone(), DueOnMasterProcessor::new(service)),
        ScanSettings::default(),
    );

    let outcome = scanner.tick(Utc::now()).await.unwrap();
    assert_eq!(outcome, TickOutcome::Processed { succeeded: 1, failed: 0, skipped: 0 });

    let dispatched = cluster.context.jobs().get(TEST_CLUSTER, held.id).await.unwrap().unwrap();
    assert_eq!(dispatched.status, JobStatus::AssignedToBucket);
    assert!(dispatched.partition_claim.is_none());
    let untouched = cluster.context.jobs().get(TEST_CLUSTER, later.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, JobStatus::HeldOnMaster);

    let address = BucketAddress::for_bucket(&bucket, QueueKind::SavePending);
    assert_eq!(cluster.transport.pending_count(&address).await, 1);
}

#[tokio::test]
async fn test_deadline_exceeded_job_is_rescheduled() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    let bucket = cluster.add_bucket(&worker, JobPriority::Normal).await;
    let engine = RecordingEngine::new("worker-1");
    let service = Arc::new(
        dispatcher(&cluster.context).with_local_engine(engine.clone() as Arc<dyn LocalExecutionEngine>),
    );

    let job = JobBuilder::new()
        .with_retries(3, 0)
        .processing_on(bucket.assignment(), Utc::now() - Duration::seconds(1))
        .build();
    cluster.context.jobs().insert(&job).await.unwrap();

    let scanner = PartitionedScanner::new(
        cluster.context.clone(),
        JobScan::new(cluster.context.clone(), DeadlineProcessor::new(service)),
        ScanSettings::default(),
    );
    let now = Utc::now();
    scanner.tick(now).await.unwrap();

    let stored = cluster.context.jobs().get(TEST_CLUSTER, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::HeldOnMaster);
    assert_eq!(stored.failure_count, 1);
    assert!(stored.scheduled_at >= now + Duration::seconds(30));
    assert_eq!(engine.aborted(), vec![job.id]);
}

#[tokio::test]
async fn test_schedule_recurring_without_buckets_stays_on_master() {
    let cluster = TestCluster::new();
    let service = dispatcher(&cluster.context);

    let schedule = ScheduleBuilder::new().build();
    let schedule_id = schedule.id;
    assert_eq!(
        service.schedule_recurring(schedule).await.unwrap(),
        DispatchOutcome::HeldOnMaster
    );

    let stored = cluster.context.schedules().get(TEST_CLUSTER, schedule_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RecurringScheduleStatus::Active);
    assert!(stored.assignment.is_none());
}

#[tokio::test]
async fn test_schedule_recurring_is_published_to_bucket() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    let bucket = cluster.add_bucket(&worker, JobPriority::Normal).await;
    let service = dispatcher(&cluster.context);

    let outcome = service.schedule_recurring(ScheduleBuilder::new().build()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Published { .. }));
    let address = BucketAddress::for_bucket(&bucket, QueueKind::RecurringSave);
    assert_eq!(cluster.transport.pending_count(&address).await, 1);
}

#[tokio::test]
async fn test_invalid_recurrence_is_rejected_before_saving() {
    let cluster = TestCluster::new();
    let service = dispatcher(&cluster.context);

    let mut schedule = ScheduleBuilder::new().build();
    schedule.expression = RecurrenceExpression::interval("every 0 seconds");
    let schedule_id = schedule.id;

    assert!(matches!(
        service.schedule_recurring(schedule).await,
        Err(SchedulerError::InvalidExpression { .. })
    ));
    assert!(cluster.context.schedules().get(TEST_CLUSTER, schedule_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_schedule() {
    let cluster = TestCluster::new();
    let service = dispatcher(&cluster.context);
    let schedule = ScheduleBuilder::new().active().build();
    cluster.context.schedules().insert(&schedule).await.unwrap();

    assert!(service.cancel_schedule(schedule.id).await.unwrap());
    let stored = cluster.context.schedules().get(TEST_CLUSTER, schedule.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RecurringScheduleStatus::Canceled);
    assert!(stored.is_job_cancellation_pending);
    assert!(!service.cancel_schedule(schedule.id).await.unwrap());
}

#[tokio::test]
async fn test_draining_bucket_is_not_selected() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    let bucket = cluster.add_bucket(&worker, JobPriority::Normal).await;
    let lifecycle = scheduler_dispatcher::BucketLifecycle::new(cluster.context.clone());
    let drained = lifecycle.begin_drain(&bucket, Utc::now()).await.unwrap().unwrap();
    assert_eq!(drained.status, BucketStatus::Draining);

    let service = dispatcher(&cluster.context);
    assert_eq!(
        service.schedule_job(JobBuilder::new().build()).await.unwrap(),
        DispatchOutcome::HeldOnMaster
    );
}
