use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;

use scheduler_dispatcher::{DispatchOutcome, DispatchService, DispatchSettings};
use scheduler_domain::{
    AgentTransport, Bucket, BucketAddress, CancelOutcome, DispatchEnvelope, Job, JobPriority, JobStatus,
    LocalExecutionEngine, QueueKind,
};
use scheduler_testing_utils::{JobBuilder, RecordingHandler, TestCluster, TestEnv, WorkerBuilder, TEST_CLUSTER};
use scheduler_worker::{EngineSettings, ExecutionEngine};

const WORKER: &str = "worker-1";

fn settings() -> EngineSettings {
    EngineSettings {
        parallelism_factor: 1,
        onboarding_window: StdDuration::from_secs(5),
        poll_interval: StdDuration::from_millis(20),
        poll_batch_size: 50,
        tick_interval: StdDuration::from_millis(10),
        timeout_sweep_interval: StdDuration::from_millis(20),
        shutdown_grace: StdDuration::from_secs(1),
    }
}

async fn setup(cluster: &TestCluster, priority: JobPriority) -> (Bucket, Arc<ExecutionEngine>) {
    let worker = cluster.add_worker(WorkerBuilder::new(WORKER)).await;
    let bucket = cluster.add_bucket(&worker, priority).await;
    let engine = Arc::new(ExecutionEngine::new(cluster.context.clone(), WORKER, settings()));
    engine.attach_bucket(bucket.clone());
    (bucket, engine)
}

async fn publish(cluster: &TestCluster, bucket: &Bucket, job: &Job) -> String {
    let payload = DispatchEnvelope::Job { job_id: job.id }.to_bytes().unwrap();
    cluster
        .transport
        .publish(
            &BucketAddress::for_bucket(bucket, QueueKind::SavePending),
            &payload,
            job.scheduled_at,
            &job.correlation_id(),
        )
        .await
        .unwrap()
}

async fn load(cluster: &TestCluster, job: &Job) -> Job {
    cluster.context.jobs().get(TEST_CLUSTER, job.id).await.unwrap().unwrap()
}

async fn wait_for_status(cluster: &TestCluster, job: &Job, status: JobStatus) -> bool {
    TestEnv::wait_for(
        || async { load(cluster, job).await.status == status },
        StdDuration::from_secs(5),
    )
    .await
}

#[tokio::test]
async fn test_polled_job_runs_to_success() {
    let cluster = TestCluster::new();
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;
    let job = JobBuilder::new().assigned_to(&bucket).build();
    cluster.context.jobs().insert(&job).await.unwrap();
    publish(&cluster, &bucket, &job).await;

    assert_eq!(engine.poll(Utc::now()).await.unwrap(), 1);
    assert!(wait_for_status(&cluster, &job, JobStatus::Succeeded).await);
    assert_eq!(cluster.handler.calls(), vec![job.id]);

    let stored = load(&cluster, &job).await;
    assert!(stored.finished_at.is_some());
    assert!(stored.process_deadline.is_none());
}

#[tokio::test]
async fn test_failed_job_is_rescheduled_on_master() {
    let cluster = TestCluster::with_handler(RecordingHandler::failing(1));
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;
    let job = JobBuilder::new().assigned_to(&bucket).build();
    cluster.context.jobs().insert(&job).await.unwrap();
    publish(&cluster, &bucket, &job).await;

    engine.poll(Utc::now()).await.unwrap();
    assert!(wait_for_status(&cluster, &job, JobStatus::HeldOnMaster).await);

    let stored = load(&cluster, &job).await;
    assert_eq!(stored.failure_count, 1);
    assert!(stored.assignment.is_none());
    assert!(stored.scheduled_at > Utc::now() + Duration::seconds(30));
    assert!(stored.last_error.unwrap().contains("scripted handler failure"));
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_job() {
    let cluster = TestCluster::with_handler(RecordingHandler::failing(1));
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;
    let job = JobBuilder::new().with_retries(0, 0).assigned_to(&bucket).build();
    cluster.context.jobs().insert(&job).await.unwrap();
    publish(&cluster, &bucket, &job).await;

    engine.poll(Utc::now()).await.unwrap();
    assert!(wait_for_status(&cluster, &job, JobStatus::Failed).await);
}

#[tokio::test]
async fn test_held_job_with_matching_supposed_id_is_adopted() {
    let cluster = TestCluster::new();
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;

    let mut adopted = JobBuilder::new().held_on_master().build();
    let message_id = publish(&cluster, &bucket, &adopted).await;
    adopted.supposed_published_id = Some(message_id);
    cluster.context.jobs().insert(&adopted).await.unwrap();

    let mut stale = JobBuilder::new().held_on_master().build();
    publish(&cluster, &bucket, &stale).await;
    stale.supposed_published_id = Some("another-message".to_string());
    cluster.context.jobs().insert(&stale).await.unwrap();

    assert_eq!(engine.poll(Utc::now()).await.unwrap(), 1);
    assert!(wait_for_status(&cluster, &adopted, JobStatus::Succeeded).await);
    assert_eq!(cluster.handler.calls(), vec![adopted.id]);

    let stale = load(&cluster, &stale).await;
    assert_eq!(stale.status, JobStatus::HeldOnMaster);
    assert_eq!(stale.supposed_published_id.as_deref(), Some("another-message"));
}

#[tokio::test]
async fn test_redelivered_message_runs_job_once() {
    let cluster = TestCluster::with_handler(RecordingHandler::slow(StdDuration::from_millis(200)));
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;
    let job = JobBuilder::new().assigned_to(&bucket).build();
    cluster.context.jobs().insert(&job).await.unwrap();
    publish(&cluster, &bucket, &job).await;
    publish(&cluster, &bucket, &job).await;

    assert_eq!(engine.poll(Utc::now()).await.unwrap(), 1);
    assert!(wait_for_status(&cluster, &job, JobStatus::Succeeded).await);
    assert_eq!(cluster.handler.call_count(), 1);
}

#[tokio::test]
async fn test_failing_message_does_not_drop_rest_of_batch() {
    let cluster = TestCluster::new();
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;
    let jobs: Vec<Job> = (0..3).map(|_| JobBuilder::new().assigned_to(&bucket).build()).collect();
    for job in &jobs {
        cluster.context.jobs().insert(job).await.unwrap();
        publish(&cluster, &bucket, job).await;
    }
    let broken = &jobs[1];
    cluster.jobs.fail_job(broken.id);

    assert_eq!(engine.poll(Utc::now()).await.unwrap(), 2);
    assert!(wait_for_status(&cluster, &jobs[0], JobStatus::Succeeded).await);
    assert!(wait_for_status(&cluster, &jobs[2], JobStatus::Succeeded).await);

    // 失败的消息放回 Processing 队列，未丢失
    let processing = BucketAddress::for_bucket(&bucket, QueueKind::Processing);
    assert_eq!(cluster.transport.pending_count(&processing).await, 1);
    let save_pending = BucketAddress::for_bucket(&bucket, QueueKind::SavePending);
    assert_eq!(cluster.transport.pending_count(&save_pending).await, 0);

    cluster.jobs.heal_job(broken.id);
    assert_eq!(load(&cluster, broken).await.status, JobStatus::AssignedToBucket);
    assert_eq!(engine.poll(Utc::now()).await.unwrap(), 1);
    assert!(wait_for_status(&cluster, broken, JobStatus::Succeeded).await);
    assert_eq!(cluster.handler.call_count(), 3);
}

#[tokio::test]
async fn test_future_message_stays_in_transport() {
    let cluster = TestCluster::new();
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;
    let job = JobBuilder::new()
        .scheduled_in(Duration::hours(1))
        .assigned_to(&bucket)
        .build();
    cluster.context.jobs().insert(&job).await.unwrap();
    publish(&cluster, &bucket, &job).await;

    assert_eq!(engine.poll(Utc::now()).await.unwrap(), 0);
    let address = BucketAddress::for_bucket(&bucket, QueueKind::SavePending);
    assert_eq!(cluster.transport.pending_count(&address).await, 1);
    assert_eq!(load(&cluster, &job).await.status, JobStatus::AssignedToBucket);
}

#[tokio::test]
async fn test_short_circuited_job_runs_locally() {
    let cluster = TestCluster::new();
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;
    let dispatcher = DispatchService::new(cluster.context.clone(), DispatchSettings::default())
        .with_local_engine(engine.clone() as Arc<dyn LocalExecutionEngine>);

    let job = dispatcher
        .create_job("test-handler", json!({"n": 1}), Utc::now(), HashMap::new())
        .unwrap();
    let outcome = dispatcher.schedule_job(job.clone()).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::ShortCircuited { bucket_id: bucket.id.clone() });

    assert!(wait_for_status(&cluster, &job, JobStatus::Succeeded).await);
    let address = BucketAddress::for_bucket(&bucket, QueueKind::SavePending);
    assert_eq!(cluster.transport.pending_count(&address).await, 0);
}

#[tokio::test]
async fn test_cancellation_request_interrupts_running_job() {
    let cluster = TestCluster::with_handler(RecordingHandler::slow(StdDuration::from_secs(30)));
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;
    let job = JobBuilder::new().assigned_to(&bucket).build();
    cluster.context.jobs().insert(&job).await.unwrap();
    publish(&cluster, &bucket, &job).await;
    engine.poll(Utc::now()).await.unwrap();
    assert!(wait_for_status(&cluster, &job, JobStatus::Processing).await);

    // 不带本地引擎的派发服务只打取消标记，由引擎清扫发现
    let dispatcher = DispatchService::new(cluster.context.clone(), DispatchSettings::default());
    assert_eq!(dispatcher.cancel_job(job.id).await.unwrap(), CancelOutcome::Requested);

    assert_eq!(engine.sweep().await.unwrap(), 1);
    assert!(wait_for_status(&cluster, &job, JobStatus::Cancelled).await);
}

#[tokio::test]
async fn test_local_abort_of_queued_job() {
    let cluster = TestCluster::with_handler(RecordingHandler::slow(StdDuration::from_secs(30)));
    let (bucket, engine) = setup(&cluster, JobPriority::Normal).await;
    let job = JobBuilder::new().assigned_to(&bucket).build();
    cluster.context.jobs().insert(&job).await.unwrap();
    publish(&cluster, &bucket, &job).await;
    engine.poll(Utc::now()).await.unwrap();

    assert!(engine.abort(job.id).await);
    assert!(!engine.abort(uuid::Uuid::new_v4()).await);
}

#[tokio::test]
async fn test_shutdown_returns_waiting_jobs_to_master() {
    let cluster = TestCluster::with_handler(RecordingHandler::slow(StdDuration::from_secs(30)));
    let (bucket, engine) = setup(&cluster, JobPriority::Lowest).await;

    let mut jobs = Vec::new();
    for _ in 0..3 {
        let job = JobBuilder::new()
            .with_priority(JobPriority::Lowest)
            .assigned_to(&bucket)
            .build();
        cluster.context.jobs().insert(&job).await.unwrap();
        publish(&cluster, &bucket, &job).await;
        jobs.push(job);
    }

    assert_eq!(engine.poll(Utc::now()).await.unwrap(), 3);
    assert_eq!(engine.running_jobs().len(), 2);

    assert_eq!(engine.shutdown().await.unwrap(), 1);
    for job in &jobs {
        assert!(wait_for_status(&cluster, job, JobStatus::HeldOnMaster).await);
        let stored = load(&cluster, job).await;
        assert!(stored.assignment.is_none());
        assert_eq!(stored.failure_count, 0);
    }
    assert!(!engine.has_capacity(&bucket.id));
}
