use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;

use scheduler_domain::{
    AgentTransport, BucketAddress, BucketStatus, ClusterConfiguration, DispatchEnvelope, JobPriority,
    JobStatus, QueueKind, RecurrenceExpression, RecurringScheduleStatus, StaticScheduleDefinition,
};
use scheduler_testing_utils::{
    BucketBuilder, JobBuilder, ScheduleBuilder, TestCluster, WorkerBuilder, TEST_CLUSTER,
};

use scheduler_dispatcher::{
    request_stop, AssignedLostBucketsRunner, BucketLifecycle, DeadWorkerDetector, DispatchOutcome,
    DispatchService, DispatchSettings, MaterializeOutcome, PartitionedScanner, RecurringPlanner,
    RecurringSettings, RetentionRunner, ScanSettings, ScheduleCancellationProcessor, ScheduleScan,
    StaticOrphanProcessor, StaticScheduleKeeper, StopKind,
};

fn service(cluster: &TestCluster) -> Arc<DispatchService> {
    Arc::new(DispatchService::new(cluster.context.clone(), DispatchSettings::default()))
}

#[tokio::test]
async fn test_lost_bucket_is_reassigned_ready_to_drain() {
    let cluster = TestCluster::new();
    let dead = cluster
        .add_worker(WorkerBuilder::new("worker-dead").last_seen(Duration::minutes(10)))
        .await;
    cluster.add_worker(WorkerBuilder::new("worker-alive")).await;
    let bucket = BucketBuilder::for_worker(&dead)
        .with_status(BucketStatus::Lost)
        .build();
    cluster.insert_bucket(&bucket).await;

    let runner = AssignedLostBucketsRunner::new(
        cluster.context.clone(),
        StdDuration::from_secs(30),
        StdDuration::from_secs(10),
    );
    assert_eq!(runner.reassign(Utc::now()).await.unwrap(), 1);

    let stored = cluster.context.buckets().get(TEST_CLUSTER, &bucket.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BucketStatus::ReadyToDrain);
    assert_eq!(stored.worker_id, "worker-alive");
}

#[tokio::test]
async fn test_lost_bucket_waits_for_live_worker_on_same_agent() {
    let cluster = TestCluster::new();
    let dead = cluster
        .add_worker(WorkerBuilder::new("worker-dead").last_seen(Duration::minutes(10)))
        .await;
    cluster
        .add_worker(WorkerBuilder::new("worker-other").with_agent("agent-other"))
        .await;
    let bucket = BucketBuilder::for_worker(&dead)
        .with_status(BucketStatus::Lost)
        .build();
    cluster.insert_bucket(&bucket).await;

    let runner = AssignedLostBucketsRunner::new(
        cluster.context.clone(),
        StdDuration::from_secs(30),
        StdDuration::from_secs(10),
    );
    assert_eq!(runner.reassign(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_dead_worker_buckets_become_lost() {
    let cluster = TestCluster::new();
    let dead = cluster
        .add_worker(WorkerBuilder::new("worker-dead").last_seen(Duration::minutes(5)))
        .await;
    let alive = cluster.add_worker(WorkerBuilder::new("worker-alive")).await;
    let lost = cluster.add_bucket(&dead, JobPriority::Normal).await;
    let kept = cluster.add_bucket(&alive, JobPriority::Normal).await;

    let detector = DeadWorkerDetector::new(
        cluster.context.clone(),
        StdDuration::from_secs(30),
        StdDuration::from_secs(30),
        StdDuration::from_secs(10),
    );
    assert_eq!(detector.detect(Utc::now()).await.unwrap(), 1);

    let buckets = cluster.context.buckets();
    assert_eq!(
        buckets.get(TEST_CLUSTER, &lost.id).await.unwrap().unwrap().status,
        BucketStatus::Lost
    );
    assert_eq!(
        buckets.get(TEST_CLUSTER, &kept.id).await.unwrap().unwrap().status,
        BucketStatus::Active
    );
    assert!(cluster.context.workers().get(TEST_CLUSTER, "worker-dead").await.unwrap().is_none());
}

#[tokio::test]
async fn test_flush_returns_queued_jobs_and_deletes_bucket() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    let bucket = cluster.add_bucket(&worker, JobPriority::Normal).await;
    let dispatcher = service(&cluster);

    let job = JobBuilder::new().scheduled_in(Duration::minutes(5)).build();
    let job_id = job.id;
    assert!(matches!(
        dispatcher.schedule_job(job).await.unwrap(),
        DispatchOutcome::Published { .. }
    ));

    let lifecycle = BucketLifecycle::new(cluster.context.clone());
    let outcome = lifecycle.flush_bucket(&bucket, Utc::now()).await.unwrap();
    assert_eq!(outcome.jobs_returned, 1);
    assert!(outcome.deleted);

    let stored = cluster.context.jobs().get(TEST_CLUSTER, job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::HeldOnMaster);
    assert!(stored.assignment.is_none());
    assert!(cluster.context.buckets().get(TEST_CLUSTER, &bucket.id).await.unwrap().is_none());
    let address = BucketAddress::for_bucket(&bucket, QueueKind::SavePending);
    assert!(!cluster.transport.address_exists(&address).await);
}

#[tokio::test]
async fn test_crashed_worker_in_flight_work_returns_to_master() {
    let cluster = TestCluster::new();
    let dead = cluster
        .add_worker(WorkerBuilder::new("worker-dead").last_seen(Duration::minutes(10)))
        .await;
    cluster.add_worker(WorkerBuilder::new("worker-alive")).await;
    let bucket = cluster.add_bucket(&dead, JobPriority::Normal).await;

    // 消息已被崩溃的 Worker 取走，只剩主存储中的分配
    let queued = JobBuilder::new().queued_on(&bucket).build();
    cluster.context.jobs().insert(&queued).await.unwrap();

    // 消息仍在 Bucket 队列中
    let assigned = JobBuilder::new()
        .scheduled_in(Duration::minutes(5))
        .assigned_to(&bucket)
        .build();
    cluster.context.jobs().insert(&assigned).await.unwrap();
    let payload = DispatchEnvelope::Job { job_id: assigned.id }.to_bytes().unwrap();
    cluster
        .transport
        .publish(
            &BucketAddress::for_bucket(&bucket, QueueKind::SavePending),
            &payload,
            assigned.scheduled_at,
            &assigned.correlation_id(),
        )
        .await
        .unwrap();

    let mut schedule = ScheduleBuilder::new()
        .with_status(RecurringScheduleStatus::PendingSave)
        .build();
    schedule.assignment = Some(bucket.assignment());
    cluster.context.schedules().insert(&schedule).await.unwrap();

    let detector = DeadWorkerDetector::new(
        cluster.context.clone(),
        StdDuration::from_secs(30),
        StdDuration::from_secs(30),
        StdDuration::from_secs(10),
    );
    assert_eq!(detector.detect(Utc::now()).await.unwrap(), 1);
    let runner = AssignedLostBucketsRunner::new(
        cluster.context.clone(),
        StdDuration::from_secs(30),
        StdDuration::from_secs(10),
    );
    assert_eq!(runner.reassign(Utc::now()).await.unwrap(), 1);

    let ready = cluster.context.buckets().get(TEST_CLUSTER, &bucket.id).await.unwrap().unwrap();
    assert_eq!(ready.status, BucketStatus::ReadyToDrain);

    let lifecycle = BucketLifecycle::new(cluster.context.clone());
    let outcome = lifecycle.flush_bucket(&ready, Utc::now()).await.unwrap();
    assert_eq!(outcome.jobs_returned, 2);
    assert_eq!(outcome.schedules_returned, 1);
    assert_eq!(outcome.failures, 0);
    assert!(outcome.deleted);

    for job in [&queued, &assigned] {
        let stored = cluster.context.jobs().get(TEST_CLUSTER, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::HeldOnMaster);
        assert!(stored.assignment.is_none());
    }
    let stored = cluster.context.schedules().get(TEST_CLUSTER, schedule.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RecurringScheduleStatus::Active);
    assert!(stored.assignment.is_none());
    assert!(cluster.context.buckets().get(TEST_CLUSTER, &bucket.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_flush_isolates_job_that_cannot_be_returned() {
    let cluster = TestCluster::new();
    let worker = cluster.add_worker(WorkerBuilder::new("worker-1")).await;
    let bucket = cluster.add_bucket(&worker, JobPriority::Normal).await;
    let dispatcher = service(&cluster);

    let jobs: Vec<_> = (0..3)
        .map(|_| JobBuilder::new().scheduled_in(Duration::minutes(5)).build())
        .collect();
    for job in &jobs {
        assert!(matches!(
            dispatcher.schedule_job(job.clone()).await.unwrap(),
            DispatchOutcome::Published { .. }
        ));
    }
    let broken = jobs[1].id;
    cluster.jobs.fail_job(broken);

    let lifecycle = BucketLifecycle::new(cluster.context.clone());
    let outcome = lifecycle.flush_bucket(&bucket, Utc::now()).await.unwrap();
    assert_eq!(outcome.jobs_returned, 2);
    assert!(outcome.failures > 0);
    assert!(!outcome.deleted);
    assert!(cluster.context.buckets().get(TEST_CLUSTER, &bucket.id).await.unwrap().is_some());
    for job in [&jobs[0], &jobs[2]] {
        let stored = cluster.context.jobs().get(TEST_CLUSTER, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::HeldOnMaster);
    }

    // 主存储恢复后下一轮排空退回剩余作业并删除 Bucket
    cluster.jobs.heal_job(broken);
    let outcome = lifecycle.flush_bucket(&bucket, Utc::now()).await.unwrap();
    assert_eq!(outcome.jobs_returned, 1);
    assert_eq!(outcome.failures, 0);
    assert!(outcome.deleted);
    let stored = cluster.context.jobs().get(TEST_CLUSTER, broken).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::HeldOnMaster);
    assert!(stored.assignment.is_none());
}

#[tokio::test]
async fn test_materialized_jobs_are_held_on_master() {
    let cluster = TestCluster::new();
    let now = Utc::now();
    let schedule = ScheduleBuilder::new()
        .every("every 5 seconds")
        .created_at(now)
        .active()
        .build();
    cluster.context.schedules().insert(&schedule).await.unwrap();

    let planner = RecurringPlanner::new(
        cluster.context.clone(),
        RecurringSettings {
            horizon: StdDuration::from_secs(10),
            max_runner_interval: StdDuration::from_secs(5),
        },
    );
    let outcome = planner.materialize(schedule.clone(), now).await.unwrap();
    assert_eq!(
        outcome,
        MaterializeOutcome::Materialized {
            jobs: 2,
            coverage_until: now + Duration::seconds(10),
        }
    );

    let jobs = cluster
        .context
        .jobs()
        .list_pending_by_recurring_schedule(TEST_CLUSTER, schedule.id)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status == JobStatus::HeldOnMaster));

    let stored = cluster.context.schedules().get(TEST_CLUSTER, schedule.id).await.unwrap().unwrap();
    assert_eq!(stored.last_plan_coverage_until, Some(now + Duration::seconds(10)));
    assert!(!stored.has_failed_on_last_plan);

    // 同一窗口再次计划不会产生新作业
    let again = planner.materialize(stored, now).await.unwrap();
    assert!(matches!(again, MaterializeOutcome::CoverageAdvanced { .. }));
}

#[tokio::test]
async fn test_cancelled_schedule_cancels_pending_jobs() {
    let cluster = TestCluster::new();
    let mut schedule = ScheduleBuilder::new().active().build();
    schedule.cancel(Utc::now()).unwrap();
    cluster.context.schedules().insert(&schedule).await.unwrap();

    let pending = JobBuilder::new()
        .held_on_master()
        .for_schedule(schedule.id)
        .scheduled_in(Duration::minutes(1))
        .build();
    cluster.context.jobs().insert(&pending).await.unwrap();

    let scanner = PartitionedScanner::new(
        cluster.context.clone(),
        ScheduleScan::new(
            cluster.context.clone(),
            ScheduleCancellationProcessor::new(service(&cluster)),
        ),
        ScanSettings::default(),
    );
    scanner.tick(Utc::now()).await.unwrap();

    let job = cluster.context.jobs().get(TEST_CLUSTER, pending.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    let stored = cluster.context.schedules().get(TEST_CLUSTER, schedule.id).await.unwrap().unwrap();
    assert!(!stored.is_job_cancellation_pending);
}

fn definition(id: &str, every: &str) -> StaticScheduleDefinition {
    StaticScheduleDefinition {
        definition_id: id.to_string(),
        handler_id: "test-handler".to_string(),
        expression: RecurrenceExpression::interval(every),
        timezone: None,
        payload: json!({"source": "profile"}),
        start_after: None,
        end_before: None,
    }
}

#[tokio::test]
async fn test_static_schedules_are_ensured_idempotently() {
    let cluster = TestCluster::new();
    let keeper = StaticScheduleKeeper::new(service(&cluster));
    let definitions = vec![definition("nightly", "every 1 hours")];

    let first = keeper.ensure("profile-a", &definitions).await.unwrap();
    assert_eq!(first.created, 1);

    let second = keeper.ensure("profile-a", &definitions).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.unchanged, 1);

    let changed = vec![definition("nightly", "every 2 hours")];
    let third = keeper.ensure("profile-a", &changed).await.unwrap();
    assert_eq!(third.updated, 1);

    let stored = cluster
        .context
        .schedules()
        .get_static(TEST_CLUSTER, "profile-a", "nightly")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.expression.text, "every 2 hours");
    assert_eq!(stored.status, RecurringScheduleStatus::Active);
    assert!(stored.has_failed_on_last_plan);
}

#[tokio::test]
async fn test_orphaned_static_schedule_is_deactivated_and_revived() {
    let cluster = TestCluster::new();
    let dispatcher = service(&cluster);
    let keeper = StaticScheduleKeeper::new(dispatcher.clone());
    keeper
        .ensure("profile-a", &[definition("hourly", "every 1 hours")])
        .await
        .unwrap();

    let scanner = PartitionedScanner::new(
        cluster.context.clone(),
        ScheduleScan::new(
            cluster.context.clone(),
            StaticOrphanProcessor::new(dispatcher, StdDuration::from_secs(60)),
        ),
        ScanSettings::default(),
    );
    scanner.tick(Utc::now() + Duration::minutes(5)).await.unwrap();

    let schedules = cluster.context.schedules();
    let orphan = schedules
        .get_static(TEST_CLUSTER, "profile-a", "hourly")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(orphan.status, RecurringScheduleStatus::Inactive);

    let report = keeper
        .ensure("profile-a", &[definition("hourly", "every 1 hours")])
        .await
        .unwrap();
    assert_eq!(report.reactivated, 1);
    let revived = schedules
        .get_static(TEST_CLUSTER, "profile-a", "hourly")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(revived.status, RecurringScheduleStatus::Active);
}

#[tokio::test]
async fn test_retention_purges_only_expired_final_rows() {
    let mut configuration = ClusterConfiguration::new(TEST_CLUSTER);
    configuration.data_retention_ttl_seconds = 3600;
    let cluster = TestCluster::with_configuration(configuration);
    let now = Utc::now();

    let mut expired = JobBuilder::new().build();
    expired.status = JobStatus::Succeeded;
    expired.finished_at = Some(now - Duration::hours(2));
    let mut recent = JobBuilder::new().build();
    recent.status = JobStatus::Failed;
    recent.finished_at = Some(now - Duration::minutes(5));
    let running = JobBuilder::new().held_on_master().build();
    for job in [&expired, &recent, &running] {
        cluster.context.jobs().insert(job).await.unwrap();
    }

    let mut finished = ScheduleBuilder::new().active().build();
    finished.complete(now - Duration::hours(3)).unwrap();
    cluster.context.schedules().insert(&finished).await.unwrap();

    let runner = RetentionRunner::new(cluster.context.clone(), StdDuration::from_secs(60));
    let report = runner.purge(now).await.unwrap();
    assert_eq!(report.jobs, 1);
    assert_eq!(report.schedules, 1);

    let jobs = cluster.context.jobs();
    assert!(jobs.get(TEST_CLUSTER, expired.id).await.unwrap().is_none());
    assert!(jobs.get(TEST_CLUSTER, recent.id).await.unwrap().is_some());
    assert!(jobs.get(TEST_CLUSTER, running.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_stop_request_is_exclusive_per_kind() {
    let cluster = TestCluster::new();
    let locks = cluster.context.locks();

    let token = request_stop(locks, "worker-1", StopKind::Friendly, StdDuration::from_secs(60))
        .await
        .unwrap();
    assert!(token.is_some());
    assert!(request_stop(locks, "worker-1", StopKind::Friendly, StdDuration::from_secs(60))
        .await
        .unwrap()
        .is_none());
    assert!(locks.is_locked("worker-stop:friendly:worker-1").await);
    assert!(!locks.is_locked("worker-stop:immediate:worker-1").await);
}
