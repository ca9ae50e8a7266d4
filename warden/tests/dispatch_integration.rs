//! Dispatch loop integration tests: idempotent publishing, governor
//! ceilings, broker recovery, timeouts and retries, against the in-memory
//! store and queue.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use warden::config::{ConsumerConfig, DispatchConfig};
use warden::consumer::{
    DeliveryOutcome, JobResult, ResultConsumer, ResultOutcome, ResultStatus, deliver,
};
use warden::dispatch::{DispatchLoop, WorkerEnvelope};
use warden::failure::RetryPolicy;
use warden::governor::{Ceiling, Governor, GovernorConfig, RateLimitTable};
use warden::handlers::DiscoveryHandler;
use warden::job::{JobCategory, JobId, JobSpec, JobStatus, TriggerType};
use warden::queue::{
    Delivery, FetchRequest, OutboundMessage, QueueError, StreamSpec, WorkQueue,
    discovery_topic, result_topic,
};
use warden::store::JobStore;
use warden::timeouts::{TimeoutConfig, TimeoutSweeper};
use warden_testkit::{
    AWS, EC2_INSTANCE, Harness, InMemoryStore, InMemoryWorkQueue, S3_BUCKET, discovery_job,
};

fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        max_batch: 100,
        randomize: false,
        ..Default::default()
    }
}

fn discovery_loop(h: &Harness, governor: GovernorConfig) -> DispatchLoop<DiscoveryHandler> {
    let handler = Arc::new(DiscoveryHandler::new(h.catalog.clone()));
    let sweeper = TimeoutSweeper::new(Arc::new(h.store.clone()), TimeoutConfig::default());
    DispatchLoop::new(
        handler,
        h.ctx(),
        Arc::new(h.queue.clone()),
        Governor::new(governor),
        sweeper,
        dispatch_config(),
    )
}

async fn create(h: &Harness, integration_id: &str, resource_type: &str) -> JobId {
    h.store
        .create_job(discovery_job(integration_id, resource_type, TriggerType::Scheduled))
        .await
        .unwrap()
        .id
}

fn scheduled_topic() -> String {
    discovery_topic(AWS, TriggerType::Scheduled)
}

#[tokio::test]
async fn test_dispatch_publishes_each_job_once() {
    let h = Harness::new();
    let dispatch = discovery_loop(&h, GovernorConfig::default());
    dispatch.provision().await.unwrap();

    let ids = vec![
        create(&h, "aws-1", S3_BUCKET).await,
        create(&h, "aws-1", EC2_INSTANCE).await,
        create(&h, "aws-2", S3_BUCKET).await,
    ];

    let first = dispatch.run_cycle().await.unwrap();
    assert_eq!(first.fetched, 3);
    assert_eq!(first.queued, 3);
    assert_eq!(first.blocked_by, None);

    let second = dispatch.run_cycle().await.unwrap();
    assert_eq!(second.fetched, 0);
    assert_eq!(second.queued, 0);

    let pending = h.queue.pending(&scheduled_topic());
    assert_eq!(pending.len(), 3);
    let mut seen = HashSet::new();
    for message in &pending {
        let envelope: WorkerEnvelope = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(envelope.category, JobCategory::Discovery);
        assert_eq!(envelope.retry_count, 0);
        assert!(seen.insert(envelope.job_id));
    }

    for id in ids {
        let job = h.store.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.queue_sequence.is_some());
        assert!(job.queued_at.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatchers_never_double_publish() {
    let h = Harness::new();
    let integrations = ["aws-1", "aws-2"];
    let mut expected = 0;
    for integration_id in integrations {
        for resource_type in [S3_BUCKET, EC2_INSTANCE] {
            create(&h, integration_id, resource_type).await;
            expected += 1;
        }
    }

    let first = Arc::new(discovery_loop(&h, GovernorConfig::default()));
    let second = Arc::new(discovery_loop(&h, GovernorConfig::default()));
    first.provision().await.unwrap();

    let a = tokio::spawn({
        let dispatch = Arc::clone(&first);
        async move { dispatch.run_cycle().await.unwrap() }
    });
    let b = tokio::spawn({
        let dispatch = Arc::clone(&second);
        async move { dispatch.run_cycle().await.unwrap() }
    });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!(a.queued + b.queued, expected);
    assert_eq!(h.queue.pending(&scheduled_topic()).len(), expected);
    assert!(
        h.store
            .jobs_in(JobCategory::Discovery)
            .iter()
            .all(|job| job.status == JobStatus::Queued)
    );
}

#[tokio::test]
async fn test_queued_ceiling_truncates_then_blocks() {
    let h = Harness::new();
    let governor = GovernorConfig {
        max_queued: 2,
        ..Default::default()
    };
    let dispatch = discovery_loop(&h, governor);
    dispatch.provision().await.unwrap();

    for integration_id in ["aws-1", "aws-2"] {
        create(&h, integration_id, S3_BUCKET).await;
        create(&h, integration_id, EC2_INSTANCE).await;
    }

    let first = dispatch.run_cycle().await.unwrap();
    assert_eq!(first.queued, 2);
    assert_eq!(first.deferred, 2);
    assert_eq!(first.blocked_by, Some(Ceiling::MaxQueued));

    let second = dispatch.run_cycle().await.unwrap();
    assert_eq!(second.queued, 0);
    assert_eq!(second.deferred, 2);
    assert_eq!(second.blocked_by, Some(Ceiling::MaxQueued));

    let created = h
        .store
        .jobs_in(JobCategory::Discovery)
        .into_iter()
        .filter(|job| job.status == JobStatus::Created)
        .count();
    assert_eq!(created, 2);
}

#[tokio::test]
async fn test_window_ceiling_blocks_publishing() {
    let h = Harness::new();
    let governor = GovernorConfig {
        max_in_window: 1,
        ..Default::default()
    };
    let dispatch = discovery_loop(&h, governor);
    dispatch.provision().await.unwrap();

    create(&h, "aws-1", S3_BUCKET).await;
    create(&h, "aws-2", S3_BUCKET).await;

    let first = dispatch.run_cycle().await.unwrap();
    assert_eq!(first.queued, 1);
    assert_eq!(first.blocked_by, Some(Ceiling::MaxInWindow));

    let second = dispatch.run_cycle().await.unwrap();
    assert_eq!(second.queued, 0);
    assert_eq!(second.blocked_by, Some(Ceiling::MaxInWindow));
}

#[tokio::test]
async fn test_resource_type_cap_counts_running_jobs() {
    let h = Harness::new();
    let governor = GovernorConfig {
        rate_limits: RateLimitTable::with_default(10).with_limit(S3_BUCKET, 1),
        ..Default::default()
    };
    let dispatch = discovery_loop(&h, governor);
    dispatch.provision().await.unwrap();

    let s3_first = create(&h, "aws-1", S3_BUCKET).await;
    let s3_second = create(&h, "aws-2", S3_BUCKET).await;
    let ec2 = create(&h, "aws-1", EC2_INSTANCE).await;

    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.queued, 2);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.blocked_by, None);
    assert_eq!(h.store.job(s3_first).unwrap().status, JobStatus::Queued);
    assert_eq!(h.store.job(s3_second).unwrap().status, JobStatus::Created);
    assert_eq!(h.store.job(ec2).unwrap().status, JobStatus::Queued);

    // Still queued: the cap holds.
    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.queued, 0);
    assert_eq!(report.deferred, 1);

    let outcome = deliver(
        dispatch.handler().as_ref(),
        &h.ctx(),
        &JobResult::new(s3_first, ResultStatus::Succeeded),
    )
    .await
    .unwrap();
    assert_eq!(outcome, ResultOutcome::Applied);

    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.queued, 1);
    assert_eq!(h.store.job(s3_second).unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn test_lost_stream_is_reprovisioned_and_publish_retried() {
    let h = Harness::new();
    let dispatch = discovery_loop(&h, GovernorConfig::default());
    dispatch.provision().await.unwrap();
    h.queue.drop_streams();

    let id = create(&h, "aws-1", S3_BUCKET).await;
    let report = dispatch.run_cycle().await.unwrap();

    assert_eq!(report.queued, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Queued);
    assert!(!h.queue.stream_names().is_empty());
}

#[tokio::test]
async fn test_broker_failure_fails_the_job() {
    let h = Harness::new();
    let dispatch = discovery_loop(&h, GovernorConfig::default());
    dispatch.provision().await.unwrap();
    h.queue.set_unavailable(true);

    let id = create(&h, "aws-1", S3_BUCKET).await;
    let report = dispatch.run_cycle().await.unwrap();

    assert_eq!(report.failed, 1);
    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure_message.unwrap().contains("broker unavailable"));
    assert!(h.queue.published().is_empty());
}

#[tokio::test]
async fn test_disabled_integration_fails_at_prepare() {
    let h = Harness::new();
    let dispatch = discovery_loop(&h, GovernorConfig::default());
    dispatch.provision().await.unwrap();

    let id = create(&h, "aws-3", S3_BUCKET).await;
    let report = dispatch.run_cycle().await.unwrap();

    assert_eq!(report.failed, 1);
    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure_message.unwrap().contains("disabled"));
}

#[tokio::test]
async fn test_integration_type_change_fails_at_prepare() {
    let h = Harness::new();
    let dispatch = discovery_loop(&h, GovernorConfig::default());
    dispatch.provision().await.unwrap();

    let id = create(&h, "aws-1", S3_BUCKET).await;
    h.store.update(id, |job| {
        if let JobSpec::Discovery(spec) = &mut job.spec {
            spec.integration_type = "azure".into();
        }
    });
    let report = dispatch.run_cycle().await.unwrap();

    assert_eq!(report.failed, 1);
    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failure_message.unwrap().contains("changed type"));
    assert!(h.queue.published().is_empty());
}

#[tokio::test]
async fn test_results_are_applied_once() {
    let h = Harness::new();
    let dispatch = discovery_loop(&h, GovernorConfig::default());
    dispatch.provision().await.unwrap();
    let id = create(&h, "aws-1", S3_BUCKET).await;
    dispatch.run_cycle().await.unwrap();

    let consumer = ResultConsumer::new(
        Arc::clone(dispatch.handler()),
        h.ctx(),
        Arc::new(h.queue.clone()),
        ConsumerConfig::default(),
    );
    assert_eq!(consumer.topic(), result_topic(JobCategory::Discovery));

    let mut result = JobResult::new(id, ResultStatus::Succeeded);
    result.described_resource_count = Some(12);
    for attempt in 0..2 {
        h.queue
            .publish(OutboundMessage {
                topic: consumer.topic().to_string(),
                dedupe_key: format!("result-{id}-{attempt}"),
                payload: serde_json::to_vec(&result).unwrap(),
            })
            .await
            .unwrap();
    }
    h.queue
        .publish(OutboundMessage {
            topic: consumer.topic().to_string(),
            dedupe_key: "garbage".into(),
            payload: b"not json".to_vec(),
        })
        .await
        .unwrap();

    let deliveries = h
        .queue
        .fetch(&FetchRequest {
            topic: consumer.topic().to_string(),
            consumer: "test".into(),
            max_messages: 10,
            ack_wait: std::time::Duration::from_secs(30),
        })
        .await
        .unwrap();
    let mut outcomes = Vec::new();
    for delivery in &deliveries {
        outcomes.push(consumer.process(delivery).await);
    }
    assert_eq!(
        outcomes,
        vec![
            DeliveryOutcome::Applied,
            DeliveryOutcome::Ignored,
            DeliveryOutcome::Poison
        ]
    );
    assert!(h.queue.pending(consumer.topic()).is_empty());

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.spec.as_discovery().unwrap().described_resource_count, Some(12));
}

#[tokio::test]
async fn test_poll_once_drains_the_result_topic() {
    let h = Harness::new();
    let dispatch = discovery_loop(&h, GovernorConfig::default());
    dispatch.provision().await.unwrap();
    let id = create(&h, "aws-1", S3_BUCKET).await;
    dispatch.run_cycle().await.unwrap();

    let consumer = ResultConsumer::new(
        Arc::clone(dispatch.handler()),
        h.ctx(),
        Arc::new(h.queue.clone()),
        ConsumerConfig::default(),
    );
    for (n, status) in [ResultStatus::InProgress, ResultStatus::Failed].into_iter().enumerate() {
        let result = JobResult::new(id, status).with_error("AccessDenied");
        h.queue
            .publish(OutboundMessage {
                topic: consumer.topic().to_string(),
                dedupe_key: format!("result-{n}"),
                payload: serde_json::to_vec(&result).unwrap(),
            })
            .await
            .unwrap();
    }

    assert_eq!(consumer.poll_once().await.unwrap(), 2);
    assert_eq!(consumer.poll_once().await.unwrap(), 0);

    let job = h.store.job(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_message.as_deref(), Some("AccessDenied"));
}

#[tokio::test]
async fn test_timeout_is_final() {
    let h = Harness::new();
    let dispatch = discovery_loop(&h, GovernorConfig::default());
    dispatch.provision().await.unwrap();
    let running = create(&h, "aws-1", S3_BUCKET).await;
    let finished = create(&h, "aws-1", EC2_INSTANCE).await;
    dispatch.run_cycle().await.unwrap();

    let handler = dispatch.handler().as_ref();
    let ctx = h.ctx();
    deliver(handler, &ctx, &JobResult::new(running, ResultStatus::InProgress))
        .await
        .unwrap();
    deliver(handler, &ctx, &JobResult::new(finished, ResultStatus::Succeeded))
        .await
        .unwrap();
    h.store.backdate(running, Duration::hours(3));
    h.store.backdate(finished, Duration::hours(3));

    let sweeper = TimeoutSweeper::new(Arc::new(h.store.clone()), TimeoutConfig::default());
    assert_eq!(sweeper.sweep(JobCategory::Discovery).await.unwrap(), 1);

    let swept = h.store.job(running).unwrap();
    assert_eq!(swept.status, JobStatus::Timeout);
    assert_eq!(h.store.job(finished).unwrap().status, JobStatus::Succeeded);

    // A late success does not resurrect the job.
    let late = deliver(handler, &ctx, &JobResult::new(running, ResultStatus::Succeeded))
        .await
        .unwrap();
    assert_eq!(late, ResultOutcome::Ignored);
    assert_eq!(h.store.job(running).unwrap().status, JobStatus::Timeout);
    assert_eq!(sweeper.sweep(JobCategory::Discovery).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_discovery_is_retried_once_after_cooldown() {
    let h = Harness::new();
    let dispatch = discovery_loop(&h, GovernorConfig::default());
    dispatch.provision().await.unwrap();
    let retried = create(&h, "aws-1", S3_BUCKET).await;
    let throttled = create(&h, "aws-2", S3_BUCKET).await;
    dispatch.run_cycle().await.unwrap();

    let handler = dispatch.handler().as_ref();
    let ctx = h.ctx();
    deliver(
        handler,
        &ctx,
        &JobResult::new(retried, ResultStatus::Failed).with_error("worker crashed"),
    )
    .await
    .unwrap();
    deliver(
        handler,
        &ctx,
        &JobResult::new(throttled, ResultStatus::Failed)
            .with_error("operation error: ThrottlingException: Rate exceeded"),
    )
    .await
    .unwrap();
    assert_eq!(
        h.store.job(throttled).unwrap().error_code.as_deref(),
        Some("RateLimitExceeded")
    );

    // Inside the cooldown nothing moves.
    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.queued, 0);

    h.store.backdate(retried, Duration::minutes(10));
    h.store.backdate(throttled, Duration::minutes(10));
    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.queued, 1);

    let job = h.store.job(retried).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.failure_message, None);
    assert_eq!(h.store.job(throttled).unwrap().status, JobStatus::Failed);
    assert!(
        h.queue
            .pending(&scheduled_topic())
            .iter()
            .any(|message| message.dedupe_key == format!("describe-{retried}-1"))
    );

    // The retry budget is spent.
    deliver(
        handler,
        &ctx,
        &JobResult::new(retried, ResultStatus::Failed).with_error("worker crashed"),
    )
    .await
    .unwrap();
    h.store.backdate(retried, Duration::minutes(10));
    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.queued, 0);
    assert_eq!(h.store.job(retried).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_retry_skips_discovery_replaced_by_a_newer_job() {
    let h = Harness::new();
    let rule = RetryPolicy::for_category(JobCategory::Discovery).rule(JobCategory::Discovery);

    let failed = create(&h, "aws-1", S3_BUCKET).await;
    h.store.update(failed, |job| job.status = JobStatus::Failed);
    h.store.backdate(failed, Duration::minutes(10));
    let replacement = create(&h, "aws-1", S3_BUCKET).await;
    assert_ne!(failed, replacement);

    assert_eq!(h.store.requeue_failed(&rule).await.unwrap(), 0);
    assert_eq!(h.store.job(failed).unwrap().status, JobStatus::Failed);
    let active: Vec<JobId> = h
        .store
        .jobs_in(JobCategory::Discovery)
        .into_iter()
        .filter(|job| JobStatus::ACTIVE.contains(&job.status))
        .map(|job| job.id)
        .collect();
    assert_eq!(active, vec![replacement]);

    // A newer row that already finished still outranks the old failure.
    h.store.update(replacement, |job| job.status = JobStatus::Succeeded);
    assert_eq!(h.store.requeue_failed(&rule).await.unwrap(), 0);

    // Two failures for one pair: only the newest comes back.
    h.store.update(replacement, |job| job.status = JobStatus::Failed);
    h.store.backdate(replacement, Duration::minutes(10));
    assert_eq!(h.store.requeue_failed(&rule).await.unwrap(), 1);
    assert_eq!(h.store.job(failed).unwrap().status, JobStatus::Failed);
    assert_eq!(h.store.job(replacement).unwrap().status, JobStatus::Created);
}

/// Queue that cancels the job while its message is being published, and
/// optionally goes down right after.
#[derive(Debug)]
struct CancelDuringPublish {
    inner: InMemoryWorkQueue,
    store: InMemoryStore,
    fail_after_publish: bool,
}

#[async_trait]
impl WorkQueue for CancelDuringPublish {
    async fn ensure_streams(&self, streams: &[StreamSpec]) -> Result<(), QueueError> {
        self.inner.ensure_streams(streams).await
    }

    async fn publish(&self, message: OutboundMessage) -> Result<u64, QueueError> {
        let envelope: WorkerEnvelope = serde_json::from_slice(&message.payload).unwrap();
        let sequence = self.inner.publish(message).await?;
        self.store
            .update(envelope.job_id, |job| job.status = JobStatus::Canceled);
        if self.fail_after_publish {
            self.inner.set_unavailable(true);
        }
        Ok(sequence)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Delivery>, QueueError> {
        self.inner.fetch(request).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.ack(delivery).await
    }

    async fn nak(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner.nak(delivery).await
    }

    async fn delete_message(&self, topic: &str, sequence: u64) -> Result<bool, QueueError> {
        self.inner.delete_message(topic, sequence).await
    }

    async fn depth(&self, topic: &str) -> Result<u64, QueueError> {
        self.inner.depth(topic).await
    }

    async fn purge_settled(&self, retention: std::time::Duration) -> Result<u64, QueueError> {
        self.inner.purge_settled(retention).await
    }
}

async fn publish_while_canceling(fail_after_publish: bool) -> (Harness, JobId) {
    let h = Harness::new();
    let queue = CancelDuringPublish {
        inner: h.queue.clone(),
        store: h.store.clone(),
        fail_after_publish,
    };
    let dispatch = DispatchLoop::new(
        Arc::new(DiscoveryHandler::new(h.catalog.clone())),
        h.ctx(),
        Arc::new(queue),
        Governor::default(),
        TimeoutSweeper::new(Arc::new(h.store.clone()), TimeoutConfig::default()),
        dispatch_config(),
    );
    dispatch.provision().await.unwrap();
    let id = create(&h, "aws-1", S3_BUCKET).await;

    let report = dispatch.run_cycle().await.unwrap();
    assert_eq!(report.queued, 0);
    assert_eq!(h.store.job(id).unwrap().status, JobStatus::Canceled);
    (h, id)
}

#[tokio::test]
async fn test_message_of_a_job_canceled_mid_publish_is_withdrawn() {
    let (h, _) = publish_while_canceling(false).await;
    assert!(h.queue.pending(&scheduled_topic()).is_empty());
}

#[tokio::test]
async fn test_failed_withdrawal_does_not_abort_the_cycle() {
    let (h, id) = publish_while_canceling(true).await;
    let pending = h.queue.pending(&scheduled_topic());
    assert_eq!(pending.len(), 1);
    let envelope: WorkerEnvelope = serde_json::from_slice(&pending[0].payload).unwrap();
    assert_eq!(envelope.job_id, id);
}

#[tokio::test]
async fn test_maintenance_purges_settled_messages() {
    let h = Harness::new();
    let dispatch = DispatchLoop::new(
        Arc::new(DiscoveryHandler::new(h.catalog.clone())),
        h.ctx(),
        Arc::new(h.queue.clone()),
        Governor::default(),
        TimeoutSweeper::new(Arc::new(h.store.clone()), TimeoutConfig::default()),
        DispatchConfig {
            queue_retention_secs: 0,
            ..dispatch_config()
        },
    );
    dispatch.provision().await.unwrap();
    create(&h, "aws-1", S3_BUCKET).await;
    create(&h, "aws-1", EC2_INSTANCE).await;
    assert_eq!(dispatch.run_cycle().await.unwrap().queued, 2);

    let deliveries = h
        .queue
        .fetch(&FetchRequest {
            topic: scheduled_topic(),
            consumer: "worker".into(),
            max_messages: 1,
            ack_wait: std::time::Duration::from_secs(30),
        })
        .await
        .unwrap();
    h.queue.ack(&deliveries[0]).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    dispatch.maintain().await;
    let remaining = h.queue.published();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].sequence, deliveries[0].sequence);
}
