//! The dispatch loop: moves `created` jobs of one category onto the work
//! queue, subject to the governor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info, warn};

use crate::config::DispatchConfig;
use crate::consumer::{JobResult, ResultOutcome, apply_worker_result};
use crate::events::{InProcEventBus, JobEvent};
use crate::failure::RetryPolicy;
use crate::governor::{Ceiling, Governor, GovernorDecision, GovernorSnapshot};
use crate::job::{JobCategory, JobId, JobRecord, JobStatus, TriggerType};
use crate::queue::{
    OutboundMessage, QueueError, StreamSpec, WorkQueue, discovery_topic, job_topic,
};
use crate::store::{JobPatch, JobStore, Transition};
use crate::timeouts::TimeoutSweeper;

/// Store and event handles shared by the code paths that act on jobs.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn JobStore>,
    pub events: Option<InProcEventBus>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            events: None,
        }
    }

    pub fn with_events(mut self, events: InProcEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            let _ = events.publish(event);
        }
    }
}

/// A message ready for the queue: where it goes and what the worker gets.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedJob {
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Envelope around every job payload published to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    pub job_id: JobId,
    pub category: JobCategory,
    pub retry_count: u32,
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<JobId>,
    pub payload: serde_json::Value,
}

impl WorkerEnvelope {
    pub fn new(job: &JobRecord, payload: serde_json::Value) -> Self {
        Self {
            job_id: job.id,
            category: job.category,
            retry_count: job.retry_count,
            trigger_type: job.trigger_type,
            parent_job_id: job.parent_id,
            payload,
        }
    }
}

/// What a job category needs to provide to be dispatched and to have its
/// results applied.
#[async_trait]
pub trait Dispatchable: Send + Sync {
    fn category(&self) -> JobCategory;

    /// Per-type bucket the governor caps; `None` means only the global
    /// ceilings apply.
    fn workload_key(&self, _job: &JobRecord) -> Option<String> {
        None
    }

    /// Active jobs per workload key.
    async fn running_workloads(
        &self,
        _store: &dyn JobStore,
    ) -> anyhow::Result<HashMap<String, u64>> {
        Ok(HashMap::new())
    }

    /// Streams this category publishes to or consumes from.
    async fn streams(&self) -> anyhow::Result<Vec<StreamSpec>> {
        Ok(vec![StreamSpec::for_category(self.category())])
    }

    /// Build the worker payload and pick the topic.
    async fn prepare(&self, job: &JobRecord) -> anyhow::Result<PreparedJob>;

    /// Apply a decoded worker result to the job it names.
    async fn apply_result(
        &self,
        ctx: &JobContext,
        job: &JobRecord,
        result: &JobResult,
    ) -> anyhow::Result<ResultOutcome> {
        apply_worker_result(ctx, job, result, JobPatch::default()).await
    }

    /// Category-specific housekeeping run at the start of each cycle.
    async fn maintain(&self, _ctx: &JobContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Default topic for categories routed by category alone.
pub fn default_topic(job: &JobRecord) -> String {
    job_topic(job.category, job.trigger_type)
}

/// Topic a queued job's message sits on.
pub fn published_topic(job: &JobRecord) -> String {
    match job.spec.as_discovery() {
        Some(spec) => discovery_topic(&spec.integration_type, job.trigger_type),
        None => default_topic(job),
    }
}

/// Counts from one dispatch cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub queued: usize,
    pub deferred: usize,
    pub failed: usize,
    /// Publishes that only succeeded after re-provisioning streams.
    pub retried: usize,
    pub blocked_by: Option<Ceiling>,
}

enum PublishOutcome {
    Queued { retried: bool },
    Failed,
    /// The job left `created` while we were publishing.
    Lost,
}

/// Periodic publisher for one category.
pub struct DispatchLoop<D: Dispatchable> {
    handler: Arc<D>,
    ctx: JobContext,
    queue: Arc<dyn WorkQueue>,
    governor: Governor,
    sweeper: TimeoutSweeper,
    retry: RetryPolicy,
    config: DispatchConfig,
}

impl<D: Dispatchable> std::fmt::Debug for DispatchLoop<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchLoop")
            .field("category", &self.handler.category())
            .field("governor", &self.governor)
            .field("retry", &self.retry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: Dispatchable> DispatchLoop<D> {
    pub fn new(
        handler: Arc<D>,
        ctx: JobContext,
        queue: Arc<dyn WorkQueue>,
        governor: Governor,
        sweeper: TimeoutSweeper,
        config: DispatchConfig,
    ) -> Self {
        let retry = RetryPolicy::for_category(handler.category());
        Self {
            handler,
            ctx,
            queue,
            governor,
            sweeper,
            retry,
            config,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn category(&self) -> JobCategory {
        self.handler.category()
    }

    pub fn handler(&self) -> &Arc<D> {
        &self.handler
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Create every stream the category needs.
    pub async fn provision(&self) -> anyhow::Result<()> {
        let streams = self.handler.streams().await?;
        self.queue.ensure_streams(&streams).await?;
        Ok(())
    }

    /// Sweep, retry and category maintenance. Failures are logged; the
    /// publish phase still runs.
    pub async fn maintain(&self) {
        let category = self.category();
        if let Err(err) = self.sweeper.sweep(category).await {
            warn!(category = %category, error = %err, "timeout sweep failed");
        }
        if self.retry.is_enabled() {
            match self.ctx.store.requeue_failed(&self.retry.rule(category)).await
            {
                Ok(0) => {}
                Ok(count) => {
                    info!(category = %category, count, "failed jobs requeued");
                }
                Err(err) => {
                    warn!(category = %category, error = %err, "retry sweep failed");
                }
            }
        }
        if let Err(err) = self.handler.maintain(&self.ctx).await {
            warn!(category = %category, error = %err, "category maintenance failed");
        }
        if let Err(err) = self.queue.purge_settled(self.config.queue_retention()).await {
            warn!(error = %err, "queue purge failed");
        }
    }

    /// One full cycle: maintenance, then publish what the governor admits.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let category = self.category();
        let span = crate::telemetry::dispatch_span(category.as_str());
        let started = Instant::now();

        let report = async {
            self.maintain().await;
            self.publish_created().await
        }
        .instrument(span)
        .await;

        crate::telemetry::observe_cycle(category, started.elapsed());
        report
    }

    async fn publish_created(&self) -> anyhow::Result<CycleReport> {
        let category = self.category();
        let store = &self.ctx.store;
        let mut report = CycleReport::default();

        let candidates = store
            .fetch_created(category, self.config.max_batch, self.config.randomize)
            .await?;
        report.fetched = candidates.len();

        let queued = store.count_in_status(category, &[JobStatus::Queued]).await?;
        crate::telemetry::set_jobs_queued(category, queued);

        if candidates.is_empty() {
            crate::telemetry::set_publishing_blocked(category, None);
            return Ok(report);
        }

        let since = Utc::now() - self.governor.config().window();
        let snapshot = GovernorSnapshot {
            queued,
            queued_in_window: store.count_queued_since(category, since).await?,
            running: self.handler.running_workloads(store.as_ref()).await?,
        };

        let handler = Arc::clone(&self.handler);
        let decision = self.governor.plan(category, candidates, &snapshot, |job| {
            handler.workload_key(job)
        });
        crate::telemetry::set_publishing_blocked(category, decision.blocked_by());
        report.blocked_by = decision.blocked_by();

        let admitted = match decision {
            GovernorDecision::Blocked { .. } => {
                report.deferred = report.fetched;
                crate::telemetry::record_dispatched(
                    category,
                    "deferred",
                    report.deferred as u64,
                );
                return Ok(report);
            }
            GovernorDecision::Admit {
                admitted, deferred, ..
            } => {
                report.deferred = deferred.len();
                admitted
            }
        };

        let concurrency = admitted.len().max(1);
        let outcomes: Vec<PublishOutcome> = futures::stream::iter(admitted)
            .map(|job| self.publish_job(job))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                PublishOutcome::Queued { retried } => {
                    report.queued += 1;
                    if retried {
                        report.retried += 1;
                    }
                }
                PublishOutcome::Failed => report.failed += 1,
                PublishOutcome::Lost => {}
            }
        }

        crate::telemetry::record_dispatched(category, "queued", report.queued as u64);
        crate::telemetry::record_dispatched(category, "deferred", report.deferred as u64);
        crate::telemetry::record_dispatched(category, "failed", report.failed as u64);
        crate::telemetry::record_dispatched(category, "retried", report.retried as u64);
        if report.queued > 0 || report.failed > 0 {
            info!(
                category = %category,
                queued = report.queued,
                deferred = report.deferred,
                failed = report.failed,
                "dispatch cycle complete"
            );
        }
        Ok(report)
    }

    async fn publish_job(&self, job: JobRecord) -> PublishOutcome {
        let prepared = match self.handler.prepare(&job).await {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(job_id = %job.id, category = %job.category, error = %err, "failed to build job payload");
                return self.fail(&job, &format!("{err:#}")).await;
            }
        };

        let envelope = WorkerEnvelope::new(&job, prepared.payload);
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(err) => return self.fail(&job, &err.to_string()).await,
        };
        let message = OutboundMessage {
            topic: prepared.topic,
            dedupe_key: job.dedupe_key(),
            payload,
        };

        let (sequence, retried) = match self.queue.publish(message.clone()).await {
            Ok(sequence) => (sequence, false),
            Err(err) if err.is_recoverable() => {
                warn!(
                    job_id = %job.id,
                    topic = %message.topic,
                    error = %err,
                    "publish failed, re-provisioning streams"
                );
                if let Err(provision_err) = self.provision().await {
                    warn!(error = %provision_err, "stream provisioning failed");
                }
                match self.queue.publish(message.clone()).await {
                    Ok(sequence) => (sequence, true),
                    Err(err) => return self.fail_publish(&job, err).await,
                }
            }
            Err(err) => return self.fail_publish(&job, err).await,
        };

        match self.ctx.store.mark_queued(job.id, sequence).await {
            Ok(true) => {
                debug!(job_id = %job.id, topic = %message.topic, sequence, "job queued");
                self.ctx.emit(JobEvent::queued(job.id, job.category, sequence));
                PublishOutcome::Queued { retried }
            }
            Ok(false) => {
                // The dedupe window hands a concurrent publisher the same
                // sequence; only a canceled or swept job gets its message
                // pulled back.
                let queued_elsewhere = matches!(
                    self.ctx.store.get_job(job.id).await,
                    Ok(Some(current)) if current.queue_sequence == Some(sequence)
                );
                if !queued_elsewhere
                    && let Err(err) = self.queue.delete_message(&message.topic, sequence).await
                {
                    warn!(
                        job_id = %job.id,
                        topic = %message.topic,
                        sequence,
                        error = %err,
                        "failed to withdraw message for a job that moved on"
                    );
                }
                PublishOutcome::Lost
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "failed to mark job queued");
                PublishOutcome::Lost
            }
        }
    }

    async fn fail_publish(&self, job: &JobRecord, err: QueueError) -> PublishOutcome {
        warn!(job_id = %job.id, category = %job.category, error = %err, "publish failed");
        self.fail(job, &err.to_string()).await
    }

    async fn fail(&self, job: &JobRecord, message: &str) -> PublishOutcome {
        let transition =
            Transition::new(job.category, &[JobStatus::Created], JobStatus::Failed)
                .with_patch(JobPatch::default().failure(message));
        match self.ctx.store.transition(job.id, &transition).await {
            Ok(true) => PublishOutcome::Failed,
            Ok(false) => PublishOutcome::Lost,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "failed to mark job failed");
                PublishOutcome::Lost
            }
        }
    }
}
