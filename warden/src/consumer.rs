//! Result consumer: applies worker results read from a category's result
//! topic to the job store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, warn};

use crate::config::ConsumerConfig;
use crate::dispatch::{Dispatchable, JobContext};
use crate::events::JobEvent;
use crate::failure::classify_failure;
use crate::job::{JobId, JobRecord, JobStatus};
use crate::lease::exhausted_deliveries;
use crate::queue::{Delivery, FetchRequest, WorkQueue, result_topic};
use crate::store::{JobPatch, Transition};

/// Status a worker reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    InProgress,
    Succeeded,
    Failed,
    Timeout,
}

impl ResultStatus {
    pub fn job_status(&self) -> JobStatus {
        match self {
            ResultStatus::InProgress => JobStatus::InProgress,
            ResultStatus::Succeeded => JobStatus::Succeeded,
            ResultStatus::Failed => JobStatus::Failed,
            ResultStatus::Timeout => JobStatus::Timeout,
        }
    }
}

/// A worker's report about one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    #[serde(default)]
    pub parent_job_id: Option<JobId>,
    pub status: ResultStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    /// Ids of every resource the discovery run saw.
    #[serde(default)]
    pub described_resource_ids: Vec<String>,
    #[serde(default)]
    pub described_resource_count: Option<u64>,
    /// Category-specific output, e.g. query rows.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

impl JobResult {
    pub fn new(job_id: JobId, status: ResultStatus) -> Self {
        Self {
            job_id,
            parent_job_id: None,
            status,
            error: None,
            error_code: None,
            described_resource_ids: Vec::new(),
            described_resource_count: None,
            output: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Explicit code, or one inferred from the error text.
    pub fn effective_error_code(&self) -> Option<String> {
        self.error_code
            .clone()
            .filter(|code| !code.is_empty())
            .or_else(|| {
                self.error
                    .as_deref()
                    .and_then(classify_failure)
                    .map(str::to_string)
            })
    }

    /// Failure fields for the row.
    pub fn failure_patch(&self) -> JobPatch {
        let mut patch = JobPatch::default();
        if let Some(error) = self.error.as_deref().filter(|e| !e.is_empty()) {
            patch = patch.failure(error);
        }
        if let Some(code) = self.effective_error_code() {
            patch = patch.error_code(code);
        }
        patch
    }
}

/// Whether applying a result changed anything.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResultOutcome {
    Applied,
    /// The job had already moved on; duplicates land here.
    Ignored,
}

impl ResultOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultOutcome::Applied => "applied",
            ResultOutcome::Ignored => "ignored",
        }
    }
}

/// Guarded status update shared by every category.
///
/// `in_progress` moves a queued job to `in_progress`; a terminal status
/// moves a queued or running job there, merging `extra` into the patch.
pub async fn apply_worker_result(
    ctx: &JobContext,
    job: &JobRecord,
    result: &JobResult,
    extra: JobPatch,
) -> anyhow::Result<ResultOutcome> {
    if result.status == ResultStatus::InProgress {
        let transition =
            Transition::new(job.category, &[JobStatus::Queued], JobStatus::InProgress);
        if ctx.store.transition(job.id, &transition).await? {
            ctx.emit(JobEvent::started(job.id, job.category));
            return Ok(ResultOutcome::Applied);
        }
        return Ok(ResultOutcome::Ignored);
    }

    let to = result.status.job_status();
    let mut patch = if to == JobStatus::Succeeded {
        JobPatch::default()
    } else {
        result.failure_patch()
    };
    patch.spec_fields.extend(extra.spec_fields);
    if extra.failure_message.is_some() {
        patch.failure_message = extra.failure_message;
    }
    if extra.error_code.is_some() {
        patch.error_code = extra.error_code;
    }

    let transition = Transition::new(
        job.category,
        &[JobStatus::Queued, JobStatus::InProgress],
        to,
    )
    .with_patch(patch);
    if ctx.store.transition(job.id, &transition).await? {
        ctx.emit(JobEvent::finished(job.id, job.category, to, job.parent_id));
        Ok(ResultOutcome::Applied)
    } else {
        Ok(ResultOutcome::Ignored)
    }
}

/// Look up the job a result names and hand it to the category handler.
/// Unknown jobs and jobs of another category are ignored.
pub async fn deliver<D: Dispatchable + ?Sized>(
    handler: &D,
    ctx: &JobContext,
    result: &JobResult,
) -> anyhow::Result<ResultOutcome> {
    let Some(job) = ctx.store.get_job(result.job_id).await? else {
        warn!(job_id = %result.job_id, "result for unknown job");
        return Ok(ResultOutcome::Ignored);
    };
    if job.category != handler.category() {
        warn!(
            job_id = %job.id,
            expected = %handler.category(),
            actual = %job.category,
            "result for job of another category"
        );
        return Ok(ResultOutcome::Ignored);
    }
    handler.apply_result(ctx, &job, result).await
}

/// What happened to one delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryOutcome {
    Applied,
    Ignored,
    /// Undecodable; acked and dropped.
    Poison,
    /// Store failure; nak'ed for redelivery.
    Retried,
    /// Redelivery budget used up; acked and dropped.
    Dropped,
}

/// Reads one category's result topic.
pub struct ResultConsumer<D: Dispatchable> {
    handler: Arc<D>,
    ctx: JobContext,
    queue: Arc<dyn WorkQueue>,
    config: ConsumerConfig,
    topic: String,
    consumer_name: String,
}

impl<D: Dispatchable> std::fmt::Debug for ResultConsumer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultConsumer")
            .field("topic", &self.topic)
            .field("consumer_name", &self.consumer_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: Dispatchable> ResultConsumer<D> {
    pub fn new(
        handler: Arc<D>,
        ctx: JobContext,
        queue: Arc<dyn WorkQueue>,
        config: ConsumerConfig,
    ) -> Self {
        let topic = result_topic(handler.category());
        let consumer_name = format!("warden-{}", handler.category());
        Self {
            handler,
            ctx,
            queue,
            config,
            topic,
            consumer_name,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Fetch and process one batch; returns how many deliveries were seen.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let request = FetchRequest {
            topic: self.topic.clone(),
            consumer: self.consumer_name.clone(),
            max_messages: self.config.fetch_batch,
            ack_wait: self.config.ack_wait(),
        };
        let deliveries = self.queue.fetch(&request).await?;
        let count = deliveries.len();
        for delivery in deliveries {
            self.process(&delivery).await;
        }
        Ok(count)
    }

    /// Decode, apply and settle one delivery.
    pub async fn process(&self, delivery: &Delivery) -> DeliveryOutcome {
        let category = self.handler.category();
        let span = crate::telemetry::result_span(category.as_str(), delivery.sequence);

        let outcome = async {
            let result: JobResult = match serde_json::from_slice(&delivery.payload) {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        topic = %delivery.topic,
                        sequence = delivery.sequence,
                        error = %err,
                        "dropping undecodable result"
                    );
                    self.settle_ack(delivery).await;
                    return DeliveryOutcome::Poison;
                }
            };

            match deliver(self.handler.as_ref(), &self.ctx, &result).await {
                Ok(outcome) => {
                    debug!(
                        job_id = %result.job_id,
                        status = ?result.status,
                        outcome = outcome.as_str(),
                        "result processed"
                    );
                    self.settle_ack(delivery).await;
                    match outcome {
                        ResultOutcome::Applied => DeliveryOutcome::Applied,
                        ResultOutcome::Ignored => DeliveryOutcome::Ignored,
                    }
                }
                Err(err) if exhausted_deliveries(delivery.deliveries, &self.config.redelivery) => {
                    warn!(
                        job_id = %result.job_id,
                        deliveries = delivery.deliveries,
                        error = %err,
                        "dropping result after repeated failures"
                    );
                    self.settle_ack(delivery).await;
                    DeliveryOutcome::Dropped
                }
                Err(err) => {
                    warn!(job_id = %result.job_id, error = %err, "failed to apply result");
                    if let Err(nak_err) = self.queue.nak(delivery).await {
                        warn!(error = %nak_err, "nak failed");
                    }
                    DeliveryOutcome::Retried
                }
            }
        }
        .instrument(span)
        .await;

        let label = match outcome {
            DeliveryOutcome::Applied => "applied",
            DeliveryOutcome::Ignored => "ignored",
            DeliveryOutcome::Poison => "poison",
            DeliveryOutcome::Retried => "retried",
            DeliveryOutcome::Dropped => "dropped",
        };
        crate::telemetry::record_result(category, label);
        outcome
    }

    async fn settle_ack(&self, delivery: &Delivery) {
        if let Err(err) = self.queue.ack(delivery).await {
            warn!(topic = %delivery.topic, sequence = delivery.sequence, error = %err, "ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_inferred_when_missing() {
        let result = JobResult::new(JobId(1), ResultStatus::Failed)
            .with_error("operation error: exceeded maximum number of attempts, 3");
        assert_eq!(
            result.effective_error_code().as_deref(),
            Some(crate::failure::RATE_LIMIT_EXCEEDED)
        );

        let mut explicit = result.clone();
        explicit.error_code = Some("AccessDenied".into());
        assert_eq!(explicit.effective_error_code().as_deref(), Some("AccessDenied"));
    }

    #[test]
    fn test_result_decodes_with_defaults() {
        let result: JobResult =
            serde_json::from_str(r#"{"job_id": 5, "status": "succeeded"}"#).unwrap();
        assert_eq!(result.job_id, JobId(5));
        assert!(result.described_resource_ids.is_empty());
        assert_eq!(result.status.job_status(), JobStatus::Succeeded);
    }

    #[test]
    fn test_failure_patch_sanitizes_message() {
        let patch = JobResult::new(JobId(1), ResultStatus::Failed)
            .with_error("bad\0thing")
            .failure_patch();
        assert_eq!(patch.failure_message.as_deref(), Some("badthing"));
        assert!(patch.error_code.is_none());
    }
}
