//! Compliance parent jobs.
//!
//! A compliance job never reaches the work queue. It fans out into one
//! runner per (control, integration), waits for them, then hands off to a
//! single summarizer:
//!
//! ```text
//! created -> runners_in_progress -> summarizer_in_progress -> succeeded
//!                                                          \-> failed
//! ```
//!
//! Each step starts with a guarded transition, so when several callers
//! (the poll loop and the event observer) race, exactly one of them creates
//! the runners or the summarizer.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::catalog::{ControlCatalog, benchmark_controls};
use crate::config::ComplianceConfig;
use crate::dispatch::JobContext;
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::failure::RetryPolicy;
use crate::job::{
    ComplianceSpec, JobCategory, JobId, JobRecord, JobSpec, JobStatus, NewJob,
    RunnerSpec, SummarizerSpec,
};
use crate::runtime::ShutdownToken;
use crate::store::{JobFilter, JobPatch, Transition};
use crate::timeouts::TimeoutSweeper;

/// How long a parent may sit in `summarizer_in_progress` without a
/// summarizer before another caller creates it.
const SUMMARIZER_GRACE_SECS: i64 = 120;

/// What one pass over a parent did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Advance {
    Unchanged,
    RunnersCreated(usize),
    SummarizerCreated(JobId),
    Finished(JobStatus),
}

#[derive(Clone)]
pub struct ComplianceCoordinator {
    ctx: JobContext,
    catalog: Arc<dyn ControlCatalog>,
    config: ComplianceConfig,
    sweeper: Option<TimeoutSweeper>,
    runner_retry: RetryPolicy,
}

impl std::fmt::Debug for ComplianceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ComplianceCoordinator {
    pub fn new(
        ctx: JobContext,
        catalog: Arc<dyn ControlCatalog>,
        config: ComplianceConfig,
    ) -> Self {
        Self {
            ctx,
            catalog,
            config,
            sweeper: None,
            runner_retry: RetryPolicy::for_category(JobCategory::ComplianceRunner),
        }
    }

    /// Must match the policy the runner dispatch loop retries with, or
    /// summaries start before retried runners report.
    pub fn with_runner_retry(mut self, retry: RetryPolicy) -> Self {
        self.runner_retry = retry;
        self
    }

    /// Compliance parents never pass through a dispatch loop, so their
    /// timeouts are swept here.
    pub fn with_sweeper(mut self, sweeper: TimeoutSweeper) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    pub fn config(&self) -> &ComplianceConfig {
        &self.config
    }

    /// Runner jobs for a compliance spec: one per control with a query and
    /// integration, each carrying every benchmark path to its control.
    pub async fn plan_runners(
        &self,
        spec: &ComplianceSpec,
    ) -> anyhow::Result<Vec<RunnerSpec>> {
        let controls =
            benchmark_controls(self.catalog.as_ref(), &spec.benchmark_id).await?;
        let mut runners = Vec::new();
        for (control_id, ancestry) in controls {
            let Some(control) = self.catalog.get_control(&control_id).await? else {
                warn!(control_id = %control_id, "control listed by benchmark not found");
                continue;
            };
            let Some(query_id) = control.query_id else {
                continue;
            };
            for integration_id in &spec.integration_ids {
                runners.push(RunnerSpec {
                    benchmark_id: spec.benchmark_id.clone(),
                    control_id: control_id.clone(),
                    query_id: query_id.clone(),
                    integration_id: integration_id.clone(),
                    ancestry: ancestry.clone(),
                });
            }
        }
        Ok(runners)
    }

    /// Move one parent forward as far as its children allow.
    pub async fn advance(&self, parent_id: JobId) -> anyhow::Result<Advance> {
        let Some(parent) = self.ctx.store.get_job(parent_id).await? else {
            return Ok(Advance::Unchanged);
        };
        if parent.category != JobCategory::Compliance {
            return Ok(Advance::Unchanged);
        }
        match parent.status {
            JobStatus::Created => self.start_runners(&parent).await,
            JobStatus::RunnersInProgress => self.start_summarizer(&parent).await,
            JobStatus::SummarizerInProgress => self.finish(&parent).await,
            _ => Ok(Advance::Unchanged),
        }
    }

    async fn start_runners(&self, parent: &JobRecord) -> anyhow::Result<Advance> {
        let JobSpec::Compliance(spec) = &parent.spec else {
            anyhow::bail!("job {} is not a compliance job", parent.id);
        };
        let claim = Transition::new(
            JobCategory::Compliance,
            &[JobStatus::Created],
            JobStatus::RunnersInProgress,
        );
        if !self.ctx.store.transition(parent.id, &claim).await? {
            return Ok(Advance::Unchanged);
        }

        let planned = match self.plan_runners(spec).await {
            Ok(planned) => planned,
            Err(err) => return self.fail(parent, &format!("{err:#}")).await,
        };
        let jobs: Vec<NewJob> = planned
            .into_iter()
            .map(|runner| {
                NewJob::new(JobSpec::ComplianceRunner(runner), parent.trigger_type)
                    .created_by(parent.created_by.clone())
                    .with_parent(parent.id)
            })
            .collect();
        let count = jobs.len();
        if let Err(err) = self.ctx.store.create_jobs(jobs).await {
            return self.fail(parent, &format!("creating runners: {err:#}")).await;
        }
        info!(job_id = %parent.id, benchmark_id = %spec.benchmark_id, runners = count, "compliance runners created");
        Ok(Advance::RunnersCreated(count))
    }

    async fn start_summarizer(&self, parent: &JobRecord) -> anyhow::Result<Advance> {
        let pending = self
            .ctx
            .store
            .count_pending_children(parent.id, JobCategory::ComplianceRunner)
            .await?;
        if pending > 0 || self.awaiting_runner_retry(parent.id).await? {
            return Ok(Advance::Unchanged);
        }
        let claim = Transition::new(
            JobCategory::Compliance,
            &[JobStatus::RunnersInProgress],
            JobStatus::SummarizerInProgress,
        );
        if !self.ctx.store.transition(parent.id, &claim).await? {
            return Ok(Advance::Unchanged);
        }
        self.create_summarizer(parent).await
    }

    /// A failed runner the retry sweep will bring back counts as pending.
    async fn awaiting_runner_retry(&self, parent: JobId) -> anyhow::Result<bool> {
        if !self.runner_retry.is_enabled() {
            return Ok(false);
        }
        let rule = self.runner_retry.rule(JobCategory::ComplianceRunner);
        let filter = JobFilter {
            parent_id: Some(parent),
            statuses: rule.statuses.clone(),
            ..JobFilter::category(JobCategory::ComplianceRunner)
        };
        let ended = self.ctx.store.list_jobs(&filter).await?.jobs;
        Ok(ended.iter().any(|runner| rule.retryable(runner)))
    }

    async fn create_summarizer(&self, parent: &JobRecord) -> anyhow::Result<Advance> {
        let benchmark_id = parent.spec.benchmark_id().unwrap_or_default().to_string();
        let summarizer = self
            .ctx
            .store
            .create_job(
                NewJob::new(
                    JobSpec::ComplianceSummarizer(SummarizerSpec { benchmark_id }),
                    parent.trigger_type,
                )
                .created_by(parent.created_by.clone())
                .with_parent(parent.id),
            )
            .await?;
        info!(job_id = %parent.id, summarizer_id = %summarizer.id, "summarizer created");
        Ok(Advance::SummarizerCreated(summarizer.id))
    }

    async fn finish(&self, parent: &JobRecord) -> anyhow::Result<Advance> {
        let filter = JobFilter {
            parent_id: Some(parent.id),
            ..JobFilter::category(JobCategory::ComplianceSummarizer)
        };
        let summarizers = self.ctx.store.list_jobs(&filter).await?.jobs;
        // Lost between the claim and the insert. The claimant may still be
        // inserting, so only step in once the claim has aged.
        if summarizers.is_empty() {
            if Utc::now() - parent.updated_at < Duration::seconds(SUMMARIZER_GRACE_SECS) {
                return Ok(Advance::Unchanged);
            }
            return self.create_summarizer(parent).await;
        }
        if summarizers.iter().any(|s| !s.is_terminal()) {
            return Ok(Advance::Unchanged);
        }

        let succeeded = summarizers.iter().any(|s| s.status == JobStatus::Succeeded);
        let (to, patch) = if succeeded {
            (JobStatus::Succeeded, JobPatch::default())
        } else {
            let last = summarizers.iter().max_by_key(|s| s.id);
            let reason = last
                .and_then(|s| s.failure_message.clone())
                .unwrap_or_else(|| {
                    format!(
                        "summarizer ended {}",
                        last.map(|s| s.status).unwrap_or(JobStatus::Failed)
                    )
                });
            (JobStatus::Failed, JobPatch::default().failure(reason))
        };
        let transition = Transition::new(
            JobCategory::Compliance,
            &[JobStatus::SummarizerInProgress],
            to,
        )
        .with_patch(patch);
        if self.ctx.store.transition(parent.id, &transition).await? {
            self.ctx
                .emit(JobEvent::finished(parent.id, parent.category, to, parent.parent_id));
            info!(job_id = %parent.id, status = %to, "compliance job finished");
            return Ok(Advance::Finished(to));
        }
        Ok(Advance::Unchanged)
    }

    async fn fail(&self, parent: &JobRecord, message: &str) -> anyhow::Result<Advance> {
        warn!(job_id = %parent.id, error = message, "compliance job failed");
        let transition = Transition::new(
            JobCategory::Compliance,
            &[JobStatus::RunnersInProgress],
            JobStatus::Failed,
        )
        .with_patch(JobPatch::default().failure(message));
        if self.ctx.store.transition(parent.id, &transition).await? {
            self.ctx.emit(JobEvent::finished(
                parent.id,
                parent.category,
                JobStatus::Failed,
                parent.parent_id,
            ));
        }
        Ok(Advance::Finished(JobStatus::Failed))
    }

    /// Sweep timed out parents, then advance every non-terminal parent
    /// once.
    pub async fn run_cycle(&self) -> anyhow::Result<usize> {
        if let Some(sweeper) = &self.sweeper
            && let Err(err) = sweeper.sweep(JobCategory::Compliance).await
        {
            warn!(error = %err, "compliance timeout sweep failed");
        }
        let filter = JobFilter {
            statuses: vec![
                JobStatus::Created,
                JobStatus::RunnersInProgress,
                JobStatus::SummarizerInProgress,
            ],
            limit: Some(self.config.batch as u64),
            ..JobFilter::category(JobCategory::Compliance)
        };
        let parents = self.ctx.store.list_jobs(&filter).await?.jobs;
        let mut advanced = 0;
        for parent in parents {
            match self.advance(parent.id).await {
                Ok(Advance::Unchanged) => {}
                Ok(_) => advanced += 1,
                Err(err) => {
                    warn!(job_id = %parent.id, error = %err, "failed to advance compliance job");
                }
            }
        }
        Ok(advanced)
    }

    /// React to runner and summarizer completions without waiting for the
    /// next poll.
    pub async fn observe(self, events: InProcEventBus, shutdown: ShutdownToken) {
        let mut rx = events.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => {
                        if let JobEventPayload::Finished {
                            category: JobCategory::ComplianceRunner | JobCategory::ComplianceSummarizer,
                            parent_id: Some(parent_id),
                            ..
                        } = event.payload
                            && let Err(err) = self.advance(parent_id).await
                        {
                            warn!(job_id = %parent_id, error = %err, "failed to advance compliance job");
                        }
                    }
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "compliance observer lagged; relying on poll");
                    }
                }
            }
        }
    }
}
