//! Launches a follow-up job once every job it depends on has settled.
//!
//! A dependency is settled when it is terminal. A discovery job that
//! succeeded recently must also have most of what it described visible in
//! the resource index, so the follow-up evaluates fresh data.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info, warn};

use crate::compliance::ComplianceCoordinator;
use crate::config::SequencerConfig;
use crate::dispatch::JobContext;
use crate::events::JobEvent;
use crate::index::ResourceIndex;
use crate::job::{JobCategory, JobId, JobRecord, JobSpec, JobStatus, NewJob, TriggerType};
use crate::store::{JobSequencer, NewSequencer, WorkflowStore};

/// The job a sequencer creates, stored as its `next_job_parameters`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencedJob {
    pub spec: JobSpec,
    pub trigger_type: TriggerType,
    pub created_by: String,
}

impl SequencedJob {
    pub fn new(spec: JobSpec, trigger_type: TriggerType) -> Self {
        Self {
            spec,
            trigger_type,
            created_by: "JobSequencer".to_string(),
        }
    }

    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = who.into();
        self
    }
}

/// What one evaluation of a sequencer row did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SequencerOutcome {
    Waiting,
    Finished(Vec<JobId>),
    Failed(String),
}

#[derive(Clone)]
pub struct JobSequencerService {
    ctx: JobContext,
    workflows: Arc<dyn WorkflowStore>,
    index: Option<Arc<dyn ResourceIndex>>,
    coordinator: Option<ComplianceCoordinator>,
    config: SequencerConfig,
}

impl std::fmt::Debug for JobSequencerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSequencerService")
            .field("config", &self.config)
            .field("has_index", &self.index.is_some())
            .finish_non_exhaustive()
    }
}

impl JobSequencerService {
    pub fn new(
        ctx: JobContext,
        workflows: Arc<dyn WorkflowStore>,
        config: SequencerConfig,
    ) -> Self {
        Self {
            ctx,
            workflows,
            index: None,
            coordinator: None,
            config,
        }
    }

    /// Without an index the consistency check is skipped.
    pub fn with_index(mut self, index: Arc<dyn ResourceIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Fan compliance parents out into runners as soon as they are created.
    pub fn with_coordinator(mut self, coordinator: ComplianceCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Register a job to be created once `dependencies` settle.
    pub async fn enqueue(
        &self,
        dependency_source: JobCategory,
        dependencies: Vec<JobId>,
        next: SequencedJob,
    ) -> anyhow::Result<JobSequencer> {
        let sequencer = self
            .workflows
            .create_sequencer(NewSequencer {
                dependency_source,
                next_job: next.spec.category(),
                dependency_list: dependencies,
                next_job_parameters: serde_json::to_value(&next)?,
            })
            .await?;
        info!(
            sequencer_id = sequencer.id,
            dependencies = sequencer.dependency_list.len(),
            next_job = %sequencer.next_job,
            "sequencer created"
        );
        Ok(sequencer)
    }

    /// Whether one dependency no longer holds up the follow-up.
    pub async fn is_settled(&self, job: &JobRecord) -> anyhow::Result<bool> {
        if !job.is_terminal() {
            return Ok(false);
        }
        let Some(index) = &self.index else {
            return Ok(true);
        };
        let Some(spec) = job.spec.as_discovery() else {
            return Ok(true);
        };
        let skip_after = Duration::hours(self.config.consistency_skip_after_hours);
        if job.status != JobStatus::Succeeded || Utc::now() - job.created_at > skip_after {
            return Ok(true);
        }

        let described = spec.described_resource_count.unwrap_or(0);
        if described == 0 {
            return Ok(true);
        }
        let indexed = index
            .count_resources_for_job(&spec.resource_type, job.id)
            .await?;
        let settled = indexed as f64 >= self.config.consistency_threshold * described as f64;
        if !settled {
            debug!(
                job_id = %job.id,
                indexed,
                described,
                "discovery results not yet indexed"
            );
        }
        Ok(settled)
    }

    /// Evaluate one row and, when every dependency has settled, create its
    /// follow-up. Errors fail the row.
    pub async fn evaluate(&self, sequencer: &JobSequencer) -> anyhow::Result<SequencerOutcome> {
        let span = crate::telemetry::sequencer_span(sequencer.id);
        async {
            match self.try_launch(sequencer).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(error = %message, "sequencer failed");
                    self.workflows.fail_sequencer(sequencer.id, &message).await?;
                    Ok(SequencerOutcome::Failed(message))
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_launch(&self, sequencer: &JobSequencer) -> anyhow::Result<SequencerOutcome> {
        let jobs = self.ctx.store.get_jobs(&sequencer.dependency_list).await?;
        for id in &sequencer.dependency_list {
            if !jobs.iter().any(|job| job.id == *id) {
                anyhow::bail!("dependency job {id} not found");
            }
        }
        for job in &jobs {
            if !self.is_settled(job).await? {
                return Ok(SequencerOutcome::Waiting);
            }
        }

        let next: SequencedJob =
            serde_json::from_value(sequencer.next_job_parameters.clone())?;
        if next.spec.category() != sequencer.next_job {
            anyhow::bail!(
                "next job parameters describe a {} job, expected {}",
                next.spec.category(),
                sequencer.next_job
            );
        }
        let created = self
            .ctx
            .store
            .create_job(NewJob::new(next.spec, next.trigger_type).created_by(next.created_by))
            .await?;
        self.ctx.emit(JobEvent::created(created.id, created.category));

        let ids = vec![created.id];
        if !self.workflows.finish_sequencer(sequencer.id, &ids).await? {
            // Another instance finished it first.
            return Ok(SequencerOutcome::Waiting);
        }
        info!(job_id = %created.id, category = %created.category, "sequencer launched job");

        if created.category == JobCategory::Compliance
            && let Some(coordinator) = &self.coordinator
            && let Err(err) = coordinator.advance(created.id).await
        {
            warn!(job_id = %created.id, error = %err, "failed to start compliance runners");
        }
        Ok(SequencerOutcome::Finished(ids))
    }

    /// Evaluate every waiting row once; returns how many launched.
    pub async fn run_cycle(&self) -> anyhow::Result<usize> {
        let waiting = self
            .workflows
            .list_waiting_sequencers(self.config.batch)
            .await?;
        let mut launched = 0;
        for sequencer in &waiting {
            match self.evaluate(sequencer).await {
                Ok(SequencerOutcome::Finished(_)) => launched += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(sequencer_id = sequencer.id, error = %err, "failed to evaluate sequencer");
                }
            }
        }
        Ok(launched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ComplianceSpec;

    #[test]
    fn test_sequenced_job_round_trips_as_parameters() {
        let next = SequencedJob::new(
            JobSpec::Compliance(ComplianceSpec {
                benchmark_id: "cis-aws".into(),
                integration_ids: vec!["i-1".into()],
            }),
            TriggerType::Manual,
        )
        .created_by("alice");

        let value = serde_json::to_value(&next).unwrap();
        assert_eq!(value["spec"]["kind"], "compliance");
        assert_eq!(value["trigger_type"], "manual");

        let back: SequencedJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, next);
    }
}
