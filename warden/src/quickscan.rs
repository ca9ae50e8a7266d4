//! Quick scan: discover what a framework needs, then evaluate it.
//!
//! ```text
//! created -> started -> fetching_dependencies -> running_compliance_quick_scan -> finished
//! ```
//!
//! Any step error moves the sequence to `failed` with the message.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{Instrument, info, warn};

use crate::catalog::{ControlCatalog, IntegrationDirectory, framework_resource_types};
use crate::config::QuickScanConfig;
use crate::dispatch::JobContext;
use crate::events::JobEvent;
use crate::job::{
    AuditSpec, DiscoverySpec, JobId, JobRecord, JobSpec, JobStatus, NewJob,
    TriggerType,
};
use crate::store::{
    DiscoveryCreate, NewQuickScan, QuickScanPatch, QuickScanSequence,
    QuickScanStatus, WorkflowStore,
};

pub const QUICK_SCAN_CREATOR: &str = "QuickScanSequencer";

#[derive(Clone)]
pub struct QuickScanWorkflow {
    ctx: JobContext,
    workflows: Arc<dyn WorkflowStore>,
    integrations: Arc<dyn IntegrationDirectory>,
    catalog: Arc<dyn ControlCatalog>,
    config: QuickScanConfig,
}

impl std::fmt::Debug for QuickScanWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuickScanWorkflow")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QuickScanWorkflow {
    pub fn new(
        ctx: JobContext,
        workflows: Arc<dyn WorkflowStore>,
        integrations: Arc<dyn IntegrationDirectory>,
        catalog: Arc<dyn ControlCatalog>,
        config: QuickScanConfig,
    ) -> Self {
        Self {
            ctx,
            workflows,
            integrations,
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &QuickScanConfig {
        &self.config
    }

    pub async fn start(&self, mut scan: NewQuickScan) -> anyhow::Result<QuickScanSequence> {
        let mut seen = HashSet::new();
        scan.integration_ids.retain(|id| seen.insert(id.clone()));
        if scan.integration_ids.is_empty() {
            anyhow::bail!("quick scan needs at least one integration");
        }
        if self.catalog.get_benchmark(&scan.framework_id).await?.is_none() {
            anyhow::bail!("framework {} not found", scan.framework_id);
        }
        let sequence = self.workflows.create_quick_scan(scan).await?;
        info!(sequence_id = sequence.id, framework_id = %sequence.framework_id, "quick scan created");
        Ok(sequence)
    }

    /// Claim every `created` sequence and run each on its own task.
    /// Sequences abandoned mid-run are failed first.
    pub async fn run_cycle(&self) -> anyhow::Result<usize> {
        self.fail_abandoned().await?;
        let pending = self
            .workflows
            .list_quick_scans(QuickScanStatus::Created, 100)
            .await?;
        let mut started = 0;
        for sequence in pending {
            let claimed = self
                .workflows
                .advance_quick_scan(
                    sequence.id,
                    QuickScanStatus::Created,
                    QuickScanStatus::Started,
                    &QuickScanPatch::default(),
                )
                .await?;
            if !claimed {
                continue;
            }
            started += 1;
            let workflow = self.clone();
            tokio::spawn(async move {
                workflow.execute(sequence).await;
            });
        }
        Ok(started)
    }

    /// Fail sequences that sat in a running step longer than any live run
    /// could, left behind by a process that stopped mid-scan.
    pub async fn fail_abandoned(&self) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.abandoned_after())?;
        let mut failed = 0;
        for status in [
            QuickScanStatus::Started,
            QuickScanStatus::FetchingDependencies,
            QuickScanStatus::RunningComplianceQuickScan,
        ] {
            for sequence in self.workflows.list_quick_scans(status, 100).await? {
                if sequence.updated_at >= cutoff {
                    continue;
                }
                let patch = QuickScanPatch {
                    failure_message: Some(format!("abandoned while {}", status.as_str())),
                    ..Default::default()
                };
                if self
                    .workflows
                    .advance_quick_scan(sequence.id, status, QuickScanStatus::Failed, &patch)
                    .await?
                {
                    warn!(sequence_id = sequence.id, status = status.as_str(), "abandoned quick scan failed");
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }

    /// Run a claimed (`started`) sequence to its end. Returns the final
    /// status.
    pub async fn execute(&self, sequence: QuickScanSequence) -> QuickScanStatus {
        let span = crate::telemetry::quick_scan_span(sequence.id);
        async {
            let mut current = QuickScanStatus::Started;
            match self.run_steps(&sequence, &mut current).await {
                Ok(()) => QuickScanStatus::Finished,
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(error = %message, step = current.as_str(), "quick scan failed");
                    let patch = QuickScanPatch {
                        failure_message: Some(message),
                        ..Default::default()
                    };
                    if let Err(err) = self
                        .workflows
                        .advance_quick_scan(sequence.id, current, QuickScanStatus::Failed, &patch)
                        .await
                    {
                        warn!(error = %err, "failed to record quick scan failure");
                    }
                    QuickScanStatus::Failed
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_steps(
        &self,
        sequence: &QuickScanSequence,
        current: &mut QuickScanStatus,
    ) -> anyhow::Result<()> {
        self.step(sequence.id, current, QuickScanStatus::FetchingDependencies, QuickScanPatch::default())
            .await?;
        let discovery_ids = self.discover_dependencies(sequence).await?;
        self.workflows
            .advance_quick_scan(
                sequence.id,
                *current,
                *current,
                &QuickScanPatch {
                    discovery_job_ids: Some(discovery_ids.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.wait_terminal(&discovery_ids, self.config.discovery_timeout())
            .await?;

        let compliance_ids = self.run_quick_compliance(sequence).await?;
        self.step(
            sequence.id,
            current,
            QuickScanStatus::RunningComplianceQuickScan,
            QuickScanPatch {
                compliance_job_ids: Some(compliance_ids.clone()),
                ..Default::default()
            },
        )
        .await?;
        let jobs = self
            .wait_terminal(&compliance_ids, self.config.compliance_timeout())
            .await?;
        if let Some(job) = jobs.iter().find(|job| job.status != JobStatus::Succeeded) {
            anyhow::bail!(
                "compliance quick run {} ended {}: {}",
                job.id,
                job.status,
                job.failure_message.as_deref().unwrap_or("no message")
            );
        }

        self.step(sequence.id, current, QuickScanStatus::Finished, QuickScanPatch::default())
            .await?;
        info!(jobs = compliance_ids.len(), "quick scan finished");
        Ok(())
    }

    async fn step(
        &self,
        id: i64,
        current: &mut QuickScanStatus,
        to: QuickScanStatus,
        patch: QuickScanPatch,
    ) -> anyhow::Result<()> {
        if !self
            .workflows
            .advance_quick_scan(id, *current, to, &patch)
            .await?
        {
            anyhow::bail!("quick scan {id} left {} unexpectedly", current.as_str());
        }
        *current = to;
        Ok(())
    }

    /// One discovery job per (integration, resource type) the framework
    /// reads. Active jobs are reused.
    pub async fn discover_dependencies(
        &self,
        sequence: &QuickScanSequence,
    ) -> anyhow::Result<Vec<JobId>> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        for integration_id in &sequence.integration_ids {
            if !seen.insert(integration_id.as_str()) {
                continue;
            }
            let integration = self
                .integrations
                .get_integration(integration_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("integration {integration_id} not found"))?;
            let resource_types = framework_resource_types(
                self.catalog.as_ref(),
                &sequence.framework_id,
                &integration.integration_type,
            )
            .await?;

            for resource_type in resource_types {
                let job = NewJob::new(
                    JobSpec::Discovery(DiscoverySpec {
                        integration_id: integration.id.clone(),
                        integration_type: integration.integration_type.clone(),
                        resource_type,
                        ..Default::default()
                    }),
                    TriggerType::Manual,
                )
                .created_by(QUICK_SCAN_CREATOR)
                .with_parent(JobId(sequence.id));
                let record = match self.ctx.store.create_discovery_job(job).await? {
                    DiscoveryCreate::Created(record) => {
                        self.ctx.emit(JobEvent::created(record.id, record.category));
                        record
                    }
                    DiscoveryCreate::AlreadyActive(record) => record,
                };
                if !ids.contains(&record.id) {
                    ids.push(record.id);
                }
            }
        }
        info!(jobs = ids.len(), "quick scan discovery jobs ready");
        Ok(ids)
    }

    async fn run_quick_compliance(
        &self,
        sequence: &QuickScanSequence,
    ) -> anyhow::Result<Vec<JobId>> {
        let jobs = sequence
            .integration_ids
            .iter()
            .map(|integration_id| {
                NewJob::new(
                    JobSpec::ComplianceQuickRun(AuditSpec {
                        framework_id: sequence.framework_id.clone(),
                        integration_ids: vec![integration_id.clone()],
                        include_results: sequence.include_results,
                        result: None,
                    }),
                    TriggerType::Manual,
                )
                .created_by(QUICK_SCAN_CREATOR)
                .with_parent(JobId(sequence.id))
            })
            .collect();
        let created = self.ctx.store.create_jobs(jobs).await?;
        for job in &created {
            self.ctx.emit(JobEvent::created(job.id, job.category));
        }
        Ok(created.into_iter().map(|job| job.id).collect())
    }

    /// Poll until every job is terminal or `timeout` passes.
    pub async fn wait_terminal(
        &self,
        ids: &[JobId],
        timeout: Duration,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let mut distinct = ids.to_vec();
        distinct.sort();
        distinct.dedup();
        let deadline = Instant::now() + timeout;
        loop {
            let jobs = self.ctx.store.get_jobs(&distinct).await?;
            if jobs.len() == distinct.len() && jobs.iter().all(JobRecord::is_terminal) {
                return Ok(jobs);
            }
            if Instant::now() >= deadline {
                let finished = jobs.iter().filter(|job| job.is_terminal()).count();
                anyhow::bail!(
                    "timed out after {}s waiting for {} of {} jobs",
                    timeout.as_secs(),
                    distinct.len() - finished,
                    distinct.len()
                );
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}
