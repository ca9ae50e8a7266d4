//! Operations behind the front door, and the scheduled triggers that create
//! periodic discovery and compliance jobs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{ControlCatalog, IntegrationDirectory, framework_resource_types};
use crate::compliance::ComplianceCoordinator;
use crate::config::IntervalSettings;
use crate::dispatch::{JobContext, published_topic};
use crate::error::{Result, WardenError};
use crate::events::JobEvent;
use crate::job::{
    AuditSpec, ComplianceSpec, DiscoverySpec, JobCategory, JobId, JobRecord,
    JobSpec, JobStatus, NewJob, QueryRunSpec, QueryValidateSpec, TriggerType,
};
use crate::queue::WorkQueue;
use crate::quickscan::QuickScanWorkflow;
use crate::sequencer::{JobSequencerService, SequencedJob};
use crate::store::{
    DiscoveryCreate, IntegrationDiscovery, JobFilter, JobPage, JobSequencer,
    NewQuickScan, QuickScanSequence, SortField, SortOrder, Transition,
    WorkflowStore,
};

fn default_creator() -> String {
    "api".to_string()
}

fn default_manual() -> TriggerType {
    TriggerType::Manual
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DescribeRequest {
    pub integration_id: String,
    pub resource_type: String,
    #[serde(default = "default_manual")]
    pub trigger_type: TriggerType,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub integration_ids: Vec<String>,
    /// Every resource type of the integration type when empty.
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

/// Jobs a manual discovery trigger produced, per integration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryTrigger {
    pub trigger_id: String,
    pub integrations: Vec<IntegrationDiscovery>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationTriggerStatus {
    pub integration_id: String,
    pub job_ids: Vec<JobId>,
    pub statuses: BTreeMap<JobStatus, u64>,
    pub finished: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryTriggerStatus {
    pub trigger_id: String,
    pub integrations: Vec<IntegrationTriggerStatus>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRequest {
    pub benchmark_id: String,
    /// The benchmark's assigned integrations when empty.
    #[serde(default)]
    pub integration_ids: Vec<String>,
    /// Discover the benchmark's resource types first and start the
    /// compliance job once they are indexed.
    #[serde(default)]
    pub with_discovery: bool,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComplianceTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequencer_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discovery_job_ids: Vec<JobId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRunRequest {
    #[serde(default)]
    pub query_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryValidateRequest {
    pub query_id: String,
    #[serde(default)]
    pub control_id: Option<String>,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRequest {
    pub framework_id: String,
    pub integration_ids: Vec<String>,
    #[serde(default)]
    pub include_results: bool,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuickScanRequest {
    pub framework_id: String,
    pub integration_ids: Vec<String>,
    #[serde(default)]
    pub include_results: bool,
    #[serde(default = "default_creator")]
    pub created_by: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRunResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub failure_message: Option<String>,
}

/// Which jobs a cancel request targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum CancelSelector {
    Ids { job_ids: Vec<JobId> },
    Status { category: JobCategory, status: JobStatus },
    Integration {
        integration_id: String,
        #[serde(default)]
        category: Option<JobCategory>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum CancelResult {
    Canceled,
    AlreadyFinished,
    NotFound,
    UnableToCancel(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub job_id: JobId,
    #[serde(flatten)]
    pub result: CancelResult,
}

const IN_PROGRESS_REASON: &str = "already in progress";

/// Creates and inspects jobs on behalf of callers.
#[derive(Clone)]
pub struct JobScheduler {
    ctx: JobContext,
    workflows: Arc<dyn WorkflowStore>,
    queue: Arc<dyn WorkQueue>,
    integrations: Arc<dyn IntegrationDirectory>,
    catalog: Arc<dyn ControlCatalog>,
    sequencer: JobSequencerService,
    quick_scan: QuickScanWorkflow,
    coordinator: ComplianceCoordinator,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler").finish_non_exhaustive()
    }
}

impl JobScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: JobContext,
        workflows: Arc<dyn WorkflowStore>,
        queue: Arc<dyn WorkQueue>,
        integrations: Arc<dyn IntegrationDirectory>,
        catalog: Arc<dyn ControlCatalog>,
        sequencer: JobSequencerService,
        quick_scan: QuickScanWorkflow,
        coordinator: ComplianceCoordinator,
    ) -> Self {
        Self {
            ctx,
            workflows,
            queue,
            integrations,
            catalog,
            sequencer,
            quick_scan,
            coordinator,
        }
    }

    async fn create(&self, job: NewJob) -> Result<JobRecord> {
        let record = self.ctx.store.create_job(job).await?;
        self.ctx.emit(JobEvent::created(record.id, record.category));
        Ok(record)
    }

    async fn enabled_integration(
        &self,
        integration_id: &str,
    ) -> Result<crate::catalog::Integration> {
        let integration = self
            .integrations
            .get_integration(integration_id)
            .await?
            .ok_or_else(|| WardenError::not_found(format!("integration {integration_id}")))?;
        if !integration.enabled {
            return Err(WardenError::invalid(format!(
                "integration {integration_id} is disabled"
            )));
        }
        Ok(integration)
    }

    /// Discover one resource type of one integration.
    pub async fn describe(&self, request: DescribeRequest) -> Result<JobRecord> {
        let integration = self.enabled_integration(&request.integration_id).await?;
        let job = NewJob::new(
            JobSpec::Discovery(DiscoverySpec {
                integration_id: integration.id.clone(),
                integration_type: integration.integration_type.clone(),
                resource_type: request.resource_type.clone(),
                ..Default::default()
            }),
            request.trigger_type,
        )
        .created_by(request.created_by);

        match self.ctx.store.create_discovery_job(job).await? {
            DiscoveryCreate::Created(record) => {
                self.ctx.emit(JobEvent::created(record.id, record.category));
                info!(job_id = %record.id, resource_type = %request.resource_type, "discovery job created");
                Ok(record)
            }
            DiscoveryCreate::AlreadyActive(record) => Err(WardenError::AlreadyInProgress {
                what: format!(
                    "discovery of {} for {}",
                    request.resource_type, request.integration_id
                ),
                job_id: record.id,
            }),
        }
    }

    /// Discover many resource types across integrations under one trigger
    /// id. Types that already have an active job reuse it.
    pub async fn run_discovery(&self, request: DiscoveryRequest) -> Result<DiscoveryTrigger> {
        if request.integration_ids.is_empty() {
            return Err(WardenError::invalid("no integrations given"));
        }
        let trigger_id = Uuid::new_v4().to_string();
        let mut recorded = Vec::new();
        for integration_id in &request.integration_ids {
            let integration = self.enabled_integration(integration_id).await?;
            let resource_types = if request.resource_types.is_empty() {
                self.catalog
                    .resource_types(&integration.integration_type)
                    .await?
                    .into_iter()
                    .map(|rt| rt.name)
                    .collect()
            } else {
                request.resource_types.clone()
            };

            let mut job_ids = Vec::new();
            for resource_type in &resource_types {
                let job = NewJob::new(
                    JobSpec::Discovery(DiscoverySpec {
                        integration_id: integration.id.clone(),
                        integration_type: integration.integration_type.clone(),
                        resource_type: resource_type.clone(),
                        trigger_id: Some(trigger_id.clone()),
                        ..Default::default()
                    }),
                    TriggerType::Manual,
                )
                .created_by(request.created_by.clone());
                let record = match self.ctx.store.create_discovery_job(job).await? {
                    DiscoveryCreate::Created(record) => {
                        self.ctx.emit(JobEvent::created(record.id, record.category));
                        record
                    }
                    DiscoveryCreate::AlreadyActive(record) => record,
                };
                job_ids.push(record.id);
            }

            let discovery = IntegrationDiscovery {
                trigger_id: trigger_id.clone(),
                integration_id: integration.id.clone(),
                resource_types,
                job_ids,
                triggered_by: request.created_by.clone(),
                created_at: Utc::now(),
            };
            self.workflows
                .record_integration_discovery(discovery.clone())
                .await?;
            recorded.push(discovery);
        }
        info!(trigger_id = %trigger_id, integrations = recorded.len(), "discovery triggered");
        Ok(DiscoveryTrigger {
            trigger_id,
            integrations: recorded,
        })
    }

    pub async fn discovery_trigger_status(
        &self,
        trigger_id: &str,
    ) -> Result<DiscoveryTriggerStatus> {
        let discoveries = self
            .workflows
            .list_integration_discoveries(trigger_id)
            .await?;
        if discoveries.is_empty() {
            return Err(WardenError::not_found(format!("discovery trigger {trigger_id}")));
        }
        let mut integrations = Vec::with_capacity(discoveries.len());
        for discovery in discoveries {
            let jobs = self.ctx.store.get_jobs(&discovery.job_ids).await?;
            let mut statuses = BTreeMap::new();
            for job in &jobs {
                *statuses.entry(job.status).or_insert(0) += 1;
            }
            integrations.push(IntegrationTriggerStatus {
                integration_id: discovery.integration_id,
                finished: jobs.iter().all(JobRecord::is_terminal),
                job_ids: discovery.job_ids,
                statuses,
            });
        }
        Ok(DiscoveryTriggerStatus {
            trigger_id: trigger_id.to_string(),
            integrations,
        })
    }

    /// Evaluate a benchmark, optionally after discovering what it reads.
    pub async fn run_compliance(&self, request: ComplianceRequest) -> Result<ComplianceTrigger> {
        if self
            .catalog
            .get_benchmark(&request.benchmark_id)
            .await?
            .is_none()
        {
            return Err(WardenError::not_found(format!("benchmark {}", request.benchmark_id)));
        }
        let integration_ids = if request.integration_ids.is_empty() {
            self.catalog
                .benchmark_assignments()
                .await?
                .into_iter()
                .filter(|a| a.benchmark_id == request.benchmark_id)
                .flat_map(|a| a.integration_ids)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            request.integration_ids.clone()
        };
        if integration_ids.is_empty() {
            return Err(WardenError::invalid(format!(
                "benchmark {} has no integrations",
                request.benchmark_id
            )));
        }
        let spec = JobSpec::Compliance(ComplianceSpec {
            benchmark_id: request.benchmark_id.clone(),
            integration_ids: integration_ids.clone(),
        });

        if !request.with_discovery {
            let record = self
                .create(NewJob::new(spec, TriggerType::Manual).created_by(request.created_by))
                .await?;
            if let Err(err) = self.coordinator.advance(record.id).await {
                warn!(job_id = %record.id, error = %err, "failed to start compliance runners");
            }
            return Ok(ComplianceTrigger {
                job_id: Some(record.id),
                sequencer_id: None,
                discovery_job_ids: Vec::new(),
            });
        }

        let mut discovery_ids = Vec::new();
        for integration_id in &integration_ids {
            let integration = self.enabled_integration(integration_id).await?;
            let resource_types = framework_resource_types(
                self.catalog.as_ref(),
                &request.benchmark_id,
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
                .created_by(request.created_by.clone());
                let record = match self.ctx.store.create_discovery_job(job).await? {
                    DiscoveryCreate::Created(record) => {
                        self.ctx.emit(JobEvent::created(record.id, record.category));
                        record
                    }
                    DiscoveryCreate::AlreadyActive(record) => record,
                };
                discovery_ids.push(record.id);
            }
        }
        let sequencer = self
            .sequencer
            .enqueue(
                JobCategory::Discovery,
                discovery_ids.clone(),
                SequencedJob::new(spec, TriggerType::Manual).created_by(request.created_by),
            )
            .await?;
        Ok(ComplianceTrigger {
            job_id: None,
            sequencer_id: Some(sequencer.id),
            discovery_job_ids: discovery_ids,
        })
    }

    pub async fn run_query(&self, request: QueryRunRequest) -> Result<JobRecord> {
        if request.query_id.is_none() && request.query.is_none() {
            return Err(WardenError::invalid("query_id or query is required"));
        }
        if let Some(id) = &request.query_id
            && self.catalog.get_query(id).await?.is_none()
        {
            return Err(WardenError::not_found(format!("query {id}")));
        }
        let spec = JobSpec::QueryRunner(QueryRunSpec {
            query_id: request.query_id,
            query: request.query,
            parameters: request.parameters,
            result: None,
        });
        self.create(NewJob::new(spec, TriggerType::Manual).created_by(request.created_by))
            .await
    }

    pub async fn validate_query(&self, request: QueryValidateRequest) -> Result<JobRecord> {
        if self.catalog.get_query(&request.query_id).await?.is_none() {
            return Err(WardenError::not_found(format!("query {}", request.query_id)));
        }
        let spec = JobSpec::QueryValidator(QueryValidateSpec {
            query_id: request.query_id,
            control_id: request.control_id,
        });
        self.create(NewJob::new(spec, TriggerType::Manual).created_by(request.created_by))
            .await
    }

    pub async fn run_audit(&self, request: AuditRequest) -> Result<JobRecord> {
        if request.integration_ids.is_empty() {
            return Err(WardenError::invalid("no integrations given"));
        }
        if self
            .catalog
            .get_benchmark(&request.framework_id)
            .await?
            .is_none()
        {
            return Err(WardenError::not_found(format!("framework {}", request.framework_id)));
        }
        let spec = JobSpec::Audit(AuditSpec {
            framework_id: request.framework_id,
            integration_ids: request.integration_ids,
            include_results: request.include_results,
            result: None,
        });
        self.create(NewJob::new(spec, TriggerType::Manual).created_by(request.created_by))
            .await
    }

    pub async fn start_quick_scan(&self, request: QuickScanRequest) -> Result<QuickScanSequence> {
        if request.integration_ids.is_empty() {
            return Err(WardenError::invalid("no integrations given"));
        }
        if self
            .catalog
            .get_benchmark(&request.framework_id)
            .await?
            .is_none()
        {
            return Err(WardenError::not_found(format!("framework {}", request.framework_id)));
        }
        Ok(self
            .quick_scan
            .start(NewQuickScan {
                framework_id: request.framework_id,
                integration_ids: request.integration_ids,
                include_results: request.include_results,
                created_by: request.created_by,
            })
            .await?)
    }

    pub async fn quick_scan_status(&self, id: i64) -> Result<QuickScanSequence> {
        self.workflows
            .get_quick_scan(id)
            .await?
            .ok_or_else(|| WardenError::not_found(format!("quick scan {id}")))
    }

    pub async fn job_status(&self, id: JobId) -> Result<JobRecord> {
        self.ctx
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| WardenError::not_found(format!("job {id}")))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        Ok(self.ctx.store.list_jobs(filter).await?)
    }

    pub async fn query_result(&self, id: JobId) -> Result<QueryRunResult> {
        let job = self.job_status(id).await?;
        let JobSpec::QueryRunner(spec) = job.spec else {
            return Err(WardenError::invalid(format!("job {id} is a {} job", job.category)));
        };
        Ok(QueryRunResult {
            job_id: job.id,
            status: job.status,
            result: spec.result,
            failure_message: job.failure_message,
        })
    }

    pub async fn sequencer_status(&self, id: i64) -> Result<JobSequencer> {
        self.workflows
            .get_sequencer(id)
            .await?
            .ok_or_else(|| WardenError::not_found(format!("sequencer {id}")))
    }

    /// Cancel the selected jobs, reporting one outcome per job.
    pub async fn cancel(&self, selector: CancelSelector) -> Result<Vec<CancelOutcome>> {
        let targets: Vec<(JobId, Option<JobRecord>)> = match selector {
            CancelSelector::Ids { job_ids } => {
                if job_ids.is_empty() {
                    return Err(WardenError::invalid("no job ids given"));
                }
                let found = self.ctx.store.get_jobs(&job_ids).await?;
                job_ids
                    .into_iter()
                    .map(|id| (id, found.iter().find(|job| job.id == id).cloned()))
                    .collect()
            }
            CancelSelector::Status { category, status } => {
                let filter = JobFilter {
                    statuses: vec![status],
                    ..JobFilter::category(category)
                };
                self.ctx
                    .store
                    .list_jobs(&filter)
                    .await?
                    .jobs
                    .into_iter()
                    .map(|job| (job.id, Some(job)))
                    .collect()
            }
            CancelSelector::Integration {
                integration_id,
                category,
            } => {
                let filter = JobFilter {
                    integration_id: Some(integration_id),
                    categories: category.into_iter().collect(),
                    statuses: JobStatus::ACTIVE.to_vec(),
                    ..Default::default()
                };
                self.ctx
                    .store
                    .list_jobs(&filter)
                    .await?
                    .jobs
                    .into_iter()
                    .map(|job| (job.id, Some(job)))
                    .collect()
            }
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for (job_id, job) in targets {
            let result = match job {
                None => CancelResult::NotFound,
                Some(job) => match self.cancel_job(&job).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(job_id = %job.id, error = %err, "failed to cancel job");
                        CancelResult::UnableToCancel(err.to_string())
                    }
                },
            };
            outcomes.push(CancelOutcome { job_id, result });
        }
        Ok(outcomes)
    }

    async fn cancel_job(&self, job: &JobRecord) -> Result<CancelResult> {
        if job.is_terminal() {
            return Ok(CancelResult::AlreadyFinished);
        }
        let canceled = match job.status {
            JobStatus::Created => {
                let transition =
                    Transition::new(job.category, &[JobStatus::Created], JobStatus::Canceled);
                self.ctx.store.transition(job.id, &transition).await?
            }
            JobStatus::Queued => {
                let Some(sequence) = job.queue_sequence else {
                    return Ok(CancelResult::UnableToCancel(IN_PROGRESS_REASON.to_string()));
                };
                let topic = published_topic(job);
                if !self.queue.delete_message(&topic, sequence).await? {
                    return Ok(CancelResult::UnableToCancel(IN_PROGRESS_REASON.to_string()));
                }
                let transition =
                    Transition::new(job.category, &[JobStatus::Queued], JobStatus::Canceled);
                self.ctx.store.transition(job.id, &transition).await?
            }
            _ => false,
        };
        if !canceled {
            return Ok(CancelResult::UnableToCancel(IN_PROGRESS_REASON.to_string()));
        }
        self.ctx.emit(JobEvent::canceled(job.id, job.category));
        info!(job_id = %job.id, category = %job.category, "job canceled");
        Ok(CancelResult::Canceled)
    }
}

/// What one scheduled trigger pass created.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TriggerReport {
    pub discovery: usize,
    pub compliance: usize,
}

/// Creates discovery and compliance jobs on their configured cadence.
#[derive(Clone)]
pub struct ScheduledTriggers {
    ctx: JobContext,
    integrations: Arc<dyn IntegrationDirectory>,
    catalog: Arc<dyn ControlCatalog>,
    intervals: watch::Receiver<IntervalSettings>,
}

impl std::fmt::Debug for ScheduledTriggers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTriggers")
            .field("intervals", &*self.intervals.borrow())
            .finish_non_exhaustive()
    }
}

impl ScheduledTriggers {
    pub fn new(
        ctx: JobContext,
        integrations: Arc<dyn IntegrationDirectory>,
        catalog: Arc<dyn ControlCatalog>,
        intervals: watch::Receiver<IntervalSettings>,
    ) -> Self {
        Self {
            ctx,
            integrations,
            catalog,
            intervals,
        }
    }

    pub async fn run_cycle(&self) -> anyhow::Result<TriggerReport> {
        let intervals = *self.intervals.borrow();
        let report = TriggerReport {
            discovery: self.trigger_discovery(&intervals).await?,
            compliance: self.trigger_compliance(&intervals).await?,
        };
        if report != TriggerReport::default() {
            info!(
                discovery = report.discovery,
                compliance = report.compliance,
                "scheduled jobs created"
            );
        }
        Ok(report)
    }

    async fn latest(&self, filter: JobFilter) -> anyhow::Result<Option<JobRecord>> {
        let filter = JobFilter {
            sort_by: SortField::CreatedAt,
            sort_order: SortOrder::Desc,
            limit: Some(1),
            ..filter
        };
        Ok(self.ctx.store.list_jobs(&filter).await?.jobs.into_iter().next())
    }

    async fn trigger_discovery(&self, intervals: &IntervalSettings) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut created = 0;
        for integration in self.integrations.list_integrations().await? {
            if !integration.enabled {
                continue;
            }
            for resource_type in self
                .catalog
                .resource_types(&integration.integration_type)
                .await?
            {
                let (hours, trigger) = if resource_type.cost {
                    (intervals.cost_discovery_interval_hours, TriggerType::CostFullDiscovery)
                } else {
                    (intervals.describe_interval_hours, TriggerType::Scheduled)
                };
                let last = self
                    .latest(JobFilter {
                        integration_id: Some(integration.id.clone()),
                        resource_type: Some(resource_type.name.clone()),
                        ..JobFilter::category(JobCategory::Discovery)
                    })
                    .await?;
                if last.is_some_and(|job| job.created_at > now - Duration::hours(hours)) {
                    continue;
                }

                let job = NewJob::new(
                    JobSpec::Discovery(DiscoverySpec {
                        integration_id: integration.id.clone(),
                        integration_type: integration.integration_type.clone(),
                        resource_type: resource_type.name.clone(),
                        ..Default::default()
                    }),
                    trigger,
                );
                match self.ctx.store.create_discovery_job(job).await? {
                    DiscoveryCreate::Created(record) => {
                        self.ctx.emit(JobEvent::created(record.id, record.category));
                        created += 1;
                    }
                    DiscoveryCreate::AlreadyActive(record) => {
                        debug!(job_id = %record.id, "discovery still active");
                    }
                }
            }
        }
        Ok(created)
    }

    async fn trigger_compliance(&self, intervals: &IntervalSettings) -> anyhow::Result<usize> {
        let now = Utc::now();
        let mut created = 0;
        for assignment in self.catalog.benchmark_assignments().await? {
            if assignment.integration_ids.is_empty() {
                continue;
            }
            let last = self
                .latest(JobFilter {
                    benchmark_id: Some(assignment.benchmark_id.clone()),
                    ..JobFilter::category(JobCategory::Compliance)
                })
                .await?;
            if let Some(job) = &last
                && (!job.is_terminal()
                    || job.created_at
                        > now - Duration::hours(intervals.compliance_interval_hours))
            {
                continue;
            }

            let record = self
                .ctx
                .store
                .create_job(NewJob::new(
                    JobSpec::Compliance(ComplianceSpec {
                        benchmark_id: assignment.benchmark_id.clone(),
                        integration_ids: assignment.integration_ids.clone(),
                    }),
                    TriggerType::Scheduled,
                ))
                .await?;
            self.ctx.emit(JobEvent::created(record.id, record.category));
            created += 1;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_selector_is_tagged() {
        let selector: CancelSelector = serde_json::from_value(serde_json::json!({
            "by": "status",
            "category": "discovery",
            "status": "queued",
        }))
        .unwrap();
        assert_eq!(
            selector,
            CancelSelector::Status {
                category: JobCategory::Discovery,
                status: JobStatus::Queued,
            }
        );
    }

    #[test]
    fn test_cancel_outcome_flattens_result() {
        let outcome = CancelOutcome {
            job_id: JobId(4),
            result: CancelResult::UnableToCancel(IN_PROGRESS_REASON.to_string()),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["job_id"], 4);
        assert_eq!(value["outcome"], "unable_to_cancel");
        assert_eq!(value["reason"], "already in progress");
    }

    #[test]
    fn test_requests_default_creator_and_trigger() {
        let request: DescribeRequest = serde_json::from_value(serde_json::json!({
            "integration_id": "i-1",
            "resource_type": "AWS::S3::Bucket",
        }))
        .unwrap();
        assert_eq!(request.trigger_type, TriggerType::Manual);
        assert_eq!(request.created_by, "api");
    }
}
