use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{
    JobCategory, JobId, JobRecord, JobSpec, JobStatus, NewJob, TriggerType,
};

/// Field updates applied alongside a status transition.
///
/// `spec_fields` are merged into the job's spec document, so they must name
/// fields of that category's spec.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobPatch {
    pub failure_message: Option<String>,
    pub error_code: Option<String>,
    pub spec_fields: serde_json::Map<String, serde_json::Value>,
}

impl JobPatch {
    pub fn failure(mut self, message: impl AsRef<str>) -> Self {
        self.failure_message =
            Some(crate::job::sanitize_failure_message(message.as_ref()));
        self
    }

    pub fn error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn field(
        mut self,
        name: &str,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.spec_fields.insert(name.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.failure_message.is_none()
            && self.error_code.is_none()
            && self.spec_fields.is_empty()
    }

    /// Apply to an in-memory record. Backends that store the spec as JSON
    /// perform the same merge in their update statement.
    pub fn apply_to(&self, job: &mut JobRecord) -> anyhow::Result<()> {
        if let Some(message) = &self.failure_message {
            job.failure_message = Some(message.clone());
        }
        if let Some(code) = &self.error_code {
            job.error_code = Some(code.clone());
        }
        if !self.spec_fields.is_empty() {
            job.spec = merge_spec(&job.spec, &self.spec_fields)?;
        }
        Ok(())
    }
}

/// Merge top-level fields into a spec document and decode it again.
pub fn merge_spec(
    spec: &JobSpec,
    fields: &serde_json::Map<String, serde_json::Value>,
) -> anyhow::Result<JobSpec> {
    let mut value = serde_json::to_value(spec)?;
    if let Some(object) = value.as_object_mut() {
        for (key, field) in fields {
            object.insert(key.clone(), field.clone());
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// A guarded status change: applied only while the job is in one of
/// `from`. Edges the category's state machine does not allow are dropped
/// when the transition is built, so an impossible transition matches no
/// rows.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub category: JobCategory,
    pub from: Vec<JobStatus>,
    pub to: JobStatus,
    pub patch: JobPatch,
}

impl Transition {
    pub fn new(category: JobCategory, from: &[JobStatus], to: JobStatus) -> Self {
        let from = from
            .iter()
            .copied()
            .filter(|status| category.allows(*status, to))
            .collect();
        Self {
            category,
            from,
            to,
            patch: JobPatch::default(),
        }
    }

    pub fn with_patch(mut self, patch: JobPatch) -> Self {
        self.patch = patch;
        self
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        job.category == self.category && self.from.contains(&job.status)
    }
}

/// Which timestamp a sweep measures age from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AgeBasis {
    CreatedAt,
    UpdatedAt,
}

/// Bulk status change for jobs that sat too long in a status set.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepRule {
    pub category: JobCategory,
    pub statuses: Vec<JobStatus>,
    pub basis: AgeBasis,
    pub older_than: Duration,
    pub to: JobStatus,
    pub message: String,
}

impl SweepRule {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.older_than
    }

    pub fn matches(&self, job: &JobRecord, now: DateTime<Utc>) -> bool {
        let stamp = match self.basis {
            AgeBasis::CreatedAt => job.created_at,
            AgeBasis::UpdatedAt => job.updated_at,
        };
        job.category == self.category
            && self.statuses.contains(&job.status)
            && stamp < self.cutoff(now)
    }
}

/// Bulk re-creation of failed jobs that are eligible for another attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryRule {
    pub category: JobCategory,
    pub statuses: Vec<JobStatus>,
    pub cooldown: Duration,
    pub max_retries: u32,
    pub excluded_error_codes: Vec<String>,
}

impl RetryRule {
    pub fn matches(&self, job: &JobRecord, now: DateTime<Utc>) -> bool {
        self.retryable(job) && job.updated_at < now - self.cooldown
    }

    /// Eligible for a retry once the cooldown has passed.
    pub fn retryable(&self, job: &JobRecord) -> bool {
        job.category == self.category
            && self.statuses.contains(&job.status)
            && job.retry_count < self.max_retries
            && !job
                .error_code
                .as_ref()
                .is_some_and(|code| self.excluded_error_codes.contains(code))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Id,
    CreatedAt,
    UpdatedAt,
    Status,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter, sort and pagination for job listings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub categories: Vec<JobCategory>,
    pub statuses: Vec<JobStatus>,
    pub trigger_types: Vec<TriggerType>,
    pub integration_id: Option<String>,
    pub resource_type: Option<String>,
    pub benchmark_id: Option<String>,
    pub parent_id: Option<JobId>,
    pub created_by: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl JobFilter {
    pub fn category(category: JobCategory) -> Self {
        Self {
            categories: vec![category],
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        (self.categories.is_empty() || self.categories.contains(&job.category))
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && (self.trigger_types.is_empty()
                || self.trigger_types.contains(&job.trigger_type))
            && self
                .integration_id
                .as_deref()
                .is_none_or(|id| job.spec.integration_id() == Some(id))
            && self
                .resource_type
                .as_deref()
                .is_none_or(|rt| job.spec.resource_type() == Some(rt))
            && self
                .benchmark_id
                .as_deref()
                .is_none_or(|b| job.spec.benchmark_id() == Some(b))
            && self.parent_id.is_none_or(|p| job.parent_id == Some(p))
            && self
                .created_by
                .as_deref()
                .is_none_or(|who| job.created_by == who)
            && self.created_after.is_none_or(|t| job.created_at >= t)
            && self.created_before.is_none_or(|t| job.created_at < t)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub total: u64,
    pub jobs: Vec<JobRecord>,
}

/// Outcome of [`JobStore::create_discovery_job`].
#[derive(Clone, Debug, PartialEq)]
pub enum DiscoveryCreate {
    Created(JobRecord),
    /// A non-terminal job for the same integration and resource type.
    AlreadyActive(JobRecord),
}

/// Persistence of job rows.
///
/// Every status change goes through a guarded update so that concurrent
/// writers (result consumer, sweeper, cancellation) resolve to exactly one
/// winner; the losers observe `false`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<JobRecord>;

    /// Create several rows atomically.
    async fn create_jobs(
        &self,
        jobs: Vec<NewJob>,
    ) -> anyhow::Result<Vec<JobRecord>>;

    /// Create a discovery job unless one is still active for the same
    /// integration and resource type. Returns the active job on conflict.
    async fn create_discovery_job(
        &self,
        job: NewJob,
    ) -> anyhow::Result<DiscoveryCreate>;

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>>;

    async fn get_jobs(&self, ids: &[JobId]) -> anyhow::Result<Vec<JobRecord>>;

    async fn list_jobs(&self, filter: &JobFilter) -> anyhow::Result<JobPage>;

    /// `created` jobs of a category, oldest first or shuffled.
    async fn fetch_created(
        &self,
        category: JobCategory,
        limit: usize,
        randomize: bool,
    ) -> anyhow::Result<Vec<JobRecord>>;

    async fn transition(
        &self,
        id: JobId,
        transition: &Transition,
    ) -> anyhow::Result<bool>;

    /// Update fields without changing status, while the job is in one of
    /// `statuses`.
    async fn patch_job(
        &self,
        id: JobId,
        statuses: &[JobStatus],
        patch: &JobPatch,
    ) -> anyhow::Result<bool>;

    /// `created -> queued`, recording the broker sequence.
    async fn mark_queued(&self, id: JobId, sequence: u64)
    -> anyhow::Result<bool>;

    async fn count_in_status(
        &self,
        category: JobCategory,
        statuses: &[JobStatus],
    ) -> anyhow::Result<u64>;

    /// Jobs of a category handed to the queue at or after `since`.
    async fn count_queued_since(
        &self,
        category: JobCategory,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Queued or running discovery jobs grouped by resource type.
    async fn running_by_resource_type(
        &self,
    ) -> anyhow::Result<HashMap<String, u64>>;

    async fn sweep(&self, rule: &SweepRule) -> anyhow::Result<u64>;

    async fn requeue_failed(&self, rule: &RetryRule) -> anyhow::Result<u64>;

    /// Non-terminal children of `parent` in `category`.
    async fn count_pending_children(
        &self,
        parent: JobId,
        category: JobCategory,
    ) -> anyhow::Result<u64>;
}

/// Waiting state of a sequencer row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerStatus {
    WaitingForDependencies,
    Finished,
    Failed,
}

impl SequencerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SequencerStatus::WaitingForDependencies => {
                "waiting_for_dependencies"
            }
            SequencerStatus::Finished => "finished",
            SequencerStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SequencerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting_for_dependencies" => {
                Ok(SequencerStatus::WaitingForDependencies)
            }
            "finished" => Ok(SequencerStatus::Finished),
            "failed" => Ok(SequencerStatus::Failed),
            other => Err(anyhow::anyhow!("unknown sequencer status {other:?}")),
        }
    }
}

/// Launches a follow-up job once a set of jobs has settled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSequencer {
    pub id: i64,
    pub dependency_source: JobCategory,
    pub dependency_list: Vec<JobId>,
    pub next_job: JobCategory,
    pub next_job_parameters: serde_json::Value,
    pub next_job_ids: Vec<JobId>,
    pub status: SequencerStatus,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewSequencer {
    pub dependency_source: JobCategory,
    pub dependency_list: Vec<JobId>,
    pub next_job: JobCategory,
    pub next_job_parameters: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickScanStatus {
    Created,
    Started,
    FetchingDependencies,
    RunningComplianceQuickScan,
    Finished,
    Failed,
}

impl QuickScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuickScanStatus::Created => "created",
            QuickScanStatus::Started => "started",
            QuickScanStatus::FetchingDependencies => "fetching_dependencies",
            QuickScanStatus::RunningComplianceQuickScan => {
                "running_compliance_quick_scan"
            }
            QuickScanStatus::Finished => "finished",
            QuickScanStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QuickScanStatus::Finished | QuickScanStatus::Failed)
    }
}

impl std::str::FromStr for QuickScanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            QuickScanStatus::Created,
            QuickScanStatus::Started,
            QuickScanStatus::FetchingDependencies,
            QuickScanStatus::RunningComplianceQuickScan,
            QuickScanStatus::Finished,
            QuickScanStatus::Failed,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| anyhow::anyhow!("unknown quick scan status {s:?}"))
    }
}

/// A discover-then-evaluate workflow over a framework and integrations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuickScanSequence {
    pub id: i64,
    pub framework_id: String,
    pub integration_ids: Vec<String>,
    pub include_results: bool,
    pub status: QuickScanStatus,
    pub failure_message: Option<String>,
    pub discovery_job_ids: Vec<JobId>,
    pub compliance_job_ids: Vec<JobId>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewQuickScan {
    pub framework_id: String,
    pub integration_ids: Vec<String>,
    pub include_results: bool,
    pub created_by: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuickScanPatch {
    pub failure_message: Option<String>,
    pub discovery_job_ids: Option<Vec<JobId>>,
    pub compliance_job_ids: Option<Vec<JobId>>,
}

impl QuickScanPatch {
    pub fn apply_to(&self, sequence: &mut QuickScanSequence) {
        if let Some(message) = &self.failure_message {
            sequence.failure_message =
                Some(crate::job::sanitize_failure_message(message));
        }
        if let Some(ids) = &self.discovery_job_ids {
            sequence.discovery_job_ids = ids.clone();
        }
        if let Some(ids) = &self.compliance_job_ids {
            sequence.compliance_job_ids = ids.clone();
        }
    }
}

/// Jobs created for one integration by a manual discovery trigger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrationDiscovery {
    pub trigger_id: String,
    pub integration_id: String,
    pub resource_types: Vec<String>,
    pub job_ids: Vec<JobId>,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
}

/// Persistence of the multi-job workflow rows.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create_sequencer(
        &self,
        sequencer: NewSequencer,
    ) -> anyhow::Result<JobSequencer>;

    async fn get_sequencer(&self, id: i64)
    -> anyhow::Result<Option<JobSequencer>>;

    async fn list_waiting_sequencers(
        &self,
        limit: usize,
    ) -> anyhow::Result<Vec<JobSequencer>>;

    /// `waiting -> finished`, storing the launched job ids.
    async fn finish_sequencer(
        &self,
        id: i64,
        next_job_ids: &[JobId],
    ) -> anyhow::Result<bool>;

    /// `waiting -> failed`.
    async fn fail_sequencer(&self, id: i64, message: &str)
    -> anyhow::Result<bool>;

    async fn create_quick_scan(
        &self,
        scan: NewQuickScan,
    ) -> anyhow::Result<QuickScanSequence>;

    async fn get_quick_scan(
        &self,
        id: i64,
    ) -> anyhow::Result<Option<QuickScanSequence>>;

    async fn list_quick_scans(
        &self,
        status: QuickScanStatus,
        limit: usize,
    ) -> anyhow::Result<Vec<QuickScanSequence>>;

    async fn advance_quick_scan(
        &self,
        id: i64,
        from: QuickScanStatus,
        to: QuickScanStatus,
        patch: &QuickScanPatch,
    ) -> anyhow::Result<bool>;

    async fn record_integration_discovery(
        &self,
        discovery: IntegrationDiscovery,
    ) -> anyhow::Result<()>;

    async fn list_integration_discoveries(
        &self,
        trigger_id: &str,
    ) -> anyhow::Result<Vec<IntegrationDiscovery>>;
}
