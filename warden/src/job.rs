use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic job identifier assigned by the job store.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

/// The closed set of job categories the scheduler orchestrates.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    Discovery,
    Compliance,
    ComplianceRunner,
    ComplianceSummarizer,
    QueryRunner,
    QueryValidator,
    Audit,
    ComplianceQuickRun,
}

impl JobCategory {
    pub const ALL: [JobCategory; 8] = [
        JobCategory::Discovery,
        JobCategory::Compliance,
        JobCategory::ComplianceRunner,
        JobCategory::ComplianceSummarizer,
        JobCategory::QueryRunner,
        JobCategory::QueryValidator,
        JobCategory::Audit,
        JobCategory::ComplianceQuickRun,
    ];

    /// Categories published to the work queue. Compliance parents are
    /// advanced in-process and never leave the scheduler.
    pub const DISPATCHED: [JobCategory; 7] = [
        JobCategory::Discovery,
        JobCategory::ComplianceRunner,
        JobCategory::ComplianceSummarizer,
        JobCategory::QueryRunner,
        JobCategory::QueryValidator,
        JobCategory::Audit,
        JobCategory::ComplianceQuickRun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::Discovery => "discovery",
            JobCategory::Compliance => "compliance",
            JobCategory::ComplianceRunner => "compliance_runner",
            JobCategory::ComplianceSummarizer => "compliance_summarizer",
            JobCategory::QueryRunner => "query_runner",
            JobCategory::QueryValidator => "query_validator",
            JobCategory::Audit => "audit",
            JobCategory::ComplianceQuickRun => "compliance_quick_run",
        }
    }

    /// Prefix of the broker dedupe key, `"{prefix}-{job_id}-{retry}"`.
    pub fn dedupe_prefix(&self) -> &'static str {
        match self {
            JobCategory::Discovery => "describe",
            JobCategory::Compliance => "compliance",
            JobCategory::ComplianceRunner => "runner",
            JobCategory::ComplianceSummarizer => "summarizer",
            JobCategory::QueryRunner => "query-run",
            JobCategory::QueryValidator => "query-validate",
            JobCategory::Audit => "audit",
            JobCategory::ComplianceQuickRun => "quick-run",
        }
    }

    pub fn is_dispatched(&self) -> bool {
        !matches!(self, JobCategory::Compliance)
    }

    /// Whether `from -> to` is a legal edge of this category's state
    /// machine.
    pub fn allows(&self, from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;

        match self {
            JobCategory::Discovery => matches!(
                (from, to),
                (Created, Queued | Failed | Canceled)
                    | (
                        Queued,
                        InProgress
                            | OldResourceDeletion
                            | Succeeded
                            | Failed
                            | Timeout
                            | Canceled
                    )
                    | (
                        InProgress,
                        OldResourceDeletion | Succeeded | Failed | Timeout
                    )
                    | (OldResourceDeletion, Succeeded | Failed | Timeout)
                    | (Failed | Timeout, Created)
            ),
            JobCategory::Compliance => matches!(
                (from, to),
                (Created, RunnersInProgress | Failed | Canceled | Timeout)
                    | (
                        RunnersInProgress,
                        SummarizerInProgress | Failed | Timeout
                    )
                    | (SummarizerInProgress, Succeeded | Failed | Timeout)
            ),
            _ => matches!(
                (from, to),
                (Created, Queued | Failed | Canceled | Timeout)
                    | (
                        Queued,
                        InProgress | Succeeded | Failed | Timeout | Canceled
                    )
                    | (InProgress, Succeeded | Failed | Timeout)
                    | (Failed | Timeout, Created)
            ),
        }
    }
}

impl Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("job category", s))
    }
}

/// Lifecycle status shared by every job category.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    InProgress,
    OldResourceDeletion,
    RunnersInProgress,
    SummarizerInProgress,
    Succeeded,
    Failed,
    Timeout,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::Created,
        JobStatus::Queued,
        JobStatus::InProgress,
        JobStatus::OldResourceDeletion,
        JobStatus::RunnersInProgress,
        JobStatus::SummarizerInProgress,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Timeout,
        JobStatus::Canceled,
    ];

    pub const TERMINAL: [JobStatus; 4] = [
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Timeout,
        JobStatus::Canceled,
    ];

    pub const ACTIVE: [JobStatus; 6] = [
        JobStatus::Created,
        JobStatus::Queued,
        JobStatus::InProgress,
        JobStatus::OldResourceDeletion,
        JobStatus::RunnersInProgress,
        JobStatus::SummarizerInProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::OldResourceDeletion => "old_resource_deletion",
            JobStatus::RunnersInProgress => "runners_in_progress",
            JobStatus::SummarizerInProgress => "summarizer_in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        JobStatus::TERMINAL.contains(self)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("job status", s))
    }
}

/// What caused a job to be created.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerType {
    #[default]
    Scheduled,
    Manual,
    Stack,
    CostFullDiscovery,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
            TriggerType::Stack => "stack",
            TriggerType::CostFullDiscovery => "cost-full-discovery",
        }
    }

    /// Interactive triggers are published to the `-manuals` topic variant so
    /// they do not wait behind scheduled traffic.
    pub fn is_interactive(&self) -> bool {
        matches!(self, TriggerType::Manual | TriggerType::Stack)
    }
}

impl Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerType::Scheduled),
            "manual" => Ok(TriggerType::Manual),
            "stack" => Ok(TriggerType::Stack),
            "cost-full-discovery" => Ok(TriggerType::CostFullDiscovery),
            other => Err(UnknownVariant::new("trigger type", other)),
        }
    }
}

/// Parse failure for the string forms of the enums above.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Root-to-parent chain of benchmark ids enclosing a control.
pub type BenchmarkPath = Vec<String>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySpec {
    pub integration_id: String,
    pub integration_type: String,
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub described_resource_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleting_resource_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_task_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSpec {
    pub benchmark_id: String,
    pub integration_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerSpec {
    pub benchmark_id: String,
    pub control_id: String,
    pub query_id: String,
    pub integration_id: String,
    /// Every benchmark path that encloses the control, so findings can be
    /// attributed to each of them.
    pub ancestry: Vec<BenchmarkPath>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SummarizerSpec {
    pub benchmark_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryValidateSpec {
    pub query_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditSpec {
    pub framework_id: String,
    pub integration_ids: Vec<String>,
    #[serde(default)]
    pub include_results: bool,
    /// Worker output, when results were requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Category-specific job fields, stored as one JSON document per job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    Discovery(DiscoverySpec),
    Compliance(ComplianceSpec),
    ComplianceRunner(RunnerSpec),
    ComplianceSummarizer(SummarizerSpec),
    QueryRunner(QueryRunSpec),
    QueryValidator(QueryValidateSpec),
    Audit(AuditSpec),
    ComplianceQuickRun(AuditSpec),
}

impl JobSpec {
    pub fn category(&self) -> JobCategory {
        match self {
            JobSpec::Discovery(_) => JobCategory::Discovery,
            JobSpec::Compliance(_) => JobCategory::Compliance,
            JobSpec::ComplianceRunner(_) => JobCategory::ComplianceRunner,
            JobSpec::ComplianceSummarizer(_) => {
                JobCategory::ComplianceSummarizer
            }
            JobSpec::QueryRunner(_) => JobCategory::QueryRunner,
            JobSpec::QueryValidator(_) => JobCategory::QueryValidator,
            JobSpec::Audit(_) => JobCategory::Audit,
            JobSpec::ComplianceQuickRun(_) => JobCategory::ComplianceQuickRun,
        }
    }

    /// Integration the job is scoped to, when it is scoped to exactly one.
    pub fn integration_id(&self) -> Option<&str> {
        match self {
            JobSpec::Discovery(spec) => Some(&spec.integration_id),
            JobSpec::ComplianceRunner(spec) => Some(&spec.integration_id),
            _ => None,
        }
    }

    pub fn resource_type(&self) -> Option<&str> {
        match self {
            JobSpec::Discovery(spec) => Some(&spec.resource_type),
            _ => None,
        }
    }

    pub fn benchmark_id(&self) -> Option<&str> {
        match self {
            JobSpec::Compliance(spec) => Some(&spec.benchmark_id),
            JobSpec::ComplianceRunner(spec) => Some(&spec.benchmark_id),
            JobSpec::ComplianceSummarizer(spec) => Some(&spec.benchmark_id),
            JobSpec::Audit(spec) | JobSpec::ComplianceQuickRun(spec) => {
                Some(&spec.framework_id)
            }
            _ => None,
        }
    }

    pub fn as_discovery(&self) -> Option<&DiscoverySpec> {
        match self {
            JobSpec::Discovery(spec) => Some(spec),
            _ => None,
        }
    }
}

/// A persisted job row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub category: JobCategory,
    pub status: JobStatus,
    pub trigger_type: TriggerType,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub failure_message: Option<String>,
    pub error_code: Option<String>,
    pub queue_sequence: Option<u64>,
    pub parent_id: Option<JobId>,
    pub spec: JobSpec,
}

impl JobRecord {
    /// Broker dedupe key; a redelivered publish of the same attempt is
    /// collapsed by the queue.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.category.dedupe_prefix(),
            self.id,
            self.retry_count
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Input for creating a job row.
#[derive(Clone, Debug, PartialEq)]
pub struct NewJob {
    pub trigger_type: TriggerType,
    pub created_by: String,
    pub parent_id: Option<JobId>,
    pub status: JobStatus,
    pub spec: JobSpec,
}

impl NewJob {
    pub fn new(spec: JobSpec, trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            created_by: "system".to_string(),
            parent_id: None,
            status: JobStatus::Created,
            spec,
        }
    }

    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = who.into();
        self
    }

    pub fn with_parent(mut self, parent: JobId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Create the row directly in `status` instead of `created`.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn category(&self) -> JobCategory {
        self.spec.category()
    }
}

/// Strip NUL bytes, which text columns reject.
pub fn sanitize_failure_message(message: &str) -> String {
    message.replace('\0', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trips_through_str() {
        for category in JobCategory::ALL {
            assert_eq!(category.as_str().parse::<JobCategory>().unwrap(), category);
        }
        assert!("describe".parse::<JobCategory>().is_err());
    }

    #[test]
    fn test_discovery_state_machine() {
        let d = JobCategory::Discovery;
        assert!(d.allows(JobStatus::Created, JobStatus::Queued));
        assert!(d.allows(JobStatus::Queued, JobStatus::OldResourceDeletion));
        assert!(d.allows(JobStatus::OldResourceDeletion, JobStatus::Succeeded));
        assert!(!d.allows(JobStatus::InProgress, JobStatus::Canceled));
        assert!(!d.allows(JobStatus::Succeeded, JobStatus::Failed));
        assert!(!d.allows(JobStatus::Canceled, JobStatus::Created));
    }

    #[test]
    fn test_compliance_state_machine_has_no_queue_edges() {
        let c = JobCategory::Compliance;
        assert!(c.allows(JobStatus::Created, JobStatus::RunnersInProgress));
        assert!(c.allows(
            JobStatus::RunnersInProgress,
            JobStatus::SummarizerInProgress
        ));
        assert!(!c.allows(JobStatus::Created, JobStatus::Queued));
        assert!(!c.allows(JobStatus::Failed, JobStatus::Created));
    }

    #[test]
    fn test_terminal_statuses_never_leave_except_retry() {
        for category in JobCategory::ALL {
            for to in JobStatus::ALL {
                assert!(!category.allows(JobStatus::Succeeded, to));
                assert!(!category.allows(JobStatus::Canceled, to));
                if to != JobStatus::Created {
                    assert!(!category.allows(JobStatus::Failed, to));
                    assert!(!category.allows(JobStatus::Timeout, to));
                }
            }
        }
    }

    #[test]
    fn test_spec_serializes_with_kind_tag() {
        let spec = JobSpec::Discovery(DiscoverySpec {
            integration_id: "i-1".into(),
            integration_type: "aws_cloud_account".into(),
            resource_type: "AWS::EC2::Instance".into(),
            ..Default::default()
        });
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["kind"], "discovery");
        assert_eq!(value["resource_type"], "AWS::EC2::Instance");
        assert!(value.get("delete_task_id").is_none());

        let back: JobSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back.category(), JobCategory::Discovery);
    }

    #[test]
    fn test_sanitize_failure_message_strips_nul() {
        assert_eq!(sanitize_failure_message("bad\0 input\0"), "bad input");
    }

    #[test]
    fn test_trigger_interactive() {
        assert!(TriggerType::Manual.is_interactive());
        assert!(!TriggerType::CostFullDiscovery.is_interactive());
        assert_eq!(
            "cost-full-discovery".parse::<TriggerType>().unwrap(),
            TriggerType::CostFullDiscovery
        );
    }
}
