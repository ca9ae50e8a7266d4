use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use warden::job::{JobCategory, JobId, JobRecord, JobStatus, NewJob};
use warden::store::{
    DiscoveryCreate, IntegrationDiscovery, JobFilter, JobPage, JobPatch,
    JobSequencer, JobStore, NewQuickScan, NewSequencer, QuickScanPatch,
    QuickScanSequence, QuickScanStatus, RetryRule, SequencerStatus, SortField,
    SortOrder, SweepRule, Transition, WorkflowStore,
};

#[derive(Default)]
struct State {
    next_job: i64,
    jobs: BTreeMap<JobId, JobRecord>,
    next_sequencer: i64,
    sequencers: BTreeMap<i64, JobSequencer>,
    next_scan: i64,
    scans: BTreeMap<i64, QuickScanSequence>,
    discoveries: Vec<IntegrationDiscovery>,
}

impl State {
    fn insert(&mut self, job: NewJob) -> JobRecord {
        self.next_job += 1;
        let now = Utc::now();
        let record = JobRecord {
            id: JobId(self.next_job),
            category: job.category(),
            status: job.status,
            trigger_type: job.trigger_type,
            created_by: job.created_by,
            created_at: now,
            updated_at: now,
            queued_at: None,
            retry_count: 0,
            failure_message: None,
            error_code: None,
            queue_sequence: None,
            parent_id: job.parent_id,
            spec: job.spec,
        };
        self.jobs.insert(record.id, record.clone());
        record
    }

    /// A discovery row with a newer or active sibling for the same
    /// integration and resource type.
    fn superseded_discovery(&self, job: &JobRecord) -> bool {
        job.category == JobCategory::Discovery
            && self.jobs.values().any(|other| {
                other.id != job.id
                    && other.category == JobCategory::Discovery
                    && other.spec.integration_id() == job.spec.integration_id()
                    && other.spec.resource_type() == job.spec.resource_type()
                    && (other.id > job.id || JobStatus::ACTIVE.contains(&other.status))
            })
    }

    fn parent_collecting_runners(&self, job: &JobRecord) -> bool {
        job.category != JobCategory::ComplianceRunner
            || job.parent_id.is_none_or(|parent| {
                self.jobs
                    .get(&parent)
                    .is_some_and(|p| p.status == JobStatus::RunnersInProgress)
            })
    }

    fn active_discovery(&self, job: &NewJob) -> Option<&JobRecord> {
        self.jobs.values().rev().find(|existing| {
            existing.category == JobCategory::Discovery
                && JobStatus::ACTIVE.contains(&existing.status)
                && existing.spec.integration_id() == job.spec.integration_id()
                && existing.spec.resource_type() == job.spec.resource_type()
        })
    }
}

/// Job and workflow rows held in memory.
///
/// Guarded updates take one lock for the check and the write, so they
/// resolve races exactly like the conditional updates of the SQL store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryStore")
            .field("jobs", &state.jobs.len())
            .field("sequencers", &state.sequencers.len())
            .field("quick_scans", &state.scans.len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.state.lock().jobs.values().cloned().collect()
    }

    pub fn jobs_in(&self, category: JobCategory) -> Vec<JobRecord> {
        self.state
            .lock()
            .jobs
            .values()
            .filter(|job| job.category == category)
            .cloned()
            .collect()
    }

    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.state.lock().jobs.get(&id).cloned()
    }

    /// Mutate a row directly, bypassing the state machine.
    pub fn update(&self, id: JobId, f: impl FnOnce(&mut JobRecord)) {
        if let Some(job) = self.state.lock().jobs.get_mut(&id) {
            f(job);
        }
    }

    /// Move both timestamps of a job into the past.
    pub fn backdate(&self, id: JobId, by: Duration) {
        self.update(id, |job| {
            job.created_at -= by;
            job.updated_at -= by;
            if let Some(queued_at) = job.queued_at.as_mut() {
                *queued_at -= by;
            }
        });
    }

    pub fn sequencers(&self) -> Vec<JobSequencer> {
        self.state.lock().sequencers.values().cloned().collect()
    }

    pub fn quick_scans(&self) -> Vec<QuickScanSequence> {
        self.state.lock().scans.values().cloned().collect()
    }

    pub fn update_quick_scan(&self, id: i64, f: impl FnOnce(&mut QuickScanSequence)) {
        if let Some(scan) = self.state.lock().scans.get_mut(&id) {
            f(scan);
        }
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<JobRecord> {
        let mut state = self.state.lock();
        if job.category() == JobCategory::Discovery
            && JobStatus::ACTIVE.contains(&job.status)
            && state.active_discovery(&job).is_some()
        {
            anyhow::bail!("job conflicts with an active job");
        }
        Ok(state.insert(job))
    }

    async fn create_jobs(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<JobRecord>> {
        let mut state = self.state.lock();
        Ok(jobs.into_iter().map(|job| state.insert(job)).collect())
    }

    async fn create_discovery_job(&self, job: NewJob) -> anyhow::Result<DiscoveryCreate> {
        let mut state = self.state.lock();
        if let Some(existing) = state.active_discovery(&job) {
            return Ok(DiscoveryCreate::AlreadyActive(existing.clone()));
        }
        Ok(DiscoveryCreate::Created(state.insert(job)))
    }

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        Ok(self.job(id))
    }

    async fn get_jobs(&self, ids: &[JobId]) -> anyhow::Result<Vec<JobRecord>> {
        let state = self.state.lock();
        let mut jobs: Vec<_> = ids.iter().filter_map(|id| state.jobs.get(id).cloned()).collect();
        jobs.sort_by_key(|job| job.id);
        jobs.dedup_by_key(|job| job.id);
        Ok(jobs)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> anyhow::Result<JobPage> {
        let mut jobs: Vec<_> = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            let ordering = match filter.sort_by {
                SortField::Id => a.id.cmp(&b.id),
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                SortField::Status => a.status.as_str().cmp(b.status.as_str()),
            }
            .then(a.id.cmp(&b.id));
            match filter.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
        let total = jobs.len() as u64;
        let jobs = jobs
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit.map_or(usize::MAX, |limit| limit as usize))
            .collect();
        Ok(JobPage { total, jobs })
    }

    async fn fetch_created(
        &self,
        category: JobCategory,
        limit: usize,
        randomize: bool,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let mut jobs: Vec<_> = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| job.category == category && job.status == JobStatus::Created)
            .cloned()
            .collect();
        if randomize {
            jobs.shuffle(&mut rand::rng());
        }
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn transition(&self, id: JobId, transition: &Transition) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !transition.matches(job) {
            return Ok(false);
        }
        transition.patch.apply_to(job)?;
        job.status = transition.to;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn patch_job(
        &self,
        id: JobId,
        statuses: &[JobStatus],
        patch: &JobPatch,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !statuses.contains(&job.status) {
            return Ok(false);
        }
        patch.apply_to(job)?;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_queued(&self, id: JobId, sequence: u64) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Created {
            return Ok(false);
        }
        let now = Utc::now();
        job.status = JobStatus::Queued;
        job.queue_sequence = Some(sequence);
        job.queued_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn count_in_status(
        &self,
        category: JobCategory,
        statuses: &[JobStatus],
    ) -> anyhow::Result<u64> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| job.category == category && statuses.contains(&job.status))
            .count() as u64)
    }

    async fn count_queued_since(
        &self,
        category: JobCategory,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| {
                job.category == category && job.queued_at.is_some_and(|at| at >= since)
            })
            .count() as u64)
    }

    async fn running_by_resource_type(&self) -> anyhow::Result<HashMap<String, u64>> {
        let mut out = HashMap::new();
        for job in self.state.lock().jobs.values() {
            if job.category != JobCategory::Discovery
                || !matches!(job.status, JobStatus::Queued | JobStatus::InProgress)
            {
                continue;
            }
            if let Some(resource_type) = job.spec.resource_type() {
                *out.entry(resource_type.to_string()).or_insert(0) += 1;
            }
        }
        Ok(out)
    }

    async fn sweep(&self, rule: &SweepRule) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut swept = 0;
        for job in self.state.lock().jobs.values_mut() {
            if rule.matches(job, now) {
                job.status = rule.to;
                job.failure_message = Some(rule.message.clone());
                job.updated_at = now;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn requeue_failed(&self, rule: &RetryRule) -> anyhow::Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let eligible: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                rule.matches(job, now)
                    && !state.superseded_discovery(job)
                    && state.parent_collecting_runners(job)
            })
            .map(|job| job.id)
            .collect();
        let mut requeued = 0;
        for id in eligible {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Created;
                job.retry_count += 1;
                job.failure_message = None;
                job.error_code = None;
                job.queue_sequence = None;
                job.queued_at = None;
                job.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn count_pending_children(
        &self,
        parent: JobId,
        category: JobCategory,
    ) -> anyhow::Result<u64> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| {
                job.parent_id == Some(parent) && job.category == category && !job.is_terminal()
            })
            .count() as u64)
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn create_sequencer(&self, sequencer: NewSequencer) -> anyhow::Result<JobSequencer> {
        let mut state = self.state.lock();
        state.next_sequencer += 1;
        let now = Utc::now();
        let row = JobSequencer {
            id: state.next_sequencer,
            dependency_source: sequencer.dependency_source,
            dependency_list: sequencer.dependency_list,
            next_job: sequencer.next_job,
            next_job_parameters: sequencer.next_job_parameters,
            next_job_ids: Vec::new(),
            status: SequencerStatus::WaitingForDependencies,
            failure_message: None,
            created_at: now,
            updated_at: now,
        };
        state.sequencers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_sequencer(&self, id: i64) -> anyhow::Result<Option<JobSequencer>> {
        Ok(self.state.lock().sequencers.get(&id).cloned())
    }

    async fn list_waiting_sequencers(&self, limit: usize) -> anyhow::Result<Vec<JobSequencer>> {
        Ok(self
            .state
            .lock()
            .sequencers
            .values()
            .filter(|row| row.status == SequencerStatus::WaitingForDependencies)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn finish_sequencer(&self, id: i64, next_job_ids: &[JobId]) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let Some(row) = state.sequencers.get_mut(&id) else {
            return Ok(false);
        };
        if row.status != SequencerStatus::WaitingForDependencies {
            return Ok(false);
        }
        row.status = SequencerStatus::Finished;
        row.next_job_ids = next_job_ids.to_vec();
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_sequencer(&self, id: i64, message: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let Some(row) = state.sequencers.get_mut(&id) else {
            return Ok(false);
        };
        if row.status != SequencerStatus::WaitingForDependencies {
            return Ok(false);
        }
        row.status = SequencerStatus::Failed;
        row.failure_message = Some(warden::job::sanitize_failure_message(message));
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn create_quick_scan(&self, scan: NewQuickScan) -> anyhow::Result<QuickScanSequence> {
        let mut state = self.state.lock();
        state.next_scan += 1;
        let now = Utc::now();
        let row = QuickScanSequence {
            id: state.next_scan,
            framework_id: scan.framework_id,
            integration_ids: scan.integration_ids,
            include_results: scan.include_results,
            status: QuickScanStatus::Created,
            failure_message: None,
            discovery_job_ids: Vec::new(),
            compliance_job_ids: Vec::new(),
            created_by: scan.created_by,
            created_at: now,
            updated_at: now,
        };
        state.scans.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_quick_scan(&self, id: i64) -> anyhow::Result<Option<QuickScanSequence>> {
        Ok(self.state.lock().scans.get(&id).cloned())
    }

    async fn list_quick_scans(
        &self,
        status: QuickScanStatus,
        limit: usize,
    ) -> anyhow::Result<Vec<QuickScanSequence>> {
        Ok(self
            .state
            .lock()
            .scans
            .values()
            .filter(|row| row.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn advance_quick_scan(
        &self,
        id: i64,
        from: QuickScanStatus,
        to: QuickScanStatus,
        patch: &QuickScanPatch,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        let Some(row) = state.scans.get_mut(&id) else {
            return Ok(false);
        };
        if row.status != from {
            return Ok(false);
        }
        patch.apply_to(row);
        row.status = to;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_integration_discovery(
        &self,
        discovery: IntegrationDiscovery,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.discoveries.retain(|existing| {
            existing.trigger_id != discovery.trigger_id
                || existing.integration_id != discovery.integration_id
        });
        state.discoveries.push(discovery);
        Ok(())
    }

    async fn list_integration_discoveries(
        &self,
        trigger_id: &str,
    ) -> anyhow::Result<Vec<IntegrationDiscovery>> {
        let mut out: Vec<_> = self
            .state
            .lock()
            .discoveries
            .iter()
            .filter(|discovery| discovery.trigger_id == trigger_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.integration_id.cmp(&b.integration_id));
        Ok(out)
    }
}
