use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::IntegrationDirectory;
use crate::consumer::{JobResult, ResultOutcome, ResultStatus, apply_worker_result};
use crate::dispatch::{Dispatchable, JobContext, PreparedJob, published_topic};
use crate::events::JobEvent;
use crate::index::{DeleteTask, ResourceIndex};
use crate::job::{DiscoverySpec, JobCategory, JobRecord, JobStatus, TriggerType};
use crate::queue::StreamSpec;
use crate::store::{JobFilter, JobPatch, JobStore, Transition};

/// Payload a discovery worker receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub integration_id: String,
    pub integration_type: String,
    pub resource_type: String,
    /// Encrypted credential, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub trigger_type: TriggerType,
}

/// Discovery jobs: one (integration, resource type) pair per job, routed to
/// the integration type's own topic.
pub struct DiscoveryHandler {
    directory: Arc<dyn IntegrationDirectory>,
    index: Option<Arc<dyn ResourceIndex>>,
    integration_types: BTreeSet<String>,
    delete_old_resources: bool,
    reconcile_batch: u64,
}

impl std::fmt::Debug for DiscoveryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryHandler")
            .field("integration_types", &self.integration_types)
            .field("delete_old_resources", &self.delete_old_resources)
            .field("has_index", &self.index.is_some())
            .finish_non_exhaustive()
    }
}

impl DiscoveryHandler {
    pub fn new(directory: Arc<dyn IntegrationDirectory>) -> Self {
        Self {
            directory,
            index: None,
            integration_types: BTreeSet::new(),
            delete_old_resources: false,
            reconcile_batch: 500,
        }
    }

    /// Enables old-resource deletion when `delete_old_resources` is set.
    pub fn with_index(
        mut self,
        index: Arc<dyn ResourceIndex>,
        delete_old_resources: bool,
    ) -> Self {
        self.index = Some(index);
        self.delete_old_resources = delete_old_resources;
        self
    }

    /// Integration types whose streams are provisioned even with no
    /// integration registered yet.
    pub fn with_integration_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.integration_types
            .extend(types.into_iter().map(Into::into));
        self
    }

    fn spec(job: &JobRecord) -> anyhow::Result<&DiscoverySpec> {
        job.spec
            .as_discovery()
            .ok_or_else(|| anyhow::anyhow!("job {} is not a discovery job", job.id))
    }

    /// Start old-resource deletion for a succeeded run. Returns `Ignored`
    /// when another delivery of the same result got there first.
    async fn start_deletion(
        &self,
        ctx: &JobContext,
        index: &dyn ResourceIndex,
        job: &JobRecord,
        result: &JobResult,
    ) -> anyhow::Result<ResultOutcome> {
        let spec = Self::spec(job)?;
        let described = result
            .described_resource_count
            .unwrap_or(result.described_resource_ids.len() as u64);

        let to_deletion = Transition::new(
            JobCategory::Discovery,
            &[JobStatus::Queued, JobStatus::InProgress],
            JobStatus::OldResourceDeletion,
        )
        .with_patch(
            JobPatch::default().field("described_resource_count", described),
        );
        if !ctx.store.transition(job.id, &to_deletion).await? {
            // A redelivery after a crash between the transition and the
            // task submission still has to file the task.
            let current = ctx.store.get_job(job.id).await?;
            let resumable = current.as_ref().is_some_and(|j| {
                j.status == JobStatus::OldResourceDeletion
                    && j.spec
                        .as_discovery()
                        .is_some_and(|s| s.delete_task_id.is_none())
            });
            if !resumable {
                return Ok(ResultOutcome::Ignored);
            }
        }

        let indexed = match index
            .list_resources(&spec.integration_id, &spec.resource_type)
            .await
        {
            Ok(indexed) => indexed,
            Err(err) => return self.fail_deletion(ctx, job, &err).await,
        };

        let reported: HashSet<&str> = result
            .described_resource_ids
            .iter()
            .map(String::as_str)
            .collect();
        let stale: Vec<_> = indexed
            .into_iter()
            .filter(|resource| !reported.contains(resource.resource_id.as_str()))
            .collect();

        if stale.is_empty() {
            let done = Transition::new(
                JobCategory::Discovery,
                &[JobStatus::OldResourceDeletion],
                JobStatus::Succeeded,
            )
            .with_patch(JobPatch::default().field("deleting_resource_count", 0u64));
            if ctx.store.transition(job.id, &done).await? {
                ctx.emit(JobEvent::finished(
                    job.id,
                    job.category,
                    JobStatus::Succeeded,
                    job.parent_id,
                ));
            }
            return Ok(ResultOutcome::Applied);
        }

        let task = DeleteTask::stale_resources(
            job.id,
            &spec.integration_id,
            &spec.resource_type,
            &stale,
        );
        let task_id = match index.submit_delete_task(&task).await {
            Ok(task_id) => task_id,
            Err(err) => return self.fail_deletion(ctx, job, &err).await,
        };
        info!(
            job_id = %job.id,
            resource_type = %spec.resource_type,
            stale = stale.len(),
            task_id = %task_id,
            "old resource deletion requested"
        );
        ctx.store
            .patch_job(
                job.id,
                &[JobStatus::OldResourceDeletion],
                &JobPatch::default()
                    .field("delete_task_id", task_id)
                    .field("deleting_resource_count", stale.len() as u64),
            )
            .await?;
        Ok(ResultOutcome::Applied)
    }

    async fn fail_deletion(
        &self,
        ctx: &JobContext,
        job: &JobRecord,
        err: &anyhow::Error,
    ) -> anyhow::Result<ResultOutcome> {
        warn!(job_id = %job.id, error = %err, "old resource deletion failed");
        let failed = Transition::new(
            JobCategory::Discovery,
            &[JobStatus::OldResourceDeletion],
            JobStatus::Failed,
        )
        .with_patch(JobPatch::default().failure(format!("{err:#}")));
        if ctx.store.transition(job.id, &failed).await? {
            ctx.emit(JobEvent::finished(
                job.id,
                job.category,
                JobStatus::Failed,
                job.parent_id,
            ));
        }
        Ok(ResultOutcome::Applied)
    }

    /// Jobs waiting on a delete task that the index sweeper has finished.
    pub async fn reconcile_deletions(&self, ctx: &JobContext) -> anyhow::Result<u64> {
        let Some(index) = &self.index else {
            return Ok(0);
        };
        let filter = JobFilter {
            statuses: vec![JobStatus::OldResourceDeletion],
            limit: Some(self.reconcile_batch),
            ..JobFilter::category(JobCategory::Discovery)
        };
        let waiting = ctx.store.list_jobs(&filter).await?.jobs;

        let mut finished = 0;
        for job in waiting {
            let Some(task_id) = job
                .spec
                .as_discovery()
                .and_then(|spec| spec.delete_task_id.clone())
            else {
                continue;
            };
            if index.delete_task_pending(&task_id).await? {
                continue;
            }
            let done = Transition::new(
                JobCategory::Discovery,
                &[JobStatus::OldResourceDeletion],
                JobStatus::Succeeded,
            );
            if ctx.store.transition(job.id, &done).await? {
                ctx.emit(JobEvent::finished(
                    job.id,
                    job.category,
                    JobStatus::Succeeded,
                    job.parent_id,
                ));
                finished += 1;
            }
        }
        if finished > 0 {
            info!(count = finished, "old resource deletions finished");
        }
        Ok(finished)
    }
}

#[async_trait]
impl Dispatchable for DiscoveryHandler {
    fn category(&self) -> JobCategory {
        JobCategory::Discovery
    }

    fn workload_key(&self, job: &JobRecord) -> Option<String> {
        job.spec.resource_type().map(str::to_string)
    }

    async fn running_workloads(
        &self,
        store: &dyn JobStore,
    ) -> anyhow::Result<HashMap<String, u64>> {
        store.running_by_resource_type().await
    }

    async fn streams(&self) -> anyhow::Result<Vec<StreamSpec>> {
        let mut types = self.integration_types.clone();
        for integration in self.directory.list_integrations().await? {
            types.insert(integration.integration_type);
        }
        let mut streams = vec![StreamSpec::for_category(JobCategory::Discovery)];
        streams.extend(types.iter().map(|t| StreamSpec::for_integration_type(t)));
        Ok(streams)
    }

    async fn prepare(&self, job: &JobRecord) -> anyhow::Result<PreparedJob> {
        let spec = Self::spec(job)?;
        let integration = self
            .directory
            .get_integration(&spec.integration_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("integration {} not found", spec.integration_id)
            })?;
        if !integration.enabled {
            anyhow::bail!("integration {} is disabled", integration.id);
        }
        // Cancellation finds the message through the job row, so the row
        // and the directory must agree on the topic.
        if integration.integration_type != spec.integration_type {
            anyhow::bail!(
                "integration {} changed type from {} to {}",
                integration.id,
                spec.integration_type,
                integration.integration_type
            );
        }

        let payload = DiscoveryPayload {
            integration_id: integration.id,
            integration_type: integration.integration_type.clone(),
            resource_type: spec.resource_type.clone(),
            credential: integration.credential,
            trigger_type: job.trigger_type,
        };
        Ok(PreparedJob {
            topic: published_topic(job),
            payload: serde_json::to_value(payload)?,
        })
    }

    async fn apply_result(
        &self,
        ctx: &JobContext,
        job: &JobRecord,
        result: &JobResult,
    ) -> anyhow::Result<ResultOutcome> {
        if result.status == ResultStatus::Succeeded
            && self.delete_old_resources
            && let Some(index) = &self.index
        {
            return self
                .start_deletion(ctx, index.as_ref(), job, result)
                .await;
        }

        let mut extra = JobPatch::default();
        if result.status == ResultStatus::Succeeded {
            let described = result
                .described_resource_count
                .unwrap_or(result.described_resource_ids.len() as u64);
            extra = extra.field("described_resource_count", described);
        }
        apply_worker_result(ctx, job, result, extra).await
    }

    async fn maintain(&self, ctx: &JobContext) -> anyhow::Result<()> {
        self.reconcile_deletions(ctx).await?;
        Ok(())
    }
}
