use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::ControlCatalog;
use crate::dispatch::{Dispatchable, PreparedJob, default_topic};
use crate::job::{BenchmarkPath, JobCategory, JobId, JobRecord, JobSpec};

/// Payload a compliance runner receives: one control evaluated against one
/// integration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerPayload {
    pub benchmark_id: String,
    pub control_id: String,
    pub query_id: String,
    pub query: String,
    pub integration_id: String,
    pub ancestry: Vec<BenchmarkPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<JobId>,
}

/// Compliance runner jobs.
pub struct RunnerHandler {
    catalog: Arc<dyn ControlCatalog>,
}

impl std::fmt::Debug for RunnerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerHandler").finish_non_exhaustive()
    }
}

impl RunnerHandler {
    pub fn new(catalog: Arc<dyn ControlCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Dispatchable for RunnerHandler {
    fn category(&self) -> JobCategory {
        JobCategory::ComplianceRunner
    }

    async fn prepare(&self, job: &JobRecord) -> anyhow::Result<PreparedJob> {
        let JobSpec::ComplianceRunner(spec) = &job.spec else {
            anyhow::bail!("job {} is not a compliance runner", job.id);
        };
        let query = self
            .catalog
            .get_query(&spec.query_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("query {} not found", spec.query_id))?;
        let rendered =
            super::query::render(self.catalog.as_ref(), &query.query, Some(&query), std::iter::empty())
                .await?;

        let payload = RunnerPayload {
            benchmark_id: spec.benchmark_id.clone(),
            control_id: spec.control_id.clone(),
            query_id: spec.query_id.clone(),
            query: rendered,
            integration_id: spec.integration_id.clone(),
            ancestry: spec.ancestry.clone(),
            parent_job_id: job.parent_id,
        };
        Ok(PreparedJob {
            topic: default_topic(job),
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// Summarizer jobs: fold runner findings of a compliance job into a
/// benchmark summary.
#[derive(Debug, Default)]
pub struct SummarizerHandler;

impl SummarizerHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dispatchable for SummarizerHandler {
    fn category(&self) -> JobCategory {
        JobCategory::ComplianceSummarizer
    }

    async fn prepare(&self, job: &JobRecord) -> anyhow::Result<PreparedJob> {
        let JobSpec::ComplianceSummarizer(spec) = &job.spec else {
            anyhow::bail!("job {} is not a summarizer", job.id);
        };
        let parent = job
            .parent_id
            .ok_or_else(|| anyhow::anyhow!("summarizer {} has no parent", job.id))?;
        Ok(PreparedJob {
            topic: default_topic(job),
            payload: serde_json::json!({
                "benchmark_id": spec.benchmark_id,
                "parent_job_id": parent,
            }),
        })
    }
}
