use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::{ControlCatalog, benchmark_controls};
use crate::consumer::{JobResult, ResultOutcome, ResultStatus, apply_worker_result};
use crate::dispatch::{Dispatchable, JobContext, PreparedJob, default_topic};
use crate::job::{JobCategory, JobRecord, JobSpec};
use crate::store::JobPatch;

/// Framework-wide evaluation request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditPayload {
    pub framework_id: String,
    pub integration_ids: Vec<String>,
    pub include_results: bool,
    /// Controls under the framework, resolved when the job is published.
    pub controls: Vec<String>,
}

/// Audit and compliance quick-run jobs. Both evaluate a whole framework in
/// one worker call and differ only in the stream they use.
pub struct AuditHandler {
    category: JobCategory,
    catalog: Arc<dyn ControlCatalog>,
}

impl std::fmt::Debug for AuditHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditHandler")
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl AuditHandler {
    pub fn audit(catalog: Arc<dyn ControlCatalog>) -> Self {
        Self {
            category: JobCategory::Audit,
            catalog,
        }
    }

    pub fn quick_run(catalog: Arc<dyn ControlCatalog>) -> Self {
        Self {
            category: JobCategory::ComplianceQuickRun,
            catalog,
        }
    }
}

#[async_trait]
impl Dispatchable for AuditHandler {
    fn category(&self) -> JobCategory {
        self.category
    }

    async fn prepare(&self, job: &JobRecord) -> anyhow::Result<PreparedJob> {
        let spec = match &job.spec {
            JobSpec::Audit(spec) | JobSpec::ComplianceQuickRun(spec) => spec,
            _ => anyhow::bail!("job {} is not an audit", job.id),
        };
        let controls = benchmark_controls(self.catalog.as_ref(), &spec.framework_id)
            .await?
            .into_keys()
            .collect();

        let payload = AuditPayload {
            framework_id: spec.framework_id.clone(),
            integration_ids: spec.integration_ids.clone(),
            include_results: spec.include_results,
            controls,
        };
        Ok(PreparedJob {
            topic: default_topic(job),
            payload: serde_json::to_value(payload)?,
        })
    }

    async fn apply_result(
        &self,
        ctx: &JobContext,
        job: &JobRecord,
        result: &JobResult,
    ) -> anyhow::Result<ResultOutcome> {
        let mut extra = JobPatch::default();
        if result.status == ResultStatus::Succeeded
            && let Some(output) = &result.output
        {
            extra = extra.field("result", output.clone());
        }
        apply_worker_result(ctx, job, result, extra).await
    }
}
