use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::{ControlCatalog, NamedQuery, render_query};
use crate::consumer::{JobResult, ResultOutcome, ResultStatus, apply_worker_result};
use crate::dispatch::{Dispatchable, JobContext, PreparedJob, default_topic};
use crate::job::{JobCategory, JobRecord, JobSpec};
use crate::store::JobPatch;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
    pub query: String,
}

/// Render `{{.key}}` placeholders from the catalog values overlaid with
/// job-level overrides. Placeholders the query declares as required, and
/// every placeholder of an ad hoc query, must resolve.
pub(crate) async fn render(
    catalog: &dyn ControlCatalog,
    text: &str,
    declared: Option<&NamedQuery>,
    overrides: impl IntoIterator<Item = (String, String)>,
) -> anyhow::Result<String> {
    let mut values = catalog.query_parameter_values().await?;
    values.extend(overrides);
    let (rendered, missing) = render_query(text, &values);
    let unresolved: Vec<_> = match declared {
        Some(query) => missing
            .into_iter()
            .filter(|key| {
                query.parameters.iter().any(|p| p.required && &p.key == key)
            })
            .collect(),
        None => missing,
    };
    if !unresolved.is_empty() {
        anyhow::bail!("missing query parameters: {}", unresolved.join(", "));
    }
    Ok(rendered)
}

/// Query-run jobs: a named or ad hoc query executed once, with its rows
/// stored on the job.
pub struct QueryRunHandler {
    catalog: Arc<dyn ControlCatalog>,
}

impl std::fmt::Debug for QueryRunHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRunHandler").finish_non_exhaustive()
    }
}

impl QueryRunHandler {
    pub fn new(catalog: Arc<dyn ControlCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Dispatchable for QueryRunHandler {
    fn category(&self) -> JobCategory {
        JobCategory::QueryRunner
    }

    async fn prepare(&self, job: &JobRecord) -> anyhow::Result<PreparedJob> {
        let JobSpec::QueryRunner(spec) = &job.spec else {
            anyhow::bail!("job {} is not a query run", job.id);
        };

        let named = match &spec.query_id {
            Some(id) => Some(
                self.catalog
                    .get_query(id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("query {id} not found"))?,
            ),
            None => None,
        };
        let text = spec
            .query
            .clone()
            .or_else(|| named.as_ref().map(|q| q.query.clone()))
            .ok_or_else(|| anyhow::anyhow!("job {} has no query text", job.id))?;

        let query = render(
            self.catalog.as_ref(),
            &text,
            named.as_ref(),
            spec.parameters.clone(),
        )
        .await?;
        let payload = QueryPayload {
            query_id: spec.query_id.clone(),
            control_id: None,
            query,
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

/// Query-validation jobs: check that a catalog query still runs.
pub struct QueryValidateHandler {
    catalog: Arc<dyn ControlCatalog>,
}

impl std::fmt::Debug for QueryValidateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryValidateHandler").finish_non_exhaustive()
    }
}

impl QueryValidateHandler {
    pub fn new(catalog: Arc<dyn ControlCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Dispatchable for QueryValidateHandler {
    fn category(&self) -> JobCategory {
        JobCategory::QueryValidator
    }

    async fn prepare(&self, job: &JobRecord) -> anyhow::Result<PreparedJob> {
        let JobSpec::QueryValidator(spec) = &job.spec else {
            anyhow::bail!("job {} is not a query validation", job.id);
        };
        let named = self
            .catalog
            .get_query(&spec.query_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("query {} not found", spec.query_id))?;
        let query =
            render(self.catalog.as_ref(), &named.query, Some(&named), std::iter::empty()).await?;
        let payload = QueryPayload {
            query_id: Some(spec.query_id.clone()),
            control_id: spec.control_id.clone(),
            query,
        };
        Ok(PreparedJob {
            topic: default_topic(job),
            payload: serde_json::to_value(payload)?,
        })
    }
}
