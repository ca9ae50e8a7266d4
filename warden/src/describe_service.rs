//! Synchronous status reporting for discovery workers that call in
//! directly instead of publishing to the result topic.

use std::sync::Arc;

use crate::consumer::{JobResult, ResultOutcome, ResultStatus};
use crate::dispatch::{Dispatchable, JobContext};
use crate::error::{Result, WardenError};
use crate::handlers::DiscoveryHandler;
use crate::job::{JobCategory, JobId, JobRecord};

#[derive(Debug, Clone)]
pub struct DescribeService {
    handler: Arc<DiscoveryHandler>,
    ctx: JobContext,
}

impl DescribeService {
    pub fn new(handler: Arc<DiscoveryHandler>, ctx: JobContext) -> Self {
        Self { handler, ctx }
    }

    async fn discovery_job(&self, job_id: JobId) -> Result<JobRecord> {
        let job = self
            .ctx
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| WardenError::not_found(format!("job {job_id}")))?;
        if job.category != JobCategory::Discovery {
            return Err(WardenError::invalid(format!(
                "job {job_id} is a {} job",
                job.category
            )));
        }
        Ok(job)
    }

    /// `queued -> in_progress`. A job that already moved on is left alone.
    pub async fn set_in_progress(&self, job_id: JobId) -> Result<ResultOutcome> {
        let job = self.discovery_job(job_id).await?;
        let result = JobResult::new(job_id, ResultStatus::InProgress);
        Ok(self.handler.apply_result(&self.ctx, &job, &result).await?)
    }

    /// Apply a result exactly as the result consumer would.
    pub async fn deliver_result(&self, result: JobResult) -> Result<ResultOutcome> {
        let job = self.discovery_job(result.job_id).await?;
        Ok(self.handler.apply_result(&self.ctx, &job, &result).await?)
    }
}
