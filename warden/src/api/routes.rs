use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use super::ApiState;
use crate::consumer::JobResult;
use crate::error::{Result, WardenError};
use crate::job::{JobCategory, JobId, JobRecord, JobStatus};
use crate::store::{JobFilter, JobPage, JobSequencer, QuickScanSequence, SortField, SortOrder};
use crate::triggers::{
    AuditRequest, CancelOutcome, CancelSelector, ComplianceRequest,
    ComplianceTrigger, DescribeRequest, DiscoveryRequest, DiscoveryTrigger,
    DiscoveryTriggerStatus, QueryRunRequest, QueryRunResult,
    QueryValidateRequest, QuickScanRequest,
};

const DEFAULT_PAGE: u64 = 100;

pub async fn health() -> &'static str {
    "OK"
}

#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String> {
    Ok(crate::metrics::gather_metrics()?)
}

#[cfg(not(feature = "metrics"))]
pub async fn metrics() -> StatusCode {
    StatusCode::NOT_FOUND
}

pub async fn describe(
    State(state): State<ApiState>,
    Json(request): Json<DescribeRequest>,
) -> Result<(StatusCode, Json<JobRecord>)> {
    let job = state.scheduler.describe(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn run_discovery(
    State(state): State<ApiState>,
    Json(request): Json<DiscoveryRequest>,
) -> Result<(StatusCode, Json<DiscoveryTrigger>)> {
    let trigger = state.scheduler.run_discovery(request).await?;
    Ok((StatusCode::ACCEPTED, Json(trigger)))
}

pub async fn discovery_status(
    State(state): State<ApiState>,
    Path(trigger_id): Path<String>,
) -> Result<Json<DiscoveryTriggerStatus>> {
    Ok(Json(
        state.scheduler.discovery_trigger_status(&trigger_id).await?,
    ))
}

pub async fn run_compliance(
    State(state): State<ApiState>,
    Json(request): Json<ComplianceRequest>,
) -> Result<(StatusCode, Json<ComplianceTrigger>)> {
    let trigger = state.scheduler.run_compliance(request).await?;
    Ok((StatusCode::ACCEPTED, Json(trigger)))
}

pub async fn run_audit(
    State(state): State<ApiState>,
    Json(request): Json<AuditRequest>,
) -> Result<(StatusCode, Json<JobRecord>)> {
    let job = state.scheduler.run_audit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn start_quick_scan(
    State(state): State<ApiState>,
    Json(request): Json<QuickScanRequest>,
) -> Result<(StatusCode, Json<QuickScanSequence>)> {
    let sequence = state.scheduler.start_quick_scan(request).await?;
    Ok((StatusCode::ACCEPTED, Json(sequence)))
}

pub async fn quick_scan_status(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<QuickScanSequence>> {
    Ok(Json(state.scheduler.quick_scan_status(id).await?))
}

pub async fn run_query(
    State(state): State<ApiState>,
    Json(request): Json<QueryRunRequest>,
) -> Result<(StatusCode, Json<JobRecord>)> {
    let job = state.scheduler.run_query(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn validate_query(
    State(state): State<ApiState>,
    Json(request): Json<QueryValidateRequest>,
) -> Result<(StatusCode, Json<JobRecord>)> {
    let job = state.scheduler.validate_query(request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn query_result(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<QueryRunResult>> {
    Ok(Json(state.scheduler.query_result(JobId(id)).await?))
}

pub async fn job_status(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<JobRecord>> {
    Ok(Json(state.scheduler.job_status(JobId(id)).await?))
}

/// Single-valued query-string form of [`JobFilter`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    pub category: Option<JobCategory>,
    pub status: Option<JobStatus>,
    pub integration_id: Option<String>,
    pub resource_type: Option<String>,
    pub benchmark_id: Option<String>,
    pub parent_id: Option<i64>,
    pub sort_by: Option<SortField>,
    pub sort_order: Option<SortOrder>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl From<ListQuery> for JobFilter {
    fn from(query: ListQuery) -> Self {
        JobFilter {
            categories: query.category.into_iter().collect(),
            statuses: query.status.into_iter().collect(),
            integration_id: query.integration_id,
            resource_type: query.resource_type,
            benchmark_id: query.benchmark_id,
            parent_id: query.parent_id.map(JobId),
            sort_by: query.sort_by.unwrap_or_default(),
            sort_order: query.sort_order.unwrap_or_default(),
            offset: query.offset.unwrap_or_default(),
            limit: Some(query.limit.unwrap_or(DEFAULT_PAGE)),
            ..Default::default()
        }
    }
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<JobPage>> {
    let filter = JobFilter::from(query);
    Ok(Json(state.scheduler.list_jobs(&filter).await?))
}

pub async fn search_jobs(
    State(state): State<ApiState>,
    Json(mut filter): Json<JobFilter>,
) -> Result<Json<JobPage>> {
    filter.limit = Some(filter.limit.unwrap_or(DEFAULT_PAGE));
    Ok(Json(state.scheduler.list_jobs(&filter).await?))
}

pub async fn cancel(
    State(state): State<ApiState>,
    Json(selector): Json<CancelSelector>,
) -> Result<Json<Vec<CancelOutcome>>> {
    if let CancelSelector::Ids { job_ids } = &selector
        && job_ids.is_empty()
    {
        return Err(WardenError::invalid("no job ids given"));
    }
    Ok(Json(state.scheduler.cancel(selector).await?))
}

pub async fn sequencer_status(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<JobSequencer>> {
    Ok(Json(state.scheduler.sequencer_status(id).await?))
}

pub async fn describe_in_progress(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let outcome = state.describe.set_in_progress(JobId(id)).await?;
    Ok(Json(json!({ "outcome": outcome.as_str() })))
}

pub async fn describe_result(
    State(state): State<ApiState>,
    Json(result): Json<JobResult>,
) -> Result<impl IntoResponse> {
    let outcome = state.describe.deliver_result(result).await?;
    Ok(Json(json!({ "outcome": outcome.as_str() })))
}
