//! JSON over HTTP front door.
//!
//! Every route is a thin adapter over [`JobScheduler`] or
//! [`DescribeService`]; errors map to status codes in [`error`].

mod error;
mod routes;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::describe_service::DescribeService;
use crate::triggers::JobScheduler;

/// Shared handler state.
#[derive(Clone, Debug)]
pub struct ApiState {
    pub scheduler: Arc<JobScheduler>,
    pub describe: Arc<DescribeService>,
}

impl ApiState {
    pub fn new(scheduler: JobScheduler, describe: DescribeService) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            describe: Arc::new(describe),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<ApiState> {
    Router::new()
        .route("/describe", post(routes::describe))
        .route("/discovery", post(routes::run_discovery))
        .route("/discovery/{trigger_id}", get(routes::discovery_status))
        .route("/compliance", post(routes::run_compliance))
        .route("/audit", post(routes::run_audit))
        .route("/quick-scan", post(routes::start_quick_scan))
        .route("/quick-scan/{id}", get(routes::quick_scan_status))
        .route("/query/run", post(routes::run_query))
        .route("/query/validate", post(routes::validate_query))
        .route("/query/{id}/result", get(routes::query_result))
        .route("/jobs", get(routes::list_jobs))
        .route("/jobs/search", post(routes::search_jobs))
        .route("/jobs/cancel", post(routes::cancel))
        .route("/jobs/{id}", get(routes::job_status))
        .route("/sequencers/{id}", get(routes::sequencer_status))
        .route("/describe/jobs/{id}/in-progress", post(routes::describe_in_progress))
        .route("/describe/results", post(routes::describe_result))
}
