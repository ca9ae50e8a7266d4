//! HTTP surface driven in-process against in-memory backends.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use warden::api::{ApiState, router};
use warden::config::{DispatchConfig, WardenConfig};
use warden::dispatch::{DispatchLoop, WorkerEnvelope};
use warden::governor::Governor;
use warden::handlers::DiscoveryHandler;
use warden::job::{JobId, JobStatus, TriggerType};
use warden::queue::discovery_topic;
use warden::runtime::WardenRuntimeBuilder;
use warden::timeouts::{TimeoutConfig, TimeoutSweeper};
use warden_testkit::{AWS, EC2_INSTANCE, Harness, S3_BUCKET};

fn app(h: &Harness) -> Router {
    let runtime = WardenRuntimeBuilder::new(WardenConfig::default())
        .with_store(Arc::new(h.store.clone()))
        .with_workflows(Arc::new(h.store.clone()))
        .with_queue(Arc::new(h.queue.clone()))
        .with_integrations(h.catalog.clone())
        .with_catalog(h.catalog.clone())
        .with_index(Arc::new(h.index.clone()))
        .with_events(h.events.clone())
        .build()
        .unwrap();
    router(ApiState::new(
        runtime.scheduler().clone(),
        runtime.describe_service().clone(),
    ))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new();
    let (status, body) = send(&app(&h), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".into()));
}

#[tokio::test]
async fn test_describe_conflicts_while_active() {
    let h = Harness::new();
    let app = app(&h);
    let request = json!({ "integration_id": "aws-1", "resource_type": S3_BUCKET });

    let (status, job) = send(&app, "POST", "/api/v1/describe", Some(request.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(job["status"], "created");
    assert_eq!(job["trigger_type"], "manual");

    let (status, body) = send(&app, "POST", "/api/v1/describe", Some(request)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["status"], 409);
    assert_eq!(body["error"]["job_id"], job["id"]);
}

#[tokio::test]
async fn test_describe_rejects_unusable_integrations() {
    let h = Harness::new();
    let app = app(&h);

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/describe",
        Some(json!({ "integration_id": "aws-3", "resource_type": S3_BUCKET })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("disabled"));

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/describe",
        Some(json!({ "integration_id": "gcp-9", "resource_type": S3_BUCKET })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.store.jobs().is_empty());
}

#[tokio::test]
async fn test_job_status() {
    let h = Harness::new();
    let app = app(&h);
    let (_, job) = send(
        &app,
        "POST",
        "/api/v1/describe",
        Some(json!({ "integration_id": "aws-2", "resource_type": S3_BUCKET })),
    )
    .await;

    let uri = format!("/api/v1/jobs/{}", job["id"]);
    let (status, fetched) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], job["id"]);
    assert_eq!(fetched["category"], "discovery");

    let (status, _) = send(&app, "GET", "/api/v1/jobs/4242", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel() {
    let h = Harness::new();
    let app = app(&h);

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/jobs/cancel",
        Some(json!({ "by": "ids", "job_ids": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, job) = send(
        &app,
        "POST",
        "/api/v1/describe",
        Some(json!({ "integration_id": "aws-1", "resource_type": S3_BUCKET })),
    )
    .await;
    let (status, outcomes) = send(
        &app,
        "POST",
        "/api/v1/jobs/cancel",
        Some(json!({ "by": "ids", "job_ids": [job["id"], 4242] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcomes[0]["outcome"], "canceled");
    assert_eq!(outcomes[1]["outcome"], "not_found");

    let uri = format!("/api/v1/jobs/{}", job["id"]);
    let (_, fetched) = send(&app, "GET", &uri, None).await;
    assert_eq!(fetched["status"], "canceled");
}

async fn describe(app: &Router, resource_type: &str) -> JobId {
    let (status, job) = send(
        app,
        "POST",
        "/api/v1/describe",
        Some(json!({ "integration_id": "aws-1", "resource_type": resource_type })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    JobId(job["id"].as_i64().unwrap())
}

async fn dispatch_discovery(h: &Harness) {
    let dispatch = DispatchLoop::new(
        Arc::new(DiscoveryHandler::new(h.catalog.clone())),
        h.ctx(),
        Arc::new(h.queue.clone()),
        Governor::default(),
        TimeoutSweeper::new(Arc::new(h.store.clone()), TimeoutConfig::default()),
        DispatchConfig::default(),
    );
    dispatch.provision().await.unwrap();
    dispatch.run_cycle().await.unwrap();
}

fn pending_job_ids(h: &Harness) -> Vec<JobId> {
    h.queue
        .pending(&discovery_topic(AWS, TriggerType::Manual))
        .into_iter()
        .map(|message| serde_json::from_slice::<WorkerEnvelope>(&message.payload).unwrap())
        .map(|envelope| envelope.job_id)
        .collect()
}

#[tokio::test]
async fn test_cancel_queued_and_running_jobs() {
    let h = Harness::new();
    let app = app(&h);
    let queued = describe(&app, S3_BUCKET).await;
    let running = describe(&app, EC2_INSTANCE).await;
    dispatch_discovery(&h).await;
    assert_eq!(h.store.job(queued).unwrap().status, JobStatus::Queued);
    h.store.update(running, |job| job.status = JobStatus::InProgress);

    let (status, outcomes) = send(
        &app,
        "POST",
        "/api/v1/jobs/cancel",
        Some(json!({ "by": "ids", "job_ids": [queued, running] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcomes[0]["outcome"], "canceled");
    assert_eq!(outcomes[1]["outcome"], "unable_to_cancel");
    assert_eq!(outcomes[1]["reason"], "already in progress");

    assert_eq!(h.store.job(queued).unwrap().status, JobStatus::Canceled);
    assert_eq!(h.store.job(running).unwrap().status, JobStatus::InProgress);
    assert_eq!(pending_job_ids(&h), vec![running]);
}

#[tokio::test]
async fn test_cancel_reports_broker_errors_per_job() {
    let h = Harness::new();
    let app = app(&h);
    let queued = describe(&app, S3_BUCKET).await;
    dispatch_discovery(&h).await;
    let created = describe(&app, EC2_INSTANCE).await;
    h.queue.set_unavailable(true);

    let (status, outcomes) = send(
        &app,
        "POST",
        "/api/v1/jobs/cancel",
        Some(json!({ "by": "ids", "job_ids": [queued, created] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcomes[0]["outcome"], "unable_to_cancel");
    assert!(outcomes[0]["reason"].as_str().unwrap().contains("broker unavailable"));
    assert_eq!(outcomes[1]["outcome"], "canceled");

    assert_eq!(h.store.job(queued).unwrap().status, JobStatus::Queued);
    assert_eq!(h.store.job(created).unwrap().status, JobStatus::Canceled);
}

#[tokio::test]
async fn test_compliance_starts_runners() {
    let h = Harness::new();
    let app = app(&h);

    let (status, trigger) = send(
        &app,
        "POST",
        "/api/v1/compliance",
        Some(json!({ "benchmark_id": "cis" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(trigger["job_id"].is_number());

    let (status, page) = send(&app, "GET", "/api/v1/jobs?category=compliance_runner", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 4);
    assert!(
        page["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .all(|job| job["parent_id"] == trigger["job_id"])
    );

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/compliance",
        Some(json!({ "benchmark_id": "nist" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_query_run_needs_a_query() {
    let h = Harness::new();
    let app = app(&h);

    let (status, _) = send(&app, "POST", "/api/v1/query/run", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, job) = send(
        &app,
        "POST",
        "/api/v1/query/run",
        Some(json!({ "query": "select 1" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(job["category"], "query_runner");

    let uri = format!("/api/v1/query/{}/result", job["id"]);
    let (status, result) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "created");
    assert!(result["result"].is_null());
}
