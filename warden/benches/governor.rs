//! Benchmarks for admission planning and a full dispatch cycle.
//!
//! - `governor_plan`: per-resource-type caps over growing candidate batches
//! - `dispatch_cycle`: fetch, plan, publish and mark queued, in memory

#![allow(missing_docs)]

use std::collections::HashMap;
use std::hint::black_box;
use std::sync::Arc;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use warden::catalog::Integration;
use warden::config::DispatchConfig;
use warden::dispatch::DispatchLoop;
use warden::governor::{Governor, GovernorConfig, GovernorSnapshot, RateLimitTable};
use warden::handlers::DiscoveryHandler;
use warden::job::{DiscoverySpec, JobCategory, JobId, JobRecord, JobSpec, JobStatus, TriggerType};
use warden::store::JobStore;
use warden::timeouts::{TimeoutConfig, TimeoutSweeper};
use warden_testkit::{AWS, EC2_INSTANCE, Harness, S3_BUCKET, discovery_job, sample_catalog};

const RESOURCE_TYPES: [&str; 4] = [
    "AWS::S3::Bucket",
    "AWS::EC2::Instance",
    "AWS::IAM::Role",
    "AWS::Lambda::Function",
];

fn create_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to create runtime")
}

fn candidate(i: usize) -> JobRecord {
    let now = Utc::now();
    JobRecord {
        id: JobId(i as i64),
        category: JobCategory::Discovery,
        status: JobStatus::Created,
        trigger_type: TriggerType::Scheduled,
        created_by: "bench".into(),
        created_at: now,
        updated_at: now,
        queued_at: None,
        retry_count: 0,
        failure_message: None,
        error_code: None,
        queue_sequence: None,
        parent_id: None,
        spec: JobSpec::Discovery(DiscoverySpec {
            integration_id: format!("aws-{}", i % 50),
            integration_type: AWS.into(),
            resource_type: RESOURCE_TYPES[i % RESOURCE_TYPES.len()].into(),
            ..Default::default()
        }),
    }
}

fn bench_governor_plan(c: &mut Criterion) {
    let governor = Governor::new(GovernorConfig {
        rate_limits: RateLimitTable::with_default(5000).with_limit("AWS::IAM::Role", 10),
        ..Default::default()
    });
    let snapshot = GovernorSnapshot {
        queued: 100,
        queued_in_window: 1000,
        running: HashMap::from([("AWS::S3::Bucket".to_string(), 4000)]),
    };

    let mut group = c.benchmark_group("governor_plan");
    for size in [100, 1_000, 10_000] {
        let candidates: Vec<JobRecord> = (0..size).map(candidate).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("candidates", size), &candidates, |b, jobs| {
            b.iter(|| {
                let decision = governor.plan(
                    JobCategory::Discovery,
                    jobs.clone(),
                    &snapshot,
                    |job| job.spec.resource_type().map(str::to_string),
                );
                black_box(decision)
            });
        });
    }
    group.finish();
}

fn bench_dispatch_cycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("dispatch_cycle");
    group.sample_size(20);
    for size in [50, 200] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_function(BenchmarkId::new("in_memory", size), |b| {
            b.to_async(&rt).iter(|| async move {
                let mut catalog = sample_catalog();
                catalog.integrations = (0..size / 2)
                    .map(|n| Integration {
                        id: format!("aws-{n}"),
                        name: format!("account {n}"),
                        integration_type: AWS.into(),
                        enabled: true,
                        credential: None,
                    })
                    .collect();
                let h = Harness::with_catalog(catalog);
                let store: Arc<dyn JobStore> = Arc::new(h.store.clone());
                for i in 0..size {
                    let resource_type = if i % 2 == 0 { S3_BUCKET } else { EC2_INSTANCE };
                    let integration_id = format!("aws-{}", i / 2);
                    h.store
                        .create_job(discovery_job(&integration_id, resource_type, TriggerType::Scheduled))
                        .await
                        .expect("create job");
                }
                let dispatch = DispatchLoop::new(
                    Arc::new(DiscoveryHandler::new(h.catalog.clone()).with_integration_types([AWS])),
                    h.ctx(),
                    Arc::new(h.queue.clone()),
                    Governor::new(GovernorConfig {
                        rate_limits: RateLimitTable::with_default(size),
                        ..Default::default()
                    }),
                    TimeoutSweeper::new(store, TimeoutConfig::default()),
                    DispatchConfig {
                        max_batch: size,
                        ..Default::default()
                    },
                );
                dispatch.provision().await.expect("provision");
                black_box(dispatch.run_cycle().await.expect("cycle"))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_governor_plan, bench_dispatch_cycle);
criterion_main!(benches);
