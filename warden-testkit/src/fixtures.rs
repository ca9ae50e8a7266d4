use std::collections::BTreeMap;
use std::sync::Arc;

use warden::catalog::{
    Benchmark, BenchmarkAssignment, Control, Integration, NamedQuery,
    QueryParameter, ResourceTypeInfo, StaticCatalog,
};
use warden::dispatch::JobContext;
use warden::events::InProcEventBus;
use warden::job::{DiscoverySpec, JobSpec, NewJob, TriggerType};

use crate::{InMemoryResourceIndex, InMemoryStore, InMemoryWorkQueue};

pub const AWS: &str = "aws_cloud_account";
pub const S3_BUCKET: &str = "AWS::S3::Bucket";
pub const EC2_INSTANCE: &str = "AWS::EC2::Instance";
pub const COST_REPORT: &str = "AWS::CostExplorer::ByService";

fn integration(id: &str, enabled: bool) -> Integration {
    Integration {
        id: id.to_string(),
        name: format!("{id} account"),
        integration_type: AWS.to_string(),
        enabled,
        credential: Some(format!("cred-{id}")),
    }
}

fn resource_type(name: &str, table: &str, cost: bool) -> ResourceTypeInfo {
    ResourceTypeInfo {
        name: name.to_string(),
        integration_type: AWS.to_string(),
        cost,
        tables: vec![table.to_string()],
    }
}

fn control(id: &str, query_id: Option<&str>) -> Control {
    Control {
        id: id.to_string(),
        query_id: query_id.map(str::to_string),
    }
}

/// A small AWS catalog.
///
/// `cis` holds `cis-1.1` and the child benchmark `cis-storage`, which
/// holds `cis-2.1` and the manual control `cis-2.2`. `aws-3` is disabled.
pub fn sample_catalog() -> StaticCatalog {
    StaticCatalog {
        integrations: vec![
            integration("aws-1", true),
            integration("aws-2", true),
            integration("aws-3", false),
        ],
        resource_types: vec![
            resource_type(S3_BUCKET, "aws_s3_bucket", false),
            resource_type(EC2_INSTANCE, "aws_ec2_instance", false),
            resource_type(COST_REPORT, "aws_cost_by_service", true),
        ],
        benchmarks: vec![
            Benchmark {
                id: "cis".into(),
                title: "CIS AWS Foundations".into(),
                integration_types: vec![AWS.into()],
                children: vec!["cis-storage".into()],
                controls: vec!["cis-1.1".into()],
            },
            Benchmark {
                id: "cis-storage".into(),
                title: "Storage".into(),
                integration_types: vec![AWS.into()],
                children: Vec::new(),
                controls: vec!["cis-2.1".into(), "cis-2.2".into()],
            },
        ],
        controls: vec![
            control("cis-1.1", Some("q-instances-public")),
            control("cis-2.1", Some("q-buckets-encrypted")),
            control("cis-2.2", None),
        ],
        queries: vec![
            NamedQuery {
                id: "q-instances-public".into(),
                query: "select * from aws_ec2_instance where public_ip is not null".into(),
                tables: vec!["aws_ec2_instance".into()],
                parameters: Vec::new(),
            },
            NamedQuery {
                id: "q-buckets-encrypted".into(),
                query: "select * from aws_s3_bucket where region = '{{.region}}'".into(),
                tables: vec!["aws_s3_bucket".into()],
                parameters: vec![QueryParameter {
                    key: "region".into(),
                    required: true,
                }],
            },
        ],
        query_parameters: BTreeMap::from([("region".to_string(), "us-east-1".to_string())]),
        assignments: vec![BenchmarkAssignment {
            benchmark_id: "cis".into(),
            integration_ids: vec!["aws-1".into(), "aws-2".into()],
        }],
    }
}

pub fn discovery_job(integration_id: &str, resource_type: &str, trigger: TriggerType) -> NewJob {
    NewJob::new(
        JobSpec::Discovery(DiscoverySpec {
            integration_id: integration_id.to_string(),
            integration_type: AWS.to_string(),
            resource_type: resource_type.to_string(),
            ..Default::default()
        }),
        trigger,
    )
    .created_by("test")
}

/// In-memory collaborators sharing one event bus.
#[derive(Clone, Debug)]
pub struct Harness {
    pub store: InMemoryStore,
    pub queue: InMemoryWorkQueue,
    pub index: InMemoryResourceIndex,
    pub catalog: Arc<StaticCatalog>,
    pub events: InProcEventBus,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_catalog(sample_catalog())
    }

    pub fn with_catalog(catalog: StaticCatalog) -> Self {
        Self {
            store: InMemoryStore::new(),
            queue: InMemoryWorkQueue::new(),
            index: InMemoryResourceIndex::new(),
            catalog: Arc::new(catalog),
            events: InProcEventBus::new(256),
        }
    }

    pub fn ctx(&self) -> JobContext {
        JobContext::new(Arc::new(self.store.clone())).with_events(self.events.clone())
    }
}
