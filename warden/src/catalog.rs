//! Interfaces to the services the scheduler asks about integrations and
//! compliance content, plus a file-backed implementation of both.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::BenchmarkPath;

/// A connected cloud account or similar credentialed target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub integration_type: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Encrypted credential handed to discovery workers as-is.
    #[serde(default)]
    pub credential: Option<String>,
}

fn enabled_default() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeInfo {
    pub name: String,
    pub integration_type: String,
    /// Billing data; discovered on the cost interval with a
    /// `cost-full-discovery` trigger.
    #[serde(default)]
    pub cost: bool,
    /// Query tables backed by this resource type.
    #[serde(default)]
    pub tables: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub integration_types: Vec<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub controls: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub id: String,
    #[serde(default)]
    pub query_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub key: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedQuery {
    pub id: String,
    pub query: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<QueryParameter>,
}

/// Benchmark evaluated on the compliance interval for these integrations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkAssignment {
    pub benchmark_id: String,
    pub integration_ids: Vec<String>,
}

#[async_trait]
pub trait IntegrationDirectory: Send + Sync {
    async fn get_integration(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<Integration>>;

    async fn list_integrations(&self) -> anyhow::Result<Vec<Integration>>;
}

#[async_trait]
pub trait ControlCatalog: Send + Sync {
    async fn get_benchmark(&self, id: &str) -> anyhow::Result<Option<Benchmark>>;

    async fn get_control(&self, id: &str) -> anyhow::Result<Option<Control>>;

    async fn get_query(&self, id: &str) -> anyhow::Result<Option<NamedQuery>>;

    /// Resource types discoverable for an integration type.
    async fn resource_types(
        &self,
        integration_type: &str,
    ) -> anyhow::Result<Vec<ResourceTypeInfo>>;

    /// Values substituted into `{{.key}}` placeholders of named queries.
    async fn query_parameter_values(
        &self,
    ) -> anyhow::Result<BTreeMap<String, String>>;

    async fn benchmark_assignments(
        &self,
    ) -> anyhow::Result<Vec<BenchmarkAssignment>>;
}

/// Every control under `root` with each benchmark path that reaches it.
/// Child benchmarks are followed depth-first; a benchmark already on the
/// current path is not entered again.
pub async fn benchmark_controls(
    catalog: &dyn ControlCatalog,
    root: &str,
) -> anyhow::Result<BTreeMap<String, Vec<BenchmarkPath>>> {
    let mut out: BTreeMap<String, Vec<BenchmarkPath>> = BTreeMap::new();
    let mut stack: Vec<BenchmarkPath> = vec![vec![root.to_string()]];

    while let Some(path) = stack.pop() {
        let Some(current) = path.last() else { continue };
        let benchmark = catalog
            .get_benchmark(current)
            .await?
            .with_context(|| format!("benchmark {current} not found"))?;

        for control in &benchmark.controls {
            out.entry(control.clone()).or_default().push(path.clone());
        }
        for child in benchmark.children.iter().rev() {
            if path.contains(child) {
                continue;
            }
            let mut next = path.clone();
            next.push(child.clone());
            stack.push(next);
        }
    }

    for paths in out.values_mut() {
        paths.sort();
        paths.dedup();
    }
    Ok(out)
}

/// Resource types an integration type must have discovered before the
/// controls of `framework_id` can be evaluated against it.
pub async fn framework_resource_types(
    catalog: &dyn ControlCatalog,
    framework_id: &str,
    integration_type: &str,
) -> anyhow::Result<BTreeSet<String>> {
    let by_table: HashMap<String, String> = catalog
        .resource_types(integration_type)
        .await?
        .into_iter()
        .flat_map(|rt| {
            rt.tables
                .into_iter()
                .map(move |table| (table.to_ascii_lowercase(), rt.name.clone()))
        })
        .collect();

    let mut seen_queries = HashSet::new();
    let mut out = BTreeSet::new();
    for control_id in benchmark_controls(catalog, framework_id).await?.keys() {
        let Some(control) = catalog.get_control(control_id).await? else {
            continue;
        };
        let Some(query_id) = control.query_id else { continue };
        if !seen_queries.insert(query_id.clone()) {
            continue;
        }
        let Some(query) = catalog.get_query(&query_id).await? else {
            continue;
        };
        for table in &query.tables {
            if let Some(resource_type) = by_table.get(&table.to_ascii_lowercase())
            {
                out.insert(resource_type.clone());
            }
        }
    }
    Ok(out)
}

/// Replace `{{.key}}` placeholders. Returns the keys that had no value.
pub fn render_query(
    query: &str,
    values: &BTreeMap<String, String>,
) -> (String, Vec<String>) {
    let mut rendered = String::with_capacity(query.len());
    let mut missing = Vec::new();
    let mut rest = query;

    while let Some(start) = rest.find("{{.") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}") else {
            rendered.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = after[..end].trim();
        match values.get(key) {
            Some(value) => rendered.push_str(value),
            None => {
                missing.push(key.to_string());
                rendered.push_str(&rest[start..start + 3 + end + 2]);
            }
        }
        rest = &after[end + 2..];
    }
    rendered.push_str(rest);
    (rendered, missing)
}

/// Catalog and integration directory loaded from a JSON snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticCatalog {
    pub integrations: Vec<Integration>,
    pub resource_types: Vec<ResourceTypeInfo>,
    pub benchmarks: Vec<Benchmark>,
    pub controls: Vec<Control>,
    pub queries: Vec<NamedQuery>,
    pub query_parameters: BTreeMap<String, String>,
    pub assignments: Vec<BenchmarkAssignment>,
}

impl StaticCatalog {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing catalog {}", path.display()))
    }

    /// Integration types with at least one resource type.
    pub fn integration_types(&self) -> BTreeSet<String> {
        self.resource_types
            .iter()
            .map(|rt| rt.integration_type.clone())
            .collect()
    }
}

#[async_trait]
impl IntegrationDirectory for StaticCatalog {
    async fn get_integration(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<Integration>> {
        Ok(self.integrations.iter().find(|i| i.id == id).cloned())
    }

    async fn list_integrations(&self) -> anyhow::Result<Vec<Integration>> {
        Ok(self.integrations.clone())
    }
}

#[async_trait]
impl ControlCatalog for StaticCatalog {
    async fn get_benchmark(&self, id: &str) -> anyhow::Result<Option<Benchmark>> {
        Ok(self.benchmarks.iter().find(|b| b.id == id).cloned())
    }

    async fn get_control(&self, id: &str) -> anyhow::Result<Option<Control>> {
        Ok(self.controls.iter().find(|c| c.id == id).cloned())
    }

    async fn get_query(&self, id: &str) -> anyhow::Result<Option<NamedQuery>> {
        Ok(self.queries.iter().find(|q| q.id == id).cloned())
    }

    async fn resource_types(
        &self,
        integration_type: &str,
    ) -> anyhow::Result<Vec<ResourceTypeInfo>> {
        Ok(self
            .resource_types
            .iter()
            .filter(|rt| rt.integration_type == integration_type)
            .cloned()
            .collect())
    }

    async fn query_parameter_values(
        &self,
    ) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(self.query_parameters.clone())
    }

    async fn benchmark_assignments(
        &self,
    ) -> anyhow::Result<Vec<BenchmarkAssignment>> {
        Ok(self.assignments.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StaticCatalog {
        serde_json::from_value(serde_json::json!({
            "resource_types": [
                {"name": "AWS::S3::Bucket", "integration_type": "aws_cloud_account",
                 "tables": ["aws_s3_bucket"]},
                {"name": "AWS::IAM::User", "integration_type": "aws_cloud_account",
                 "tables": ["aws_iam_user"]},
                {"name": "AWS::EC2::Instance", "integration_type": "aws_cloud_account",
                 "tables": ["aws_ec2_instance"]}
            ],
            "benchmarks": [
                {"id": "root", "children": ["storage", "identity"], "controls": ["c-root"]},
                {"id": "storage", "children": ["identity"], "controls": ["c-bucket"]},
                {"id": "identity", "children": ["root"], "controls": ["c-user"]}
            ],
            "controls": [
                {"id": "c-root", "query_id": "q-bucket"},
                {"id": "c-bucket", "query_id": "q-bucket"},
                {"id": "c-user", "query_id": "q-user"}
            ],
            "queries": [
                {"id": "q-bucket", "query": "select * from aws_s3_bucket", "tables": ["aws_s3_bucket"]},
                {"id": "q-user", "query": "select * from aws_iam_user", "tables": ["AWS_IAM_USER"]}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_benchmark_controls_collects_every_path() {
        let catalog = catalog();
        let controls = benchmark_controls(&catalog, "root").await.unwrap();

        assert_eq!(controls["c-root"], vec![vec!["root".to_string()]]);
        assert_eq!(
            controls["c-user"],
            vec![
                vec!["root".to_string(), "identity".to_string()],
                vec![
                    "root".to_string(),
                    "storage".to_string(),
                    "identity".to_string()
                ],
            ]
        );
    }

    #[tokio::test]
    async fn test_benchmark_controls_missing_benchmark_errors() {
        let catalog = catalog();
        assert!(benchmark_controls(&catalog, "nope").await.is_err());
    }

    #[tokio::test]
    async fn test_framework_resource_types_follow_query_tables() {
        let catalog = catalog();
        let types =
            framework_resource_types(&catalog, "storage", "aws_cloud_account")
                .await
                .unwrap();
        assert_eq!(
            types.into_iter().collect::<Vec<_>>(),
            vec!["AWS::IAM::User".to_string(), "AWS::S3::Bucket".to_string()]
        );

        let none = framework_resource_types(&catalog, "storage", "azure")
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_render_query_substitutes_and_reports_missing() {
        let values = BTreeMap::from([("region".to_string(), "eu-west-1".to_string())]);
        let (rendered, missing) = render_query(
            "select * from t where region = '{{.region}}' and tag = '{{.tag}}'",
            &values,
        );
        assert_eq!(
            rendered,
            "select * from t where region = 'eu-west-1' and tag = '{{.tag}}'"
        );
        assert_eq!(missing, vec!["tag".to_string()]);
    }
}
