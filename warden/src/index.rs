//! Search-index documents the scheduler reads or writes, and the index
//! operations it needs.
//!
//! Workers write `Resource`, `LookupResource` and `ResourceFinding`
//! documents; the scheduler only reads them and, after a discovery run,
//! files a [`DeleteTask`] naming the documents that disappeared upstream.
//! The actual deletion is done by a sweeper on the index side, which
//! removes the task document when it is finished.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::job::JobId;

pub const LOOKUP_INDEX: &str = "lookup_resources";
pub const FINDINGS_INDEX: &str = "resource_findings";
pub const DELETE_TASKS_INDEX: &str = "delete_tasks";

/// Lowercase hex SHA-256 over the `:`-joined key tuple.
pub fn document_id(keys: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            hasher.update(b":");
        }
        hasher.update(key.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Index holding the documents of one resource type.
pub fn resource_index(resource_type: &str) -> String {
    resource_type
        .to_ascii_lowercase()
        .replace("::", "_")
        .replace(['/', '.', ' '], "_")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: String,
    pub integration_id: String,
    pub resource_type: String,
    pub source_job_id: JobId,
    #[serde(default)]
    pub description: serde_json::Value,
}

impl Resource {
    pub fn document_id(&self) -> String {
        document_id(&[
            &self.resource_id,
            &self.integration_id,
            &self.resource_type.to_ascii_lowercase(),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LookupResource {
    pub resource_id: String,
    pub integration_id: String,
    pub resource_type: String,
    pub source_job_id: JobId,
}

impl LookupResource {
    pub fn document_id(&self) -> String {
        lookup_document_id(
            &self.resource_id,
            &self.integration_id,
            &self.resource_type,
        )
    }
}

fn lookup_document_id(
    resource_id: &str,
    integration_id: &str,
    resource_type: &str,
) -> String {
    document_id(&[
        "lookup",
        resource_id,
        integration_id,
        &resource_type.to_ascii_lowercase(),
    ])
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceFinding {
    pub resource_id: String,
    pub resource_type: String,
    pub integration_id: String,
    pub benchmark_id: String,
    pub control_id: String,
    pub result: String,
}

impl ResourceFinding {
    pub fn document_id(&self) -> String {
        document_id(&[
            &self.resource_id,
            &self.resource_type.to_ascii_lowercase(),
            &self.benchmark_id,
            &self.control_id,
        ])
    }
}

/// One document to delete.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeleteKey {
    pub index: String,
    pub document_id: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteTaskKind {
    /// Delete the listed documents.
    Resources,
    /// Delete everything matching `query` in `index`.
    Query,
}

/// Work item for the index-side sweeper.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteTask {
    pub kind: DeleteTaskKind,
    pub discovery_job_id: JobId,
    pub integration_id: String,
    pub resource_type: String,
    #[serde(default)]
    pub keys: Vec<DeleteKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl DeleteTask {
    /// Task removing resources that a discovery run no longer reported:
    /// the resource document and its lookup document for each id.
    pub fn stale_resources(
        discovery_job_id: JobId,
        integration_id: &str,
        resource_type: &str,
        stale: &[IndexedResource],
    ) -> Self {
        let index = resource_index(resource_type);
        let keys = stale
            .iter()
            .flat_map(|resource| {
                [
                    DeleteKey {
                        index: index.clone(),
                        document_id: resource.document_id.clone(),
                    },
                    DeleteKey {
                        index: LOOKUP_INDEX.to_string(),
                        document_id: lookup_document_id(
                            &resource.resource_id,
                            integration_id,
                            resource_type,
                        ),
                    },
                ]
            })
            .collect();

        Self {
            kind: DeleteTaskKind::Resources,
            discovery_job_id,
            integration_id: integration_id.to_string(),
            resource_type: resource_type.to_string(),
            keys,
            index: None,
            query: None,
            created_at: Utc::now(),
        }
    }

    /// Derived from the originating job so a replayed result files the
    /// same task rather than a second one.
    pub fn document_id(&self) -> String {
        document_id(&[
            "delete-task",
            &self.discovery_job_id.to_string(),
            &self.integration_id,
            &self.resource_type.to_ascii_lowercase(),
        ])
    }
}

/// A resource currently present in the index.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IndexedResource {
    pub resource_id: String,
    pub document_id: String,
}

/// Read and delete-task operations against the search index.
#[async_trait]
pub trait ResourceIndex: Send + Sync {
    /// Resources indexed for an integration and resource type.
    async fn list_resources(
        &self,
        integration_id: &str,
        resource_type: &str,
    ) -> anyhow::Result<Vec<IndexedResource>>;

    /// Resource documents written by a discovery job.
    async fn count_resources_for_job(
        &self,
        resource_type: &str,
        job_id: JobId,
    ) -> anyhow::Result<u64>;

    /// Store a delete task, returning its document id. Storing the same
    /// task twice overwrites it.
    async fn submit_delete_task(&self, task: &DeleteTask)
    -> anyhow::Result<String>;

    /// Whether the index-side sweeper has yet to process the task.
    async fn delete_task_pending(&self, task_id: &str) -> anyhow::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_is_stable_hex() {
        let a = document_id(&["r-1", "i-1"]);
        let b = document_id(&["r-1", "i-1"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        assert_ne!(a, document_id(&["r-1:i-1"]));
        assert_ne!(a, document_id(&["i-1", "r-1"]));
    }

    #[test]
    fn test_resource_index_name() {
        assert_eq!(resource_index("AWS::EC2::Instance"), "aws_ec2_instance");
        assert_eq!(
            resource_index("Microsoft.Compute/virtualMachines"),
            "microsoft_compute_virtualmachines"
        );
    }

    #[test]
    fn test_delete_task_targets_resource_and_lookup_docs() {
        let stale = vec![IndexedResource {
            resource_id: "arn:1".into(),
            document_id: "doc-1".into(),
        }];
        let task = DeleteTask::stale_resources(
            JobId(9),
            "i-1",
            "AWS::S3::Bucket",
            &stale,
        );

        assert_eq!(task.keys.len(), 2);
        assert_eq!(task.keys[0].index, "aws_s3_bucket");
        assert_eq!(task.keys[0].document_id, "doc-1");
        assert_eq!(task.keys[1].index, LOOKUP_INDEX);

        let lookup = LookupResource {
            resource_id: "arn:1".into(),
            integration_id: "i-1".into(),
            resource_type: "AWS::S3::Bucket".into(),
            source_job_id: JobId(9),
        };
        assert_eq!(task.keys[1].document_id, lookup.document_id());
    }

    #[test]
    fn test_delete_task_id_depends_on_job_not_time() {
        let first =
            DeleteTask::stale_resources(JobId(3), "i-1", "AWS::S3::Bucket", &[]);
        let mut second = first.clone();
        second.created_at = first.created_at + chrono::Duration::seconds(5);
        assert_eq!(first.document_id(), second.document_id());

        let other =
            DeleteTask::stale_resources(JobId(4), "i-1", "AWS::S3::Bucket", &[]);
        assert_ne!(first.document_id(), other.document_id());
    }
}
