use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use warden::index::{DeleteTask, IndexedResource, ResourceIndex, document_id};
use warden::job::JobId;

#[derive(Default)]
struct State {
    resources: HashMap<(String, String), Vec<IndexedResource>>,
    job_counts: HashMap<(String, JobId), u64>,
    tasks: BTreeMap<String, DeleteTask>,
    submissions: usize,
}

/// Search index held in memory. Delete tasks stay pending until
/// [`InMemoryResourceIndex::complete_task`] is called.
#[derive(Clone, Default)]
pub struct InMemoryResourceIndex {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for InMemoryResourceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryResourceIndex")
            .field("resource_sets", &state.resources.len())
            .field("delete_tasks", &state.tasks.len())
            .finish()
    }
}

fn key(integration_id: &str, resource_type: &str) -> (String, String) {
    (integration_id.to_string(), resource_type.to_ascii_lowercase())
}

impl InMemoryResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the indexed resources of an integration and resource type.
    pub fn set_resources(&self, integration_id: &str, resource_type: &str, resource_ids: &[&str]) {
        let lowered = resource_type.to_ascii_lowercase();
        let resources = resource_ids
            .iter()
            .map(|resource_id| IndexedResource {
                resource_id: resource_id.to_string(),
                document_id: document_id(&[resource_id, integration_id, &lowered]),
            })
            .collect();
        self.state
            .lock()
            .resources
            .insert(key(integration_id, resource_type), resources);
    }

    /// Documents a discovery job has written so far.
    pub fn set_indexed_count(&self, resource_type: &str, job_id: JobId, count: u64) {
        self.state
            .lock()
            .job_counts
            .insert((resource_type.to_ascii_lowercase(), job_id), count);
    }

    pub fn delete_tasks(&self) -> Vec<DeleteTask> {
        self.state.lock().tasks.values().cloned().collect()
    }

    /// Number of submit calls, including overwrites of the same task.
    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    /// Let the index-side sweeper finish a task.
    pub fn complete_task(&self, task_id: &str) {
        self.state.lock().tasks.remove(task_id);
    }

    pub fn complete_all_tasks(&self) {
        self.state.lock().tasks.clear();
    }
}

#[async_trait]
impl ResourceIndex for InMemoryResourceIndex {
    async fn list_resources(
        &self,
        integration_id: &str,
        resource_type: &str,
    ) -> anyhow::Result<Vec<IndexedResource>> {
        Ok(self
            .state
            .lock()
            .resources
            .get(&key(integration_id, resource_type))
            .cloned()
            .unwrap_or_default())
    }

    async fn count_resources_for_job(
        &self,
        resource_type: &str,
        job_id: JobId,
    ) -> anyhow::Result<u64> {
        Ok(self
            .state
            .lock()
            .job_counts
            .get(&(resource_type.to_ascii_lowercase(), job_id))
            .copied()
            .unwrap_or_default())
    }

    async fn submit_delete_task(&self, task: &DeleteTask) -> anyhow::Result<String> {
        let id = task.document_id();
        let mut state = self.state.lock();
        state.submissions += 1;
        state.tasks.insert(id.clone(), task.clone());
        Ok(id)
    }

    async fn delete_task_pending(&self, task_id: &str) -> anyhow::Result<bool> {
        Ok(self.state.lock().tasks.contains_key(task_id))
    }
}
