use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::IndexConfig;
use crate::index::{
    DELETE_TASKS_INDEX, DeleteTask, IndexedResource, LOOKUP_INDEX, ResourceIndex,
    document_id, resource_index,
};
use crate::job::JobId;

/// Lookup documents read per search request.
const LOOKUP_PAGE_SIZE: usize = 10_000;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: LookupSource,
    #[serde(default)]
    sort: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct LookupSource {
    resource_id: String,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(rename = "_id")]
    id: String,
}

/// Search index reached over its HTTP document API.
#[derive(Debug, Clone)]
pub struct HttpResourceIndex {
    client: reqwest::Client,
    config: IndexConfig,
    page_size: usize,
}

impl HttpResourceIndex {
    pub fn new(config: IndexConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            config: IndexConfig {
                url: config.url.trim_end_matches('/').to_string(),
                ..config
            },
            page_size: LOOKUP_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.username {
            Some(username) => request.basic_auth(username, self.config.password.as_deref()),
            None => request,
        }
    }
}

#[async_trait]
impl ResourceIndex for HttpResourceIndex {
    async fn list_resources(
        &self,
        integration_id: &str,
        resource_type: &str,
    ) -> anyhow::Result<Vec<IndexedResource>> {
        let resource_type = resource_type.to_ascii_lowercase();
        let mut resources = Vec::new();
        let mut search_after: Option<Vec<Value>> = None;
        loop {
            let mut body = json!({
                "size": self.page_size,
                "_source": ["resource_id"],
                "sort": [{ "resource_id": "asc" }],
                "query": {
                    "bool": {
                        "filter": [
                            { "term": { "integration_id": integration_id } },
                            { "term": { "resource_type": resource_type } },
                        ]
                    }
                }
            });
            if let Some(after) = search_after.take() {
                body["search_after"] = Value::Array(after);
            }
            let response = self
                .authorize(
                    self.client
                        .post(self.url(&format!("{LOOKUP_INDEX}/_search")))
                        .json(&body),
                )
                .send()
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            let page: SearchResponse = response
                .error_for_status()?
                .json()
                .await
                .context("decoding lookup search response")?;

            let full = page.hits.hits.len() >= self.page_size;
            search_after = page.hits.hits.last().map(|hit| hit.sort.clone());
            resources.extend(page.hits.hits.into_iter().map(|hit| IndexedResource {
                document_id: document_id(&[
                    &hit.source.resource_id,
                    integration_id,
                    &resource_type,
                ]),
                resource_id: hit.source.resource_id,
            }));
            match &search_after {
                Some(after) if full && !after.is_empty() => {}
                Some(_) if full => anyhow::bail!("lookup search returned no sort values"),
                _ => break,
            }
        }
        debug!(integration_id, count = resources.len(), "listed indexed resources");
        Ok(resources)
    }

    async fn count_resources_for_job(
        &self,
        resource_type: &str,
        job_id: JobId,
    ) -> anyhow::Result<u64> {
        let body = json!({
            "query": { "term": { "source_job_id": job_id.0 } }
        });
        let response = self
            .authorize(
                self.client
                    .post(self.url(&format!("{}/_count", resource_index(resource_type))))
                    .json(&body),
            )
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let count: CountResponse = response.error_for_status()?.json().await?;
        Ok(count.count)
    }

    async fn submit_delete_task(&self, task: &DeleteTask) -> anyhow::Result<String> {
        let id = task.document_id();
        let response: IndexResponse = self
            .authorize(
                self.client
                    .put(self.url(&format!("{DELETE_TASKS_INDEX}/_doc/{id}")))
                    .json(task),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("decoding delete task response")?;
        Ok(response.id)
    }

    async fn delete_task_pending(&self, task_id: &str) -> anyhow::Result<bool> {
        let response = self
            .authorize(
                self.client
                    .head(self.url(&format!("{DELETE_TASKS_INDEX}/_doc/{task_id}"))),
            )
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => anyhow::bail!("delete task lookup failed with {status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;

    struct Lookup {
        ids: Vec<String>,
        searches: AtomicUsize,
    }

    /// Lookup index that serves sorted pages and honours `search_after`.
    async fn search(State(lookup): State<Arc<Lookup>>, Json(body): Json<Value>) -> Json<Value> {
        lookup.searches.fetch_add(1, Ordering::SeqCst);
        let size = body["size"].as_u64().unwrap_or(10) as usize;
        let after = body["search_after"][0].as_str();
        let hits: Vec<Value> = lookup
            .ids
            .iter()
            .filter(|id| after.is_none_or(|after| id.as_str() > after))
            .take(size)
            .map(|id| json!({ "_id": id, "_source": { "resource_id": id }, "sort": [id] }))
            .collect();
        Json(json!({ "hits": { "hits": hits } }))
    }

    async fn serve(count: usize) -> (HttpResourceIndex, Arc<Lookup>) {
        let lookup = Arc::new(Lookup {
            ids: (0..count).map(|n| format!("arn:{n:03}")).collect(),
            searches: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route(&format!("/{LOOKUP_INDEX}/_search"), post(search))
            .with_state(Arc::clone(&lookup));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        let index = HttpResourceIndex::new(IndexConfig {
            url: format!("http://{addr}"),
            username: None,
            password: None,
        })
        .unwrap()
        .with_page_size(2);
        (index, lookup)
    }

    #[tokio::test]
    async fn test_list_resources_reads_every_page() {
        let (index, lookup) = serve(5).await;
        let resources = index.list_resources("aws-1", "AWS::S3::Bucket").await.unwrap();
        let ids: Vec<&str> = resources.iter().map(|r| r.resource_id.as_str()).collect();
        assert_eq!(ids, lookup.ids.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(lookup.searches.load(Ordering::SeqCst), 3);
        assert_eq!(
            resources[0].document_id,
            document_id(&["arn:000", "aws-1", "aws::s3::bucket"])
        );
    }

    #[tokio::test]
    async fn test_list_resources_stops_on_an_empty_page() {
        let (index, lookup) = serve(4).await;
        let resources = index.list_resources("aws-1", "AWS::S3::Bucket").await.unwrap();
        assert_eq!(resources.len(), 4);
        assert_eq!(lookup.searches.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_base_url_is_normalised() {
        let index = HttpResourceIndex::new(IndexConfig {
            url: "http://search:9200/".into(),
            username: None,
            password: None,
        })
        .unwrap();
        assert_eq!(
            index.url("delete_tasks/_doc/1"),
            "http://search:9200/delete_tasks/_doc/1"
        );
    }

    #[test]
    fn test_lookup_hits_decode() {
        let raw = r#"{"hits":{"hits":[{"_id":"x","_source":{"resource_id":"arn:1"}}]}}"#;
        let response: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.hits.hits[0].source.resource_id, "arn:1");
    }
}
