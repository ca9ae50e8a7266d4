use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobCategory, TriggerType};
use crate::lease::LeaseId;

/// Suffix of the topic variant that carries interactive traffic.
pub const MANUALS_SUFFIX: &str = "-manuals";

/// Errors returned by work queue backends.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No stream accepted the publish; typically the stream was deleted or
    /// never provisioned on this broker.
    #[error("no responders for topic {0}")]
    NoResponders(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl QueueError {
    /// Recoverable errors are fixed by re-provisioning streams and
    /// publishing once more.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            QueueError::NoResponders(_) | QueueError::StreamNotFound(_)
        )
    }
}

/// A durable stream and the topics it captures.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub topics: Vec<String>,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            name: name.into(),
            topics,
        }
    }

    /// The job and result topics of a category. Discovery jobs are routed
    /// per integration type, so this only carries their results.
    pub fn for_category(category: JobCategory) -> Self {
        let stream = stream_name(category);
        let mut topics = vec![result_topic(category)];
        if category != JobCategory::Discovery {
            topics.push(format!("{stream}-jobs"));
            topics.push(format!("{stream}-jobs{MANUALS_SUFFIX}"));
        }
        Self::new(stream, topics)
    }

    /// Discovery job stream for one integration type.
    pub fn for_integration_type(integration_type: &str) -> Self {
        let stream = format!("{}-{integration_type}", stream_name(JobCategory::Discovery));
        Self::new(
            stream.clone(),
            vec![
                format!("{stream}-jobs"),
                format!("{stream}-jobs{MANUALS_SUFFIX}"),
            ],
        )
    }

    pub fn captures(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}

/// Broker stream backing a category.
pub fn stream_name(category: JobCategory) -> &'static str {
    match category {
        JobCategory::Discovery => "describe",
        JobCategory::Compliance => "compliance",
        JobCategory::ComplianceRunner => "compliance-runner",
        JobCategory::ComplianceSummarizer => "compliance-summarizer",
        JobCategory::QueryRunner => "query-runner",
        JobCategory::QueryValidator => "query-validator",
        JobCategory::Audit => "audit",
        JobCategory::ComplianceQuickRun => "compliance-quick-run",
    }
}

/// Job topic for a category, honouring the manual/scheduled split.
pub fn job_topic(category: JobCategory, trigger: TriggerType) -> String {
    with_trigger_suffix(format!("{}-jobs", stream_name(category)), trigger)
}

/// Discovery job topic of an integration type.
pub fn discovery_topic(integration_type: &str, trigger: TriggerType) -> String {
    with_trigger_suffix(
        format!(
            "{}-{integration_type}-jobs",
            stream_name(JobCategory::Discovery)
        ),
        trigger,
    )
}

pub fn result_topic(category: JobCategory) -> String {
    format!("{}-results", stream_name(category))
}

fn with_trigger_suffix(topic: String, trigger: TriggerType) -> String {
    if trigger.is_interactive() {
        format!("{topic}{MANUALS_SUFFIX}")
    } else {
        topic
    }
}

/// A message ready to be published.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub dedupe_key: String,
    pub payload: Vec<u8>,
}

/// A message handed to a consumer under a lease.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub sequence: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    /// Number of times this message has been delivered, including this one.
    pub deliveries: u32,
    pub lease_id: LeaseId,
}

/// Consumer-side knobs for a fetch.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub topic: String,
    pub consumer: String,
    pub max_messages: usize,
    /// How long a fetched message stays invisible to other consumers
    /// before it is redelivered.
    pub ack_wait: Duration,
}

/// Durable, topic-addressed work queue.
///
/// Publishing returns the broker sequence number of the stored message,
/// which is what cancellation later deletes by.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Create any missing streams. Existing streams are left as they are.
    async fn ensure_streams(
        &self,
        streams: &[StreamSpec],
    ) -> Result<(), QueueError>;

    /// Publish a message. A message whose dedupe key is already stored in
    /// the stream is not stored twice; the existing sequence is returned.
    async fn publish(&self, message: OutboundMessage)
    -> Result<u64, QueueError>;

    /// Lease up to `max_messages` from a topic.
    async fn fetch(
        &self,
        request: &FetchRequest,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledge a delivery; the message is removed.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Negatively acknowledge a delivery so it is redelivered later.
    async fn nak(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Delete a message that has not been handed to a consumer yet.
    /// Returns `false` when the message is gone or already leased.
    async fn delete_message(
        &self,
        topic: &str,
        sequence: u64,
    ) -> Result<bool, QueueError>;

    /// Messages waiting on a topic.
    async fn depth(&self, topic: &str) -> Result<u64, QueueError>;

    /// Remove acked and deleted messages settled longer than `retention`
    /// ago. Returns how many were removed.
    async fn purge_settled(&self, retention: Duration) -> Result<u64, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_topics_use_suffix() {
        assert_eq!(
            job_topic(JobCategory::ComplianceRunner, TriggerType::Manual),
            "compliance-runner-jobs-manuals"
        );
        assert_eq!(
            job_topic(JobCategory::QueryRunner, TriggerType::Scheduled),
            "query-runner-jobs"
        );
        assert_eq!(
            discovery_topic("azure_subscription", TriggerType::Stack),
            "describe-azure_subscription-jobs-manuals"
        );
    }

    #[test]
    fn test_stream_specs_capture_their_topics() {
        let runner = StreamSpec::for_category(JobCategory::ComplianceRunner);
        assert!(runner.captures("compliance-runner-jobs"));
        assert!(runner.captures("compliance-runner-jobs-manuals"));
        assert!(runner.captures("compliance-runner-results"));

        let discovery = StreamSpec::for_category(JobCategory::Discovery);
        assert!(discovery.captures("describe-results"));
        assert!(!discovery.captures("describe-jobs"));

        let aws = StreamSpec::for_integration_type("aws_cloud_account");
        assert!(aws.captures(&discovery_topic(
            "aws_cloud_account",
            TriggerType::Scheduled
        )));
    }

    #[test]
    fn test_every_category_has_its_own_result_topic() {
        let mut topics: Vec<_> =
            JobCategory::ALL.iter().map(|c| result_topic(*c)).collect();
        topics.sort();
        topics.dedup();
        assert_eq!(topics.len(), JobCategory::ALL.len());
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(QueueError::NoResponders("t".into()).is_recoverable());
        assert!(QueueError::StreamNotFound("s".into()).is_recoverable());
        assert!(
            !QueueError::Backend(anyhow::anyhow!("io")).is_recoverable()
        );
    }
}
