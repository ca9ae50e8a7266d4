use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobCategory, JobId, JobStatus};

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        correlation_id: Option<Uuid>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A job lifecycle event.
#[derive(Clone, Debug)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum JobEventPayload {
    Created {
        job_id: JobId,
        category: JobCategory,
    },
    /// Published to the work queue.
    Queued {
        job_id: JobId,
        category: JobCategory,
        sequence: u64,
    },
    /// A worker reported that it picked the job up.
    Started {
        job_id: JobId,
        category: JobCategory,
    },
    /// The job reached a terminal status through a worker result.
    Finished {
        job_id: JobId,
        category: JobCategory,
        status: JobStatus,
        parent_id: Option<JobId>,
    },
    Canceled {
        job_id: JobId,
        category: JobCategory,
    },
    /// A sweep moved `count` jobs to `to`.
    Swept {
        category: JobCategory,
        to: JobStatus,
        count: u64,
    },
}

impl JobEvent {
    fn keyed(key: String, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(None, key),
            payload,
        }
    }

    pub fn created(job_id: JobId, category: JobCategory) -> Self {
        Self::keyed(
            format!("created-{job_id}"),
            JobEventPayload::Created { job_id, category },
        )
    }

    pub fn queued(job_id: JobId, category: JobCategory, sequence: u64) -> Self {
        Self::keyed(
            format!("queued-{job_id}-{sequence}"),
            JobEventPayload::Queued {
                job_id,
                category,
                sequence,
            },
        )
    }

    pub fn started(job_id: JobId, category: JobCategory) -> Self {
        Self::keyed(
            format!("started-{job_id}"),
            JobEventPayload::Started { job_id, category },
        )
    }

    pub fn finished(
        job_id: JobId,
        category: JobCategory,
        status: JobStatus,
        parent_id: Option<JobId>,
    ) -> Self {
        Self::keyed(
            format!("finished-{job_id}-{status}"),
            JobEventPayload::Finished {
                job_id,
                category,
                status,
                parent_id,
            },
        )
    }

    pub fn canceled(job_id: JobId, category: JobCategory) -> Self {
        Self::keyed(
            format!("canceled-{job_id}"),
            JobEventPayload::Canceled { job_id, category },
        )
    }

    pub fn swept(category: JobCategory, to: JobStatus, count: u64) -> Self {
        Self::keyed(
            format!("swept-{category}-{to}-{}", Uuid::now_v7()),
            JobEventPayload::Swept {
                category,
                to,
                count,
            },
        )
    }

    pub fn category(&self) -> JobCategory {
        match &self.payload {
            JobEventPayload::Created { category, .. }
            | JobEventPayload::Queued { category, .. }
            | JobEventPayload::Started { category, .. }
            | JobEventPayload::Finished { category, .. }
            | JobEventPayload::Canceled { category, .. }
            | JobEventPayload::Swept { category, .. } => *category,
        }
    }
}

/// In-process broadcast bus for job events.
///
/// Publishing never blocks: with no subscribers the event is dropped, and a
/// slow subscriber sees `RecvError::Lagged` instead of holding the
/// publisher back.
#[derive(Clone)]
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}
