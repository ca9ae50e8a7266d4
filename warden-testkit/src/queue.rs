use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use warden::lease::LeaseId;
use warden::queue::{
    Delivery, FetchRequest, OutboundMessage, QueueError, StreamSpec, WorkQueue,
};

#[derive(Clone, Debug, PartialEq)]
enum MessageState {
    Ready,
    Leased(LeaseId),
    Acked,
    Deleted,
}

#[derive(Clone, Debug)]
struct StoredMessage {
    stream: String,
    topic: String,
    dedupe_key: String,
    payload: Vec<u8>,
    state: MessageState,
    deliveries: u32,
    visible_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    streams: BTreeMap<String, StreamSpec>,
    next_sequence: u64,
    messages: BTreeMap<u64, StoredMessage>,
}

/// A message as the queue currently holds it.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub sequence: u64,
    pub topic: String,
    pub dedupe_key: String,
    pub payload: Vec<u8>,
}

/// Work queue held in memory, with switches for simulating broker
/// outages.
#[derive(Clone, Default)]
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryWorkQueue")
            .field("streams", &state.streams.len())
            .field("messages", &state.messages.len())
            .finish()
    }
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish and delete fails with a backend error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Forget every stream, as if the broker lost its configuration.
    pub fn drop_streams(&self) {
        self.state.lock().streams.clear();
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.state.lock().streams.keys().cloned().collect()
    }

    /// Messages on `topic` not yet acked or deleted, oldest first.
    pub fn pending(&self, topic: &str) -> Vec<Published> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|(_, message)| {
                message.topic == topic
                    && matches!(message.state, MessageState::Ready | MessageState::Leased(_))
            })
            .map(|(sequence, message)| Published {
                sequence: *sequence,
                topic: message.topic.clone(),
                dedupe_key: message.dedupe_key.clone(),
                payload: message.payload.clone(),
            })
            .collect()
    }

    /// Every message ever stored, whatever its state.
    pub fn published(&self) -> Vec<Published> {
        self.state
            .lock()
            .messages
            .iter()
            .map(|(sequence, message)| Published {
                sequence: *sequence,
                topic: message.topic.clone(),
                dedupe_key: message.dedupe_key.clone(),
                payload: message.payload.clone(),
            })
            .collect()
    }

    /// Make leased messages visible again, as an expired ack wait would.
    pub fn expire_leases(&self) {
        let now = Utc::now();
        for message in self.state.lock().messages.values_mut() {
            if matches!(message.state, MessageState::Leased(_)) {
                message.visible_at = now;
            }
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn ensure_streams(&self, streams: &[StreamSpec]) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        for stream in streams {
            let entry = state
                .streams
                .entry(stream.name.clone())
                .or_insert_with(|| StreamSpec::new(stream.name.clone(), Vec::new()));
            for topic in &stream.topics {
                if !entry.captures(topic) {
                    entry.topics.push(topic.clone());
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<u64, QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Backend(anyhow::anyhow!("broker unavailable")));
        }
        let mut state = self.state.lock();
        let Some(stream) = state
            .streams
            .values()
            .find(|stream| stream.captures(&message.topic))
            .map(|stream| stream.name.clone())
        else {
            return Err(QueueError::NoResponders(message.topic));
        };

        if let Some((sequence, _)) = state
            .messages
            .iter()
            .find(|(_, stored)| stored.stream == stream && stored.dedupe_key == message.dedupe_key)
        {
            return Ok(*sequence);
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.messages.insert(
            sequence,
            StoredMessage {
                stream,
                topic: message.topic,
                dedupe_key: message.dedupe_key,
                payload: message.payload,
                state: MessageState::Ready,
                deliveries: 0,
                visible_at: Utc::now(),
                settled_at: None,
            },
        );
        Ok(sequence)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Delivery>, QueueError> {
        let now = Utc::now();
        let lease_for = chrono::Duration::from_std(request.ack_wait)
            .map_err(|err| QueueError::Backend(err.into()))?;
        let mut out = Vec::new();
        for (sequence, message) in self.state.lock().messages.iter_mut() {
            if out.len() >= request.max_messages {
                break;
            }
            let available = match message.state {
                MessageState::Ready | MessageState::Leased(_) => message.visible_at <= now,
                MessageState::Acked | MessageState::Deleted => false,
            };
            if message.topic != request.topic || !available {
                continue;
            }
            let lease_id = LeaseId::new();
            message.state = MessageState::Leased(lease_id);
            message.deliveries += 1;
            message.visible_at = now + lease_for;
            out.push(Delivery {
                sequence: *sequence,
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                deliveries: message.deliveries,
                lease_id,
            });
        }
        Ok(out)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if let Some(message) = self.state.lock().messages.get_mut(&delivery.sequence)
            && message.state == MessageState::Leased(delivery.lease_id)
        {
            message.state = MessageState::Acked;
            message.settled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if let Some(message) = self.state.lock().messages.get_mut(&delivery.sequence)
            && message.state == MessageState::Leased(delivery.lease_id)
        {
            message.state = MessageState::Ready;
            message.visible_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_message(&self, topic: &str, sequence: u64) -> Result<bool, QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Backend(anyhow::anyhow!("broker unavailable")));
        }
        let mut state = self.state.lock();
        match state.messages.get_mut(&sequence) {
            Some(message)
                if message.topic == topic
                    && message.state == MessageState::Ready
                    && message.deliveries == 0 =>
            {
                message.state = MessageState::Deleted;
                message.settled_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn depth(&self, topic: &str) -> Result<u64, QueueError> {
        Ok(self
            .state
            .lock()
            .messages
            .values()
            .filter(|message| message.topic == topic && message.state == MessageState::Ready)
            .count() as u64)
    }

    async fn purge_settled(&self, retention: Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|err| QueueError::Backend(err.into()))?;
        let mut state = self.state.lock();
        let before = state.messages.len();
        state
            .messages
            .retain(|_, message| message.settled_at.is_none_or(|at| at >= cutoff));
        Ok((before - state.messages.len()) as u64)
    }
}
