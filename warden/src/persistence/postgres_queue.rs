use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::lease::{LeaseId, RedeliveryConfig, compute_redelivery_delay};
use crate::queue::{
    Delivery, FetchRequest, OutboundMessage, QueueError, StreamSpec, WorkQueue,
};

fn backend(err: sqlx::Error) -> QueueError {
    QueueError::Backend(err.into())
}

/// Work queue stored in PostgreSQL.
///
/// Streams are rows in `warden_queue_streams`; a publish lands in the
/// stream whose topic list contains the message topic. Consumers lease
/// messages with `FOR UPDATE SKIP LOCKED`, and a lease that is neither
/// acked nor nak'ed expires after `ack_wait`, making the message visible
/// again.
#[derive(Debug, Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
    redelivery: RedeliveryConfig,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            redelivery: RedeliveryConfig::default(),
        }
    }

    pub fn with_redelivery(mut self, redelivery: RedeliveryConfig) -> Self {
        self.redelivery = redelivery;
        self
    }

    async fn stream_for(&self, topic: &str) -> Result<String, QueueError> {
        let stream: Option<String> = sqlx::query_scalar(
            "SELECT name FROM warden_queue_streams WHERE $1 = ANY(topics) LIMIT 1",
        )
        .bind(topic)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        stream.ok_or_else(|| QueueError::NoResponders(topic.to_string()))
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn ensure_streams(&self, streams: &[StreamSpec]) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        for stream in streams {
            sqlx::query(
                r#"
                INSERT INTO warden_queue_streams (name, topics)
                VALUES ($1, $2)
                ON CONFLICT (name) DO UPDATE
                SET topics = ARRAY(
                    SELECT DISTINCT unnest(warden_queue_streams.topics || EXCLUDED.topics)
                )
                "#,
            )
            .bind(&stream.name)
            .bind(&stream.topics)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        debug!(count = streams.len(), "streams ensured");
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<u64, QueueError> {
        let stream = self.stream_for(&message.topic).await?;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO warden_queue_messages (stream, topic, dedupe_key, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stream, dedupe_key) DO NOTHING
            RETURNING sequence
            "#,
        )
        .bind(&stream)
        .bind(&message.topic)
        .bind(&message.dedupe_key)
        .bind(&message.payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let sequence = match inserted {
            Some(sequence) => sequence,
            None => {
                debug!(dedupe_key = %message.dedupe_key, "duplicate publish suppressed");
                sqlx::query_scalar(
                    "SELECT sequence FROM warden_queue_messages WHERE stream = $1 AND dedupe_key = $2",
                )
                .bind(&stream)
                .bind(&message.dedupe_key)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?
            }
        };
        Ok(sequence as u64)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Delivery>, QueueError> {
        let ack_wait_ms = request.ack_wait.as_millis() as f64;
        let rows = sqlx::query(
            r#"
            WITH next AS (
                SELECT sequence
                FROM warden_queue_messages
                WHERE topic = $1
                  AND state IN ('ready', 'leased')
                  AND visible_at <= NOW()
                ORDER BY sequence
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE warden_queue_messages m
            SET state = 'leased',
                deliveries = m.deliveries + 1,
                consumer = $3,
                lease_id = gen_random_uuid(),
                visible_at = NOW() + ($4 * INTERVAL '1 millisecond'),
                updated_at = NOW()
            FROM next
            WHERE m.sequence = next.sequence
            RETURNING m.sequence, m.topic, m.payload, m.deliveries, m.lease_id
            "#,
        )
        .bind(&request.topic)
        .bind(request.max_messages as i64)
        .bind(&request.consumer)
        .bind(ack_wait_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut deliveries = rows
            .iter()
            .map(|row| {
                let sequence: i64 = row.try_get("sequence")?;
                let deliveries: i32 = row.try_get("deliveries")?;
                let lease_id: Uuid = row.try_get("lease_id")?;
                Ok(Delivery {
                    sequence: sequence as u64,
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    deliveries: deliveries.max(0) as u32,
                    lease_id: LeaseId(lease_id),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(backend)?;
        deliveries.sort_by_key(|delivery| delivery.sequence);
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE warden_queue_messages
            SET state = 'acked', updated_at = NOW()
            WHERE sequence = $1 AND lease_id = $2
            "#,
        )
        .bind(delivery.sequence as i64)
        .bind(delivery.lease_id.0)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let delay = compute_redelivery_delay(delivery.deliveries, &self.redelivery);
        sqlx::query(
            r#"
            UPDATE warden_queue_messages
            SET state = 'ready',
                lease_id = NULL,
                visible_at = NOW() + ($3 * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE sequence = $1 AND lease_id = $2
            "#,
        )
        .bind(delivery.sequence as i64)
        .bind(delivery.lease_id.0)
        .bind(delay.num_milliseconds() as f64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delete_message(&self, topic: &str, sequence: u64) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE warden_queue_messages
            SET state = 'deleted', updated_at = NOW()
            WHERE sequence = $1
              AND topic = $2
              AND state = 'ready'
              AND deliveries = 0
            "#,
        )
        .bind(sequence as i64)
        .bind(topic)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        let deleted = result.rows_affected() == 1;
        if deleted {
            info!(topic, sequence, "queued message deleted");
        }
        Ok(deleted)
    }

    async fn depth(&self, topic: &str) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM warden_queue_messages WHERE topic = $1 AND state = 'ready'",
        )
        .bind(topic)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(count as u64)
    }

    async fn purge_settled(&self, retention: Duration) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM warden_queue_messages
            WHERE state IN ('acked', 'deleted')
              AND updated_at < NOW() - ($1 * INTERVAL '1 millisecond')
            "#,
        )
        .bind(retention.as_millis() as f64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() > 0 {
            debug!(count = result.rows_affected(), "settled messages purged");
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue() -> PostgresWorkQueue {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrate");
        PostgresWorkQueue::new(pool)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_publish_dedupes_and_cancel_deletes_unleased() {
        let queue = queue().await;
        let topic = format!("test-{}-jobs", Uuid::new_v4());
        queue
            .ensure_streams(&[StreamSpec::new(topic.clone(), vec![topic.clone()])])
            .await
            .unwrap();

        let message = OutboundMessage {
            topic: topic.clone(),
            dedupe_key: "job-1".into(),
            payload: b"{}".to_vec(),
        };
        let first = queue.publish(message.clone()).await.unwrap();
        let second = queue.publish(message).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.depth(&topic).await.unwrap(), 1);

        assert!(queue.delete_message(&topic, first).await.unwrap());
        assert!(!queue.delete_message(&topic, first).await.unwrap());
        assert_eq!(queue.depth(&topic).await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_leased_message_cannot_be_deleted() {
        let queue = queue().await;
        let topic = format!("test-{}-jobs", Uuid::new_v4());
        queue
            .ensure_streams(&[StreamSpec::new(topic.clone(), vec![topic.clone()])])
            .await
            .unwrap();
        let sequence = queue
            .publish(OutboundMessage {
                topic: topic.clone(),
                dedupe_key: "job-2".into(),
                payload: b"{}".to_vec(),
            })
            .await
            .unwrap();

        let fetched = queue
            .fetch(&FetchRequest {
                topic: topic.clone(),
                consumer: "test".into(),
                max_messages: 10,
                ack_wait: Duration::from_secs(30),
            })
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].deliveries, 1);

        assert!(!queue.delete_message(&topic, sequence).await.unwrap());
        queue.ack(&fetched[0]).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_settled_messages_are_purged() {
        let queue = queue().await;
        let topic = format!("test-{}-jobs", Uuid::new_v4());
        queue
            .ensure_streams(&[StreamSpec::new(topic.clone(), vec![topic.clone()])])
            .await
            .unwrap();
        let message = OutboundMessage {
            topic: topic.clone(),
            dedupe_key: "job-3".into(),
            payload: b"{}".to_vec(),
        };
        let first = queue.publish(message.clone()).await.unwrap();
        let fetched = queue
            .fetch(&FetchRequest {
                topic: topic.clone(),
                consumer: "test".into(),
                max_messages: 10,
                ack_wait: Duration::from_secs(30),
            })
            .await
            .unwrap();
        queue.ack(&fetched[0]).await.unwrap();

        // Inside the retention window the key still suppresses a publish.
        queue.purge_settled(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(queue.publish(message.clone()).await.unwrap(), first);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.purge_settled(Duration::ZERO).await.unwrap() >= 1);
        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM warden_queue_messages WHERE topic = $1",
        )
        .bind(&topic)
        .fetch_one(&queue.pool)
        .await
        .unwrap();
        assert_eq!(remaining, 0);
        assert_ne!(queue.publish(message).await.unwrap(), first);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_publish_without_stream_has_no_responders() {
        let queue = queue().await;
        let err = queue
            .publish(OutboundMessage {
                topic: format!("missing-{}", Uuid::new_v4()),
                dedupe_key: "x".into(),
                payload: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
