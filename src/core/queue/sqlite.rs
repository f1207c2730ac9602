//! Durable queue on the service's SQLite database.
//!
//! The lease is a `leased_until` timestamp: a message is available when it has
//! no lease or the lease has expired, so a crashed consumer needs no cleanup
//! path at all. All calls share the storage connection; the mutex makes the
//! select-then-lease pair atomic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, params};
use tokio::sync::Mutex;

use super::{Delivery, TaskQueue};

pub struct SqliteQueue {
    db: Arc<Mutex<Connection>>,
}

impl SqliteQueue {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskQueue for SqliteQueue {
    async fn publish(&self, queue: &str, payload: &str) -> anyhow::Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO queue_messages (queue, payload) VALUES (?1, ?2)",
            params![queue, payload],
        )?;
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        visibility: Duration,
    ) -> anyhow::Result<Option<Delivery>> {
        let db = self.db.lock().await;
        let next = {
            let mut stmt = db.prepare(
                "SELECT id, payload, delivery_count FROM queue_messages
                 WHERE queue = ?1
                   AND available_at <= CURRENT_TIMESTAMP
                   AND (leased_until IS NULL OR leased_until <= CURRENT_TIMESTAMP)
                 ORDER BY id LIMIT 1",
            )?;
            let mut rows = stmt.query(params![queue])?;
            match rows.next()? {
                Some(row) => Some((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                )),
                None => None,
            }
        };

        let Some((id, payload, delivery_count)) = next else {
            return Ok(None);
        };

        let lease = format!("+{} seconds", visibility.as_secs());
        db.execute(
            "UPDATE queue_messages
             SET leased_until = datetime('now', ?1), delivery_count = delivery_count + 1
             WHERE id = ?2",
            params![lease, id],
        )?;

        Ok(Some(Delivery {
            id,
            queue: queue.to_string(),
            payload,
            delivery_count: delivery_count + 1,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "DELETE FROM queue_messages WHERE id = ?1",
            params![delivery.id],
        )?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, delay: Duration) -> anyhow::Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE queue_messages
             SET leased_until = NULL, available_at = datetime('now', ?1)
             WHERE id = ?2",
            params![format!("+{} seconds", delay.as_secs()), delivery.id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::Storage;

    fn queue() -> SqliteQueue {
        let storage = Storage::open_in_memory().unwrap();
        SqliteQueue::new(storage.get_db())
    }

    #[tokio::test]
    async fn ack_removes_the_message() {
        let q = queue();
        q.publish("agent", "payload-1").await.unwrap();

        let delivery = q
            .dequeue("agent", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, "payload-1");
        assert_eq!(delivery.delivery_count, 1);
        q.ack(&delivery).await.unwrap();

        assert!(
            q.dequeue("agent", Duration::from_secs(600))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn leased_messages_are_invisible_until_expiry() {
        let q = queue();
        q.publish("agent", "payload-1").await.unwrap();

        let first = q
            .dequeue("agent", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        // Lease held: nothing available for a second consumer.
        assert!(
            q.dequeue("agent", Duration::from_secs(600))
                .await
                .unwrap()
                .is_none()
        );
        // Nothing acked: a crashed consumer just lets the lease lapse.
        drop(first);
    }

    #[tokio::test]
    async fn expired_lease_causes_redelivery() {
        let q = queue();
        q.publish("agent", "payload-1").await.unwrap();

        // Zero visibility expires the lease immediately, standing in for a
        // consumer crash.
        let first = q
            .dequeue("agent", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.delivery_count, 1);

        let second = q
            .dequeue("agent", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.payload, "payload-1");
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn nack_releases_for_redelivery() {
        let q = queue();
        q.publish("agent", "payload-1").await.unwrap();

        let delivery = q
            .dequeue("agent", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        q.nack(&delivery, Duration::ZERO).await.unwrap();

        let again = q
            .dequeue("agent", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, delivery.id);
    }

    #[tokio::test]
    async fn named_queues_are_isolated() {
        let q = queue();
        q.publish("agent", "for-agent").await.unwrap();
        q.publish("default", "for-default").await.unwrap();

        let delivery = q
            .dequeue("default", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, "for-default");
        let delivery = q
            .dequeue("agent", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, "for-agent");
    }

    #[tokio::test]
    async fn oldest_message_is_delivered_first() {
        let q = queue();
        q.publish("agent", "first").await.unwrap();
        q.publish("agent", "second").await.unwrap();

        let delivery = q
            .dequeue("agent", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, "first");
    }
}
