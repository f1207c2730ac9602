//! At-least-once task queue contract.
//!
//! Messages are partitioned by named queue. A dequeue takes a lease for the
//! visibility window; acknowledging deletes the message, abandoning (nack)
//! releases it for redelivery after an optional delay. A consumer that
//! crashes while holding a lease simply lets it expire, and the message is
//! redelivered — which is why every consumer must tolerate duplicates.

pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;

/// One leased message. Holds everything needed to ack or abandon it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    /// How many times this message has been handed out, this delivery
    /// included. Greater than one means a redelivery.
    pub delivery_count: i64,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, queue: &str, payload: &str) -> anyhow::Result<()>;

    /// Lease the oldest available message, or `None` when the queue is empty.
    /// Non-blocking; callers poll.
    async fn dequeue(&self, queue: &str, visibility: Duration)
    -> anyhow::Result<Option<Delivery>>;

    /// Acknowledge and delete. Only called once the corresponding job has
    /// reached a terminal state or is being deliberately discarded.
    async fn ack(&self, delivery: &Delivery) -> anyhow::Result<()>;

    /// Release the lease so the message is redelivered after `delay`.
    async fn nack(&self, delivery: &Delivery, delay: Duration) -> anyhow::Result<()>;
}
