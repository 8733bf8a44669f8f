//! # Event Channel
//!
//! Partitioned, at-least-once delivery of sale events from the reservation
//! engine to the sales processor.
//!
//! ## Delivery Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Event Channel                                   │
//! │                                                                         │
//! │  publish(routing_key) ── fnv1a(key) % N ──► partition p                 │
//! │                                                                         │
//! │  partition p:  [m1][m2][m3] ...                                         │
//! │                  ▲                                                      │
//! │                  └── head leased to ONE consumer (visibility timeout)   │
//! │                                                                         │
//! │  ack   ──► head removed, next message released                          │
//! │  nack  ──► error recorded, head redelivered (attempt + 1)               │
//! │  lease expires ──► head redelivered to any consumer                     │
//! │  attempt == max ──► head moved to the dead-letter channel               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One message per partition is in flight at a time, so events for the same
//! (variant, location) are processed in publish order by at most one worker.

pub mod memory;
pub mod redis_streams;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::error::ChannelResult;
use tally_core::SaleEvent;

pub use memory::MemoryChannel;
pub use redis_streams::RedisStreamsChannel;

/// Confirmation that a message was durably accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub message_id: String,
    pub partition: u32,
}

/// A leased message. Must be acked, nacked or dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub partition: u32,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery.
    pub attempt: u32,
    pub lease_token: String,
}

impl Delivery {
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// What happened to a negatively acknowledged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Will be delivered again.
    Redeliver { attempt: u32 },
    /// Attempt budget spent; moved to the dead-letter channel.
    DeadLettered,
}

/// A message that exhausted its attempts or could never be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    pub routing_key: String,
    pub payload: String,
    pub attempt_count: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Partitioned at-least-once message channel.
#[async_trait]
pub trait EventChannel: Send + Sync + 'static {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> ChannelResult<PublishAck>;

    /// Leases up to `max` messages, at most one per partition.
    async fn receive(&self, consumer: &str, max: usize) -> ChannelResult<Vec<Delivery>>;

    /// Removes the head. Fails with `LeaseLost` once the delivery's lease
    /// expired or passed to another consumer; ack, nack and dead_letter all
    /// require a live lease.
    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()>;

    /// Records `error` and releases the message for redelivery, or
    /// dead-letters it when the attempt budget is spent.
    async fn nack(&self, delivery: &Delivery, error: &str) -> ChannelResult<NackOutcome>;

    /// Routes a message that can never succeed straight to the dead-letter channel.
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> ChannelResult<()>;

    /// Oldest dead letters first.
    async fn dead_letters(&self, limit: usize) -> ChannelResult<Vec<DeadLetter>>;
}

/// Serializes a sale event and publishes it under its routing key.
pub async fn publish_event(channel: &dyn EventChannel, event: &SaleEvent) -> ChannelResult<PublishAck> {
    let payload = serde_json::to_vec(event)?;
    channel.publish(&event.routing_key(), &payload).await
}

struct ConsumeState {
    channel: Arc<dyn EventChannel>,
    consumer: String,
    buffer: VecDeque<Delivery>,
}

/// Infinite stream of deliveries for `consumer`.
///
/// Polls every `poll_interval` while the channel is empty. Receive errors
/// are yielded after one poll interval so callers can log and continue.
pub fn consume(
    channel: Arc<dyn EventChannel>,
    consumer: impl Into<String>,
    batch_size: usize,
    poll_interval: Duration,
) -> impl Stream<Item = ChannelResult<Delivery>> + Send {
    let state = ConsumeState {
        channel,
        consumer: consumer.into(),
        buffer: VecDeque::new(),
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(delivery) = state.buffer.pop_front() {
                return Some((Ok(delivery), state));
            }
            match state.channel.receive(&state.consumer, batch_size).await {
                Ok(batch) if batch.is_empty() => tokio::time::sleep(poll_interval).await,
                Ok(batch) => state.buffer.extend(batch),
                Err(e) => {
                    tokio::time::sleep(poll_interval).await;
                    return Some((Err(e), state));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tally_core::SaleLine;

    #[tokio::test]
    async fn test_publish_event_routes_by_first_line() {
        let channel = MemoryChannel::new(8, Duration::from_secs(30), 5);
        let event = SaleEvent::new(
            "sale-1",
            vec![SaleLine {
                variant_id: "A".into(),
                location_id: "1".into(),
                quantity: 3,
                reservation_id: None,
            }],
        );
        let ack = publish_event(&channel, &event).await.unwrap();
        assert_eq!(ack.partition, tally_core::partition_for("A:1", 8));
    }

    #[tokio::test]
    async fn test_consume_yields_in_publish_order() {
        let channel: Arc<dyn EventChannel> = Arc::new(MemoryChannel::new(1, Duration::from_secs(30), 5));
        for i in 0..3 {
            channel.publish("A:1", format!("m{i}").as_bytes()).await.unwrap();
        }

        let mut stream = Box::pin(consume(channel.clone(), "worker-0", 4, Duration::from_millis(5)));
        for i in 0..3 {
            let delivery = stream.next().await.unwrap().unwrap();
            assert_eq!(delivery.payload_str(), format!("m{i}"));
            channel.ack(&delivery).await.unwrap();
        }
    }
}
