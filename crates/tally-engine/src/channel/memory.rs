//! # In-Memory Channel
//!
//! Single-process channel for tests and embedded use. Each partition is a
//! FIFO queue whose head can be leased by one consumer at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DeadLetter, Delivery, EventChannel, NackOutcome, PublishAck};
use crate::error::{ChannelError, ChannelResult};
use tally_core::partition_for;

const LEASE_EXPIRED: &str = "visibility timeout exceeded";

#[derive(Debug)]
struct Message {
    message_id: String,
    routing_key: String,
    payload: Vec<u8>,
    deliveries: u32,
    last_error: Option<String>,
}

impl Message {
    fn into_dead_letter(self, error: Option<&str>) -> DeadLetter {
        DeadLetter {
            last_error: error
                .map(str::to_string)
                .or(self.last_error)
                .unwrap_or_else(|| LEASE_EXPIRED.to_string()),
            message_id: self.message_id,
            routing_key: self.routing_key,
            payload: String::from_utf8_lossy(&self.payload).into_owned(),
            attempt_count: self.deliveries,
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct Lease {
    token: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Partition {
    queue: VecDeque<Message>,
    lease: Option<Lease>,
}

/// Partitioned channel held in process memory.
#[derive(Debug)]
pub struct MemoryChannel {
    partitions: Vec<Mutex<Partition>>,
    dead: Mutex<Vec<DeadLetter>>,
    next_id: AtomicU64,
    /// Rotates the first partition scanned by `receive`.
    cursor: AtomicUsize,
    visibility_timeout: Duration,
    max_attempts: u32,
}

fn poisoned<E>(_: E) -> ChannelError {
    ChannelError::Backend("channel lock poisoned".into())
}

impl MemoryChannel {
    pub fn new(partitions: u32, visibility_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Partition::default())).collect(),
            dead: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            cursor: AtomicUsize::new(0),
            visibility_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_settings(settings: &crate::config::ChannelSettings) -> Self {
        Self::new(
            settings.partitions,
            settings.visibility_timeout(),
            settings.max_delivery_attempts,
        )
    }

    fn partition(&self, index: u32) -> ChannelResult<MutexGuard<'_, Partition>> {
        self.partitions
            .get(index as usize)
            .ok_or_else(|| ChannelError::Backend(format!("no partition {index}")))?
            .lock()
            .map_err(poisoned)
    }

    /// Locks the delivery's partition if its lease is still held by the delivery.
    /// A lease past its deadline is lost even before another receive claims it.
    fn leased(&self, delivery: &Delivery) -> ChannelResult<MutexGuard<'_, Partition>> {
        let partition = self.partition(delivery.partition)?;
        let now = Instant::now();
        let owned = partition
            .lease
            .as_ref()
            .is_some_and(|l| l.token == delivery.lease_token && l.deadline > now);
        let head_matches = partition
            .queue
            .front()
            .is_some_and(|m| m.message_id == delivery.message_id);
        if !owned || !head_matches {
            return Err(ChannelError::LeaseLost {
                message_id: delivery.message_id.clone(),
            });
        }
        Ok(partition)
    }

    fn bury(&self, message: Message, error: Option<&str>) -> ChannelResult<()> {
        let letter = message.into_dead_letter(error);
        warn!(
            message_id = %letter.message_id,
            routing_key = %letter.routing_key,
            attempts = letter.attempt_count,
            error = %letter.last_error,
            "Message moved to dead-letter channel"
        );
        self.dead.lock().map_err(poisoned)?.push(letter);
        Ok(())
    }

    /// Messages waiting in all partitions, including leased heads.
    pub fn pending(&self) -> usize {
        self.partitions
            .iter()
            .filter_map(|p| p.lock().ok().map(|p| p.queue.len()))
            .sum()
    }
}

#[async_trait]
impl EventChannel for MemoryChannel {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> ChannelResult<PublishAck> {
        let index = partition_for(routing_key, self.partitions.len() as u32);
        let message_id = format!("{}-{}", Utc::now().timestamp_millis(), self.next_id.fetch_add(1, Ordering::Relaxed));

        self.partition(index)?.queue.push_back(Message {
            message_id: message_id.clone(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            deliveries: 0,
            last_error: None,
        });

        debug!(%message_id, partition = index, "Published message");
        Ok(PublishAck {
            message_id,
            partition: index,
        })
    }

    async fn receive(&self, _consumer: &str, max: usize) -> ChannelResult<Vec<Delivery>> {
        let count = self.partitions.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let now = Instant::now();
        let mut out = Vec::new();

        for offset in 0..count {
            if out.len() >= max {
                break;
            }
            let index = ((start + offset) % count) as u32;
            let mut partition = self.partition(index)?;

            if partition.lease.as_ref().is_some_and(|l| l.deadline > now) {
                continue;
            }
            partition.lease = None;

            // A head whose last lease expired on its final attempt is dead.
            while partition
                .queue
                .front()
                .is_some_and(|m| m.deliveries >= self.max_attempts)
            {
                if let Some(message) = partition.queue.pop_front() {
                    self.bury(message, None)?;
                }
            }

            let Some(head) = partition.queue.front_mut() else {
                continue;
            };
            head.deliveries += 1;
            let delivery = Delivery {
                message_id: head.message_id.clone(),
                partition: index,
                routing_key: head.routing_key.clone(),
                payload: head.payload.clone(),
                attempt: head.deliveries,
                lease_token: Uuid::new_v4().to_string(),
            };
            partition.lease = Some(Lease {
                token: delivery.lease_token.clone(),
                deadline: now + self.visibility_timeout,
            });
            out.push(delivery);
        }

        Ok(out)
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        let mut partition = self.leased(delivery)?;
        partition.queue.pop_front();
        partition.lease = None;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> ChannelResult<NackOutcome> {
        let mut partition = self.leased(delivery)?;
        partition.lease = None;

        let exhausted = partition
            .queue
            .front()
            .is_some_and(|m| m.deliveries >= self.max_attempts);
        if exhausted {
            let message = partition.queue.pop_front();
            drop(partition);
            if let Some(message) = message {
                self.bury(message, Some(error))?;
            }
            return Ok(NackOutcome::DeadLettered);
        }

        let attempt = match partition.queue.front_mut() {
            Some(head) => {
                head.last_error = Some(error.to_string());
                head.deliveries + 1
            }
            None => delivery.attempt + 1,
        };
        Ok(NackOutcome::Redeliver { attempt })
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> ChannelResult<()> {
        let mut partition = self.leased(delivery)?;
        partition.lease = None;
        let message = partition.queue.pop_front();
        drop(partition);
        if let Some(message) = message {
            self.bury(message, Some(error))?;
        }
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> ChannelResult<Vec<DeadLetter>> {
        let dead = self.dead.lock().map_err(poisoned)?;
        Ok(dead.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(max_attempts: u32) -> MemoryChannel {
        MemoryChannel::new(4, Duration::from_secs(30), max_attempts)
    }

    #[tokio::test]
    async fn test_one_in_flight_per_partition() {
        let ch = channel(5);
        ch.publish("A:1", b"first").await.unwrap();
        ch.publish("A:1", b"second").await.unwrap();

        let got = ch.receive("w0", 10).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"first");
        assert!(ch.receive("w1", 10).await.unwrap().is_empty());

        ch.ack(&got[0]).await.unwrap();
        let next = ch.receive("w1", 10).await.unwrap();
        assert_eq!(next[0].payload, b"second");
        assert_eq!(next[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let ch = channel(2);
        ch.publish("A:1", b"bad").await.unwrap();

        let first = ch.receive("w0", 1).await.unwrap().remove(0);
        assert_eq!(ch.nack(&first, "db locked").await.unwrap(), NackOutcome::Redeliver { attempt: 2 });

        let second = ch.receive("w0", 1).await.unwrap().remove(0);
        assert_eq!(second.attempt, 2);
        assert_eq!(ch.nack(&second, "db locked").await.unwrap(), NackOutcome::DeadLettered);

        assert!(ch.receive("w0", 1).await.unwrap().is_empty());
        let dead = ch.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt_count, 2);
        assert_eq!(dead[0].last_error, "db locked");
        assert_eq!(dead[0].payload, "bad");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_lease_expiry_is_rejected() {
        let ch = MemoryChannel::new(1, Duration::from_millis(100), 5);
        ch.publish("A:1", b"m").await.unwrap();
        let first = ch.receive("w0", 1).await.unwrap().remove(0);

        tokio::time::advance(Duration::from_millis(150)).await;
        let err = ch.ack(&first).await.unwrap_err();
        assert!(matches!(err, ChannelError::LeaseLost { .. }));
        assert_eq!(ch.pending(), 1);

        let again = ch.receive("w0", 1).await.unwrap().remove(0);
        assert_eq!(again.message_id, first.message_id);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_ack_after_nack_is_rejected() {
        let ch = MemoryChannel::new(1, Duration::from_secs(30), 5);
        ch.publish("A:1", b"m").await.unwrap();
        let first = ch.receive("w0", 1).await.unwrap().remove(0);
        ch.nack(&first, "db locked").await.unwrap();

        let err = ch.ack(&first).await.unwrap_err();
        assert!(matches!(err, ChannelError::LeaseLost { .. }));
        assert_eq!(ch.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_redelivers() {
        let ch = MemoryChannel::new(1, Duration::from_millis(100), 5);
        ch.publish("A:1", b"m").await.unwrap();
        let first = ch.receive("w0", 1).await.unwrap().remove(0);

        tokio::time::advance(Duration::from_millis(150)).await;
        let again = ch.receive("w1", 1).await.unwrap().remove(0);
        assert_eq!(again.message_id, first.message_id);
        assert_eq!(again.attempt, 2);

        let err = ch.ack(&first).await.unwrap_err();
        assert!(matches!(err, ChannelError::LeaseLost { .. }));
        ch.ack(&again).await.unwrap();
        assert_eq!(ch.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_final_attempt_is_dead_lettered() {
        let ch = MemoryChannel::new(1, Duration::from_millis(10), 1);
        ch.publish("A:1", b"m").await.unwrap();
        ch.receive("w0", 1).await.unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(ch.receive("w0", 1).await.unwrap().is_empty());
        let dead = ch.dead_letters(10).await.unwrap();
        assert_eq!(dead[0].last_error, LEASE_EXPIRED);
    }

    #[tokio::test]
    async fn test_dead_letter_immediately() {
        let ch = channel(5);
        ch.publish("A:1", b"{not json").await.unwrap();
        let d = ch.receive("w0", 1).await.unwrap().remove(0);
        ch.dead_letter(&d, "malformed").await.unwrap();
        assert_eq!(ch.pending(), 0);
        assert_eq!(ch.dead_letters(10).await.unwrap()[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_partitions_deliver_in_parallel() {
        let ch = MemoryChannel::new(64, Duration::from_secs(30), 5);
        for i in 0..20 {
            ch.publish(&format!("v{i}:loc"), b"x").await.unwrap();
        }
        let batch = ch.receive("w0", 100).await.unwrap();
        assert!(batch.len() > 1);
        let partitions: std::collections::HashSet<u32> = batch.iter().map(|d| d.partition).collect();
        assert_eq!(partitions.len(), batch.len());
    }
}
