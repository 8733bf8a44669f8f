//! # Redis Streams Channel
//!
//! Durable, at-least-once channel shared by every process.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tally:sales:p{n}          STREAM  one per partition                    │
//! │                            group "tally-processors"                     │
//! │  tally:sales:p{n}:lease    STRING  lease token, PX = visibility timeout │
//! │  tally:sales:errors        HASH    message_id → last error              │
//! │  tally:sales:dlq           STREAM  dead letters                         │
//! │                                                                         │
//! │  receive:                                                               │
//! │    SET lease NX PX ──► XPENDING head? ──► XCLAIM (redelivery)           │
//! │                             │                                           │
//! │                             └── none ──► XREADGROUP > COUNT 1 (new)     │
//! │  ack:   lease check ──► XACK + XDEL + DEL lease   (one script)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pending entry list counts deliveries, so a head whose lease expired
//! on its final attempt is moved to the DLQ by the next receive.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DeadLetter, Delivery, EventChannel, NackOutcome, PublishAck};
use crate::config::ChannelSettings;
use crate::error::{ChannelError, ChannelResult};
use tally_core::partition_for;

const STREAM_PREFIX: &str = "tally:sales";
const GROUP: &str = "tally-processors";
const LEASE_EXPIRED: &str = "visibility timeout exceeded";

const ACK_LUA: &str = r#"
if redis.call('GET', KEYS[2]) ~= ARGV[2] then
  return 0
end
redis.call('XACK', KEYS[1], ARGV[3], ARGV[1])
redis.call('XDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('DEL', KEYS[2])
return 1
"#;

const RELEASE_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn stream_key(partition: u32) -> String {
    format!("{STREAM_PREFIX}:p{partition}")
}

fn lease_held(holder: Option<&str>, delivery: &Delivery) -> bool {
    holder == Some(delivery.lease_token.as_str())
}

fn lease_key(partition: u32) -> String {
    format!("{STREAM_PREFIX}:p{partition}:lease")
}

fn errors_key() -> String {
    format!("{STREAM_PREFIX}:errors")
}

fn dlq_key() -> String {
    format!("{STREAM_PREFIX}:dlq")
}

/// Builds a dead letter from DLQ entry fields.
fn parse_dead_letter(message_id: &str, get: impl Fn(&str) -> Option<String>) -> DeadLetter {
    DeadLetter {
        message_id: get("message_id").unwrap_or_else(|| message_id.to_string()),
        routing_key: get("routing_key").unwrap_or_default(),
        payload: get("payload").unwrap_or_default(),
        attempt_count: get("attempt_count").and_then(|v| v.parse().ok()).unwrap_or(0),
        last_error: get("last_error").unwrap_or_default(),
        failed_at: get("failed_at")
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    }
}

fn field_string(entry: &StreamId, name: &str) -> Option<String> {
    entry.get::<String>(name)
}

/// Channel backed by one Redis stream per partition.
#[derive(Clone)]
pub struct RedisStreamsChannel {
    conn: ConnectionManager,
    partitions: u32,
    visibility_timeout_ms: u64,
    max_attempts: u32,
    ack: Script,
    release: Script,
    cursor: std::sync::Arc<AtomicUsize>,
}

impl RedisStreamsChannel {
    pub fn new(conn: ConnectionManager, settings: &ChannelSettings) -> Self {
        Self {
            conn,
            partitions: settings.partitions.max(1),
            visibility_timeout_ms: settings.visibility_timeout_ms,
            max_attempts: settings.max_delivery_attempts.max(1),
            ack: Script::new(ACK_LUA),
            release: Script::new(RELEASE_LUA),
            cursor: std::sync::Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connects and makes sure every partition's consumer group exists.
    pub async fn connect(redis_url: &str, settings: &ChannelSettings) -> ChannelResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        let channel = Self::new(conn, settings);
        channel.ensure_groups().await?;
        Ok(channel)
    }

    /// XGROUP CREATE for every partition. Existing groups are kept.
    pub async fn ensure_groups(&self) -> ChannelResult<()> {
        let mut conn = self.conn.clone();
        for p in 0..self.partitions {
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream_key(p))
                .arg(GROUP)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            match created {
                Ok(_) => {}
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(partitions = self.partitions, "Sale event streams ready");
        Ok(())
    }

    async fn acquire_lease(&self, conn: &mut ConnectionManager, partition: u32, token: &str) -> ChannelResult<bool> {
        let set: Option<String> = redis::cmd("SET")
            .arg(lease_key(partition))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.visibility_timeout_ms)
            .query_async(conn)
            .await?;
        Ok(set.is_some())
    }

    async fn release_lease(&self, conn: &mut ConnectionManager, partition: u32, token: &str) -> ChannelResult<()> {
        let _: i64 = self
            .release
            .key(lease_key(partition))
            .arg(token)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    /// Fails unless `delivery` still holds the partition lease. An expired
    /// lease is lost even if nobody has claimed the partition since.
    async fn check_lease(&self, conn: &mut ConnectionManager, delivery: &Delivery) -> ChannelResult<()> {
        let holder: Option<String> = conn.get(lease_key(delivery.partition)).await?;
        if lease_held(holder.as_deref(), delivery) {
            Ok(())
        } else {
            Err(ChannelError::LeaseLost {
                message_id: delivery.message_id.clone(),
            })
        }
    }

    fn delivery(&self, partition: u32, entry: StreamId, attempt: u32, token: &str) -> Delivery {
        Delivery {
            routing_key: field_string(&entry, "routing_key").unwrap_or_default(),
            payload: entry.get::<Vec<u8>>("payload").unwrap_or_default(),
            message_id: entry.id,
            partition,
            attempt,
            lease_token: token.to_string(),
        }
    }

    /// Moves a message to the DLQ and removes it from its partition.
    #[allow(clippy::too_many_arguments)]
    async fn bury(
        &self,
        conn: &mut ConnectionManager,
        partition: u32,
        message_id: &str,
        routing_key: &str,
        payload: &[u8],
        attempts: u32,
        error: &str,
    ) -> ChannelResult<()> {
        let stream = stream_key(partition);
        let _: () = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(dlq_key())
            .arg("*")
            .arg("message_id")
            .arg(message_id)
            .arg("routing_key")
            .arg(routing_key)
            .arg("payload")
            .arg(payload)
            .arg("attempt_count")
            .arg(attempts)
            .arg("last_error")
            .arg(error)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .ignore()
            .cmd("XACK")
            .arg(&stream)
            .arg(GROUP)
            .arg(message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(message_id)
            .ignore()
            .cmd("HDEL")
            .arg(errors_key())
            .arg(message_id)
            .ignore()
            .query_async(conn)
            .await?;

        warn!(
            %message_id,
            %routing_key,
            attempts,
            %error,
            "Message moved to dead-letter stream"
        );
        Ok(())
    }

    /// Next message of a leased partition: the unacknowledged head if any,
    /// otherwise the next new entry.
    async fn next_in_partition(
        &self,
        conn: &mut ConnectionManager,
        partition: u32,
        consumer: &str,
        token: &str,
    ) -> ChannelResult<Option<Delivery>> {
        let stream = stream_key(partition);
        loop {
            let pending: StreamPendingCountReply = conn.xpending_count(&stream, GROUP, "-", "+", 1).await?;
            let Some(head) = pending.ids.into_iter().next() else {
                break;
            };
            let delivered = head.times_delivered as u32;

            let claimed: StreamClaimReply = conn.xclaim(&stream, GROUP, consumer, 0, &[&head.id]).await?;
            let Some(entry) = claimed.ids.into_iter().next() else {
                // Entry was trimmed underneath the group; drop the pending slot.
                let _: i64 = conn.xack(&stream, GROUP, &[&head.id]).await?;
                continue;
            };

            if delivered >= self.max_attempts {
                let last_error: Option<String> = conn.hget(errors_key(), &head.id).await?;
                let routing_key = field_string(&entry, "routing_key").unwrap_or_default();
                let payload = entry.get::<Vec<u8>>("payload").unwrap_or_default();
                self.bury(
                    conn,
                    partition,
                    &head.id,
                    &routing_key,
                    &payload,
                    delivered,
                    last_error.as_deref().unwrap_or(LEASE_EXPIRED),
                )
                .await?;
                continue;
            }

            return Ok(Some(self.delivery(partition, entry, delivered + 1, token)));
        }

        let options = StreamReadOptions::default().group(GROUP, consumer).count(1);
        let reply: StreamReadReply = conn.xread_options(&[&stream], &[">"], &options).await?;
        let entry = reply.keys.into_iter().next().and_then(|k| k.ids.into_iter().next());
        Ok(entry.map(|e| self.delivery(partition, e, 1, token)))
    }
}

#[async_trait]
impl EventChannel for RedisStreamsChannel {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> ChannelResult<PublishAck> {
        let mut conn = self.conn.clone();
        let partition = partition_for(routing_key, self.partitions);
        let message_id: String = redis::cmd("XADD")
            .arg(stream_key(partition))
            .arg("*")
            .arg("routing_key")
            .arg(routing_key)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        debug!(%message_id, partition, "Published sale event");
        Ok(PublishAck { message_id, partition })
    }

    async fn receive(&self, consumer: &str, max: usize) -> ChannelResult<Vec<Delivery>> {
        let mut conn = self.conn.clone();
        let count = self.partitions as usize;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let mut out = Vec::new();

        for offset in 0..count {
            if out.len() >= max {
                break;
            }
            let partition = ((start + offset) % count) as u32;
            let token = Uuid::new_v4().to_string();
            if !self.acquire_lease(&mut conn, partition, &token).await? {
                continue;
            }

            match self.next_in_partition(&mut conn, partition, consumer, &token).await {
                Ok(Some(delivery)) => out.push(delivery),
                Ok(None) => self.release_lease(&mut conn, partition, &token).await?,
                Err(e) => {
                    if let Err(release) = self.release_lease(&mut conn, partition, &token).await {
                        warn!(partition, error = %release, "Failed to release partition lease");
                    }
                    return Err(e);
                }
            }
        }

        Ok(out)
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        let mut conn = self.conn.clone();
        let acked: i64 = self
            .ack
            .key(stream_key(delivery.partition))
            .key(lease_key(delivery.partition))
            .key(errors_key())
            .arg(&delivery.message_id)
            .arg(&delivery.lease_token)
            .arg(GROUP)
            .invoke_async(&mut conn)
            .await?;
        if acked == 0 {
            return Err(ChannelError::LeaseLost {
                message_id: delivery.message_id.clone(),
            });
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> ChannelResult<NackOutcome> {
        let mut conn = self.conn.clone();
        self.check_lease(&mut conn, delivery).await?;

        if delivery.attempt >= self.max_attempts {
            self.bury(
                &mut conn,
                delivery.partition,
                &delivery.message_id,
                &delivery.routing_key,
                &delivery.payload,
                delivery.attempt,
                error,
            )
            .await?;
            self.release_lease(&mut conn, delivery.partition, &delivery.lease_token)
                .await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let _: () = conn.hset(errors_key(), &delivery.message_id, error).await?;
        self.release_lease(&mut conn, delivery.partition, &delivery.lease_token)
            .await?;
        Ok(NackOutcome::Redeliver {
            attempt: delivery.attempt + 1,
        })
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> ChannelResult<()> {
        let mut conn = self.conn.clone();
        self.check_lease(&mut conn, delivery).await?;
        self.bury(
            &mut conn,
            delivery.partition,
            &delivery.message_id,
            &delivery.routing_key,
            &delivery.payload,
            delivery.attempt,
            error,
        )
        .await?;
        self.release_lease(&mut conn, delivery.partition, &delivery.lease_token)
            .await
    }

    async fn dead_letters(&self, limit: usize) -> ChannelResult<Vec<DeadLetter>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange_count(dlq_key(), "-", "+", limit).await?;
        Ok(reply
            .ids
            .iter()
            .map(|entry| parse_dead_letter(&entry.id, |name| field_string(entry, name)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_key_layout() {
        assert_eq!(stream_key(3), "tally:sales:p3");
        assert_eq!(lease_key(3), "tally:sales:p3:lease");
        assert_eq!(errors_key(), "tally:sales:errors");
        assert_eq!(dlq_key(), "tally:sales:dlq");
    }

    #[test]
    fn test_expired_lease_is_not_held() {
        let delivery = Delivery {
            message_id: "1-0".into(),
            partition: 0,
            routing_key: "A:1".into(),
            payload: Vec::new(),
            attempt: 1,
            lease_token: "t-1".into(),
        };
        assert!(lease_held(Some("t-1"), &delivery));
        assert!(!lease_held(Some("t-2"), &delivery));
        assert!(!lease_held(None, &delivery));
    }

    #[test]
    fn test_parse_dead_letter_fields() {
        let fields: HashMap<&str, &str> = [
            ("message_id", "1767607200000-0"),
            ("routing_key", "A:1"),
            ("payload", "{}"),
            ("attempt_count", "5"),
            ("last_error", "database is locked"),
            ("failed_at", "2026-01-05T10:00:00+00:00"),
        ]
        .into_iter()
        .collect();

        let letter = parse_dead_letter("9-0", |name| fields.get(name).map(|v| v.to_string()));
        assert_eq!(letter.message_id, "1767607200000-0");
        assert_eq!(letter.attempt_count, 5);
        assert_eq!(letter.last_error, "database is locked");
        assert_eq!(letter.failed_at.to_rfc3339(), "2026-01-05T10:00:00+00:00");
    }

    #[test]
    fn test_parse_dead_letter_tolerates_missing_fields() {
        let letter = parse_dead_letter("9-0", |_| None);
        assert_eq!(letter.message_id, "9-0");
        assert_eq!(letter.attempt_count, 0);
        assert!(letter.payload.is_empty());
    }
}
