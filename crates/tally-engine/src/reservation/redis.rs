//! # Redis Reservation Store
//!
//! Shared fast path for multi-process deployments. Every mutation is one
//! Lua script, so Redis applies the check and the counter change as a
//! single step.
//!
//! ## Key Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  stock:{variant}:{location}   HASH  on_hand reserved in_flight          │
//! │                                     epoch seeded                        │
//! │  reservation:{id}             HASH  reservation_id variant_id           │
//! │                                     location_id quantity status         │
//! │                                     created_ms expires_ms sale_id       │
//! │                                     settled        (EXPIRE ttl+retain)  │
//! │  reservations:expiry          ZSET  member=id score=expires_ms          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use super::store::{ReservationStore, ReserveAttempt, ResyncOutcome, SeedOutcome, TransitionResult};
use crate::error::{StoreError, StoreResult};
use tally_core::{Reservation, ReservationStatus, StockKey, StockLevel, Transition};

const EXPIRY_INDEX: &str = "reservations:expiry";

const RESERVE_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'seeded') ~= '1' then
  return {-2, 0}
end
local on_hand = tonumber(redis.call('HGET', KEYS[1], 'on_hand') or '0')
local reserved = tonumber(redis.call('HGET', KEYS[1], 'reserved') or '0')
local qty = tonumber(ARGV[1])
local available = on_hand - reserved
if available < qty then
  return {-1, available}
end
redis.call('HINCRBY', KEYS[1], 'reserved', qty)
redis.call('HSET', KEYS[2],
  'reservation_id', ARGV[2], 'variant_id', ARGV[3], 'location_id', ARGV[4],
  'quantity', ARGV[1], 'status', 'HELD', 'created_ms', ARGV[5],
  'expires_ms', ARGV[6], 'sale_id', '', 'settled', '0')
redis.call('EXPIRE', KEYS[2], ARGV[7])
redis.call('ZADD', KEYS[3], ARGV[6], ARGV[2])
return {1, available - qty}
"#;

const TRANSITION_LUA: &str = r#"
local st = redis.call('HGET', KEYS[1], 'status')
if not st then
  return {-3, '', '0', ''}
end
local id = ARGV[3]
local qty = tonumber(redis.call('HGET', KEYS[1], 'quantity'))
local settled = redis.call('HGET', KEYS[1], 'settled') or '0'
local sale = redis.call('HGET', KEYS[1], 'sale_id') or ''
local op = ARGV[1]

local function finish(status)
  redis.call('HSET', KEYS[1], 'status', status)
  redis.call('HINCRBY', KEYS[2], 'reserved', -qty)
  redis.call('ZREM', KEYS[3], id)
  return {1, status, settled, sale}
end

if op == 'commit' then
  if st == 'HELD' then
    redis.call('HSET', KEYS[1], 'status', 'COMMITTED', 'sale_id', ARGV[2])
    redis.call('ZREM', KEYS[3], id)
    return {1, 'COMMITTED', settled, ARGV[2]}
  elseif st == 'COMMITTED' then
    return {0, st, settled, sale}
  end
  return {-1, st, settled, sale}
elseif op == 'release' then
  if st == 'HELD' then
    return finish('RELEASED')
  elseif st == 'COMMITTED' then
    return {-1, st, settled, sale}
  end
  return {0, st, settled, sale}
elseif op == 'expire' then
  local expires = tonumber(redis.call('HGET', KEYS[1], 'expires_ms'))
  if st == 'HELD' and expires < tonumber(ARGV[2]) then
    return finish('EXPIRED')
  end
  if st ~= 'HELD' then
    redis.call('ZREM', KEYS[3], id)
  end
  return {0, st, settled, sale}
elseif op == 'settle' then
  if st ~= 'COMMITTED' then
    return {-1, st, settled, sale}
  end
  if settled == '1' then
    return {0, st, settled, sale}
  end
  redis.call('HSET', KEYS[1], 'settled', '1')
  redis.call('HINCRBY', KEYS[2], 'reserved', -qty)
  redis.call('HINCRBY', KEYS[2], 'on_hand', -qty)
  return {1, st, '1', sale}
elseif op == 'compensate' then
  if st == 'HELD' or (st == 'COMMITTED' and settled ~= '1') then
    return finish('RELEASED')
  elseif st == 'COMMITTED' then
    return {-1, st, settled, sale}
  end
  return {0, st, settled, sale}
end
return {-1, st, settled, sale}
"#;

const SEED_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'seeded') == '1' then
  return 0
end
local epoch = tonumber(redis.call('HGET', KEYS[1], 'epoch') or '0')
local in_flight = tonumber(redis.call('HGET', KEYS[1], 'in_flight') or '0')
if epoch ~= tonumber(ARGV[2]) or in_flight ~= 0 then
  return -1
end
redis.call('HSET', KEYS[1], 'on_hand', ARGV[1], 'seeded', '1')
redis.call('HSETNX', KEYS[1], 'reserved', '0')
redis.call('HSETNX', KEYS[1], 'in_flight', '0')
redis.call('HSETNX', KEYS[1], 'epoch', '0')
return 1
"#;

const FINISH_MOVEMENT_LUA: &str = r#"
local in_flight = tonumber(redis.call('HGET', KEYS[1], 'in_flight') or '0')
if in_flight > 0 then
  redis.call('HINCRBY', KEYS[1], 'in_flight', -1)
end
redis.call('HINCRBY', KEYS[1], 'epoch', 1)
if redis.call('HGET', KEYS[1], 'seeded') == '1' then
  redis.call('HINCRBY', KEYS[1], 'on_hand', ARGV[1])
end
return 1
"#;

const RESYNC_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'seeded') ~= '1' then
  if ARGV[3] ~= '1' then
    return {-2, 0}
  end
  redis.call('HSET', KEYS[1], 'on_hand', ARGV[1], 'in_flight', '0', 'seeded', '1')
  redis.call('HSETNX', KEYS[1], 'reserved', '0')
  redis.call('HSETNX', KEYS[1], 'epoch', '0')
  return {2, 0}
end
local in_flight = tonumber(redis.call('HGET', KEYS[1], 'in_flight') or '0')
local epoch = tonumber(redis.call('HGET', KEYS[1], 'epoch') or '0')
local previous = tonumber(redis.call('HGET', KEYS[1], 'on_hand') or '0')
if ARGV[3] ~= '1' then
  if in_flight ~= 0 then
    return {-1, in_flight}
  end
  if epoch ~= tonumber(ARGV[2]) then
    return {-3, 0}
  end
end
if previous == tonumber(ARGV[1]) and in_flight == 0 then
  return {0, previous}
end
redis.call('HSET', KEYS[1], 'on_hand', ARGV[1], 'in_flight', '0')
return {1, previous}
"#;

fn reservation_key(reservation_id: &str) -> String {
    format!("reservation:{}", reservation_id)
}

/// Fast-path store backed by Redis.
#[derive(Clone)]
pub struct RedisReservationStore {
    conn: ConnectionManager,
    retention_secs: i64,
    reserve: Script,
    transition: Script,
    seed: Script,
    finish_movement: Script,
    resync: Script,
}

impl RedisReservationStore {
    pub fn new(conn: ConnectionManager, retention: chrono::Duration) -> Self {
        Self {
            conn,
            retention_secs: retention.num_seconds().max(0),
            reserve: Script::new(RESERVE_LUA),
            transition: Script::new(TRANSITION_LUA),
            seed: Script::new(SEED_LUA),
            finish_movement: Script::new(FINISH_MOVEMENT_LUA),
            resync: Script::new(RESYNC_LUA),
        }
    }

    /// Opens a managed connection to `redis_url`.
    pub async fn connect(redis_url: &str, retention: chrono::Duration) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, retention))
    }
}

/// Op name and parameter passed to the transition script.
fn transition_args(transition: &Transition) -> (&'static str, String) {
    match transition {
        Transition::Commit { sale_id } => ("commit", sale_id.clone()),
        Transition::Expire { now } => ("expire", now.timestamp_millis().to_string()),
        other => (other.name(), String::new()),
    }
}

fn millis(fields: &HashMap<String, String>, name: &str) -> StoreResult<DateTime<Utc>> {
    let ms: i64 = field(fields, name)?
        .parse()
        .map_err(|_| StoreError::Backend(format!("reservation field {name} is not a timestamp")))?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Backend(format!("reservation field {name} out of range")))
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> StoreResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Backend(format!("reservation missing field {name}")))
}

/// Decodes a `reservation:{id}` hash.
fn parse_reservation(fields: &HashMap<String, String>) -> StoreResult<Reservation> {
    let status = field(fields, "status")?;
    let status = ReservationStatus::parse(status)
        .ok_or_else(|| StoreError::Backend(format!("unknown reservation status {status}")))?;
    let quantity = field(fields, "quantity")?
        .parse()
        .map_err(|_| StoreError::Backend("reservation quantity is not a number".into()))?;
    let sale_id = fields.get("sale_id").filter(|s| !s.is_empty()).cloned();

    Ok(Reservation {
        reservation_id: field(fields, "reservation_id")?.to_string(),
        variant_id: field(fields, "variant_id")?.to_string(),
        location_id: field(fields, "location_id")?.to_string(),
        quantity,
        status,
        created_at: millis(fields, "created_ms")?,
        expires_at: millis(fields, "expires_ms")?,
        sale_id,
        settled: fields.get("settled").map(String::as_str) == Some("1"),
    })
}

#[async_trait]
impl ReservationStore for RedisReservationStore {
    async fn seed(&self, key: &StockKey, on_hand: i64, epoch: u64) -> StoreResult<SeedOutcome> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .seed
            .key(key.redis_key())
            .arg(on_hand)
            .arg(epoch)
            .invoke_async(&mut conn)
            .await?;
        Ok(match code {
            1 => {
                debug!(%key, on_hand, "Seeded stock counter");
                SeedOutcome::Seeded
            }
            0 => SeedOutcome::AlreadySeeded,
            _ => SeedOutcome::Stale,
        })
    }

    async fn movement_epoch(&self, key: &StockKey) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let epoch: Option<u64> = conn.hget(key.redis_key(), "epoch").await?;
        Ok(epoch.unwrap_or(0))
    }

    async fn level(&self, key: &StockKey) -> StoreResult<Option<StockLevel>> {
        let mut conn = self.conn.clone();
        let (on_hand, reserved, in_flight, seeded): (Option<i64>, Option<i64>, Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(key.redis_key())
            .arg("on_hand")
            .arg("reserved")
            .arg("in_flight")
            .arg("seeded")
            .query_async(&mut conn)
            .await?;
        if seeded != Some(1) {
            return Ok(None);
        }
        Ok(Some(StockLevel {
            on_hand: on_hand.unwrap_or(0),
            reserved: reserved.unwrap_or(0),
            in_flight: in_flight.unwrap_or(0),
        }))
    }

    async fn try_reserve(
        &self,
        key: &StockKey,
        quantity: i64,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> StoreResult<ReserveAttempt> {
        let mut conn = self.conn.clone();
        let reservation = Reservation::hold(key, quantity, now, ttl);
        let key_ttl = ttl.num_seconds().max(1) + self.retention_secs;

        let (code, available): (i64, i64) = self
            .reserve
            .key(key.redis_key())
            .key(reservation_key(&reservation.reservation_id))
            .key(EXPIRY_INDEX)
            .arg(quantity)
            .arg(&reservation.reservation_id)
            .arg(&reservation.variant_id)
            .arg(&reservation.location_id)
            .arg(reservation.created_at.timestamp_millis())
            .arg(reservation.expires_at.timestamp_millis())
            .arg(key_ttl)
            .invoke_async(&mut conn)
            .await?;

        Ok(match code {
            1 => ReserveAttempt::Reserved(reservation),
            -1 => ReserveAttempt::Insufficient { available },
            _ => ReserveAttempt::NotSeeded,
        })
    }

    async fn get(&self, reservation_id: &str) -> StoreResult<Option<Reservation>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(reservation_key(reservation_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_reservation(&fields).map(Some)
    }

    async fn transition(&self, reservation_id: &str, transition: &Transition) -> StoreResult<TransitionResult> {
        let Some(mut reservation) = self.get(reservation_id).await? else {
            return Ok(TransitionResult::NotFound);
        };
        let (op, param) = transition_args(transition);
        let mut conn = self.conn.clone();

        let (code, status, settled, sale_id): (i64, String, String, String) = self
            .transition
            .key(reservation_key(reservation_id))
            .key(reservation.key().redis_key())
            .key(EXPIRY_INDEX)
            .arg(op)
            .arg(param)
            .arg(reservation_id)
            .invoke_async(&mut conn)
            .await?;

        if code == -3 {
            return Ok(TransitionResult::NotFound);
        }
        reservation.status = ReservationStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown reservation status {status}")))?;
        reservation.settled = settled == "1";
        reservation.sale_id = (!sale_id.is_empty()).then_some(sale_id);

        Ok(match code {
            1 => TransitionResult::Applied(reservation),
            0 => TransitionResult::Unchanged(reservation),
            _ => TransitionResult::Rejected(reservation),
        })
    }

    async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(EXPIRY_INDEX)
            .arg("-inf")
            .arg(format!("({}", now.timestamp_millis()))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn begin_movement(&self, key: &StockKey) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let redis_key = key.redis_key();
        let _: () = redis::pipe()
            .atomic()
            .hincr(&redis_key, "in_flight", 1)
            .ignore()
            .hincr(&redis_key, "epoch", 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn finish_movement(&self, key: &StockKey, on_hand_delta: i64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .finish_movement
            .key(key.redis_key())
            .arg(on_hand_delta)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn resync(&self, key: &StockKey, on_hand: i64, epoch: u64, force: bool) -> StoreResult<ResyncOutcome> {
        let mut conn = self.conn.clone();
        let (code, value): (i64, i64) = self
            .resync
            .key(key.redis_key())
            .arg(on_hand)
            .arg(epoch)
            .arg(if force { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(match code {
            2 => ResyncOutcome::Seeded,
            1 => ResyncOutcome::Updated { previous: value },
            0 => ResyncOutcome::Unchanged,
            -1 => ResyncOutcome::Busy { in_flight: value },
            -3 => ResyncOutcome::Stale,
            _ => ResyncOutcome::NotSeeded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_held_reservation() {
        let r = parse_reservation(&fields(&[
            ("reservation_id", "r-1"),
            ("variant_id", "A"),
            ("location_id", "1"),
            ("quantity", "3"),
            ("status", "HELD"),
            ("created_ms", "1767607200000"),
            ("expires_ms", "1767607500000"),
            ("sale_id", ""),
            ("settled", "0"),
        ]))
        .unwrap();
        assert_eq!(r.status, ReservationStatus::Held);
        assert_eq!(r.quantity, 3);
        assert_eq!(r.sale_id, None);
        assert!(!r.settled);
        assert_eq!((r.expires_at - r.created_at).num_seconds(), 300);
        assert_eq!(r.key().redis_key(), "stock:A:1");
    }

    #[test]
    fn test_parse_settled_commit() {
        let r = parse_reservation(&fields(&[
            ("reservation_id", "r-2"),
            ("variant_id", "A"),
            ("location_id", "1"),
            ("quantity", "1"),
            ("status", "COMMITTED"),
            ("created_ms", "0"),
            ("expires_ms", "1000"),
            ("sale_id", "s-9"),
            ("settled", "1"),
        ]))
        .unwrap();
        assert_eq!(r.sale_id.as_deref(), Some("s-9"));
        assert!(r.settled);
    }

    #[test]
    fn test_parse_rejects_corrupt_hash() {
        let err = parse_reservation(&fields(&[("status", "LIMBO")])).unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        let err = parse_reservation(&fields(&[("status", "HELD")])).unwrap_err();
        assert!(err.to_string().contains("quantity"));
    }

    #[test]
    fn test_transition_script_args() {
        assert_eq!(
            transition_args(&Transition::Commit { sale_id: "s".into() }),
            ("commit", "s".to_string())
        );
        let now = DateTime::from_timestamp_millis(42).unwrap();
        assert_eq!(transition_args(&Transition::Expire { now }), ("expire", "42".to_string()));
        assert_eq!(transition_args(&Transition::Settle), ("settle", String::new()));
        assert_eq!(reservation_key("abc"), "reservation:abc");
    }
}
