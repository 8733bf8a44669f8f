//! # Domain Types
//!
//! Core domain types used throughout Tally.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    StockKey     │   │  LedgerEntry    │   │  Reservation    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  variant_id     │◄──│  entry_id       │   │  reservation_id │       │
//! │  │  location_id    │   │  movement_type  │   │  quantity       │       │
//! │  │                 │   │  delta (signed) │   │  status         │       │
//! │  │                 │   │  reference_id   │   │  expires_at     │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   SaleEvent     │   │      Sale       │   │   StockLevel    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  event_id       │──►│  sale_id        │   │  on_hand        │       │
//! │  │  sale_id        │   │  event_id       │   │  reserved       │       │
//! │  │  lines[]        │   │  status         │   │  in_flight      │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Stock Identity
//! A stock unit is the pair (variant, location). Every counter, ledger row
//! and channel partition is addressed by a [`StockKey`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

// =============================================================================
// Stock Key
// =============================================================================

/// Identifies a stock unit: one product variant at one location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockKey {
    pub variant_id: String,
    pub location_id: String,
}

impl StockKey {
    pub fn new(variant_id: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            variant_id: variant_id.into(),
            location_id: location_id.into(),
        }
    }

    /// Key of the fast-path counter hash in Redis.
    pub fn redis_key(&self) -> String {
        format!("stock:{}:{}", self.variant_id, self.location_id)
    }

    /// Routing key used by the event channel.
    pub fn routing_key(&self) -> String {
        format!("{}:{}", self.variant_id, self.location_id)
    }

    /// Channel partition for this key.
    ///
    /// FNV-1a over the routing key, so every process maps the same key to
    /// the same partition.
    pub fn partition(&self, partitions: u32) -> u32 {
        partition_for(&self.routing_key(), partitions)
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.variant_id, self.location_id)
    }
}

/// Maps a routing key onto one of `partitions` buckets (64-bit FNV-1a).
pub fn partition_for(routing_key: &str, partitions: u32) -> u32 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = routing_key
        .bytes()
        .fold(OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(PRIME));
    (hash % u64::from(partitions.max(1))) as u32
}

// =============================================================================
// Movement Type
// =============================================================================

/// Why a ledger entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    /// Stock left through a recorded sale (negative delta).
    Sale,
    /// Goods received from a supplier or initial load (positive delta).
    Restock,
    /// Manual correction after a count (either sign).
    Adjustment,
    /// Compensation for an invalidated sale (positive delta).
    Rollback,
    /// One leg of a move between locations.
    Transfer,
}

impl MovementType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MovementType::Sale => "SALE",
            MovementType::Restock => "RESTOCK",
            MovementType::Adjustment => "ADJUSTMENT",
            MovementType::Rollback => "ROLLBACK",
            MovementType::Transfer => "TRANSFER",
        }
    }
}

// =============================================================================
// Ledger Entry
// =============================================================================

/// An immutable stock delta.
///
/// Entries are append-only. Stock for a key is the sum of its deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub variant_id: String,
    pub location_id: String,
    pub movement_type: MovementType,
    /// Signed quantity change.
    pub delta: i64,
    /// Originating sale, transfer or adjustment ID.
    pub reference_id: String,
    pub actor_id: String,
    pub notes: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    /// Assigned by the ledger store on append. Zero until persisted.
    pub sequence: i64,
}

impl LedgerEntry {
    /// Builds a new, not yet persisted entry.
    pub fn new(
        key: &StockKey,
        movement_type: MovementType,
        delta: i64,
        reference_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            variant_id: key.variant_id.clone(),
            location_id: key.location_id.clone(),
            movement_type,
            delta,
            reference_id: reference_id.into(),
            actor_id: actor_id.into(),
            notes: None,
            created_at: Utc::now(),
            sequence: 0,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(&self.variant_id, &self.location_id)
    }

    /// Position of this entry in the per-key ordering.
    pub fn cursor(&self) -> LedgerCursor {
        LedgerCursor {
            created_at: self.created_at,
            sequence: self.sequence,
        }
    }
}

/// Resume point for ledger paging: the last entry already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LedgerCursor {
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    pub sequence: i64,
}

// =============================================================================
// Stock Level (fast path)
// =============================================================================

/// Fast-path counters for one stock unit.
///
/// ```text
///   on_hand   = ledger stock as of the last settled movement
///   reserved  = HELD + COMMITTED (unsettled) quantities
///   available = on_hand - reserved
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockLevel {
    pub on_hand: i64,
    pub reserved: i64,
    /// Ledger movements started but not yet folded into `on_hand`.
    pub in_flight: i64,
}

impl StockLevel {
    #[inline]
    pub const fn available(&self) -> i64 {
        self.on_hand - self.reserved
    }

    /// Counters may be resynchronised from the ledger only when idle.
    #[inline]
    pub const fn is_quiescent(&self) -> bool {
        self.in_flight == 0
    }
}

/// Stock for one (variant, location) as reported by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockLine {
    pub variant_id: String,
    pub location_id: String,
    pub quantity: i64,
}

/// Stock of one variant across every location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StockSummary {
    pub variant_id: String,
    pub locations: Vec<StockLine>,
    pub total: i64,
}

impl StockSummary {
    pub fn from_lines(variant_id: impl Into<String>, locations: Vec<StockLine>) -> Self {
        let total = locations.iter().map(|l| l.quantity).sum();
        Self {
            variant_id: variant_id.into(),
            locations,
            total,
        }
    }
}

// =============================================================================
// Reservation
// =============================================================================

/// Lifecycle of a reservation.
///
/// ```text
///            commit            settle
///   HELD ───────────► COMMITTED ──────► (settled)
///    │  │
///    │  └── release ──► RELEASED
///    └───── sweep ────► EXPIRED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Held,
    Committed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Held => "HELD",
            ReservationStatus::Committed => "COMMITTED",
            ReservationStatus::Released => "RELEASED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HELD" => Some(ReservationStatus::Held),
            "COMMITTED" => Some(ReservationStatus::Committed),
            "RELEASED" => Some(ReservationStatus::Released),
            "EXPIRED" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    /// Quantity no longer counts against `reserved`.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, ReservationStatus::Released | ReservationStatus::Expired)
    }
}

/// A time-bounded hold on stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Reservation {
    pub reservation_id: String,
    pub variant_id: String,
    pub location_id: String,
    pub quantity: i64,
    pub status: ReservationStatus,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub expires_at: DateTime<Utc>,
    /// Assigned on commit.
    pub sale_id: Option<String>,
    /// Set once the sale is durably recorded and folded into `on_hand`.
    pub settled: bool,
}

impl Reservation {
    /// A fresh HELD reservation.
    pub fn hold(key: &StockKey, quantity: i64, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            reservation_id: Uuid::new_v4().to_string(),
            variant_id: key.variant_id.clone(),
            location_id: key.location_id.clone(),
            quantity,
            status: ReservationStatus::Held,
            created_at: now,
            expires_at: now + ttl,
            sale_id: None,
            settled: false,
        }
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(&self.variant_id, &self.location_id)
    }

    /// HELD and past its deadline.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Held && self.expires_at < now
    }
}

// =============================================================================
// Sale Event (wire contract)
// =============================================================================

/// One line of a sale event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleLine {
    pub variant_id: String,
    pub location_id: String,
    pub quantity: i64,
    /// Reservation this line settles, when it came from the reservation API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
}

impl SaleLine {
    pub fn key(&self) -> StockKey {
        StockKey::new(&self.variant_id, &self.location_id)
    }
}

impl From<&Reservation> for SaleLine {
    fn from(r: &Reservation) -> Self {
        Self {
            variant_id: r.variant_id.clone(),
            location_id: r.location_id.clone(),
            quantity: r.quantity,
            reservation_id: Some(r.reservation_id.clone()),
        }
    }
}

/// Published once per checkout; consumed at least once.
///
/// `event_id` is the idempotency key. Unknown fields are ignored so newer
/// publishers stay compatible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleEvent {
    pub event_id: String,
    pub sale_id: String,
    pub lines: Vec<SaleLine>,
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
}

impl SaleEvent {
    pub fn new(sale_id: impl Into<String>, lines: Vec<SaleLine>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            sale_id: sale_id.into(),
            lines,
            timestamp: Utc::now(),
            attempt_count: 0,
            actor_id: None,
        }
    }

    /// Channel routing key: the first line's stock key.
    pub fn routing_key(&self) -> String {
        self.lines
            .first()
            .map(|l| l.key().routing_key())
            .unwrap_or_else(|| self.sale_id.clone())
    }

    /// Reservation IDs named by the event's lines.
    pub fn reservation_ids(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| l.reservation_id.as_deref())
    }
}

// =============================================================================
// Sale (durable)
// =============================================================================

/// The status of a recorded sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    /// Written by the sales processor.
    Completed,
    /// Compensated by ROLLBACK entries. Never deleted.
    Voided,
}

/// A sale recorded by the sales processor.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Sale {
    pub sale_id: String,
    pub event_id: String,
    pub status: SaleStatus,
    pub actor_id: String,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub voided_at: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
    pub items: Vec<SaleItem>,
}

/// A line item in a recorded sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleItem {
    pub item_id: String,
    pub sale_id: String,
    pub variant_id: String,
    pub location_id: String,
    pub quantity: i64,
    pub reservation_id: Option<String>,
}

impl SaleItem {
    pub fn key(&self) -> StockKey {
        StockKey::new(&self.variant_id, &self.location_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_key_formats() {
        let key = StockKey::new("v1", "loc9");
        assert_eq!(key.to_string(), "v1@loc9");
        assert_eq!(key.redis_key(), "stock:v1:loc9");
        assert_eq!(key.routing_key(), "v1:loc9");
    }

    #[test]
    fn test_partition_is_stable_and_bounded() {
        let key = StockKey::new("variant-a", "store-1");
        let p = key.partition(16);
        assert!(p < 16);
        for _ in 0..10 {
            assert_eq!(key.partition(16), p);
        }
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(partition_for("", 1), 0);
        assert_eq!(
            partition_for("", 1000),
            (0xcbf2_9ce4_8422_2325_u64 % 1000) as u32
        );
        // Zero partitions is treated as one.
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_partitions_spread_keys() {
        let used: std::collections::HashSet<u32> = (0..200)
            .map(|i| StockKey::new(format!("v{i}"), "loc").partition(8))
            .collect();
        assert!(used.len() > 4);
    }

    #[test]
    fn test_stock_level_available() {
        let level = StockLevel {
            on_hand: 10,
            reserved: 6,
            in_flight: 0,
        };
        assert_eq!(level.available(), 4);
        assert!(level.is_quiescent());
    }

    #[test]
    fn test_movement_type_serializes_screaming() {
        let json = serde_json::to_string(&MovementType::Rollback).unwrap();
        assert_eq!(json, "\"ROLLBACK\"");
        assert_eq!(MovementType::Transfer.as_str(), "TRANSFER");
    }

    #[test]
    fn test_reservation_status_round_trip() {
        for status in [
            ReservationStatus::Held,
            ReservationStatus::Committed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            assert_eq!(ReservationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ReservationStatus::parse("nope"), None);
        assert!(ReservationStatus::Expired.is_terminal());
        assert!(!ReservationStatus::Committed.is_terminal());
    }

    #[test]
    fn test_reservation_is_due() {
        let now = Utc::now();
        let r = Reservation::hold(&StockKey::new("v", "l"), 2, now, chrono::Duration::seconds(1));
        assert!(!r.is_due(now));
        assert!(r.is_due(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_sale_event_wire_format() {
        let json = r#"{
            "event_id": "6b0c4a4e-4a53-4c62-8d0e-2d2a3a1f0d11",
            "sale_id": "0f7d1a52-9a0f-4c36-9b7e-0c5b5f1f8e22",
            "lines": [{"variant_id": "A", "location_id": "1", "quantity": 3}],
            "timestamp": "2026-01-05T10:00:00Z",
            "channel": "pos"
        }"#;
        let event: SaleEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.attempt_count, 0);
        assert_eq!(event.lines[0].reservation_id, None);
        assert_eq!(event.routing_key(), "A:1");

        let out = serde_json::to_value(&event).unwrap();
        assert!(out["lines"][0].get("reservation_id").is_none());
        assert!(out.get("actor_id").is_none());
    }

    #[test]
    fn test_ledger_entry_builder() {
        let key = StockKey::new("v", "l");
        let entry = LedgerEntry::new(&key, MovementType::Adjustment, -2, "adj-1", "user-1")
            .with_notes("damaged");
        assert_eq!(entry.key(), key);
        assert_eq!(entry.notes.as_deref(), Some("damaged"));
        assert_eq!(entry.sequence, 0);
    }

    #[test]
    fn test_stock_summary_total() {
        let summary = StockSummary::from_lines(
            "v",
            vec![
                StockLine {
                    variant_id: "v".into(),
                    location_id: "a".into(),
                    quantity: 4,
                },
                StockLine {
                    variant_id: "v".into(),
                    location_id: "b".into(),
                    quantity: 6,
                },
            ],
        );
        assert_eq!(summary.total, 10);
    }
}
