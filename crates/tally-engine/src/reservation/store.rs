//! # Reservation Store Capability
//!
//! The fast-path atomic-state service. Every counter mutation is one
//! serialised primitive on the store; the engine never reads, computes and
//! writes back.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Per-unit state (StockKey)                           │
//! │                                                                         │
//! │   on_hand ─────── ledger stock as of the last finished movement         │
//! │   reserved ────── HELD + unsettled COMMITTED quantities                 │
//! │   in_flight ───── movements started but not yet finished                │
//! │   epoch ───────── bumped by every begin_movement and finish_movement    │
//! │   seeded ──────── counters were loaded from the ledger                  │
//! │                                                                         │
//! │   seed / resync succeed only while in_flight == 0 and the epoch the     │
//! │   caller read before loading the ledger is still current, so any        │
//! │   movement overlapping that read makes the load stale                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use tally_core::{Reservation, StockKey, StockLevel, Transition};

/// Result of [`ReservationStore::seed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded,
    /// Another caller seeded first. Live counters were left alone.
    AlreadySeeded,
    /// A movement started or finished after the epoch was read; reload and retry.
    Stale,
}

/// Result of one atomic reserve attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveAttempt {
    Reserved(Reservation),
    Insufficient { available: i64 },
    /// Counters have never been loaded for this unit.
    NotSeeded,
    /// The unit was busy. Back off and retry.
    Contended,
}

/// Result of an atomic lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Counters moved. Carries the reservation after the change.
    Applied(Reservation),
    /// Already in the requested state.
    Unchanged(Reservation),
    /// Forbidden from the current state.
    Rejected(Reservation),
    NotFound,
}

/// Result of [`ReservationStore::resync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    Updated { previous: i64 },
    /// Forced load of a unit that had never been seeded.
    Seeded,
    Unchanged,
    Busy { in_flight: i64 },
    NotSeeded,
    Stale,
}

/// Atomic fast-path counters and reservation records.
#[async_trait]
pub trait ReservationStore: Send + Sync + 'static {
    /// Loads `on_hand` for an unseeded unit. Never overwrites live counters.
    async fn seed(&self, key: &StockKey, on_hand: i64, epoch: u64) -> StoreResult<SeedOutcome>;

    /// Current movement epoch. Read before loading the ledger for `seed`/`resync`.
    async fn movement_epoch(&self, key: &StockKey) -> StoreResult<u64>;

    /// Counters, or `None` if the unit was never seeded.
    async fn level(&self, key: &StockKey) -> StoreResult<Option<StockLevel>>;

    /// Checks `available >= quantity` and holds it in one step.
    async fn try_reserve(
        &self,
        key: &StockKey,
        quantity: i64,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> StoreResult<ReserveAttempt>;

    async fn get(&self, reservation_id: &str) -> StoreResult<Option<Reservation>>;

    /// Applies a transition and its counter delta in one step.
    async fn transition(&self, reservation_id: &str, transition: &Transition) -> StoreResult<TransitionResult>;

    /// IDs of HELD reservations whose deadline passed, oldest first.
    async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<String>>;

    /// Marks a ledger movement as started (`in_flight += 1`, `epoch += 1`).
    async fn begin_movement(&self, key: &StockKey) -> StoreResult<()>;

    /// Marks a movement finished (`in_flight -= 1`, `epoch += 1`) and folds
    /// its on-hand delta in once the unit is seeded.
    async fn finish_movement(&self, key: &StockKey, on_hand_delta: i64) -> StoreResult<()>;

    /// Replaces `on_hand` with the ledger value. `force` also clears a
    /// stuck `in_flight` count left by a crashed writer and seeds a unit
    /// that was never loaded.
    async fn resync(&self, key: &StockKey, on_hand: i64, epoch: u64, force: bool) -> StoreResult<ResyncOutcome>;

    /// Drops finished reservations created before `before`. Returns the count.
    async fn purge_finished(&self, _before: DateTime<Utc>) -> StoreResult<usize> {
        Ok(0)
    }
}
