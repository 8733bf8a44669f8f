//! # Reservation Engine
//!
//! Checkout-facing API: reserve, commit, release. Holds stock on the fast
//! path and hands committed sales to the event channel.
//!
//! ## Reserve Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  reserve(key, qty)                                                      │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  store.try_reserve ──► Reserved ─────────────────────────► Ok           │
//! │     │                                                                   │
//! │     ├── NotSeeded ────► load ledger stock, seed, retry                  │
//! │     ├── Contended ────► backoff 1ms..20ms, retry (max_attempts)         │
//! │     │                   └─ exhausted ─► ContentionExceeded              │
//! │     ├── Insufficient ─► expire due holds once, retry                    │
//! │     │                   └─ still short ─► InsufficientStock             │
//! │     └── store down ───► backoff within retry window                     │
//! │                         └─ exhausted ─► StoreUnavailable (fail closed)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Commit Flow
//! ```text
//!   HELD ──commit──► COMMITTED ──publish SaleEvent──► Ok(receipt)
//!                        │
//!                        └── publish failed ──► compensate (RELEASED)
//!                                               └─► StoreUnavailable
//! ```

use std::future::Future;
use std::sync::Arc;

use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::store::{ReservationStore, ReserveAttempt, ResyncOutcome, SeedOutcome, TransitionResult};
use crate::channel::{publish_event, EventChannel, PublishAck};
use crate::config::ReservationSettings;
use crate::error::{ChannelError, StockError, StockResult, StoreResult};
use tally_core::validation::{validate_id, validate_quantity, validate_stock_key};
use tally_core::{
    Reservation, ReservationStatus, SaleEvent, SaleLine, StockKey, StockLevel, Transition, ValidationError,
    MAX_SALE_LINES,
};
use tally_db::LedgerStore;

/// Result of a successful commit.
#[derive(Debug, Clone, Serialize)]
pub struct CommitReceipt {
    pub sale_id: String,
    /// `None` when the reservations were already committed and nothing was published.
    pub event_id: Option<String>,
    pub reservations: Vec<Reservation>,
}

/// Atomic reservation engine over a fast-path store.
pub struct ReservationEngine {
    store: Arc<dyn ReservationStore>,
    ledger: Arc<dyn LedgerStore>,
    channel: Arc<dyn EventChannel>,
    settings: ReservationSettings,
}

impl ReservationEngine {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        ledger: Arc<dyn LedgerStore>,
        channel: Arc<dyn EventChannel>,
        settings: ReservationSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            channel,
            settings,
        }
    }

    pub fn settings(&self) -> &ReservationSettings {
        &self.settings
    }

    // =========================================================================
    // Retry Helpers
    // =========================================================================

    /// Runs a store operation, retrying while the store is unreachable.
    async fn with_store<T, F, Fut>(&self, op: &'static str, mut call: F) -> StockResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut backoff = self.settings.store_backoff();
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => match backoff.next_backoff() {
                    Some(wait) => {
                        warn!(op, error = %e, ?wait, "Reservation store unavailable, retrying");
                        tokio::time::sleep(wait).await;
                    }
                    None => {
                        error!(op, error = %e, "Reservation store unavailable, failing closed");
                        return Err(e.into());
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn run_transition(
        &self,
        op: &'static str,
        reservation_id: &str,
        transition: Transition,
    ) -> StockResult<TransitionResult> {
        self.with_store(op, || self.store.transition(reservation_id, &transition))
            .await
    }

    async fn publish_with_retry(&self, event: &SaleEvent) -> Result<PublishAck, ChannelError> {
        let mut backoff = self.settings.store_backoff();
        loop {
            match publish_event(self.channel.as_ref(), event).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() => match backoff.next_backoff() {
                    Some(wait) => {
                        warn!(sale_id = %event.sale_id, error = %e, "Sale event publish failed, retrying");
                        tokio::time::sleep(wait).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Loads ledger stock into an unseeded unit.
    async fn seed_from_ledger(&self, key: &StockKey) -> StockResult<SeedOutcome> {
        let epoch = self.with_store("movement_epoch", || self.store.movement_epoch(key)).await?;
        let on_hand = self
            .ledger
            .current_stock(key)
            .await
            .map_err(|e| StockError::StoreUnavailable(format!("ledger read failed: {e}")))?;
        let outcome = self.with_store("seed", || self.store.seed(key, on_hand, epoch)).await?;
        debug!(%key, on_hand, ?outcome, "Seed attempt");
        Ok(outcome)
    }

    /// Makes sure the unit's counters exist, retrying while movements race the seed.
    async fn ensure_seeded(&self, key: &StockKey) -> StockResult<StockLevel> {
        let mut backoff = self.settings.contention_backoff();
        for _ in 0..self.settings.max_attempts {
            if let Some(level) = self.with_store("level", || self.store.level(key)).await? {
                return Ok(level);
            }
            if self.seed_from_ledger(key).await? == SeedOutcome::Stale {
                if let Some(wait) = backoff.next_backoff() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
        Err(StockError::ContentionExceeded {
            key: key.to_string(),
            attempts: self.settings.max_attempts,
        })
    }

    // =========================================================================
    // Reserve
    // =========================================================================

    /// Reserves `quantity` with the default TTL.
    pub async fn reserve(&self, variant_id: &str, location_id: &str, quantity: i64) -> StockResult<Reservation> {
        self.try_reserve(&StockKey::new(variant_id, location_id), quantity, self.settings.ttl())
            .await
    }

    /// Atomically checks availability and holds `quantity` for `ttl`.
    pub async fn try_reserve(&self, key: &StockKey, quantity: i64, ttl: chrono::Duration) -> StockResult<Reservation> {
        validate_stock_key(key)?;
        validate_quantity(quantity)?;
        if ttl <= chrono::Duration::zero() {
            return Err(ValidationError::MustBePositive { field: "ttl".into() }.into());
        }

        let mut contention = self.settings.contention_backoff();
        let mut attempts = 0u32;
        let mut swept = false;

        loop {
            let now = Utc::now();
            let attempt = self
                .with_store("try_reserve", || self.store.try_reserve(key, quantity, now, ttl))
                .await?;

            match attempt {
                ReserveAttempt::Reserved(reservation) => {
                    debug!(
                        reservation_id = %reservation.reservation_id,
                        %key,
                        quantity,
                        "Stock reserved"
                    );
                    return Ok(reservation);
                }
                ReserveAttempt::Insufficient { .. } if !swept => {
                    swept = true;
                    self.sweep_expired_at(now).await?;
                    continue;
                }
                ReserveAttempt::Insufficient { available } => {
                    debug!(%key, available, requested = quantity, "Insufficient stock");
                    return Err(StockError::InsufficientStock {
                        key: key.to_string(),
                        available,
                        requested: quantity,
                    });
                }
                ReserveAttempt::NotSeeded => {
                    if self.seed_from_ledger(key).await? != SeedOutcome::Stale {
                        continue;
                    }
                }
                ReserveAttempt::Contended => {}
            }

            attempts += 1;
            if attempts >= self.settings.max_attempts {
                warn!(%key, attempts, "Reservation contention exceeded");
                return Err(StockError::ContentionExceeded {
                    key: key.to_string(),
                    attempts,
                });
            }
            if let Some(wait) = contention.next_backoff() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Reserves every line or none.
    pub async fn reserve_all(&self, lines: &[(StockKey, i64)], ttl: chrono::Duration) -> StockResult<Vec<Reservation>> {
        if lines.is_empty() {
            return Err(ValidationError::Required { field: "lines".into() }.into());
        }
        if lines.len() > MAX_SALE_LINES {
            return Err(ValidationError::TooMany {
                field: "lines".into(),
                max: MAX_SALE_LINES,
            }
            .into());
        }

        let mut held = Vec::with_capacity(lines.len());
        for (key, quantity) in lines {
            match self.try_reserve(key, *quantity, ttl).await {
                Ok(reservation) => held.push(reservation),
                Err(e) => {
                    for reservation in &held {
                        if let Err(release_err) = self.release(&reservation.reservation_id).await {
                            error!(
                                reservation_id = %reservation.reservation_id,
                                error = %release_err,
                                "Failed to release partial checkout hold"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    // =========================================================================
    // Commit / Release
    // =========================================================================

    /// Commits one reservation and publishes its sale event. Idempotent.
    pub async fn commit(&self, reservation_id: &str) -> StockResult<CommitReceipt> {
        self.commit_all(&[reservation_id.to_string()]).await
    }

    /// Commits reservations under one sale and publishes a single event.
    pub async fn commit_all(&self, reservation_ids: &[String]) -> StockResult<CommitReceipt> {
        if reservation_ids.is_empty() {
            return Err(ValidationError::Required {
                field: "reservation_ids".into(),
            }
            .into());
        }

        let mut current = Vec::with_capacity(reservation_ids.len());
        for id in reservation_ids {
            validate_id("reservation_id", id)?;
            current.push(self.get_reservation(id).await?);
        }

        if let Some(receipt) = already_committed(&current) {
            debug!(sale_id = %receipt.sale_id, "Commit repeated, nothing to publish");
            return Ok(receipt);
        }
        if let Some(blocked) = current.iter().find(|r| r.status != ReservationStatus::Held) {
            return Err(StockError::ReservationNotActive {
                reservation_id: blocked.reservation_id.clone(),
                status: blocked.status,
            });
        }

        let sale_id = Uuid::new_v4().to_string();
        let commit = Transition::Commit {
            sale_id: sale_id.clone(),
        };
        let mut committed: Vec<Reservation> = Vec::with_capacity(current.len());

        for reservation in &current {
            let id = reservation.reservation_id.as_str();
            let result = self.with_store("commit", || self.store.transition(id, &commit)).await;
            let failure = match result {
                Ok(TransitionResult::Applied(r)) => {
                    committed.push(r);
                    continue;
                }
                Ok(TransitionResult::Unchanged(r)) if current.len() == 1 => {
                    // A concurrent commit of the same reservation won.
                    return Ok(CommitReceipt {
                        sale_id: r.sale_id.clone().unwrap_or_default(),
                        event_id: None,
                        reservations: vec![r],
                    });
                }
                Ok(TransitionResult::Unchanged(r)) | Ok(TransitionResult::Rejected(r)) => StockError::ReservationNotActive {
                    reservation_id: r.reservation_id.clone(),
                    status: r.status,
                },
                Ok(TransitionResult::NotFound) => StockError::ReservationNotFound(id.to_string()),
                Err(e) => e,
            };
            self.compensate_all(&committed).await;
            return Err(failure);
        }

        let event = SaleEvent::new(&sale_id, committed.iter().map(SaleLine::from).collect());
        match self.publish_with_retry(&event).await {
            Ok(ack) => {
                info!(
                    %sale_id,
                    event_id = %event.event_id,
                    lines = committed.len(),
                    partition = ack.partition,
                    "Checkout committed"
                );
                Ok(CommitReceipt {
                    sale_id,
                    event_id: Some(event.event_id),
                    reservations: committed,
                })
            }
            Err(e) => {
                error!(%sale_id, error = %e, "Sale event publish failed, releasing stock");
                self.compensate_all(&committed).await;
                Err(StockError::StoreUnavailable(format!("sale event publish failed: {e}")))
            }
        }
    }

    async fn compensate_all(&self, reservations: &[Reservation]) {
        for reservation in reservations {
            if let Err(e) = self.compensate(&reservation.reservation_id).await {
                error!(
                    reservation_id = %reservation.reservation_id,
                    error = %e,
                    "Failed to compensate reservation"
                );
            }
        }
    }

    /// Returns a HELD reservation's quantity. Releasing an already
    /// released or expired reservation is a no-op.
    pub async fn release(&self, reservation_id: &str) -> StockResult<Reservation> {
        validate_id("reservation_id", reservation_id)?;
        match self
            .run_transition("release", reservation_id, Transition::Release)
            .await?
        {
            TransitionResult::Applied(r) => {
                debug!(%reservation_id, quantity = r.quantity, "Reservation released");
                Ok(r)
            }
            TransitionResult::Unchanged(r) => Ok(r),
            TransitionResult::Rejected(r) => Err(StockError::ReservationNotActive {
                reservation_id: r.reservation_id,
                status: r.status,
            }),
            TransitionResult::NotFound => Err(StockError::ReservationNotFound(reservation_id.to_string())),
        }
    }

    /// Reads a reservation, expiring it first if its deadline passed.
    pub async fn get_reservation(&self, reservation_id: &str) -> StockResult<Reservation> {
        let reservation = self
            .with_store("get", || self.store.get(reservation_id))
            .await?
            .ok_or_else(|| StockError::ReservationNotFound(reservation_id.to_string()))?;

        let now = Utc::now();
        if !reservation.is_due(now) {
            return Ok(reservation);
        }
        match self
            .run_transition("expire", reservation_id, Transition::Expire { now })
            .await?
        {
            TransitionResult::Applied(r) | TransitionResult::Unchanged(r) | TransitionResult::Rejected(r) => Ok(r),
            TransitionResult::NotFound => Err(StockError::ReservationNotFound(reservation_id.to_string())),
        }
    }

    /// Fast-path counters for a unit, seeding from the ledger if needed.
    pub async fn availability(&self, key: &StockKey) -> StockResult<StockLevel> {
        validate_stock_key(key)?;
        self.ensure_seeded(key).await
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    pub async fn sweep_expired(&self) -> StockResult<usize> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Expires HELD reservations past their deadline and purges old records.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> StockResult<usize> {
        let due = self
            .with_store("due_for_expiry", || self.store.due_for_expiry(now, self.settings.sweep_batch))
            .await?;

        let mut expired = 0;
        for id in &due {
            let result = self
                .run_transition("expire", id, Transition::Expire { now })
                .await?;
            if let TransitionResult::Applied(r) = result {
                debug!(reservation_id = %id, quantity = r.quantity, "Reservation expired");
                expired += 1;
            }
        }

        let purged = self
            .with_store("purge_finished", || self.store.purge_finished(now - self.settings.retention()))
            .await?;

        if expired > 0 || purged > 0 {
            info!(expired, purged, "Expiry sweep");
        }
        Ok(expired)
    }

    // =========================================================================
    // Processor Hooks
    // =========================================================================

    /// Folds a durably recorded sale into `on_hand`.
    pub async fn settle(&self, reservation_id: &str) -> StockResult<TransitionResult> {
        let result = self
            .run_transition("settle", reservation_id, Transition::Settle)
            .await?;
        if let TransitionResult::Rejected(ref r) = result {
            warn!(%reservation_id, status = ?r.status, "Settle rejected");
        }
        Ok(result)
    }

    /// Returns the quantity of a reservation whose sale will never be recorded.
    pub async fn compensate(&self, reservation_id: &str) -> StockResult<TransitionResult> {
        let result = self
            .run_transition("compensate", reservation_id, Transition::Compensate)
            .await?;
        match result {
            TransitionResult::Applied(ref r) => {
                info!(%reservation_id, quantity = r.quantity, "Reservation compensated");
            }
            TransitionResult::Rejected(ref r) => {
                warn!(%reservation_id, status = ?r.status, settled = r.settled, "Compensation rejected");
            }
            _ => {}
        }
        Ok(result)
    }

    pub async fn begin_movement(&self, key: &StockKey) -> StockResult<()> {
        self.with_store("begin_movement", || self.store.begin_movement(key)).await
    }

    pub async fn finish_movement(&self, key: &StockKey, on_hand_delta: i64) -> StockResult<()> {
        self.with_store("finish_movement", || self.store.finish_movement(key, on_hand_delta))
            .await
    }

    /// Fast-path counters without seeding.
    pub async fn level(&self, key: &StockKey) -> StockResult<Option<StockLevel>> {
        self.with_store("level", || self.store.level(key)).await
    }

    /// Replaces the unit's `on_hand` with the ledger's current stock.
    pub async fn resync_from_ledger(&self, key: &StockKey, force: bool) -> StockResult<ResyncOutcome> {
        let epoch = self.with_store("movement_epoch", || self.store.movement_epoch(key)).await?;
        let on_hand = self.ledger.current_stock(key).await?;
        let outcome = self
            .with_store("resync", || self.store.resync(key, on_hand, epoch, force))
            .await?;
        match outcome {
            ResyncOutcome::Updated { previous } => {
                warn!(%key, previous, on_hand, force, "Fast-path counter resynchronised from ledger");
            }
            ResyncOutcome::Seeded => {
                warn!(%key, on_hand, "Fast-path counter force-seeded from ledger");
            }
            ResyncOutcome::Busy { in_flight } => {
                debug!(%key, in_flight, "Resync skipped, movements in flight");
            }
            _ => {}
        }
        Ok(outcome)
    }
}

/// A receipt if every reservation is already COMMITTED under one sale.
fn already_committed(reservations: &[Reservation]) -> Option<CommitReceipt> {
    let sale_id = reservations.first()?.sale_id.clone()?;
    let same_sale = reservations
        .iter()
        .all(|r| r.status == ReservationStatus::Committed && r.sale_id.as_deref() == Some(sale_id.as_str()));
    same_sale.then(|| CommitReceipt {
        sale_id,
        event_id: None,
        reservations: reservations.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Delivery, MemoryChannel};
    use crate::error::StoreError;
    use crate::reservation::MemoryReservationStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tally_core::{LedgerEntry, MovementType};
    use tally_db::{Database, DbConfig, StockCheck};

    struct Fixture {
        engine: Arc<ReservationEngine>,
        store: Arc<MemoryReservationStore>,
        channel: Arc<MemoryChannel>,
        db: Arc<Database>,
    }

    fn fast_settings() -> ReservationSettings {
        ReservationSettings {
            store_retry_window_ms: 50,
            ..Default::default()
        }
    }

    async fn fixture(stock: &[(&str, &str, i64)]) -> Fixture {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        for (variant, location, qty) in stock {
            let key = StockKey::new(*variant, *location);
            db.append_entries(
                &[LedgerEntry::new(&key, MovementType::Restock, *qty, "po-1", "tester")],
                StockCheck::Unchecked,
            )
            .await
            .unwrap();
        }
        let store = Arc::new(MemoryReservationStore::new());
        let channel = Arc::new(MemoryChannel::new(4, Duration::from_secs(30), 5));
        let engine = Arc::new(ReservationEngine::new(
            store.clone(),
            db.clone(),
            channel.clone(),
            fast_settings(),
        ));
        Fixture {
            engine,
            store,
            channel,
            db,
        }
    }

    #[tokio::test]
    async fn test_reserve_seeds_from_ledger() {
        let f = fixture(&[("A", "1", 10)]).await;
        let r = f.engine.reserve("A", "1", 4).await.unwrap();
        assert_eq!(r.status, ReservationStatus::Held);

        let level = f.engine.availability(&StockKey::new("A", "1")).await.unwrap();
        assert_eq!(level.on_hand, 10);
        assert_eq!(level.reserved, 4);
        assert_eq!(level.available(), 6);
    }

    #[tokio::test]
    async fn test_movement_finishing_during_seed_is_not_lost() {
        let f = fixture(&[("A", "1", 10)]).await;
        let key = StockKey::new("A", "1");

        f.store.begin_movement(&key).await.unwrap();
        let epoch = f.store.movement_epoch(&key).await.unwrap();
        let on_hand = f.db.current_stock(&key).await.unwrap();
        f.db.append_entries(
            &[LedgerEntry::new(&key, MovementType::Adjustment, -4, "count-1", "tester")],
            StockCheck::NonNegative,
        )
        .await
        .unwrap();
        f.store.finish_movement(&key, -4).await.unwrap();
        assert_eq!(f.store.seed(&key, on_hand, epoch).await.unwrap(), SeedOutcome::Stale);

        let err = f.engine.reserve("A", "1", 10).await.unwrap_err();
        assert!(matches!(err, StockError::InsufficientStock { available: 6, .. }));
        f.engine.reserve("A", "1", 6).await.unwrap();
        assert_eq!(f.engine.availability(&key).await.unwrap().available(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserves_never_oversell() {
        let f = fixture(&[("A", "1", 10)]).await;
        f.engine.availability(&StockKey::new("A", "1")).await.unwrap();

        let a = tokio::spawn({
            let engine = f.engine.clone();
            async move { engine.reserve("A", "1", 6).await }
        });
        let b = tokio::spawn({
            let engine = f.engine.clone();
            async move { engine.reserve("A", "1", 6).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        let rejected = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(rejected.is_stock_unavailable());

        let level = f.engine.availability(&StockKey::new("A", "1")).await.unwrap();
        assert_eq!(level.available() + level.reserved, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_small_reserves_respect_quantity() {
        let f = fixture(&[("A", "1", 25)]).await;
        f.engine.availability(&StockKey::new("A", "1")).await.unwrap();

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let engine = f.engine.clone();
                tokio::spawn(async move { engine.reserve("A", "1", 1).await })
            })
            .collect();

        let mut held = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => held += 1,
                Err(StockError::InsufficientStock { .. }) | Err(StockError::ContentionExceeded { .. }) => {}
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert!(held <= 25);
        let level = f.engine.availability(&StockKey::new("A", "1")).await.unwrap();
        assert_eq!(level.reserved, held);
    }

    #[tokio::test]
    async fn test_insufficient_stock_is_not_retried() {
        let f = fixture(&[("A", "1", 2)]).await;
        let err = f.engine.reserve("A", "1", 3).await.unwrap_err();
        assert!(matches!(
            err,
            StockError::InsufficientStock {
                available: 2,
                requested: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_release_restores_exact_quantity() {
        let f = fixture(&[("A", "1", 10)]).await;
        let r = f.engine.reserve("A", "1", 7).await.unwrap();
        let released = f.engine.release(&r.reservation_id).await.unwrap();
        assert_eq!(released.status, ReservationStatus::Released);
        let level = f.engine.availability(&StockKey::new("A", "1")).await.unwrap();
        assert_eq!(level.available(), 10);

        // Second release is a no-op.
        f.engine.release(&r.reservation_id).await.unwrap();
        assert_eq!(f.engine.availability(&StockKey::new("A", "1")).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_expired_hold_is_reusable() {
        let f = fixture(&[("A", "1", 5)]).await;
        let key = StockKey::new("A", "1");
        let r = f.engine.try_reserve(&key, 5, chrono::Duration::seconds(1)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(2);
        assert_eq!(f.engine.sweep_expired_at(later).await.unwrap(), 1);
        let stored = f.store.get(&r.reservation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Expired);

        f.engine.reserve("A", "1", 5).await.unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_triggers_sweep() {
        let f = fixture(&[("A", "1", 5)]).await;
        let key = StockKey::new("A", "1");
        f.engine.try_reserve(&key, 5, chrono::Duration::milliseconds(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // The stale hold is expired on demand rather than rejecting.
        f.engine.reserve("A", "1", 5).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_publishes_once() {
        let f = fixture(&[("A", "1", 10)]).await;
        let r = f.engine.reserve("A", "1", 3).await.unwrap();

        let receipt = f.engine.commit(&r.reservation_id).await.unwrap();
        assert!(receipt.event_id.is_some());
        assert_eq!(f.channel.pending(), 1);

        let again = f.engine.commit(&r.reservation_id).await.unwrap();
        assert_eq!(again.sale_id, receipt.sale_id);
        assert!(again.event_id.is_none());
        assert_eq!(f.channel.pending(), 1);

        let delivery = f.channel.receive("w0", 1).await.unwrap().remove(0);
        let event: SaleEvent = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(event.sale_id, receipt.sale_id);
        assert_eq!(event.lines[0].quantity, 3);
        assert_eq!(event.lines[0].reservation_id.as_deref(), Some(r.reservation_id.as_str()));
    }

    #[tokio::test]
    async fn test_commit_after_expiry_is_rejected() {
        let f = fixture(&[("A", "1", 10)]).await;
        let key = StockKey::new("A", "1");
        let r = f.engine.try_reserve(&key, 2, chrono::Duration::milliseconds(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = f.engine.commit(&r.reservation_id).await.unwrap_err();
        assert!(matches!(
            err,
            StockError::ReservationNotActive {
                status: ReservationStatus::Expired,
                ..
            }
        ));
        assert_eq!(f.engine.availability(&key).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_release_after_commit_is_rejected() {
        let f = fixture(&[("A", "1", 10)]).await;
        let r = f.engine.reserve("A", "1", 1).await.unwrap();
        f.engine.commit(&r.reservation_id).await.unwrap();
        assert!(matches!(
            f.engine.release(&r.reservation_id).await,
            Err(StockError::ReservationNotActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_reserve_all_is_all_or_nothing() {
        let f = fixture(&[("A", "1", 10), ("B", "1", 1)]).await;
        let lines = vec![(StockKey::new("A", "1"), 4), (StockKey::new("B", "1"), 2)];
        let err = f.engine.reserve_all(&lines, f.engine.settings().ttl()).await.unwrap_err();
        assert!(err.is_stock_unavailable());
        assert_eq!(f.engine.availability(&StockKey::new("A", "1")).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_commit_all_publishes_single_event() {
        let f = fixture(&[("A", "1", 10), ("B", "2", 10)]).await;
        let lines = vec![(StockKey::new("A", "1"), 1), (StockKey::new("B", "2"), 2)];
        let held = f.engine.reserve_all(&lines, f.engine.settings().ttl()).await.unwrap();
        let ids: Vec<String> = held.iter().map(|r| r.reservation_id.clone()).collect();

        let receipt = f.engine.commit_all(&ids).await.unwrap();
        assert_eq!(receipt.reservations.len(), 2);
        assert_eq!(f.channel.pending(), 1);
        assert!(receipt
            .reservations
            .iter()
            .all(|r| r.sale_id.as_deref() == Some(receipt.sale_id.as_str())));
    }

    #[tokio::test]
    async fn test_settle_moves_on_hand() {
        let f = fixture(&[("A", "1", 10)]).await;
        let r = f.engine.reserve("A", "1", 3).await.unwrap();
        f.engine.commit(&r.reservation_id).await.unwrap();
        f.engine.settle(&r.reservation_id).await.unwrap();

        let level = f.engine.level(&StockKey::new("A", "1")).await.unwrap().unwrap();
        assert_eq!(level.on_hand, 7);
        assert_eq!(level.reserved, 0);
        assert!(f.db.current_stock(&StockKey::new("A", "1")).await.is_ok());
    }

    struct DownChannel;

    #[async_trait]
    impl EventChannel for DownChannel {
        async fn publish(&self, _: &str, _: &[u8]) -> crate::error::ChannelResult<PublishAck> {
            Err(ChannelError::Unavailable("connection refused".into()))
        }
        async fn receive(&self, _: &str, _: usize) -> crate::error::ChannelResult<Vec<Delivery>> {
            Ok(vec![])
        }
        async fn ack(&self, _: &Delivery) -> crate::error::ChannelResult<()> {
            Ok(())
        }
        async fn nack(&self, _: &Delivery, _: &str) -> crate::error::ChannelResult<crate::channel::NackOutcome> {
            Ok(crate::channel::NackOutcome::DeadLettered)
        }
        async fn dead_letter(&self, _: &Delivery, _: &str) -> crate::error::ChannelResult<()> {
            Ok(())
        }
        async fn dead_letters(&self, _: usize) -> crate::error::ChannelResult<Vec<crate::channel::DeadLetter>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_publish_failure_compensates() {
        let f = fixture(&[("A", "1", 10)]).await;
        let engine = ReservationEngine::new(f.store.clone(), f.db.clone(), Arc::new(DownChannel), fast_settings());
        let r = engine.reserve("A", "1", 4).await.unwrap();

        let err = engine.commit(&r.reservation_id).await.unwrap_err();
        assert!(err.is_system_unavailable());
        let stored = f.store.get(&r.reservation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Released);
        assert_eq!(engine.availability(&StockKey::new("A", "1")).await.unwrap().reserved, 0);
    }

    /// Reports every reserve as contended.
    struct ContendedStore {
        inner: MemoryReservationStore,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ReservationStore for ContendedStore {
        async fn seed(&self, key: &StockKey, on_hand: i64, epoch: u64) -> StoreResult<SeedOutcome> {
            self.inner.seed(key, on_hand, epoch).await
        }
        async fn movement_epoch(&self, key: &StockKey) -> StoreResult<u64> {
            self.inner.movement_epoch(key).await
        }
        async fn level(&self, key: &StockKey) -> StoreResult<Option<StockLevel>> {
            self.inner.level(key).await
        }
        async fn try_reserve(
            &self,
            _: &StockKey,
            _: i64,
            _: DateTime<Utc>,
            _: chrono::Duration,
        ) -> StoreResult<ReserveAttempt> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(ReserveAttempt::Contended)
        }
        async fn get(&self, id: &str) -> StoreResult<Option<Reservation>> {
            self.inner.get(id).await
        }
        async fn transition(&self, id: &str, t: &Transition) -> StoreResult<TransitionResult> {
            self.inner.transition(id, t).await
        }
        async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<String>> {
            self.inner.due_for_expiry(now, limit).await
        }
        async fn begin_movement(&self, key: &StockKey) -> StoreResult<()> {
            self.inner.begin_movement(key).await
        }
        async fn finish_movement(&self, key: &StockKey, delta: i64) -> StoreResult<()> {
            self.inner.finish_movement(key, delta).await
        }
        async fn resync(&self, key: &StockKey, on_hand: i64, epoch: u64, force: bool) -> StoreResult<ResyncOutcome> {
            self.inner.resync(key, on_hand, epoch, force).await
        }
    }

    #[tokio::test]
    async fn test_contention_is_bounded() {
        let f = fixture(&[("A", "1", 10)]).await;
        let store = Arc::new(ContendedStore {
            inner: MemoryReservationStore::new(),
            attempts: AtomicUsize::new(0),
        });
        let engine = ReservationEngine::new(store.clone(), f.db.clone(), f.channel.clone(), fast_settings());

        let err = engine.reserve("A", "1", 1).await.unwrap_err();
        assert!(matches!(err, StockError::ContentionExceeded { attempts: 5, .. }));
        assert!(err.is_retryable());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 5);
    }

    /// Refuses every connection.
    struct UnreachableStore;

    #[async_trait]
    impl ReservationStore for UnreachableStore {
        async fn seed(&self, _: &StockKey, _: i64, _: u64) -> StoreResult<SeedOutcome> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn movement_epoch(&self, _: &StockKey) -> StoreResult<u64> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn level(&self, _: &StockKey) -> StoreResult<Option<StockLevel>> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn try_reserve(
            &self,
            _: &StockKey,
            _: i64,
            _: DateTime<Utc>,
            _: chrono::Duration,
        ) -> StoreResult<ReserveAttempt> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn get(&self, _: &str) -> StoreResult<Option<Reservation>> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn transition(&self, _: &str, _: &Transition) -> StoreResult<TransitionResult> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn due_for_expiry(&self, _: DateTime<Utc>, _: usize) -> StoreResult<Vec<String>> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn begin_movement(&self, _: &StockKey) -> StoreResult<()> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn finish_movement(&self, _: &StockKey, _: i64) -> StoreResult<()> {
            Err(StoreError::Unavailable("refused".into()))
        }
        async fn resync(&self, _: &StockKey, _: i64, _: u64, _: bool) -> StoreResult<ResyncOutcome> {
            Err(StoreError::Unavailable("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_closed() {
        let f = fixture(&[("A", "1", 10)]).await;
        let engine = ReservationEngine::new(Arc::new(UnreachableStore), f.db.clone(), f.channel.clone(), fast_settings());
        let err = engine.reserve("A", "1", 1).await.unwrap_err();
        assert!(matches!(err, StockError::StoreUnavailable(_)));
        assert!(err.is_system_unavailable());
        assert!(!err.is_stock_unavailable());
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_input() {
        let f = fixture(&[]).await;
        assert!(matches!(
            f.engine.reserve("A", "1", 0).await,
            Err(StockError::Validation(_))
        ));
        assert!(matches!(f.engine.reserve("", "1", 1).await, Err(StockError::Validation(_))));
        assert!(matches!(
            f.engine.get_reservation("missing").await,
            Err(StockError::ReservationNotFound(_))
        ));
    }
}
