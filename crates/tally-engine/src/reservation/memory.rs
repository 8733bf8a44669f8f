//! # In-Memory Reservation Store
//!
//! Single-process fast path. Each stock unit is a cell behind its own
//! mutex; reservations live inside the cell that owns their counters, so a
//! transition and its counter delta are applied under one lock.
//!
//! `try_reserve` takes the cell with `try_lock` and reports a busy cell as
//! [`ReserveAttempt::Contended`]; the engine backs off and retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::store::{ReservationStore, ReserveAttempt, ResyncOutcome, SeedOutcome, TransitionResult};
use crate::error::{StoreError, StoreResult};
use tally_core::reservation::apply;
use tally_core::{Reservation, ReservationStatus, StockKey, StockLevel, Transition, TransitionOutcome};

#[derive(Debug, Default)]
struct Cell {
    level: StockLevel,
    seeded: bool,
    epoch: u64,
    reservations: HashMap<String, Reservation>,
}

type SharedCell = Arc<Mutex<Cell>>;

/// Fast-path store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryReservationStore {
    cells: RwLock<HashMap<StockKey, SharedCell>>,
    /// reservation_id → owning unit
    index: RwLock<HashMap<String, StockKey>>,
}

fn poisoned<E>(_: E) -> StoreError {
    StoreError::Backend("reservation cell lock poisoned".into())
}

fn lock(cell: &Mutex<Cell>) -> StoreResult<MutexGuard<'_, Cell>> {
    cell.lock().map_err(poisoned)
}

impl MemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: &StockKey) -> StoreResult<Option<SharedCell>> {
        Ok(self.cells.read().map_err(poisoned)?.get(key).cloned())
    }

    fn cell_or_insert(&self, key: &StockKey) -> StoreResult<SharedCell> {
        if let Some(cell) = self.cell(key)? {
            return Ok(cell);
        }
        let mut cells = self.cells.write().map_err(poisoned)?;
        Ok(cells.entry(key.clone()).or_default().clone())
    }

    fn owner(&self, reservation_id: &str) -> StoreResult<Option<SharedCell>> {
        let key = self.index.read().map_err(poisoned)?.get(reservation_id).cloned();
        match key {
            Some(key) => self.cell(&key),
            None => Ok(None),
        }
    }

    fn all_cells(&self) -> StoreResult<Vec<SharedCell>> {
        Ok(self.cells.read().map_err(poisoned)?.values().cloned().collect())
    }
}

#[async_trait]
impl ReservationStore for MemoryReservationStore {
    async fn seed(&self, key: &StockKey, on_hand: i64, epoch: u64) -> StoreResult<SeedOutcome> {
        let cell = self.cell_or_insert(key)?;
        let mut cell = lock(&cell)?;
        if cell.seeded {
            return Ok(SeedOutcome::AlreadySeeded);
        }
        if cell.epoch != epoch || cell.level.in_flight != 0 {
            return Ok(SeedOutcome::Stale);
        }
        cell.level.on_hand = on_hand;
        cell.seeded = true;
        debug!(%key, on_hand, "Seeded stock counter");
        Ok(SeedOutcome::Seeded)
    }

    async fn movement_epoch(&self, key: &StockKey) -> StoreResult<u64> {
        match self.cell(key)? {
            Some(cell) => Ok(lock(&cell)?.epoch),
            None => Ok(0),
        }
    }

    async fn level(&self, key: &StockKey) -> StoreResult<Option<StockLevel>> {
        match self.cell(key)? {
            Some(cell) => {
                let cell = lock(&cell)?;
                Ok(cell.seeded.then_some(cell.level))
            }
            None => Ok(None),
        }
    }

    async fn try_reserve(
        &self,
        key: &StockKey,
        quantity: i64,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> StoreResult<ReserveAttempt> {
        let Some(cell) = self.cell(key)? else {
            return Ok(ReserveAttempt::NotSeeded);
        };
        let mut cell = match cell.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(ReserveAttempt::Contended),
            Err(TryLockError::Poisoned(e)) => return Err(poisoned(e)),
        };
        if !cell.seeded {
            return Ok(ReserveAttempt::NotSeeded);
        }

        let available = cell.level.available();
        if available < quantity {
            return Ok(ReserveAttempt::Insufficient { available });
        }

        let reservation = Reservation::hold(key, quantity, now, ttl);
        cell.level.reserved += quantity;
        cell.reservations
            .insert(reservation.reservation_id.clone(), reservation.clone());
        drop(cell);

        self.index
            .write()
            .map_err(poisoned)?
            .insert(reservation.reservation_id.clone(), key.clone());
        Ok(ReserveAttempt::Reserved(reservation))
    }

    async fn get(&self, reservation_id: &str) -> StoreResult<Option<Reservation>> {
        match self.owner(reservation_id)? {
            Some(cell) => Ok(lock(&cell)?.reservations.get(reservation_id).cloned()),
            None => Ok(None),
        }
    }

    async fn transition(&self, reservation_id: &str, transition: &Transition) -> StoreResult<TransitionResult> {
        let Some(cell) = self.owner(reservation_id)? else {
            return Ok(TransitionResult::NotFound);
        };
        let mut guard = lock(&cell)?;
        let cell = &mut *guard;
        let Some(reservation) = cell.reservations.get_mut(reservation_id) else {
            return Ok(TransitionResult::NotFound);
        };

        match apply(reservation, transition) {
            Ok(TransitionOutcome::Applied(delta)) => {
                cell.level.reserved += delta.reserved;
                cell.level.on_hand += delta.on_hand;
                Ok(TransitionResult::Applied(reservation.clone()))
            }
            Ok(TransitionOutcome::Unchanged) => Ok(TransitionResult::Unchanged(reservation.clone())),
            Err(_) => Ok(TransitionResult::Rejected(reservation.clone())),
        }
    }

    async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<String>> {
        let mut due = Vec::new();
        for cell in self.all_cells()? {
            let cell = lock(&cell)?;
            due.extend(
                cell.reservations
                    .values()
                    .filter(|r| r.is_due(now))
                    .map(|r| (r.expires_at, r.reservation_id.clone())),
            );
        }
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn begin_movement(&self, key: &StockKey) -> StoreResult<()> {
        let cell = self.cell_or_insert(key)?;
        let mut cell = lock(&cell)?;
        cell.level.in_flight += 1;
        cell.epoch += 1;
        Ok(())
    }

    async fn finish_movement(&self, key: &StockKey, on_hand_delta: i64) -> StoreResult<()> {
        let cell = self.cell_or_insert(key)?;
        let mut cell = lock(&cell)?;
        cell.level.in_flight = (cell.level.in_flight - 1).max(0);
        cell.epoch += 1;
        if cell.seeded {
            cell.level.on_hand += on_hand_delta;
        }
        Ok(())
    }

    async fn resync(&self, key: &StockKey, on_hand: i64, epoch: u64, force: bool) -> StoreResult<ResyncOutcome> {
        let cell = match self.cell(key)? {
            Some(cell) => cell,
            None if force => self.cell_or_insert(key)?,
            None => return Ok(ResyncOutcome::NotSeeded),
        };
        let mut cell = lock(&cell)?;
        if !cell.seeded {
            if !force {
                return Ok(ResyncOutcome::NotSeeded);
            }
            cell.level.on_hand = on_hand;
            cell.level.in_flight = 0;
            cell.seeded = true;
            return Ok(ResyncOutcome::Seeded);
        }
        if !force {
            if cell.level.in_flight != 0 {
                return Ok(ResyncOutcome::Busy {
                    in_flight: cell.level.in_flight,
                });
            }
            if cell.epoch != epoch {
                return Ok(ResyncOutcome::Stale);
            }
        }

        let previous = cell.level.on_hand;
        if previous == on_hand && cell.level.in_flight == 0 {
            return Ok(ResyncOutcome::Unchanged);
        }
        cell.level.on_hand = on_hand;
        cell.level.in_flight = 0;
        Ok(ResyncOutcome::Updated { previous })
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut purged = Vec::new();
        for cell in self.all_cells()? {
            let mut cell = lock(&cell)?;
            cell.reservations.retain(|id, r| {
                let finished = r.status.is_terminal() || (r.status == ReservationStatus::Committed && r.settled);
                let remove = finished && r.created_at < before;
                if remove {
                    purged.push(id.clone());
                }
                !remove
            });
        }

        if !purged.is_empty() {
            let mut index = self.index.write().map_err(poisoned)?;
            for id in &purged {
                index.remove(id);
            }
        }
        Ok(purged.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> StockKey {
        StockKey::new("A", "1")
    }

    async fn seeded(on_hand: i64) -> MemoryReservationStore {
        let store = MemoryReservationStore::new();
        assert_eq!(store.seed(&key(), on_hand, 0).await.unwrap(), SeedOutcome::Seeded);
        store
    }

    async fn reserve(store: &MemoryReservationStore, qty: i64) -> Reservation {
        match store.try_reserve(&key(), qty, Utc::now(), Duration::seconds(60)).await.unwrap() {
            ReserveAttempt::Reserved(r) => r,
            other => panic!("expected reservation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unseeded_unit() {
        let store = MemoryReservationStore::new();
        let attempt = store.try_reserve(&key(), 1, Utc::now(), Duration::seconds(5)).await.unwrap();
        assert_eq!(attempt, ReserveAttempt::NotSeeded);
        assert_eq!(store.level(&key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_seed_never_overwrites() {
        let store = seeded(10).await;
        reserve(&store, 4).await;
        assert_eq!(store.seed(&key(), 99, 0).await.unwrap(), SeedOutcome::AlreadySeeded);
        let level = store.level(&key()).await.unwrap().unwrap();
        assert_eq!(level.on_hand, 10);
        assert_eq!(level.reserved, 4);
    }

    #[tokio::test]
    async fn test_seed_is_stale_after_movement() {
        let store = MemoryReservationStore::new();
        let epoch = store.movement_epoch(&key()).await.unwrap();
        store.begin_movement(&key()).await.unwrap();
        assert_eq!(store.seed(&key(), 5, epoch).await.unwrap(), SeedOutcome::Stale);

        store.finish_movement(&key(), 5).await.unwrap();
        let epoch = store.movement_epoch(&key()).await.unwrap();
        assert_eq!(store.seed(&key(), 5, epoch).await.unwrap(), SeedOutcome::Seeded);
        assert_eq!(store.level(&key()).await.unwrap().unwrap().on_hand, 5);
    }

    #[tokio::test]
    async fn test_seed_is_stale_when_movement_finishes_during_load() {
        let store = MemoryReservationStore::new();
        store.begin_movement(&key()).await.unwrap();
        let epoch = store.movement_epoch(&key()).await.unwrap();
        // Ledger read here, then the movement commits and finishes.
        store.finish_movement(&key(), -4).await.unwrap();
        assert_eq!(store.seed(&key(), 10, epoch).await.unwrap(), SeedOutcome::Stale);
        assert_eq!(store.level(&key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resync_is_stale_when_movement_finishes_during_load() {
        let store = seeded(10).await;
        store.begin_movement(&key()).await.unwrap();
        let epoch = store.movement_epoch(&key()).await.unwrap();
        store.finish_movement(&key(), -4).await.unwrap();
        assert_eq!(store.resync(&key(), 10, epoch, false).await.unwrap(), ResyncOutcome::Stale);
        assert_eq!(store.level(&key()).await.unwrap().unwrap().on_hand, 6);
    }

    #[tokio::test]
    async fn test_forced_resync_seeds_unit() {
        let store = MemoryReservationStore::new();
        store.begin_movement(&key()).await.unwrap();
        assert_eq!(store.resync(&key(), 3, 0, false).await.unwrap(), ResyncOutcome::NotSeeded);
        assert_eq!(store.resync(&key(), 3, 0, true).await.unwrap(), ResyncOutcome::Seeded);
        let level = store.level(&key()).await.unwrap().unwrap();
        assert_eq!((level.on_hand, level.in_flight), (3, 0));
    }

    #[tokio::test]
    async fn test_reserve_rejects_over_available() {
        let store = seeded(10).await;
        reserve(&store, 6).await;
        let attempt = store.try_reserve(&key(), 6, Utc::now(), Duration::seconds(60)).await.unwrap();
        assert_eq!(attempt, ReserveAttempt::Insufficient { available: 4 });
    }

    #[tokio::test]
    async fn test_contended_cell() {
        let store = seeded(10).await;
        let cell = store.cell(&key()).unwrap().unwrap();
        let _held = cell.lock().unwrap();
        let attempt = store.try_reserve(&key(), 1, Utc::now(), Duration::seconds(60)).await.unwrap();
        assert_eq!(attempt, ReserveAttempt::Contended);
    }

    #[tokio::test]
    async fn test_release_restores_available() {
        let store = seeded(10).await;
        let r = reserve(&store, 3).await;
        let result = store.transition(&r.reservation_id, &Transition::Release).await.unwrap();
        assert!(matches!(result, TransitionResult::Applied(ref r) if r.status == ReservationStatus::Released));
        let level = store.level(&key()).await.unwrap().unwrap();
        assert_eq!(level.available(), 10);

        let again = store.transition(&r.reservation_id, &Transition::Release).await.unwrap();
        assert!(matches!(again, TransitionResult::Unchanged(_)));
        assert_eq!(store.level(&key()).await.unwrap().unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_settle_moves_on_hand() {
        let store = seeded(10).await;
        let r = reserve(&store, 3).await;
        store
            .transition(&r.reservation_id, &Transition::Commit { sale_id: "s".into() })
            .await
            .unwrap();
        store.transition(&r.reservation_id, &Transition::Settle).await.unwrap();
        let level = store.level(&key()).await.unwrap().unwrap();
        assert_eq!(level.on_hand, 7);
        assert_eq!(level.reserved, 0);
    }

    #[tokio::test]
    async fn test_rejected_and_missing_transitions() {
        let store = seeded(10).await;
        let r = reserve(&store, 1).await;
        let result = store.transition(&r.reservation_id, &Transition::Settle).await.unwrap();
        assert!(matches!(result, TransitionResult::Rejected(_)));
        let missing = store.transition("nope", &Transition::Release).await.unwrap();
        assert_eq!(missing, TransitionResult::NotFound);
    }

    #[tokio::test]
    async fn test_due_for_expiry_and_purge() {
        let store = seeded(10).await;
        let now = Utc::now();
        let short = match store.try_reserve(&key(), 2, now, Duration::seconds(1)).await.unwrap() {
            ReserveAttempt::Reserved(r) => r,
            other => panic!("{other:?}"),
        };
        reserve(&store, 1).await;

        let later = now + Duration::seconds(2);
        let due = store.due_for_expiry(later, 10).await.unwrap();
        assert_eq!(due, vec![short.reservation_id.clone()]);

        store
            .transition(&short.reservation_id, &Transition::Expire { now: later })
            .await
            .unwrap();
        assert_eq!(store.purge_finished(later).await.unwrap(), 1);
        assert_eq!(store.get(&short.reservation_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resync_waits_for_quiescence() {
        let store = seeded(10).await;
        store.begin_movement(&key()).await.unwrap();
        let epoch = store.movement_epoch(&key()).await.unwrap();
        assert_eq!(
            store.resync(&key(), 12, epoch, false).await.unwrap(),
            ResyncOutcome::Busy { in_flight: 1 }
        );

        store.finish_movement(&key(), 2).await.unwrap();
        assert_eq!(store.resync(&key(), 12, epoch, false).await.unwrap(), ResyncOutcome::Unchanged);
        assert_eq!(
            store.resync(&key(), 15, epoch, false).await.unwrap(),
            ResyncOutcome::Updated { previous: 12 }
        );
    }

    #[tokio::test]
    async fn test_forced_resync_clears_in_flight() {
        let store = seeded(10).await;
        store.begin_movement(&key()).await.unwrap();
        let outcome = store.resync(&key(), 8, 0, true).await.unwrap();
        assert_eq!(outcome, ResyncOutcome::Updated { previous: 10 });
        assert!(store.level(&key()).await.unwrap().unwrap().is_quiescent());
    }
}
