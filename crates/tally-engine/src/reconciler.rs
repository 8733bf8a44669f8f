//! # Reconciler
//!
//! Periodic consistency pass over every stock unit.
//!
//! ```text
//! for each ledger key:
//!   running total == full scan?      no ──► drift audit + error!  (never corrected)
//!   fast-path on_hand == ledger?     no ──► in_flight == 0 ? resync (warn!) : skip
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{StockError, StockResult};
use crate::query::StockQueryService;
use crate::reservation::{ReservationEngine, ResyncOutcome};
use tally_db::LedgerStore;

/// Findings of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub keys: usize,
    /// Units whose running total disagrees with the ledger scan.
    pub drifted: usize,
    /// Fast-path counters reloaded from the ledger.
    pub resynced: usize,
    /// Counter mismatches left alone because movements were in flight.
    pub busy: usize,
}

pub struct Reconciler {
    ledger: Arc<dyn LedgerStore>,
    engine: Arc<ReservationEngine>,
    query: Arc<StockQueryService>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping the reconciler.
#[derive(Clone)]
pub struct ReconcilerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl ReconcilerHandle {
    pub async fn shutdown(&self) -> StockResult<()> {
        self.shutdown_tx.send(()).await.map_err(|_| StockError::ShuttingDown)
    }
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        engine: Arc<ReservationEngine>,
        query: Arc<StockQueryService>,
        interval: Duration,
    ) -> (Self, ReconcilerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let reconciler = Reconciler {
            ledger,
            engine,
            query,
            interval,
            shutdown_rx,
        };
        (reconciler, ReconcilerHandle { shutdown_tx })
    }

    /// Runs the reconcile loop. Spawn as a background task.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Reconciler starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Checks every key once.
    pub async fn reconcile_once(&self) -> StockResult<ReconcileReport> {
        let keys = self.ledger.stock_keys().await?;
        let mut report = ReconcileReport {
            keys: keys.len(),
            ..Default::default()
        };

        for key in &keys {
            let ledger_stock = match self.query.verify(key).await {
                Ok(stock) => stock,
                Err(StockError::LedgerDriftDetected { running_total, .. }) => {
                    report.drifted += 1;
                    // Reservations follow the running total, the value checkout reads.
                    running_total
                }
                Err(e) => return Err(e),
            };

            let Some(level) = self.engine.level(key).await? else {
                continue;
            };
            if level.on_hand == ledger_stock {
                continue;
            }

            match self.engine.resync_from_ledger(key, false).await? {
                ResyncOutcome::Updated { .. } | ResyncOutcome::Seeded => report.resynced += 1,
                ResyncOutcome::Busy { in_flight } => {
                    debug!(%key, in_flight, on_hand = level.on_hand, ledger_stock, "Counter mismatch while busy");
                    report.busy += 1;
                }
                ResyncOutcome::Stale => report.busy += 1,
                ResyncOutcome::Unchanged | ResyncOutcome::NotSeeded => {}
            }
        }

        if report.drifted > 0 || report.resynced > 0 {
            warn!(?report, "Reconciliation found inconsistencies");
        } else {
            debug!(keys = report.keys, "Reconciliation clean");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::config::ReservationSettings;
    use crate::reservation::{MemoryReservationStore, ReservationStore};
    use tally_core::{LedgerEntry, MovementType, StockKey};
    use tally_db::{Database, DbConfig, StockCheck};

    struct Fixture {
        reconciler: Reconciler,
        engine: Arc<ReservationEngine>,
        store: Arc<MemoryReservationStore>,
        db: Arc<Database>,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let store = Arc::new(MemoryReservationStore::new());
        let channel = Arc::new(MemoryChannel::new(2, Duration::from_secs(30), 5));
        let engine = Arc::new(ReservationEngine::new(
            store.clone(),
            db.clone(),
            channel.clone(),
            ReservationSettings::default(),
        ));
        let query = Arc::new(StockQueryService::new(db.clone(), channel, engine.clone()));
        let (reconciler, _handle) = Reconciler::new(db.clone(), engine.clone(), query, Duration::from_secs(60));
        Fixture {
            reconciler,
            engine,
            store,
            db,
        }
    }

    async fn restock(db: &Database, key: &StockKey, qty: i64) {
        db.append_entries(
            &[LedgerEntry::new(key, MovementType::Restock, qty, "po-1", "tester")],
            StockCheck::Unchecked,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_clean_pass() {
        let f = fixture().await;
        let key = StockKey::new("A", "1");
        restock(&f.db, &key, 5).await;
        f.engine.availability(&key).await.unwrap();

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                keys: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn test_quiescent_mismatch_is_resynced() {
        let f = fixture().await;
        let key = StockKey::new("A", "1");
        restock(&f.db, &key, 5).await;
        f.engine.availability(&key).await.unwrap();
        // Written behind the counter's back.
        restock(&f.db, &key, 3).await;

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.resynced, 1);
        assert_eq!(f.store.level(&key).await.unwrap().unwrap().on_hand, 8);
    }

    #[tokio::test]
    async fn test_mismatch_with_movement_in_flight_is_left() {
        let f = fixture().await;
        let key = StockKey::new("A", "1");
        restock(&f.db, &key, 5).await;
        f.engine.availability(&key).await.unwrap();
        f.store.begin_movement(&key).await.unwrap();
        restock(&f.db, &key, 3).await;

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!((report.resynced, report.busy), (0, 1));
        assert_eq!(f.store.level(&key).await.unwrap().unwrap().on_hand, 5);
    }

    #[tokio::test]
    async fn test_drift_is_counted_not_fixed() {
        let f = fixture().await;
        let key = StockKey::new("A", "1");
        restock(&f.db, &key, 5).await;
        sqlx::query("UPDATE stock_levels SET quantity = 6")
            .execute(f.db.pool())
            .await
            .unwrap();

        let report = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(report.drifted, 1);
        assert_eq!(f.db.current_stock(&key).await.unwrap(), 6);
        assert_eq!(f.db.drift_audit(10).await.unwrap().len(), 1);
    }
}
