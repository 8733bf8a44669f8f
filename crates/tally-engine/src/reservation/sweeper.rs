//! # Expiry Sweeper
//!
//! Background task that expires HELD reservations past their deadline so
//! their quantity returns to `available` without waiting for a reader.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::engine::ReservationEngine;
use crate::error::{StockError, StockResult};

/// Periodic expiry sweep over the reservation store.
pub struct ExpirySweeper {
    engine: Arc<ReservationEngine>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping the sweeper.
#[derive(Clone)]
pub struct ExpirySweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl ExpirySweeperHandle {
    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> StockResult<()> {
        self.shutdown_tx.send(()).await.map_err(|_| StockError::ShuttingDown)
    }
}

impl ExpirySweeper {
    pub fn new(engine: Arc<ReservationEngine>) -> (Self, ExpirySweeperHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let interval = engine.settings().sweep_interval();
        let sweeper = ExpirySweeper {
            engine,
            interval,
            shutdown_rx,
        };
        (sweeper, ExpirySweeperHandle { shutdown_tx })
    }

    /// Runs the sweep loop. Spawn as a background task.
    pub async fn run(mut self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Expiry sweeper starting");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.engine.sweep_expired().await {
                        Ok(0) => {}
                        Ok(expired) => debug!(expired, "Swept expired reservations"),
                        Err(e) => error!(error = %e, "Expiry sweep failed"),
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Expiry sweeper shutting down");
                    break;
                }
            }
        }

        info!("Expiry sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::config::ReservationSettings;
    use crate::reservation::{MemoryReservationStore, ReservationStore};
    use tally_core::{LedgerEntry, MovementType, ReservationStatus, StockKey};
    use tally_db::{Database, DbConfig, LedgerStore, StockCheck};

    #[tokio::test]
    async fn test_sweeper_expires_and_stops() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let key = StockKey::new("A", "1");
        db.append_entries(
            &[LedgerEntry::new(&key, MovementType::Restock, 5, "po-1", "tester")],
            StockCheck::Unchecked,
        )
        .await
        .unwrap();

        let store = Arc::new(MemoryReservationStore::new());
        let settings = ReservationSettings {
            sweep_interval_ms: 10,
            ..Default::default()
        };
        let engine = Arc::new(ReservationEngine::new(
            store.clone(),
            db,
            Arc::new(MemoryChannel::new(1, Duration::from_secs(30), 5)),
            settings,
        ));
        let r = engine
            .try_reserve(&key, 5, chrono::Duration::milliseconds(20))
            .await
            .unwrap();

        let (sweeper, handle) = ExpirySweeper::new(engine.clone());
        let task = tokio::spawn(sweeper.run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stored = store.get(&r.reservation_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Expired);
        assert_eq!(engine.level(&key).await.unwrap().unwrap().available(), 5);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
