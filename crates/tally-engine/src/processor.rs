//! # Sales Processor
//!
//! Consumes sale events and turns them into durable sales and ledger
//! entries. The processor is the only writer of the ledger: restocks,
//! adjustments, transfers and rollbacks go through it as well.
//!
//! ## Event State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  RECEIVED ──decode──► VALIDATING ──valid──► WRITING ──ok──► ACKNOWLEDGED│
//! │     │                     │                    │                        │
//! │     │ not JSON            │ invalid            │ transient failure      │
//! │     ▼                     ▼                    ▼                        │
//! │  REJECTED ◄───────────────┘                  RETRY ──► redelivered      │
//! │  (dead-letter, alert,                          │                        │
//! │   release stock)                               └─ attempts spent ──►    │
//! │                                                   dead-letter, alert,   │
//! │                                                   release stock         │
//! │                                                                         │
//! │  sale_id already recorded ──► settle reservations ──► ACKNOWLEDGED      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Counter Bracketing
//! Every ledger write is wrapped in `begin_movement` / `finish_movement` on
//! the fast path, so a concurrent seed can never load a ledger value that
//! is about to change and the counter follows the ledger without a reload.

use std::future::Future;
use std::sync::Arc;

use backoff::backoff::Backoff;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{consume, Delivery, EventChannel, NackOutcome};
use crate::config::{ChannelSettings, ProcessorSettings};
use crate::error::{ChannelError, StockError, StockResult};
use crate::reservation::{ReservationEngine, TransitionResult};
use tally_core::validation::{
    validate_delta, validate_id, validate_quantity, validate_sale_event, validate_stock_key, validate_transfer,
};
use tally_core::{LedgerEntry, MovementType, SaleEvent, SaleLine, StockKey, ValidationError};
use tally_db::{DbError, DbResult, LedgerStore, NewSale, RecordOutcome, RollbackOutcome, StockCheck};

/// Terminal state of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Sale written and acknowledged.
    Acknowledged { sale_id: String, entries: usize },
    /// Sale already recorded; acknowledged without writing.
    Duplicate { sale_id: String },
    /// Malformed or invalid; dead-lettered without a write.
    Rejected { reason: String },
    /// Write failed transiently; left for redelivery.
    Retrying { attempt: u32 },
    /// Write failed on the final attempt or permanently.
    DeadLettered { reason: String },
}

/// Consumes sale events and owns every ledger write.
pub struct SalesProcessor {
    ledger: Arc<dyn LedgerStore>,
    channel: Arc<dyn EventChannel>,
    engine: Arc<ReservationEngine>,
    settings: ProcessorSettings,
    channel_settings: ChannelSettings,
}

impl SalesProcessor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        channel: Arc<dyn EventChannel>,
        engine: Arc<ReservationEngine>,
        settings: ProcessorSettings,
        channel_settings: ChannelSettings,
    ) -> Self {
        Self {
            ledger,
            channel,
            engine,
            settings,
            channel_settings,
        }
    }

    // =========================================================================
    // Event Processing
    // =========================================================================

    /// Drives one delivery through the state machine.
    ///
    /// Returns `Err` only when the channel itself fails; every event outcome
    /// is reported through [`ProcessOutcome`].
    pub async fn process(&self, delivery: &Delivery) -> StockResult<ProcessOutcome> {
        // RECEIVED
        let event: SaleEvent = match serde_json::from_slice(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                let reason = StockError::MalformedEvent {
                    message_id: delivery.message_id.clone(),
                    reason: e.to_string(),
                }
                .to_string();
                error!(message_id = %delivery.message_id, %reason, "Rejecting undecodable sale event");
                self.channel.dead_letter(delivery, &reason).await?;
                return Ok(ProcessOutcome::Rejected { reason });
            }
        };

        // VALIDATING
        if let Err(e) = validate_sale_event(&event) {
            let reason = StockError::MalformedEvent {
                message_id: delivery.message_id.clone(),
                reason: e.to_string(),
            }
            .to_string();
            error!(
                message_id = %delivery.message_id,
                sale_id = %event.sale_id,
                %reason,
                "Rejecting invalid sale event"
            );
            self.channel.dead_letter(delivery, &reason).await?;
            self.release_stock(&event).await;
            return Ok(ProcessOutcome::Rejected { reason });
        }

        match self.ledger.sale_exists(&event.sale_id).await {
            Ok(true) => {
                debug!(
                    sale_id = %event.sale_id,
                    event_id = %event.event_id,
                    attempt = delivery.attempt,
                    "Duplicate sale event, acknowledging"
                );
                self.settle_lines(&event, false).await;
                self.acknowledge(delivery).await?;
                return Ok(ProcessOutcome::Duplicate { sale_id: event.sale_id });
            }
            Ok(false) => {}
            Err(e) => {
                warn!(sale_id = %event.sale_id, error = %e, "Idempotency check failed");
                return self.fail_transient(delivery, &event, &e.to_string()).await;
            }
        }

        // WRITING
        self.write_sale(delivery, &event).await
    }

    async fn write_sale(&self, delivery: &Delivery, event: &SaleEvent) -> StockResult<ProcessOutcome> {
        let keys: Vec<StockKey> = event.lines.iter().map(SaleLine::key).collect();
        if let Err(e) = self.begin_all(&keys).await {
            return self.fail_transient(delivery, event, &e.to_string()).await;
        }

        let sale = NewSale::from(event);
        let written = self.write_with_retry("record_sale", || self.ledger.record_sale(&sale)).await;

        match written {
            Ok(RecordOutcome::Recorded(entries)) => {
                self.settle_lines(event, true).await;
                self.acknowledge(delivery).await?;
                info!(
                    sale_id = %event.sale_id,
                    event_id = %event.event_id,
                    entries = entries.len(),
                    attempt = delivery.attempt,
                    "Sale recorded"
                );
                Ok(ProcessOutcome::Acknowledged {
                    sale_id: event.sale_id.clone(),
                    entries: entries.len(),
                })
            }
            Ok(RecordOutcome::Duplicate) => {
                self.finish_all(&keys).await;
                self.settle_lines(event, false).await;
                self.acknowledge(delivery).await?;
                Ok(ProcessOutcome::Duplicate {
                    sale_id: event.sale_id.clone(),
                })
            }
            Err(e) => {
                self.finish_all(&keys).await;
                let err = StockError::from(e);
                if err.is_retryable() {
                    self.fail_transient(delivery, event, &err.to_string()).await
                } else {
                    self.fail_permanent(delivery, event, &err.to_string()).await
                }
            }
        }
    }

    /// Leaves the delivery for redelivery, or dead-letters it on the last attempt.
    async fn fail_transient(&self, delivery: &Delivery, event: &SaleEvent, reason: &str) -> StockResult<ProcessOutcome> {
        match self.channel.nack(delivery, reason).await? {
            NackOutcome::Redeliver { attempt } => {
                warn!(
                    sale_id = %event.sale_id,
                    next_attempt = attempt,
                    error = %reason,
                    "Sale write failed, awaiting redelivery"
                );
                Ok(ProcessOutcome::Retrying { attempt })
            }
            NackOutcome::DeadLettered => {
                error!(
                    sale_id = %event.sale_id,
                    event_id = %event.event_id,
                    attempts = delivery.attempt,
                    error = %reason,
                    "Sale event dead-lettered after exhausting retries"
                );
                self.release_stock(event).await;
                Ok(ProcessOutcome::DeadLettered {
                    reason: reason.to_string(),
                })
            }
        }
    }

    async fn fail_permanent(&self, delivery: &Delivery, event: &SaleEvent, reason: &str) -> StockResult<ProcessOutcome> {
        error!(
            sale_id = %event.sale_id,
            event_id = %event.event_id,
            error = %reason,
            "Sale event dead-lettered on permanent failure"
        );
        self.channel.dead_letter(delivery, reason).await?;
        self.release_stock(event).await;
        Ok(ProcessOutcome::DeadLettered {
            reason: reason.to_string(),
        })
    }

    async fn acknowledge(&self, delivery: &Delivery) -> StockResult<()> {
        match self.channel.ack(delivery).await {
            Ok(()) => Ok(()),
            Err(ChannelError::LeaseLost { message_id }) => {
                // Redelivery hits the idempotency guard.
                warn!(%message_id, "Lease lost before ack");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Folds a recorded sale into the fast-path counters.
    ///
    /// Lines settled through their reservation move `on_hand` there; any
    /// other line moves it when the bracket closes. `bracketed` is false
    /// when no movement was begun for this delivery.
    async fn settle_lines(&self, event: &SaleEvent, bracketed: bool) {
        for line in &event.lines {
            let key = line.key();
            let settled = match line.reservation_id.as_deref() {
                Some(id) => match self.engine.settle(id).await {
                    Ok(TransitionResult::Applied(_)) | Ok(TransitionResult::Unchanged(_)) => true,
                    Ok(_) => false,
                    Err(e) => {
                        warn!(reservation_id = %id, error = %e, "Settle failed");
                        false
                    }
                },
                None => false,
            };
            if !bracketed {
                continue;
            }
            let delta = if settled { 0 } else { -line.quantity };
            if let Err(e) = self.engine.finish_movement(&key, delta).await {
                error!(%key, error = %e, "Failed to close counter movement");
            }
        }
    }

    /// Releases reservations named by an event that will never be recorded.
    async fn release_stock(&self, event: &SaleEvent) {
        for id in event.reservation_ids() {
            if let Err(e) = self.engine.compensate(id).await {
                error!(reservation_id = %id, error = %e, "Failed to release stock for rejected sale");
            }
        }
    }

    // =========================================================================
    // Write Helpers
    // =========================================================================

    /// Retries transient ledger failures within the write window.
    async fn write_with_retry<T, F, Fut>(&self, op: &'static str, mut write: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut backoff = self.settings.write_backoff();
        loop {
            match write().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match backoff.next_backoff() {
                    Some(wait) => {
                        warn!(op, error = %e, ?wait, "Ledger write failed, retrying");
                        tokio::time::sleep(wait).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn begin_all(&self, keys: &[StockKey]) -> StockResult<()> {
        for (i, key) in keys.iter().enumerate() {
            if let Err(e) = self.engine.begin_movement(key).await {
                self.finish_all(&keys[..i]).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn finish_all(&self, keys: &[StockKey]) {
        for key in keys {
            if let Err(e) = self.engine.finish_movement(key, 0).await {
                error!(%key, error = %e, "Failed to close counter movement");
            }
        }
    }

    /// Appends entries inside a counter bracket; deltas reach the counter on success.
    async fn apply_movement(&self, entries: Vec<LedgerEntry>, check: StockCheck) -> StockResult<Vec<LedgerEntry>> {
        let keys: Vec<StockKey> = entries.iter().map(LedgerEntry::key).collect();
        self.begin_all(&keys).await?;

        let written = self
            .write_with_retry("append_entries", || self.ledger.append_entries(&entries, check))
            .await;

        match written {
            Ok(stored) => {
                for entry in &stored {
                    if let Err(e) = self.engine.finish_movement(&entry.key(), entry.delta).await {
                        error!(key = %entry.key(), error = %e, "Failed to close counter movement");
                    }
                }
                Ok(stored)
            }
            Err(e) => {
                self.finish_all(&keys).await;
                Err(e.into())
            }
        }
    }

    // =========================================================================
    // Stock Movements
    // =========================================================================

    /// Records goods received at a location.
    pub async fn restock(&self, key: &StockKey, quantity: i64, reference_id: &str, actor_id: &str) -> StockResult<LedgerEntry> {
        validate_stock_key(key)?;
        validate_quantity(quantity)?;
        validate_id("reference_id", reference_id)?;
        validate_id("actor_id", actor_id)?;

        let entry = LedgerEntry::new(key, MovementType::Restock, quantity, reference_id, actor_id);
        let stored = self.apply_movement(vec![entry], StockCheck::Unchecked).await?;
        info!(%key, quantity, %reference_id, "Restock recorded");
        single(stored)
    }

    /// Records a manual correction. Never drives stock below zero.
    pub async fn adjust(&self, key: &StockKey, delta: i64, reason: &str, actor_id: &str) -> StockResult<LedgerEntry> {
        validate_stock_key(key)?;
        validate_delta(delta)?;
        validate_id("actor_id", actor_id)?;
        if reason.trim().is_empty() {
            return Err(ValidationError::Required { field: "reason".into() }.into());
        }

        let adjustment_id = Uuid::new_v4().to_string();
        let entry = LedgerEntry::new(key, MovementType::Adjustment, delta, &adjustment_id, actor_id).with_notes(reason);
        let stored = self.apply_movement(vec![entry], StockCheck::NonNegative).await?;
        info!(%key, delta, %adjustment_id, "Adjustment recorded");
        single(stored)
    }

    /// Moves stock between two locations of one variant in a single transaction.
    pub async fn transfer(&self, from: &StockKey, to: &StockKey, quantity: i64, actor_id: &str) -> StockResult<Vec<LedgerEntry>> {
        validate_transfer(from, to)?;
        validate_quantity(quantity)?;
        validate_id("actor_id", actor_id)?;

        let transfer_id = Uuid::new_v4().to_string();
        let entries = vec![
            LedgerEntry::new(from, MovementType::Transfer, -quantity, &transfer_id, actor_id)
                .with_notes(format!("to {}", to.location_id)),
            LedgerEntry::new(to, MovementType::Transfer, quantity, &transfer_id, actor_id)
                .with_notes(format!("from {}", from.location_id)),
        ];
        let stored = self.apply_movement(entries, StockCheck::NonNegative).await?;
        info!(%from, %to, quantity, %transfer_id, "Transfer recorded");
        Ok(stored)
    }

    /// Reverses a recorded sale with ROLLBACK entries. Idempotent.
    pub async fn rollback_sale(&self, sale_id: &str, actor_id: &str, reason: &str) -> StockResult<RollbackOutcome> {
        validate_id("sale_id", sale_id)?;
        validate_id("actor_id", actor_id)?;
        if reason.trim().is_empty() {
            return Err(ValidationError::Required { field: "reason".into() }.into());
        }

        let sale = self
            .ledger
            .get_sale(sale_id)
            .await?
            .ok_or_else(|| StockError::SaleNotFound(sale_id.to_string()))?;
        let keys: Vec<StockKey> = sale.items.iter().map(|i| i.key()).collect();
        self.begin_all(&keys).await?;

        let outcome = self
            .write_with_retry("rollback_sale", || self.ledger.rollback_sale(sale_id, actor_id, reason))
            .await;

        match outcome {
            Ok(RollbackOutcome::RolledBack(entries)) => {
                for entry in &entries {
                    if let Err(e) = self.engine.finish_movement(&entry.key(), entry.delta).await {
                        error!(key = %entry.key(), error = %e, "Failed to close counter movement");
                    }
                }
                info!(%sale_id, entries = entries.len(), %reason, "Sale rolled back");
                Ok(RollbackOutcome::RolledBack(entries))
            }
            Ok(already) => {
                self.finish_all(&keys).await;
                debug!(%sale_id, "Sale already rolled back");
                Ok(already)
            }
            Err(e) => {
                self.finish_all(&keys).await;
                Err(e.into())
            }
        }
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Spawns `count` consumers named `worker-0..count`.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = (0..count)
            .map(|i| {
                let processor = Arc::clone(self);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { processor.run_worker(format!("worker-{i}"), shutdown).await })
            })
            .collect();
        info!(count, "Sales processor workers started");
        ProcessorHandle { shutdown_tx, workers }
    }

    async fn run_worker(self: Arc<Self>, name: String, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %name, "Worker starting");
        let deliveries = consume(
            Arc::clone(&self.channel),
            name.clone(),
            self.channel_settings.batch_size,
            self.channel_settings.poll_interval(),
        );
        tokio::pin!(deliveries);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(e) = self.process(&delivery).await {
                            error!(worker = %name, message_id = %delivery.message_id, error = %e, "Processing failed");
                        }
                    }
                    Some(Err(e)) => warn!(worker = %name, error = %e, "Channel receive failed"),
                    None => break,
                },
            }
        }

        debug!(worker = %name, "Worker stopped");
    }
}

fn single(mut entries: Vec<LedgerEntry>) -> StockResult<LedgerEntry> {
    entries
        .pop()
        .ok_or_else(|| StockError::Database(DbError::Internal("append returned no entries".into())))
}

/// Handle for stopping processor workers.
pub struct ProcessorHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Stops every worker after its in-flight event and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Sales processor workers stopped");
    }
}
