//! # Ledger Store Capability
//!
//! The narrow interface the engine depends on. [`Database`] implements it
//! over SQLite; tests wrap it to inject storage failures.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tally-engine                        tally-db                           │
//! │                                                                         │
//! │  ReservationEngine ── seed ───────►┐                                    │
//! │  SalesProcessor ──── write ───────►├──► dyn LedgerStore ──► Database    │
//! │  StockQueryService ─ read ────────►┘                        (SQLite)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DbResult;
use crate::pool::Database;
use crate::repository::ledger::{DriftRecord, StockCheck};
use crate::repository::sale::{NewSale, RecordOutcome, RollbackOutcome};
use tally_core::{LedgerCursor, LedgerEntry, Sale, StockKey, StockLine};

/// Durable, append-only stock ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Appends entries atomically with their running-total updates.
    async fn append_entries(&self, entries: &[LedgerEntry], check: StockCheck) -> DbResult<Vec<LedgerEntry>>;

    /// Running total for a key.
    async fn current_stock(&self, key: &StockKey) -> DbResult<i64>;

    /// Full-scan SUM(delta) for a key.
    async fn scan_stock(&self, key: &StockKey) -> DbResult<i64>;

    /// One page of a key's ledger, oldest first.
    async fn ledger_page(
        &self,
        key: &StockKey,
        since: Option<DateTime<Utc>>,
        after: Option<LedgerCursor>,
        limit: u32,
    ) -> DbResult<Vec<LedgerEntry>>;

    async fn entries_for_reference(&self, reference_id: &str) -> DbResult<Vec<LedgerEntry>>;

    async fn stock_keys(&self) -> DbResult<Vec<StockKey>>;

    async fn stock_by_variant(&self, variant_id: &str) -> DbResult<Vec<StockLine>>;

    async fn low_stock(&self, threshold: i64) -> DbResult<Vec<StockLine>>;

    async fn record_drift(&self, key: &StockKey, running_total: i64, ledger_sum: i64) -> DbResult<()>;

    async fn drift_audit(&self, limit: u32) -> DbResult<Vec<DriftRecord>>;

    /// Records a sale with its SALE entries in one transaction. Idempotent.
    async fn record_sale(&self, sale: &NewSale) -> DbResult<RecordOutcome>;

    async fn sale_exists(&self, sale_id: &str) -> DbResult<bool>;

    async fn get_sale(&self, sale_id: &str) -> DbResult<Option<Sale>>;

    /// Appends ROLLBACK entries for a sale and voids it. Idempotent.
    async fn rollback_sale(&self, sale_id: &str, actor_id: &str, reason: &str) -> DbResult<RollbackOutcome>;
}

#[async_trait]
impl LedgerStore for Database {
    async fn append_entries(&self, entries: &[LedgerEntry], check: StockCheck) -> DbResult<Vec<LedgerEntry>> {
        self.ledger().append(entries, check).await
    }

    async fn current_stock(&self, key: &StockKey) -> DbResult<i64> {
        self.ledger().current_stock(key).await
    }

    async fn scan_stock(&self, key: &StockKey) -> DbResult<i64> {
        self.ledger().scan_stock(key).await
    }

    async fn ledger_page(
        &self,
        key: &StockKey,
        since: Option<DateTime<Utc>>,
        after: Option<LedgerCursor>,
        limit: u32,
    ) -> DbResult<Vec<LedgerEntry>> {
        self.ledger().page(key, since, after, limit).await
    }

    async fn entries_for_reference(&self, reference_id: &str) -> DbResult<Vec<LedgerEntry>> {
        self.ledger().entries_for_reference(reference_id).await
    }

    async fn stock_keys(&self) -> DbResult<Vec<StockKey>> {
        self.ledger().stock_keys().await
    }

    async fn stock_by_variant(&self, variant_id: &str) -> DbResult<Vec<StockLine>> {
        self.ledger().stock_by_variant(variant_id).await
    }

    async fn low_stock(&self, threshold: i64) -> DbResult<Vec<StockLine>> {
        self.ledger().low_stock(threshold).await
    }

    async fn record_drift(&self, key: &StockKey, running_total: i64, ledger_sum: i64) -> DbResult<()> {
        self.ledger().record_drift(key, running_total, ledger_sum).await
    }

    async fn drift_audit(&self, limit: u32) -> DbResult<Vec<DriftRecord>> {
        self.ledger().drift_audit(limit).await
    }

    async fn record_sale(&self, sale: &NewSale) -> DbResult<RecordOutcome> {
        self.sales().record(sale).await
    }

    async fn sale_exists(&self, sale_id: &str) -> DbResult<bool> {
        self.sales().exists(sale_id).await
    }

    async fn get_sale(&self, sale_id: &str) -> DbResult<Option<Sale>> {
        self.sales().get(sale_id).await
    }

    async fn rollback_sale(&self, sale_id: &str, actor_id: &str, reason: &str) -> DbResult<RollbackOutcome> {
        self.sales().rollback(sale_id, actor_id, reason).await
    }
}
