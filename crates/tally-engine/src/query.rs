//! # Stock Query Service
//!
//! Read side of the ledger plus the operator views: dead letters, drift
//! audit and forced counter resync.
//!
//! `get_ledger` is a lazy, finite stream that reads the ledger one page at
//! a time. Callers that stop early resume with the last entry's cursor.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use tracing::{debug, error};

use crate::channel::{DeadLetter, EventChannel};
use crate::error::{StockError, StockResult};
use crate::reservation::{ReservationEngine, ResyncOutcome};
use tally_core::validation::{validate_id, validate_stock_key};
use tally_core::{LedgerCursor, LedgerEntry, Sale, StockKey, StockLevel, StockLine, StockSummary};
use tally_db::{DriftRecord, LedgerStore};

/// Entries fetched per ledger page.
pub const LEDGER_PAGE_SIZE: u32 = 256;

pub struct StockQueryService {
    ledger: Arc<dyn LedgerStore>,
    channel: Arc<dyn EventChannel>,
    engine: Arc<ReservationEngine>,
}

struct PageState {
    ledger: Arc<dyn LedgerStore>,
    key: StockKey,
    since: Option<DateTime<Utc>>,
    after: Option<LedgerCursor>,
    buffer: VecDeque<LedgerEntry>,
    exhausted: bool,
}

impl StockQueryService {
    pub fn new(ledger: Arc<dyn LedgerStore>, channel: Arc<dyn EventChannel>, engine: Arc<ReservationEngine>) -> Self {
        Self { ledger, channel, engine }
    }

    /// Ledger stock for a unit, from the running total.
    pub async fn get_stock(&self, variant_id: &str, location_id: &str) -> StockResult<i64> {
        let key = StockKey::new(variant_id, location_id);
        validate_stock_key(&key)?;
        Ok(self.ledger.current_stock(&key).await?)
    }

    pub fn get_ledger(
        &self,
        variant_id: &str,
        location_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> impl Stream<Item = StockResult<LedgerEntry>> + Send {
        self.get_ledger_after(StockKey::new(variant_id, location_id), since, None)
    }

    /// Ledger entries for `key` in (created_at, sequence) order, starting
    /// after `after` when resuming.
    pub fn get_ledger_after(
        &self,
        key: StockKey,
        since: Option<DateTime<Utc>>,
        after: Option<LedgerCursor>,
    ) -> impl Stream<Item = StockResult<LedgerEntry>> + Send {
        let state = PageState {
            ledger: Arc::clone(&self.ledger),
            key,
            since,
            after,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(entry) = state.buffer.pop_front() {
                    state.after = Some(entry.cursor());
                    return Some((Ok(entry), state));
                }
                if state.exhausted {
                    return None;
                }
                if let Err(e) = validate_stock_key(&state.key) {
                    state.exhausted = true;
                    return Some((Err(e.into()), state));
                }

                let page = state
                    .ledger
                    .ledger_page(&state.key, state.since, state.after, LEDGER_PAGE_SIZE)
                    .await;
                match page {
                    Ok(entries) => {
                        debug!(key = %state.key, fetched = entries.len(), "Ledger page");
                        state.exhausted = entries.len() < LEDGER_PAGE_SIZE as usize;
                        state.buffer.extend(entries);
                    }
                    Err(e) => {
                        state.exhausted = true;
                        return Some((Err(e.into()), state));
                    }
                }
            }
        })
    }

    /// Stock per location for a variant, with the total.
    pub async fn stock_summary(&self, variant_id: &str) -> StockResult<StockSummary> {
        validate_id("variant_id", variant_id)?;
        let lines = self.ledger.stock_by_variant(variant_id).await?;
        Ok(StockSummary::from_lines(variant_id, lines))
    }

    /// Units at or below `threshold`.
    pub async fn low_stock(&self, threshold: i64) -> StockResult<Vec<StockLine>> {
        Ok(self.ledger.low_stock(threshold).await?)
    }

    /// Fast-path view: on hand, reserved and available.
    pub async fn availability(&self, variant_id: &str, location_id: &str) -> StockResult<StockLevel> {
        self.engine.availability(&StockKey::new(variant_id, location_id)).await
    }

    pub async fn entries_for_reference(&self, reference_id: &str) -> StockResult<Vec<LedgerEntry>> {
        validate_id("reference_id", reference_id)?;
        Ok(self.ledger.entries_for_reference(reference_id).await?)
    }

    pub async fn get_sale(&self, sale_id: &str) -> StockResult<Sale> {
        self.ledger
            .get_sale(sale_id)
            .await?
            .ok_or_else(|| StockError::SaleNotFound(sale_id.to_string()))
    }

    pub async fn dead_letters(&self, limit: usize) -> StockResult<Vec<DeadLetter>> {
        Ok(self.channel.dead_letters(limit).await?)
    }

    pub async fn drift_audit(&self, limit: u32) -> StockResult<Vec<DriftRecord>> {
        Ok(self.ledger.drift_audit(limit).await?)
    }

    /// Compares the running total with a full scan of the ledger.
    ///
    /// A mismatch is recorded in the drift audit and reported as
    /// [`StockError::LedgerDriftDetected`]. The running total is left as is.
    pub async fn verify(&self, key: &StockKey) -> StockResult<i64> {
        let running_total = self.ledger.current_stock(key).await?;
        let ledger_sum = self.ledger.scan_stock(key).await?;
        if running_total == ledger_sum {
            return Ok(ledger_sum);
        }

        error!(%key, running_total, ledger_sum, "Ledger drift detected");
        self.ledger.record_drift(key, running_total, ledger_sum).await?;
        Err(StockError::LedgerDriftDetected {
            key: key.to_string(),
            running_total,
            ledger_sum,
        })
    }

    /// Reloads a unit's fast-path `on_hand` from the ledger, clearing any
    /// in-flight movement count.
    pub async fn force_resync(&self, key: &StockKey) -> StockResult<ResyncOutcome> {
        validate_stock_key(key)?;
        self.engine.resync_from_ledger(key, true).await
    }
}
