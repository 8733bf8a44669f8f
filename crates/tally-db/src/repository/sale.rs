//! # Sale Repository
//!
//! Durable sales, written only by the sales processor.
//!
//! ## Sale Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sale Lifecycle                                    │
//! │                                                                         │
//! │  1. RECORD (one transaction)                                           │
//! │     ├── existence check on sale_id / event_id → Duplicate              │
//! │     ├── INSERT sales                                                   │
//! │     ├── INSERT sale_items          (one per line)                      │
//! │     └── append SALE entries        (delta = -quantity)                 │
//! │                                                                         │
//! │  2. (OPTIONAL) ROLLBACK (one transaction)                              │
//! │     ├── existing ROLLBACK entries? → AlreadyRolledBack                 │
//! │     ├── append ROLLBACK entries    (delta = +quantity)                 │
//! │     └── UPDATE sales SET status = 'voided'                             │
//! │                                                                         │
//! │  Original SALE entries are never touched.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::repository::ledger::{append_in, entries_for_reference_in};
use tally_core::{LedgerEntry, MovementType, Sale, SaleEvent, SaleItem, SaleLine, SaleStatus, SYSTEM_ACTOR};

/// Everything needed to record a sale.
#[derive(Debug, Clone)]
pub struct NewSale {
    pub sale_id: String,
    pub event_id: String,
    pub actor_id: String,
    pub lines: Vec<SaleLine>,
}

impl From<&SaleEvent> for NewSale {
    fn from(event: &SaleEvent) -> Self {
        NewSale {
            sale_id: event.sale_id.clone(),
            event_id: event.event_id.clone(),
            actor_id: event
                .actor_id
                .clone()
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
            lines: event.lines.clone(),
        }
    }
}

/// Result of [`SaleRepository::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Sale and SALE entries written.
    Recorded(Vec<LedgerEntry>),
    /// The sale or event was already recorded. Nothing written.
    Duplicate,
}

/// Result of [`SaleRepository::rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// ROLLBACK entries written and the sale voided.
    RolledBack(Vec<LedgerEntry>),
    /// The sale was already rolled back; these are the earlier entries.
    AlreadyRolledBack(Vec<LedgerEntry>),
}

#[derive(Debug, sqlx::FromRow)]
struct SaleRow {
    sale_id: String,
    event_id: String,
    status: SaleStatus,
    actor_id: String,
    created_at: DateTime<Utc>,
    voided_at: Option<DateTime<Utc>>,
    void_reason: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct SaleItemRow {
    item_id: String,
    sale_id: String,
    variant_id: String,
    location_id: String,
    quantity: i64,
    reservation_id: Option<String>,
}

impl From<SaleItemRow> for SaleItem {
    fn from(row: SaleItemRow) -> Self {
        SaleItem {
            item_id: row.item_id,
            sale_id: row.sale_id,
            variant_id: row.variant_id,
            location_id: row.location_id,
            quantity: row.quantity,
            reservation_id: row.reservation_id,
        }
    }
}

/// Repository for sale database operations.
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    /// Creates a new SaleRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    /// Whether a sale with this ID is recorded.
    pub async fn exists(&self, sale_id: &str) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sales WHERE sale_id = ?1")
            .bind(sale_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Records a sale, its items and its SALE ledger entries.
    ///
    /// ## Idempotency
    /// A sale whose `sale_id` or `event_id` already exists yields
    /// [`RecordOutcome::Duplicate`], both from the pre-write check and from
    /// the UNIQUE constraints if two writers race.
    pub async fn record(&self, sale: &NewSale) -> DbResult<RecordOutcome> {
        match self.record_once(sale).await {
            Err(DbError::UniqueViolation { field, .. }) if field.starts_with("sales.") => {
                debug!(sale_id = %sale.sale_id, %field, "Sale recorded concurrently");
                Ok(RecordOutcome::Duplicate)
            }
            other => other,
        }
    }

    async fn record_once(&self, sale: &NewSale) -> DbResult<RecordOutcome> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT sale_id FROM sales WHERE sale_id = ?1 OR event_id = ?2 LIMIT 1",
        )
        .bind(&sale.sale_id)
        .bind(&sale.event_id)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            debug!(sale_id = %sale.sale_id, event_id = %sale.event_id, "Sale already recorded");
            return Ok(RecordOutcome::Duplicate);
        }

        let now = Utc::now();
        debug!(sale_id = %sale.sale_id, lines = sale.lines.len(), "Recording sale");

        sqlx::query(
            r#"
            INSERT INTO sales (sale_id, event_id, status, actor_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&sale.sale_id)
        .bind(&sale.event_id)
        .bind(SaleStatus::Completed)
        .bind(&sale.actor_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let mut entries = Vec::with_capacity(sale.lines.len());
        for (line_no, line) in sale.lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO sale_items (
                    item_id, sale_id, line_no, variant_id, location_id, quantity, reservation_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&sale.sale_id)
            .bind(line_no as i64)
            .bind(&line.variant_id)
            .bind(&line.location_id)
            .bind(line.quantity)
            .bind(&line.reservation_id)
            .execute(&mut *tx)
            .await?;

            let entry = LedgerEntry::new(
                &line.key(),
                MovementType::Sale,
                -line.quantity,
                &sale.sale_id,
                &sale.actor_id,
            );
            entries.push(append_in(&mut tx, &entry).await?);
        }

        tx.commit().await?;
        Ok(RecordOutcome::Recorded(entries))
    }

    /// Gets a sale and its items.
    pub async fn get(&self, sale_id: &str) -> DbResult<Option<Sale>> {
        let row: Option<SaleRow> = sqlx::query_as(
            r#"
            SELECT sale_id, event_id, status, actor_id, created_at, voided_at, void_reason
            FROM sales
            WHERE sale_id = ?1
            "#,
        )
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items: Vec<SaleItemRow> = sqlx::query_as(
            r#"
            SELECT item_id, sale_id, variant_id, location_id, quantity, reservation_id
            FROM sale_items
            WHERE sale_id = ?1
            ORDER BY line_no
            "#,
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Sale {
            sale_id: row.sale_id,
            event_id: row.event_id,
            status: row.status,
            actor_id: row.actor_id,
            created_at: row.created_at,
            voided_at: row.voided_at,
            void_reason: row.void_reason,
            items: items.into_iter().map(SaleItem::from).collect(),
        }))
    }

    /// Compensates a recorded sale with ROLLBACK entries and voids it.
    ///
    /// ## Errors
    /// `NotFound` when the sale was never recorded.
    pub async fn rollback(&self, sale_id: &str, actor_id: &str, reason: &str) -> DbResult<RollbackOutcome> {
        let mut tx = self.pool.begin().await?;

        let status: Option<SaleStatus> = sqlx::query_scalar("SELECT status FROM sales WHERE sale_id = ?1")
            .bind(sale_id)
            .fetch_optional(&mut *tx)
            .await?;
        if status.is_none() {
            return Err(DbError::not_found("Sale", sale_id));
        }

        let earlier = entries_for_reference_in(&mut tx, sale_id, Some(MovementType::Rollback)).await?;
        if !earlier.is_empty() {
            return Ok(RollbackOutcome::AlreadyRolledBack(earlier));
        }

        let items: Vec<SaleItemRow> = sqlx::query_as(
            r#"
            SELECT item_id, sale_id, variant_id, location_id, quantity, reservation_id
            FROM sale_items
            WHERE sale_id = ?1
            ORDER BY line_no
            "#,
        )
        .bind(sale_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut entries = Vec::with_capacity(items.len());
        for item in items.into_iter().map(SaleItem::from) {
            let entry = LedgerEntry::new(
                &item.key(),
                MovementType::Rollback,
                item.quantity,
                sale_id,
                actor_id,
            )
            .with_notes(reason);
            entries.push(append_in(&mut tx, &entry).await?);
        }

        sqlx::query(
            r#"
            UPDATE sales SET status = ?2, voided_at = ?3, void_reason = ?4
            WHERE sale_id = ?1
            "#,
        )
        .bind(sale_id)
        .bind(SaleStatus::Voided)
        .bind(Utc::now())
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(sale_id = %sale_id, entries = entries.len(), "Sale rolled back");
        Ok(RollbackOutcome::RolledBack(entries))
    }
}
