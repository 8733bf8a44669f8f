//! # Ledger Repository
//!
//! Append-only stock movements and the running totals derived from them.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    append(entries, check)                               │
//! │                                                                         │
//! │  BEGIN                                                                  │
//! │   ├── for each entry:                                                   │
//! │   │     ├── check == NonNegative? read stock_levels, reject if < 0     │
//! │   │     ├── INSERT INTO ledger_entries      (seq assigned)             │
//! │   │     └── UPSERT stock_levels += delta    (running total)            │
//! │  COMMIT                                                                 │
//! │                                                                         │
//! │  Both tables change in one transaction, so the running total can only  │
//! │  drift through a bug. verify() compares it with SUM(delta).            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{LedgerCursor, LedgerEntry, MovementType, StockKey, StockLine};

/// Guard applied to a batch of appended entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockCheck {
    /// Append unconditionally (sales, restocks, rollbacks).
    Unchecked,
    /// Reject the whole batch if any key would drop below zero.
    NonNegative,
}

/// A mismatch between the running total and the ledger sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DriftRecord {
    pub id: i64,
    pub variant_id: String,
    pub location_id: String,
    pub running_total: i64,
    pub ledger_sum: i64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    seq: i64,
    entry_id: String,
    variant_id: String,
    location_id: String,
    movement_type: MovementType,
    delta: i64,
    reference_id: String,
    actor_id: String,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        LedgerEntry {
            entry_id: row.entry_id,
            variant_id: row.variant_id,
            location_id: row.location_id,
            movement_type: row.movement_type,
            delta: row.delta,
            reference_id: row.reference_id,
            actor_id: row.actor_id,
            notes: row.notes,
            created_at: row.created_at,
            sequence: row.seq,
        }
    }
}

const ENTRY_COLUMNS: &str = "seq, entry_id, variant_id, location_id, movement_type, delta, \
                             reference_id, actor_id, notes, created_at";

/// Repository for ledger database operations.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    /// Creates a new LedgerRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LedgerRepository { pool }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Appends a batch of entries atomically.
    ///
    /// ## Returns
    /// The entries with their store-assigned `sequence`.
    pub async fn append(&self, entries: &[LedgerEntry], check: StockCheck) -> DbResult<Vec<LedgerEntry>> {
        let mut tx = self.pool.begin().await?;
        let mut written = Vec::with_capacity(entries.len());

        for entry in entries {
            let key = entry.key();
            if check == StockCheck::NonNegative {
                let current = level_in(&mut tx, &key).await?;
                if current + entry.delta < 0 {
                    return Err(DbError::NegativeStock {
                        key: key.to_string(),
                        current,
                        delta: entry.delta,
                    });
                }
            }
            written.push(append_in(&mut tx, entry).await?);
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Writes one drift finding to the audit trail.
    pub async fn record_drift(&self, key: &StockKey, running_total: i64, ledger_sum: i64) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_drift_audit (variant_id, location_id, running_total, ledger_sum, detected_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&key.variant_id)
        .bind(&key.location_id)
        .bind(running_total)
        .bind(ledger_sum)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Running total for a key. Zero when the key has no entries.
    pub async fn current_stock(&self, key: &StockKey) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        level_in(&mut conn, key).await
    }

    /// SUM(delta) over the full ledger for a key.
    pub async fn scan_stock(&self, key: &StockKey) -> DbResult<i64> {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(delta), 0) FROM ledger_entries WHERE variant_id = ?1 AND location_id = ?2",
        )
        .bind(&key.variant_id)
        .bind(&key.location_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    /// One page of a key's ledger, oldest first.
    ///
    /// ## Arguments
    /// * `since` - Only entries created at or after this instant
    /// * `after` - Resume strictly after this entry
    /// * `limit` - Page size
    pub async fn page(
        &self,
        key: &StockKey,
        since: Option<DateTime<Utc>>,
        after: Option<LedgerCursor>,
        limit: u32,
    ) -> DbResult<Vec<LedgerEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ledger_entries
            WHERE variant_id = ?1 AND location_id = ?2
              AND (?3 IS NULL OR created_at_us >= ?3)
              AND (?4 IS NULL OR created_at_us > ?4 OR (created_at_us = ?4 AND seq > ?5))
            ORDER BY created_at_us ASC, seq ASC
            LIMIT ?6
            "#
        );

        let rows: Vec<LedgerRow> = sqlx::query_as(&sql)
            .bind(&key.variant_id)
            .bind(&key.location_id)
            .bind(since.map(|t| t.timestamp_micros()))
            .bind(after.map(|c| c.created_at.timestamp_micros()))
            .bind(after.map(|c| c.sequence))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    /// Every entry referencing a sale, transfer or adjustment.
    pub async fn entries_for_reference(&self, reference_id: &str) -> DbResult<Vec<LedgerEntry>> {
        let mut conn = self.pool.acquire().await?;
        entries_for_reference_in(&mut conn, reference_id, None).await
    }

    /// Every key with a running total or at least one entry.
    pub async fn stock_keys(&self) -> DbResult<Vec<StockKey>> {
        let keys: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT variant_id, location_id FROM stock_levels
            UNION
            SELECT variant_id, location_id FROM ledger_entries
            ORDER BY 1, 2
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(keys.into_iter().map(|(v, l)| StockKey::new(v, l)).collect())
    }

    /// Stock of one variant at every location.
    pub async fn stock_by_variant(&self, variant_id: &str) -> DbResult<Vec<StockLine>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT variant_id, location_id, quantity
            FROM stock_levels
            WHERE variant_id = ?1
            ORDER BY location_id
            "#,
        )
        .bind(variant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(stock_line).collect())
    }

    /// Units at or below `threshold`, lowest first.
    pub async fn low_stock(&self, threshold: i64) -> DbResult<Vec<StockLine>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT variant_id, location_id, quantity
            FROM stock_levels
            WHERE quantity <= ?1
            ORDER BY quantity ASC, variant_id, location_id
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(stock_line).collect())
    }

    /// Most recent drift findings first.
    pub async fn drift_audit(&self, limit: u32) -> DbResult<Vec<DriftRecord>> {
        let rows = sqlx::query_as::<_, DriftRecord>(
            r#"
            SELECT id, variant_id, location_id, running_total, ledger_sum, detected_at
            FROM ledger_drift_audit
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn stock_line((variant_id, location_id, quantity): (String, String, i64)) -> StockLine {
    StockLine {
        variant_id,
        location_id,
        quantity,
    }
}

// =============================================================================
// Transaction Helpers (shared with the sale repository)
// =============================================================================

/// Inserts one entry and folds its delta into the running total.
pub(crate) async fn append_in(conn: &mut SqliteConnection, entry: &LedgerEntry) -> DbResult<LedgerEntry> {
    debug!(
        entry_id = %entry.entry_id,
        key = %entry.key(),
        movement = entry.movement_type.as_str(),
        delta = entry.delta,
        "Appending ledger entry"
    );

    let result = sqlx::query(
        r#"
        INSERT INTO ledger_entries (
            entry_id, variant_id, location_id, movement_type, delta,
            reference_id, actor_id, notes, created_at, created_at_us
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&entry.entry_id)
    .bind(&entry.variant_id)
    .bind(&entry.location_id)
    .bind(entry.movement_type)
    .bind(entry.delta)
    .bind(&entry.reference_id)
    .bind(&entry.actor_id)
    .bind(&entry.notes)
    .bind(entry.created_at)
    .bind(entry.created_at.timestamp_micros())
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO stock_levels (variant_id, location_id, quantity, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (variant_id, location_id)
        DO UPDATE SET quantity = quantity + excluded.quantity, updated_at = excluded.updated_at
        "#,
    )
    .bind(&entry.variant_id)
    .bind(&entry.location_id)
    .bind(entry.delta)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;

    let mut written = entry.clone();
    written.sequence = result.last_insert_rowid();
    Ok(written)
}

/// Running total for a key as seen by `conn`.
pub(crate) async fn level_in(conn: &mut SqliteConnection, key: &StockKey) -> DbResult<i64> {
    let quantity: Option<i64> = sqlx::query_scalar(
        "SELECT quantity FROM stock_levels WHERE variant_id = ?1 AND location_id = ?2",
    )
    .bind(&key.variant_id)
    .bind(&key.location_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(quantity.unwrap_or(0))
}

pub(crate) async fn entries_for_reference_in(
    conn: &mut SqliteConnection,
    reference_id: &str,
    movement_type: Option<MovementType>,
) -> DbResult<Vec<LedgerEntry>> {
    let sql = format!(
        r#"
        SELECT {ENTRY_COLUMNS}
        FROM ledger_entries
        WHERE reference_id = ?1 AND (?2 IS NULL OR movement_type = ?2)
        ORDER BY seq ASC
        "#
    );
    let rows: Vec<LedgerRow> = sqlx::query_as(&sql)
        .bind(reference_id)
        .bind(movement_type)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(LedgerEntry::from).collect())
}
