//! # tally-db: Ledger Store for Tally
//!
//! Durable, append-only record of stock movements keyed by
//! (variant, location), stored in SQLite via sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tally Data Flow                                │
//! │                                                                         │
//! │  SalesProcessor / StockQueryService (tally-engine)                     │
//! │       │                                                                 │
//! │       ▼  dyn LedgerStore                                               │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ LedgerRepo    │    │ 001_ledger   │  │   │
//! │  │   │ SqlitePool    │◄───│ SaleRepo      │    │ 002_sales    │  │   │
//! │  │   │ WAL mode      │    │               │    │ 003_drift    │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Ledger and sale repositories
//! - [`store`] - The `LedgerStore` capability trait
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig, LedgerStore};
//!
//! let db = Database::new(DbConfig::new("ledger.db")).await?;
//! let on_hand = db.current_stock(&StockKey::new("A", "1")).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use store::LedgerStore;

pub use repository::ledger::{DriftRecord, LedgerRepository, StockCheck};
pub use repository::sale::{NewSale, RecordOutcome, RollbackOutcome, SaleRepository};
