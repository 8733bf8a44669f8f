//! # tally-core: Pure Domain Logic for Tally
//!
//! Types and rules shared by every layer of the stock-reservation and
//! inventory-ledger subsystem. Zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tally Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  Checkout flow (external)                       │   │
//! │  │        reserve ──► commit ──► (release on failure)              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   tally-engine: reservations · event channel · sales processor  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌─────────────┐  ┌───────────┐                │   │
//! │  │   │   types   │  │ reservation │  │ validation│                │   │
//! │  │   │ StockKey  │  │ Transition  │  │   rules   │                │   │
//! │  │   │ SaleEvent │  │ CounterDelta│  │  checks   │                │   │
//! │  │   └───────────┘  └─────────────┘  └───────────┘                │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 tally-db (Ledger Store, SQLite)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (StockKey, LedgerEntry, Reservation, SaleEvent)
//! - [`reservation`] - Reservation lifecycle transitions and counter effects
//! - [`error`] - Domain error types
//! - [`validation`] - Input and event validation
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::StockKey;
//!
//! let key = StockKey::new("variant-a", "store-1");
//! assert_eq!(key.redis_key(), "stock:variant-a:store-1");
//! assert!(key.partition(16) < 16);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod reservation;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use reservation::{CounterDelta, Transition, TransitionOutcome};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default reservation hold time (5 minutes).
///
/// ## Business Reason
/// Long enough for a cashier to take payment, short enough that an
/// abandoned checkout never locks stock for long.
pub const DEFAULT_RESERVATION_TTL_SECS: u64 = 300;

/// Maximum lines in a single sale event.
pub const MAX_SALE_LINES: usize = 100;

/// Maximum quantity for a single reservation or sale line.
///
/// Guards against typos (1000 instead of 10) reaching the counters.
pub const MAX_LINE_QUANTITY: i64 = 9_999;

/// Actor recorded on ledger entries written without a human actor.
pub const SYSTEM_ACTOR: &str = "system";
