//! # Engine Error Types
//!
//! The error taxonomy seen by checkout callers and operators.
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       StockError Taxonomy                               │
//! │                                                                         │
//! │  Reservation path (returned synchronously to checkout)                 │
//! │  ├── InsufficientStock     "stock unavailable"  · not retried          │
//! │  ├── ContentionExceeded    transient            · caller may retry     │
//! │  └── StoreUnavailable      "system unavailable" · fail closed          │
//! │                                                                         │
//! │  Processor path (retried or dead-lettered)                             │
//! │  ├── DuplicateEvent        idempotency hit      · acknowledged         │
//! │  ├── MalformedEvent        permanent            · dead-lettered, alert │
//! │  ├── TransientWriteFailure redelivered          · bounded by DLQ       │
//! │  └── LedgerDriftDetected   critical             · logged, audited      │
//! │                                                                         │
//! │  Backend errors                                                        │
//! │  ├── StoreError   (fast-path store)  → StoreUnavailable                │
//! │  ├── ChannelError (event channel)    → Channel                         │
//! │  └── DbError      (ledger store)     → by category                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use tally_core::{CoreError, ReservationStatus, ValidationError};
use tally_db::DbError;

// =============================================================================
// Stock Error
// =============================================================================

/// Errors surfaced by the reservation engine, processor and query service.
#[derive(Debug, Error)]
pub enum StockError {
    // =========================================================================
    // Reservation Errors
    // =========================================================================
    /// Not enough stock. A normal rejection, shown to the customer.
    #[error("Insufficient stock for {key}: available {available}, requested {requested}")]
    InsufficientStock {
        key: String,
        available: i64,
        requested: i64,
    },

    /// The atomic reserve kept losing races.
    #[error("Contention exceeded for {key} after {attempts} attempts")]
    ContentionExceeded { key: String, attempts: u32 },

    /// The fast-path store could not be reached within the retry window.
    #[error("Reservation store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    /// The reservation is in a state that forbids the operation.
    #[error("Reservation {reservation_id} is {status:?}")]
    ReservationNotActive {
        reservation_id: String,
        status: ReservationStatus,
    },

    // =========================================================================
    // Processor Errors
    // =========================================================================
    /// The sale was already recorded.
    #[error("Duplicate event {event_id} for sale {sale_id}")]
    DuplicateEvent { event_id: String, sale_id: String },

    /// The payload can never be processed.
    #[error("Malformed event {message_id}: {reason}")]
    MalformedEvent { message_id: String, reason: String },

    /// The durable write failed in a way that may succeed later.
    #[error("Transient write failure: {0}")]
    TransientWriteFailure(String),

    /// The running total disagrees with the ledger sum.
    #[error("Ledger drift for {key}: running total {running_total}, ledger sum {ledger_sum}")]
    LedgerDriftDetected {
        key: String,
        running_total: i64,
        ledger_sum: i64,
    },

    // =========================================================================
    // Movement Errors
    // =========================================================================
    #[error("Sale not found: {0}")]
    SaleNotFound(String),

    /// A restock, adjustment or transfer that can never be applied.
    #[error("Invalid movement: {0}")]
    InvalidMovement(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Database error: {0}")]
    Database(DbError),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// A background task is stopping.
    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Result type for engine operations.
pub type StockResult<T> = Result<T, StockError>;

// =============================================================================
// Backend Errors
// =============================================================================

/// Fast-path reservation store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection refused, dropped or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Unexpected reply or corrupt record.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Event channel failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// The delivery's lease expired and the message may be redelivered elsewhere.
    #[error("lease lost for message {message_id}")]
    LeaseLost { message_id: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("channel backend error: {0}")]
    Backend(String),
}

impl ChannelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Unavailable(_))
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for StockError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NegativeStock { key, current, delta } => StockError::InsufficientStock {
                key,
                available: current,
                requested: -delta,
            },
            DbError::NotFound { ref entity, ref id } if entity == "Sale" => {
                StockError::SaleNotFound(id.clone())
            }
            e if e.is_transient() => StockError::TransientWriteFailure(e.to_string()),
            e => StockError::Database(e),
        }
    }
}

impl From<StoreError> for StockError {
    fn from(err: StoreError) -> Self {
        StockError::StoreUnavailable(err.to_string())
    }
}

impl From<CoreError> for StockError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InsufficientStock {
                key,
                available,
                requested,
            } => StockError::InsufficientStock {
                key,
                available,
                requested,
            },
            CoreError::InvalidTransition {
                reservation_id,
                status,
                ..
            } => StockError::ReservationNotActive {
                reservation_id,
                status,
            },
            CoreError::Validation(v) => StockError::Validation(v),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

impl From<redis::RedisError> for ChannelError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            ChannelError::Unavailable(err.to_string())
        } else {
            ChannelError::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StockError {
    fn from(err: std::io::Error) -> Self {
        StockError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for StockError {
    fn from(err: toml::de::Error) -> Self {
        StockError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for StockError {
    fn from(err: toml::ser::Error) -> Self {
        StockError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl StockError {
    /// Returns true if the same operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            StockError::ContentionExceeded { .. }
            | StockError::StoreUnavailable(_)
            | StockError::TransientWriteFailure(_) => true,
            StockError::Channel(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// "Stock unavailable": the customer-facing rejection.
    pub fn is_stock_unavailable(&self) -> bool {
        matches!(self, StockError::InsufficientStock { .. })
    }

    /// Errors the checkout surface shows verbatim to the operator.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            StockError::InsufficientStock { .. }
                | StockError::ReservationNotFound(_)
                | StockError::ReservationNotActive { .. }
                | StockError::Validation(_)
                | StockError::InvalidMovement(_)
        )
    }

    /// "System unavailable": checkout failed closed on infrastructure.
    pub fn is_system_unavailable(&self) -> bool {
        matches!(
            self,
            StockError::StoreUnavailable(_)
                | StockError::ContentionExceeded { .. }
                | StockError::TransientWriteFailure(_)
                | StockError::Channel(_)
                | StockError::Database(_)
                | StockError::ShuttingDown
        )
    }

    /// Errors that will fail identically on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            StockError::MalformedEvent { .. }
                | StockError::Validation(_)
                | StockError::SaleNotFound(_)
                | StockError::InvalidMovement(_)
                | StockError::Database(_)
        )
    }

    /// Configuration problems.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            StockError::InvalidConfig(_) | StockError::ConfigLoadFailed(_) | StockError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_vs_system_unavailable() {
        let stock = StockError::InsufficientStock {
            key: "A@1".into(),
            available: 4,
            requested: 6,
        };
        assert!(stock.is_stock_unavailable());
        assert!(!stock.is_system_unavailable());
        assert!(!stock.is_retryable());

        let system = StockError::StoreUnavailable("refused".into());
        assert!(!system.is_stock_unavailable());
        assert!(system.is_system_unavailable());
        assert!(system.is_retryable());
    }

    #[test]
    fn test_db_error_mapping() {
        let err: StockError = DbError::NegativeStock {
            key: "A@1".into(),
            current: 2,
            delta: -5,
        }
        .into();
        assert!(matches!(
            err,
            StockError::InsufficientStock {
                available: 2,
                requested: 5,
                ..
            }
        ));

        let err: StockError = DbError::PoolExhausted.into();
        assert!(matches!(err, StockError::TransientWriteFailure(_)));

        let err: StockError = DbError::not_found("Sale", "s-1").into();
        assert!(matches!(err, StockError::SaleNotFound(ref id) if id == "s-1"));

        let err: StockError = DbError::QueryFailed("no such table".into()).into();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_malformed_is_permanent() {
        let err = StockError::MalformedEvent {
            message_id: "1-0".into(),
            reason: "bad json".into(),
        };
        assert!(err.is_permanent());
        assert!(!err.is_retryable());
    }
}
