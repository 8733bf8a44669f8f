//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Domain rule violations                         │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Ledger storage failures                        │
//! │                                                                         │
//! │  tally-engine errors                                                   │
//! │  └── StockError       - What the checkout caller / operator sees       │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → StockError → caller               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::types::ReservationStatus;

// =============================================================================
// Core Error
// =============================================================================

/// Domain rule violations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Not enough stock to hold or move the requested quantity.
    ///
    /// ## When This Occurs
    /// - A reservation asks for more than `on_hand - reserved`
    /// - A transfer or negative adjustment would drive stock below zero
    ///
    /// ## User Workflow
    /// ```text
    /// reserve(variant A, store 1, qty 6)
    ///      │
    ///      ▼
    /// available = 4
    ///      │
    ///      ▼
    /// InsufficientStock { key: "A@1", available: 4, requested: 6 }
    ///      │
    ///      ▼
    /// Checkout shows: "Only 4 in stock"
    /// ```
    #[error("Insufficient stock for {key}: available {available}, requested {requested}")]
    InsufficientStock {
        key: String,
        available: i64,
        requested: i64,
    },

    /// A reservation transition is not allowed from its current status.
    ///
    /// ## When This Occurs
    /// - Committing a reservation that was already released or expired
    /// - Releasing a reservation that was already committed
    #[error("Reservation {reservation_id} is {status:?}, cannot {action}")]
    InvalidTransition {
        reservation_id: String,
        status: ReservationStatus,
        action: &'static str,
    },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before any counter or ledger is touched.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be zero.
    #[error("{field} must not be zero")]
    MustBeNonZero { field: String },

    /// Invalid format (e.g., invalid UUID).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Too many entries in a collection.
    #[error("{field} cannot have more than {max} entries")]
    TooMany { field: String, max: usize },

    /// Two values that must differ are equal.
    #[error("{field} must differ from {other}")]
    MustDiffer { field: String, other: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InsufficientStock {
            key: "A@1".to_string(),
            available: 4,
            requested: 6,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient stock for A@1: available 4, requested 6"
        );

        let err = CoreError::InvalidTransition {
            reservation_id: "r-1".to_string(),
            status: ReservationStatus::Released,
            action: "commit",
        };
        assert_eq!(err.to_string(), "Reservation r-1 is Released, cannot commit");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let err: CoreError = ValidationError::MustBeNonZero {
            field: "delta".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(err.to_string(), "Validation error: delta must not be zero");
    }
}
