//! # Validation Module
//!
//! Input validation for reservations, stock movements and sale events.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Reservation API (tally-engine)                               │
//! │  └── validate_stock_key / validate_quantity before touching counters   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Sales processor VALIDATING state                             │
//! │  └── validate_sale_event: malformed → dead-letter, never retried       │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── CHECK (quantity > 0), UNIQUE (event_id)                           │
//! │  └── Triggers rejecting UPDATE/DELETE on ledger_entries                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use uuid::Uuid;

use crate::error::ValidationError;
use crate::types::{SaleEvent, StockKey};
use crate::{MAX_LINE_QUANTITY, MAX_SALE_LINES};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Identifier Validators
// =============================================================================

/// Validates a non-empty identifier (variant, location, actor, reference).
pub fn validate_id(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if value.len() > 128 {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "longer than 128 characters".to_string(),
        });
    }
    // ':' separates key segments in Redis and routing keys
    if value.contains(':') {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not contain ':'".to_string(),
        });
    }
    Ok(())
}

/// Validates a UUID string (event and sale IDs on the wire).
pub fn validate_uuid(field: &str, value: &str) -> ValidationResult<()> {
    Uuid::parse_str(value).map_err(|e| ValidationError::InvalidFormat {
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

pub fn validate_stock_key(key: &StockKey) -> ValidationResult<()> {
    validate_id("variant_id", &key.variant_id)?;
    validate_id("location_id", &key.location_id)
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a reservation, sale or transfer quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_LINE_QUANTITY
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_LINE_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_LINE_QUANTITY,
        });
    }

    Ok(())
}

/// Validates an adjustment delta: any sign, never zero.
pub fn validate_delta(delta: i64) -> ValidationResult<()> {
    if delta == 0 {
        return Err(ValidationError::MustBeNonZero {
            field: "delta".to_string(),
        });
    }
    if delta.abs() > MAX_LINE_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "delta".to_string(),
            min: -MAX_LINE_QUANTITY,
            max: MAX_LINE_QUANTITY,
        });
    }
    Ok(())
}

/// Validates a transfer's endpoints.
pub fn validate_transfer(from: &StockKey, to: &StockKey) -> ValidationResult<()> {
    validate_stock_key(from)?;
    validate_stock_key(to)?;
    if from.variant_id != to.variant_id {
        return Err(ValidationError::InvalidFormat {
            field: "to.variant_id".to_string(),
            reason: "transfers move a single variant".to_string(),
        });
    }
    if from.location_id == to.location_id {
        return Err(ValidationError::MustDiffer {
            field: "to.location_id".to_string(),
            other: "from.location_id".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Event Validators
// =============================================================================

/// Validates a sale event before the processor writes anything.
///
/// ## Rules
/// - `event_id` and `sale_id` are UUIDs
/// - 1..=MAX_SALE_LINES lines
/// - Every line has a valid key and quantity
pub fn validate_sale_event(event: &SaleEvent) -> ValidationResult<()> {
    validate_uuid("event_id", &event.event_id)?;
    validate_uuid("sale_id", &event.sale_id)?;

    if event.lines.is_empty() {
        return Err(ValidationError::Required {
            field: "lines".to_string(),
        });
    }
    if event.lines.len() > MAX_SALE_LINES {
        return Err(ValidationError::TooMany {
            field: "lines".to_string(),
            max: MAX_SALE_LINES,
        });
    }

    for line in &event.lines {
        validate_stock_key(&line.key())?;
        validate_quantity(line.quantity)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SaleLine;

    fn line(v: &str, l: &str, q: i64) -> SaleLine {
        SaleLine {
            variant_id: v.into(),
            location_id: l.into(),
            quantity: q,
            reservation_id: None,
        }
    }

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(MAX_LINE_QUANTITY).is_ok());
        assert!(matches!(
            validate_quantity(0),
            Err(ValidationError::MustBePositive { .. })
        ));
        assert!(matches!(
            validate_quantity(MAX_LINE_QUANTITY + 1),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_validate_delta() {
        assert!(validate_delta(-3).is_ok());
        assert!(validate_delta(7).is_ok());
        assert!(matches!(
            validate_delta(0),
            Err(ValidationError::MustBeNonZero { .. })
        ));
    }

    #[test]
    fn test_validate_id_rejects_separator() {
        assert!(validate_id("variant_id", "sku-1").is_ok());
        assert!(validate_id("variant_id", "  ").is_err());
        assert!(validate_id("variant_id", "a:b").is_err());
    }

    #[test]
    fn test_validate_transfer() {
        let a = StockKey::new("v", "store-1");
        let b = StockKey::new("v", "store-2");
        assert!(validate_transfer(&a, &b).is_ok());
        assert!(matches!(
            validate_transfer(&a, &a),
            Err(ValidationError::MustDiffer { .. })
        ));
        assert!(validate_transfer(&a, &StockKey::new("w", "store-2")).is_err());
    }

    #[test]
    fn test_validate_sale_event() {
        let ok = SaleEvent::new(Uuid::new_v4().to_string(), vec![line("A", "1", 3)]);
        assert!(validate_sale_event(&ok).is_ok());

        let mut bad_id = ok.clone();
        bad_id.event_id = "not-a-uuid".into();
        assert!(matches!(
            validate_sale_event(&bad_id),
            Err(ValidationError::InvalidFormat { .. })
        ));

        let mut empty = ok.clone();
        empty.lines.clear();
        assert!(matches!(
            validate_sale_event(&empty),
            Err(ValidationError::Required { .. })
        ));

        let mut zero = ok;
        zero.lines.push(line("B", "1", 0));
        assert!(validate_sale_event(&zero).is_err());
    }
}
