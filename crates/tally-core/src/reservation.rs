//! # Reservation Lifecycle
//!
//! Pure transition rules for [`Reservation`]. Every fast-path store applies
//! transitions through [`apply`] (or a server-side script with identical
//! rules) so the counters move exactly once per transition.
//!
//! ## Transition Table
//! ```text
//! ┌──────────────┬───────────┬────────────────────┬─────────────────────────┐
//! │ Transition   │ From      │ To                 │ Counter effect          │
//! ├──────────────┼───────────┼────────────────────┼─────────────────────────┤
//! │ Commit       │ HELD      │ COMMITTED          │ none                    │
//! │ Release      │ HELD      │ RELEASED           │ reserved -= q           │
//! │ Expire       │ HELD, due │ EXPIRED            │ reserved -= q           │
//! │ Settle       │ COMMITTED │ COMMITTED, settled │ reserved -= q,          │
//! │              │           │                    │ on_hand  -= q           │
//! │ Compensate   │ HELD /    │ RELEASED           │ reserved -= q           │
//! │              │ COMMITTED │                    │                         │
//! └──────────────┴───────────┴────────────────────┴─────────────────────────┘
//! ```
//!
//! Repeating a transition that already happened is `Unchanged`, never an
//! error. That keeps `commit` idempotent and lets redelivered events settle
//! safely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{Reservation, ReservationStatus};

/// A requested lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transition {
    /// Checkout confirmed; the sale event is about to be published.
    Commit { sale_id: String },
    /// Checkout failed or was cancelled.
    Release,
    /// Sweep or lazy read found the hold past its deadline.
    Expire { now: DateTime<Utc> },
    /// The sales processor durably recorded the sale.
    Settle,
    /// The sale event was dead-lettered; return the stock.
    Compensate,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Commit { .. } => "commit",
            Transition::Release => "release",
            Transition::Expire { .. } => "expire",
            Transition::Settle => "settle",
            Transition::Compensate => "compensate",
        }
    }
}

/// Change to apply to the unit's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub reserved: i64,
    pub on_hand: i64,
}

impl CounterDelta {
    pub const NONE: CounterDelta = CounterDelta {
        reserved: 0,
        on_hand: 0,
    };
}

/// Result of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The reservation changed; apply `delta` to the counters.
    Applied(CounterDelta),
    /// Already in the requested state (or not yet due). Nothing to do.
    Unchanged,
}

/// Applies `transition` to `reservation` in place.
pub fn apply(reservation: &mut Reservation, transition: &Transition) -> CoreResult<TransitionOutcome> {
    use ReservationStatus::*;

    let q = reservation.quantity;
    let reject = |r: &Reservation| CoreError::InvalidTransition {
        reservation_id: r.reservation_id.clone(),
        status: r.status,
        action: transition.name(),
    };

    let outcome = match (transition, reservation.status) {
        (Transition::Commit { sale_id }, Held) => {
            reservation.status = Committed;
            reservation.sale_id = Some(sale_id.clone());
            TransitionOutcome::Applied(CounterDelta::NONE)
        }
        (Transition::Commit { .. }, Committed) => TransitionOutcome::Unchanged,
        (Transition::Commit { .. }, Released | Expired) => return Err(reject(reservation)),

        (Transition::Release, Held) => {
            reservation.status = Released;
            TransitionOutcome::Applied(CounterDelta {
                reserved: -q,
                on_hand: 0,
            })
        }
        (Transition::Release, Released | Expired) => TransitionOutcome::Unchanged,
        (Transition::Release, Committed) => return Err(reject(reservation)),

        (Transition::Expire { now }, Held) if reservation.expires_at < *now => {
            reservation.status = Expired;
            TransitionOutcome::Applied(CounterDelta {
                reserved: -q,
                on_hand: 0,
            })
        }
        (Transition::Expire { .. }, _) => TransitionOutcome::Unchanged,

        (Transition::Settle, Committed) if !reservation.settled => {
            reservation.settled = true;
            TransitionOutcome::Applied(CounterDelta {
                reserved: -q,
                on_hand: -q,
            })
        }
        (Transition::Settle, Committed) => TransitionOutcome::Unchanged,
        (Transition::Settle, _) => return Err(reject(reservation)),

        (Transition::Compensate, Committed) if reservation.settled => return Err(reject(reservation)),
        (Transition::Compensate, Held | Committed) => {
            reservation.status = Released;
            TransitionOutcome::Applied(CounterDelta {
                reserved: -q,
                on_hand: 0,
            })
        }
        (Transition::Compensate, Released | Expired) => TransitionOutcome::Unchanged,
    };

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StockKey;
    use chrono::Duration;

    fn held(qty: i64) -> Reservation {
        Reservation::hold(&StockKey::new("v", "l"), qty, Utc::now(), Duration::seconds(60))
    }

    #[test]
    fn test_commit_is_idempotent() {
        let mut r = held(3);
        let first = apply(&mut r, &Transition::Commit { sale_id: "s1".into() }).unwrap();
        assert_eq!(first, TransitionOutcome::Applied(CounterDelta::NONE));
        assert_eq!(r.status, ReservationStatus::Committed);

        let again = apply(&mut r, &Transition::Commit { sale_id: "s2".into() }).unwrap();
        assert_eq!(again, TransitionOutcome::Unchanged);
        assert_eq!(r.sale_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_release_returns_quantity_once() {
        let mut r = held(4);
        let out = apply(&mut r, &Transition::Release).unwrap();
        assert_eq!(
            out,
            TransitionOutcome::Applied(CounterDelta {
                reserved: -4,
                on_hand: 0
            })
        );
        assert_eq!(apply(&mut r, &Transition::Release).unwrap(), TransitionOutcome::Unchanged);
    }

    #[test]
    fn test_release_after_commit_is_rejected() {
        let mut r = held(1);
        apply(&mut r, &Transition::Commit { sale_id: "s".into() }).unwrap();
        let err = apply(&mut r, &Transition::Release).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { action: "release", .. }));
    }

    #[test]
    fn test_commit_after_expiry_is_rejected() {
        let mut r = held(1);
        let later = r.expires_at + Duration::seconds(1);
        apply(&mut r, &Transition::Expire { now: later }).unwrap();
        assert_eq!(r.status, ReservationStatus::Expired);
        assert!(apply(&mut r, &Transition::Commit { sale_id: "s".into() }).is_err());
    }

    #[test]
    fn test_expire_only_when_due() {
        let mut r = held(2);
        let early = r.expires_at - Duration::seconds(1);
        assert_eq!(
            apply(&mut r, &Transition::Expire { now: early }).unwrap(),
            TransitionOutcome::Unchanged
        );
        assert_eq!(r.status, ReservationStatus::Held);
    }

    #[test]
    fn test_settle_moves_both_counters_once() {
        let mut r = held(5);
        apply(&mut r, &Transition::Commit { sale_id: "s".into() }).unwrap();
        assert_eq!(
            apply(&mut r, &Transition::Settle).unwrap(),
            TransitionOutcome::Applied(CounterDelta {
                reserved: -5,
                on_hand: -5
            })
        );
        assert!(r.settled);
        assert_eq!(apply(&mut r, &Transition::Settle).unwrap(), TransitionOutcome::Unchanged);
    }

    #[test]
    fn test_settle_requires_commit() {
        let mut r = held(1);
        assert!(apply(&mut r, &Transition::Settle).is_err());
    }

    #[test]
    fn test_compensate_unsettled_commit() {
        let mut r = held(2);
        apply(&mut r, &Transition::Commit { sale_id: "s".into() }).unwrap();
        let out = apply(&mut r, &Transition::Compensate).unwrap();
        assert_eq!(
            out,
            TransitionOutcome::Applied(CounterDelta {
                reserved: -2,
                on_hand: 0
            })
        );
        assert_eq!(r.status, ReservationStatus::Released);
        assert_eq!(apply(&mut r, &Transition::Compensate).unwrap(), TransitionOutcome::Unchanged);
    }

    #[test]
    fn test_compensate_settled_is_rejected() {
        let mut r = held(2);
        apply(&mut r, &Transition::Commit { sale_id: "s".into() }).unwrap();
        apply(&mut r, &Transition::Settle).unwrap();
        assert!(apply(&mut r, &Transition::Compensate).is_err());
    }
}
