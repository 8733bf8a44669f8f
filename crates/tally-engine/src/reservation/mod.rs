//! # Reservations
//!
//! Fast-path stock holds. [`ReservationEngine`] is the checkout API; the
//! [`ReservationStore`] trait is the atomic counter service behind it.

pub mod engine;
pub mod memory;
pub mod redis;
pub mod store;
pub mod sweeper;

pub use engine::{CommitReceipt, ReservationEngine};
pub use memory::MemoryReservationStore;
pub use redis::RedisReservationStore;
pub use store::{ReservationStore, ReserveAttempt, ResyncOutcome, SeedOutcome, TransitionResult};
pub use sweeper::{ExpirySweeper, ExpirySweeperHandle};
