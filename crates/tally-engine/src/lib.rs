//! # tally-engine: Reservations, Event Channel and Sales Processor
//!
//! Everything between the checkout surface and the ledger.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           tally-engine                                  │
//! │                                                                         │
//! │  checkout ──reserve/commit/release──► ┌──────────────────────────┐      │
//! │                                       │   ReservationEngine      │      │
//! │                                       │   (fast-path counters)   │      │
//! │                                       └──────┬─────────────┬─────┘      │
//! │                      ReservationStore ◄──────┘             │ SaleEvent  │
//! │                      (Redis Lua / memory)                  ▼            │
//! │                                              ┌──────────────────────┐   │
//! │                                              │    EventChannel      │   │
//! │                                              │ (partitioned, DLQ)   │   │
//! │                                              └──────────┬───────────┘   │
//! │                                                         │ consume       │
//! │  ┌──────────────────┐   settle / compensate  ┌──────────▼───────────┐   │
//! │  │ ExpirySweeper    │◄───────────────────────│   SalesProcessor     │   │
//! │  │ Reconciler       │                        │ (sole ledger writer) │   │
//! │  └────────┬─────────┘                        └──────────┬───────────┘   │
//! │           │              StockQueryService              │               │
//! │           └────────────────────┬────────────────────────┘               │
//! │                                ▼                                        │
//! │                       tally-db (LedgerStore)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`reservation`] - Atomic holds, commit, release, expiry
//! - [`channel`] - Partitioned at-least-once delivery with dead-lettering
//! - [`processor`] - Sale events and stock movements into the ledger
//! - [`query`] - Ledger reads, dead letters, drift checks
//! - [`reconciler`] - Periodic ledger and counter consistency pass
//! - [`config`] - `tally.toml` configuration
//! - [`error`] - Error taxonomy

pub mod channel;
pub mod config;
pub mod error;
pub mod processor;
pub mod query;
pub mod reconciler;
pub mod reservation;

pub use channel::{DeadLetter, Delivery, EventChannel, MemoryChannel, NackOutcome, RedisStreamsChannel};
pub use config::TallyConfig;
pub use error::{ChannelError, StockError, StockResult, StoreError};
pub use processor::{ProcessOutcome, ProcessorHandle, SalesProcessor};
pub use query::StockQueryService;
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerHandle};
pub use reservation::{
    CommitReceipt, ExpirySweeper, ExpirySweeperHandle, MemoryReservationStore, RedisReservationStore, ReservationEngine,
    ReservationStore,
};
