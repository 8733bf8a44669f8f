//! # Repository Module
//!
//! Database repository implementations for the ledger store.
//!
//! ## Available Repositories
//!
//! - [`LedgerRepository`](ledger::LedgerRepository) - Append-only entries, running totals, drift audit
//! - [`SaleRepository`](sale::SaleRepository) - Sale recording and rollback
//!
//! Both share the transaction helpers in [`ledger`], so every ledger write
//! updates `stock_levels` in the same transaction.

pub mod ledger;
pub mod sale;
