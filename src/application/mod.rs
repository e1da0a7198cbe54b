//! Application layer containing the ledger's business logic.
//!
//! `TransferEngine` owns the transfer algorithm, `queries` the read side and
//! account creation, and `Bank` bundles both behind an injected store.

pub mod bank;
pub mod engine;
pub mod queries;
