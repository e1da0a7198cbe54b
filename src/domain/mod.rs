//! Domain layer: ledger entities, value objects and the storage ports the
//! application layer talks to.

pub mod account;
pub mod payment;
pub mod policy;
pub mod ports;
