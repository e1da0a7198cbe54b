//! Storage adapters implementing [`crate::domain::ports::LedgerStore`].

pub mod in_memory;
#[cfg(feature = "storage-postgres")]
pub mod postgres;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod row_locks;
pub mod staging;
