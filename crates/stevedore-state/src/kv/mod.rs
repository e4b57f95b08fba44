//! Key-value backend for the entity store, backed by redb.
//!
//! Deprecated in favor of the relational backend; kept for stores created
//! before the switch. Creating a new store with this backend requires an
//! explicit environment override.

pub mod tables;

mod store;

pub use store::KvState;
