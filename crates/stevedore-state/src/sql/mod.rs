//! Relational backend for the entity store, backed by SQLite.
//!
//! The default backend. Entity blobs live as JSON columns; the fields the
//! store filters or joins on (IDs, names, pod membership, storage IDs) are
//! lifted into real columns with constraints.

mod schema;
mod store;

pub use store::SqliteState;
