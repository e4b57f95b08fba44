//! Persistent entity store for the Stevedore engine.
//!
//! Durably tracks containers, pods, volumes, network attachments, exec
//! sessions, and exit codes across process restarts and host reboots, while
//! multiple independent processes operate on the same store concurrently.
//!
//! Two interchangeable backends implement the same [`EntityStore`] contract:
//! an embedded key-value engine ([`kv`], redb) and an embedded relational
//! engine ([`sql`], SQLite). The backend is selected once, when the store is
//! first created, and validated on every subsequent open.
//!
//! Callers never touch the store directly for mutable state; the
//! [`Container`], [`Pod`], and [`Volume`] wrappers apply the
//! lock-then-resync protocol around every access.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod error;
pub mod kv;
pub mod lock;
pub mod pod;
pub mod sql;
pub mod store;
pub mod volume;

pub use container::{Batched, Container};
pub use error::{Result, StateError};
pub use kv::KvState;
pub use lock::{InProcessLockManager, LockManager, StoreLock};
pub use pod::Pod;
pub use sql::SqliteState;
pub use store::{EntityStore, open};
pub use volume::Volume;
