//! Cross-process lock allocation for store entities.
//!
//! Every container, pod, and volume carries a lock referenced by a small
//! integer handle persisted in its config. The underlying primitive (file
//! lock, named semaphore, in-process mutex) is chosen by the deployment
//! context; the store only depends on the [`LockManager`] capability.
//!
//! Lock ordering for operations spanning entity kinds is fixed: the
//! dependent entity is always locked before its dependency (a container
//! before the volumes it mounts, a pod before its member containers). This
//! ordering must never be reversed, or two processes can deadlock against
//! each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Result, StateError};

/// One allocated entity lock.
///
/// `lock`/`unlock` are explicit rather than RAII because the handle models a
/// cross-process primitive: the holder may release it on a different call
/// path than the one that acquired it, and the guard state lives outside the
/// process in most deployments.
pub trait StoreLock: std::fmt::Debug + Send + Sync {
    /// The small integer handle identifying this lock, persisted in entity
    /// configs.
    fn id(&self) -> u32;

    /// Blocks until the lock is held by this caller.
    fn lock(&self);

    /// Releases the lock.
    fn unlock(&self);
}

/// Allocates and resolves entity locks by integer handle.
pub trait LockManager: Send + Sync {
    /// Allocates a fresh lock, returning its handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the deployment's lock pool is exhausted.
    fn allocate_lock(&self) -> Result<Arc<dyn StoreLock>>;

    /// Resolves a persisted handle back to its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if no lock with that handle exists.
    fn retrieve_lock(&self, id: u32) -> Result<Arc<dyn StoreLock>>;

    /// Frees an allocated lock. Called when its entity is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if no lock with that handle exists.
    fn free_lock(&self, id: u32) -> Result<()>;
}

/// A single in-process lock slot.
#[derive(Debug)]
struct LockSlot {
    id: u32,
    held: Mutex<bool>,
    freed: Condvar,
}

impl StoreLock for LockSlot {
    fn id(&self) -> u32 {
        self.id
    }

    fn lock(&self) {
        let mut held = self.held.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while *held {
            held = self
                .freed
                .wait(held)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *held = true;
    }

    fn unlock(&self) {
        let mut held = self.held.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *held = false;
        self.freed.notify_one();
    }
}

/// In-process [`LockManager`] backed by a mutex-and-condvar table.
///
/// Suitable for tests and single-process deployments; multi-process
/// deployments substitute a file-lock or shared-memory implementation behind
/// the same trait.
#[derive(Debug, Default)]
pub struct InProcessLockManager {
    locks: Mutex<HashMap<u32, Arc<LockSlot>>>,
    next_id: AtomicU32,
}

impl InProcessLockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<LockSlot>>> {
        self.locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl LockManager for InProcessLockManager {
    fn allocate_lock(&self) -> Result<Arc<dyn StoreLock>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(LockSlot {
            id,
            held: Mutex::new(false),
            freed: Condvar::new(),
        });
        let _ = self.table().insert(id, Arc::clone(&slot));
        tracing::debug!(lock_id = id, "allocated entity lock");
        Ok(slot)
    }

    fn retrieve_lock(&self, id: u32) -> Result<Arc<dyn StoreLock>> {
        self.table()
            .get(&id)
            .map(|slot| Arc::clone(slot) as Arc<dyn StoreLock>)
            .ok_or_else(|| StateError::internal(format!("no lock with handle {id} allocated")))
    }

    fn free_lock(&self, id: u32) -> Result<()> {
        match self.table().remove(&id) {
            Some(_) => {
                tracing::debug!(lock_id = id, "freed entity lock");
                Ok(())
            }
            None => Err(StateError::internal(format!(
                "no lock with handle {id} allocated"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_retrieve_free_round_trip() {
        let manager = InProcessLockManager::new();
        let lock = manager.allocate_lock().expect("allocate");
        let retrieved = manager.retrieve_lock(lock.id()).expect("retrieve");
        assert_eq!(retrieved.id(), lock.id());
        manager.free_lock(lock.id()).expect("free");
        assert!(manager.retrieve_lock(lock.id()).is_err());
    }

    #[test]
    fn handles_are_distinct() {
        let manager = InProcessLockManager::new();
        let a = manager.allocate_lock().expect("allocate");
        let b = manager.allocate_lock().expect("allocate");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn lock_excludes_concurrent_holder() {
        let manager = InProcessLockManager::new();
        let lock = manager.allocate_lock().expect("allocate");
        lock.lock();

        let contender = manager.retrieve_lock(lock.id()).expect("retrieve");
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            contender.lock();
            tx.send(()).expect("send");
            contender.unlock();
        });

        // The contender must not acquire while we hold the lock.
        assert!(
            rx.recv_timeout(std::time::Duration::from_millis(50)).is_err(),
            "lock acquired while already held"
        );
        lock.unlock();
        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("contender should acquire after release");
        handle.join().expect("join");
    }
}
