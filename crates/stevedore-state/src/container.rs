//! Container wrapper applying the lock-then-resync protocol.
//!
//! A [`Container`] caches its config and runtime state, but another process
//! may have changed or removed the entity since the cache was filled. Every
//! operation therefore acquires the container's cross-process lock, re-reads
//! the state from the store, and only then acts; the lock is released on
//! every path out. An operation already running inside a caller's batch
//! passes [`Batched::Yes`] to skip the acquire and resync, since the caller
//! holds the lock and the cache is known fresh.

use std::collections::HashMap;
use std::sync::Arc;

use stevedore_common::types::{
    ContainerConfig, ContainerRuntimeState, ContainerStatus, ExecSession, PerNetworkOptions,
};

use crate::error::{Result, StateError};
use crate::lock::{LockManager, StoreLock};
use crate::store::EntityStore;

/// Whether the caller already holds the entity's lock.
///
/// Passed explicitly on every wrapper operation so a read of the call site
/// shows whether locking happens there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Batched {
    /// Acquire the lock and resync before operating.
    No,
    /// The caller holds the lock and has already synced; operate directly.
    Yes,
}

/// A container tracked by the entity store.
#[derive(Debug)]
pub struct Container {
    config: ContainerConfig,
    state: ContainerRuntimeState,
    lock: Arc<dyn StoreLock>,
    store: Arc<dyn EntityStore>,
    valid: bool,
}

impl Container {
    /// Creates a container in the store and returns its wrapper.
    ///
    /// Allocates the container's lock and records its handle in the config
    /// before the store insert, so the persisted config always names a live
    /// lock.
    ///
    /// # Errors
    ///
    /// Fails if the name or ID is taken, a dependency or volume is missing,
    /// or the config names a pod (pod members go through
    /// [`Container::create_in_pod`]).
    pub fn create(
        store: Arc<dyn EntityStore>,
        locks: &dyn LockManager,
        mut config: ContainerConfig,
        state: ContainerRuntimeState,
    ) -> Result<Self> {
        let lock = locks.allocate_lock()?;
        config.lock_id = lock.id();
        if let Err(err) = store.add_container(&config, &state) {
            // The entity never existed; its lock must not leak.
            let _ = locks.free_lock(lock.id());
            return Err(err);
        }
        Ok(Self {
            config,
            state,
            lock,
            store,
            valid: true,
        })
    }

    /// Creates a container inside an existing pod and returns its wrapper.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Container::create`], or if the
    /// pod does not exist or the config's pod ID disagrees with `pod_id`.
    pub fn create_in_pod(
        store: Arc<dyn EntityStore>,
        locks: &dyn LockManager,
        pod_id: &str,
        mut config: ContainerConfig,
        state: ContainerRuntimeState,
    ) -> Result<Self> {
        let lock = locks.allocate_lock()?;
        config.lock_id = lock.id();
        if let Err(err) = store.add_container_to_pod(pod_id, &config, &state) {
            let _ = locks.free_lock(lock.id());
            return Err(err);
        }
        Ok(Self {
            config,
            state,
            lock,
            store,
            valid: true,
        })
    }

    /// Loads a container from the store by full or partial ID or full name.
    ///
    /// # Errors
    ///
    /// Fails if the lookup does not resolve or resolves ambiguously, or if
    /// the persisted lock handle cannot be retrieved.
    pub fn load(
        store: Arc<dyn EntityStore>,
        locks: &dyn LockManager,
        id_or_name: &str,
    ) -> Result<Self> {
        let (config, state) = store.lookup_container(id_or_name)?;
        let lock = locks.retrieve_lock(config.lock_id)?;
        Ok(Self {
            config,
            state,
            lock,
            store,
            valid: true,
        })
    }

    /// Full container ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Container name, as of the last sync.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Cached immutable config.
    #[must_use]
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Whether the wrapper still refers to a live entity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Current lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ContainerRemoved`] if another process removed
    /// the container.
    pub fn status(&mut self, batched: Batched) -> Result<ContainerStatus> {
        self.locked(batched, |ctr| Ok(ctr.state.status))
    }

    /// Snapshot of the current runtime state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ContainerRemoved`] if another process removed
    /// the container.
    pub fn runtime_state(&mut self, batched: Batched) -> Result<ContainerRuntimeState> {
        self.locked(batched, |ctr| Ok(ctr.state.clone()))
    }

    /// Applies a mutation to the runtime state and commits it.
    ///
    /// The mutation sees the freshly synced state, so concurrent writers
    /// cannot be clobbered with stale data.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ContainerRemoved`] if another process removed
    /// the container.
    pub fn update_state(
        &mut self,
        batched: Batched,
        mutate: impl FnOnce(&mut ContainerRuntimeState),
    ) -> Result<()> {
        self.locked(batched, |ctr| {
            mutate(&mut ctr.state);
            ctr.store.save_container(&ctr.config.id, &ctr.state)
        })
    }

    /// Records that the container exited, saving the exit code both in the
    /// runtime state and in the store's exit-code registry.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ContainerRemoved`] if another process removed
    /// the container.
    pub fn record_exit(&mut self, batched: Batched, exit_code: i32) -> Result<()> {
        self.locked(batched, |ctr| {
            ctr.state.status = ContainerStatus::Exited;
            ctr.state.exit_code = Some(exit_code);
            ctr.state.pid = None;
            ctr.state.finished_at = Some(chrono::Utc::now());
            ctr.store.save_container(&ctr.config.id, &ctr.state)?;
            ctr.store.add_container_exit_code(&ctr.config.id, exit_code)
        })
    }

    /// Registers an exec session in the store and in the runtime state.
    ///
    /// # Errors
    ///
    /// Fails if a session with the ID exists or the container was removed.
    pub fn add_exec_session(&mut self, batched: Batched, session: &ExecSession) -> Result<()> {
        if session.container_id != self.config.id {
            return Err(StateError::invalid_arg(format!(
                "exec session {} names container {}, not {}",
                session.id, session.container_id, self.config.id
            )));
        }
        self.locked(batched, |ctr| {
            ctr.store.add_exec_session(session)?;
            ctr.state.exec_sessions.push(session.id.clone());
            ctr.store.save_container(&ctr.config.id, &ctr.state)
        })
    }

    /// Removes an exec session from the store and the runtime state.
    ///
    /// # Errors
    ///
    /// Fails if the session is not registered or the container was removed.
    pub fn remove_exec_session(&mut self, batched: Batched, session: &ExecSession) -> Result<()> {
        self.locked(batched, |ctr| {
            ctr.store.remove_exec_session(session)?;
            ctr.state.exec_sessions.retain(|id| *id != session.id);
            ctr.store.save_container(&ctr.config.id, &ctr.state)
        })
    }

    /// Networks the container is attached to, with options.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ContainerRemoved`] if another process removed
    /// the container.
    pub fn networks(&mut self, batched: Batched) -> Result<HashMap<String, PerNetworkOptions>> {
        self.locked(batched, |ctr| ctr.store.networks(&ctr.config.id))
    }

    /// Attaches the container to a network.
    ///
    /// # Errors
    ///
    /// Fails if already attached or the container was removed.
    pub fn network_connect(
        &mut self,
        batched: Batched,
        network: &str,
        opts: &PerNetworkOptions,
    ) -> Result<()> {
        self.locked(batched, |ctr| {
            ctr.store.network_connect(&ctr.config.id, network, opts)
        })
    }

    /// Detaches the container from a network.
    ///
    /// # Errors
    ///
    /// Fails if not attached or the container was removed.
    pub fn network_disconnect(&mut self, batched: Batched, network: &str) -> Result<()> {
        self.locked(batched, |ctr| {
            ctr.store.network_disconnect(&ctr.config.id, network)
        })
    }

    /// Renames the container, updating every name index atomically.
    ///
    /// # Errors
    ///
    /// Fails if the new name is taken or the container was removed; on
    /// failure the old name remains everywhere.
    pub fn rename(&mut self, batched: Batched, new_name: &str) -> Result<()> {
        self.locked(batched, |ctr| {
            let old_name = ctr.config.name.clone();
            let mut new_config = ctr.config.clone();
            new_config.name = new_name.to_owned();
            ctr.store.safe_rewrite_container_config(
                &ctr.config.id,
                &old_name,
                new_name,
                &new_config,
            )?;
            ctr.config = new_config;
            Ok(())
        })
    }

    /// Removes the container from the store and frees its lock.
    ///
    /// The wrapper is invalid afterwards regardless of entity kind of exit:
    /// if another process already removed the container, that is success.
    ///
    /// # Errors
    ///
    /// Fails (leaving the wrapper valid) while dependent containers or
    /// registered exec sessions exist, or if the container is in a pod.
    pub fn remove(&mut self, locks: &dyn LockManager) -> Result<()> {
        let lock = Arc::clone(&self.lock);
        lock.lock();
        let result = (|| {
            match self.sync() {
                Ok(()) => {}
                // Already gone; removal is idempotent.
                Err(StateError::ContainerRemoved { .. }) => return Ok(()),
                Err(err) => return Err(err),
            }
            self.store.remove_container(&self.config.id)?;
            self.valid = false;
            locks.free_lock(lock.id())
        })();
        lock.unlock();
        result
    }

    /// Runs `op` with the lock held and the state synced, unlocking on every
    /// path out.
    fn locked<T>(
        &mut self,
        batched: Batched,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        match batched {
            Batched::Yes => op(self),
            Batched::No => {
                let lock = Arc::clone(&self.lock);
                lock.lock();
                let result = self.sync().and_then(|()| op(self));
                lock.unlock();
                result
            }
        }
    }

    /// Re-reads the runtime state from the store.
    ///
    /// A missing container marks the wrapper invalid permanently: the entity
    /// was removed by another process, and no later sync can resurrect it.
    fn sync(&mut self) -> Result<()> {
        if !self.valid {
            return Err(StateError::ContainerRemoved {
                id: self.config.id.clone(),
            });
        }
        match self.store.update_container(&self.config.id) {
            Ok(state) => {
                self.state = state;
                Ok(())
            }
            Err(StateError::NoSuchContainer { .. }) => {
                self.valid = false;
                Err(StateError::ContainerRemoved {
                    id: self.config.id.clone(),
                })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InProcessLockManager;
    use crate::sql::SqliteState;
    use stevedore_common::config::StoreConfig;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Arc<dyn EntityStore>) {
        let dir = TempDir::new().expect("tempdir");
        let config = StoreConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.static_dir).expect("mkdir");
        let store = SqliteState::open(&config).expect("open store");
        (dir, Arc::new(store))
    }

    #[test]
    fn create_persists_lock_handle() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let ctr = Container::create(
            Arc::clone(&store),
            &locks,
            ContainerConfig::new("web"),
            ContainerRuntimeState::default(),
        )
        .expect("create");

        let persisted = store.container_config(ctr.id()).expect("config");
        assert_eq!(persisted.lock_id, ctr.config().lock_id);
        locks
            .retrieve_lock(persisted.lock_id)
            .expect("lock handle must resolve");
    }

    #[test]
    fn failed_create_frees_the_lock() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let _first = Container::create(
            Arc::clone(&store),
            &locks,
            ContainerConfig::new("web"),
            ContainerRuntimeState::default(),
        )
        .expect("create");

        let dup = Container::create(
            Arc::clone(&store),
            &locks,
            ContainerConfig::new("web"),
            ContainerRuntimeState::default(),
        );
        let err = dup.expect_err("duplicate name must fail");
        assert!(matches!(err, StateError::ContainerExists { .. }));
    }

    #[test]
    fn sync_picks_up_foreign_writes() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut ctr = Container::create(
            Arc::clone(&store),
            &locks,
            ContainerConfig::new("web"),
            ContainerRuntimeState::default(),
        )
        .expect("create");

        // Another process changes the status behind the wrapper's back.
        let mut foreign = store.update_container(ctr.id()).expect("read");
        foreign.status = ContainerStatus::Running;
        foreign.pid = Some(4242);
        store.save_container(ctr.id(), &foreign).expect("save");

        assert_eq!(
            ctr.status(Batched::No).expect("status"),
            ContainerStatus::Running
        );
    }

    #[test]
    fn removed_container_invalidates_wrapper() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut ctr = Container::create(
            Arc::clone(&store),
            &locks,
            ContainerConfig::new("web"),
            ContainerRuntimeState::default(),
        )
        .expect("create");

        // Another process removes the container.
        store.remove_container(ctr.id()).expect("remove");

        let err = ctr.status(Batched::No).expect_err("must report removal");
        assert!(matches!(err, StateError::ContainerRemoved { .. }));
        assert!(!ctr.is_valid());

        // The wrapper stays invalid even for later calls.
        let err = ctr.status(Batched::No).expect_err("still removed");
        assert!(matches!(err, StateError::ContainerRemoved { .. }));
    }

    #[test]
    fn record_exit_saves_state_and_exit_code() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut ctr = Container::create(
            Arc::clone(&store),
            &locks,
            ContainerConfig::new("web"),
            ContainerRuntimeState::default(),
        )
        .expect("create");

        ctr.record_exit(Batched::No, 137).expect("record exit");
        assert_eq!(store.container_exit_code(ctr.id()).expect("code"), 137);
        let state = store.update_container(ctr.id()).expect("state");
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.exit_code, Some(137));
    }

    #[test]
    fn rename_updates_wrapper_and_store() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut ctr = Container::create(
            Arc::clone(&store),
            &locks,
            ContainerConfig::new("old"),
            ContainerRuntimeState::default(),
        )
        .expect("create");

        ctr.rename(Batched::No, "new").expect("rename");
        assert_eq!(ctr.name(), "new");
        assert_eq!(store.container_name(ctr.id()).expect("name"), "new");
        assert_eq!(store.lookup_container_id("new").expect("lookup"), ctr.id());
    }

    #[test]
    fn remove_frees_the_lock() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut ctr = Container::create(
            Arc::clone(&store),
            &locks,
            ContainerConfig::new("web"),
            ContainerRuntimeState::default(),
        )
        .expect("create");
        let lock_id = ctr.config().lock_id;

        ctr.remove(&locks).expect("remove");
        assert!(!ctr.is_valid());
        assert!(!store.has_container(ctr.id()).expect("has"));
        assert!(locks.retrieve_lock(lock_id).is_err());
    }
}
