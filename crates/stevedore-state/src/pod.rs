//! Pod wrapper applying the lock-then-resync protocol.
//!
//! Lock ordering: operations that touch a pod and its member containers lock
//! the pod first, then each member. The store-level membership operations
//! here run under the pod lock alone; callers holding member wrappers pass
//! [`Batched::Yes`] into those after taking the pod lock themselves.

use std::sync::Arc;

use stevedore_common::types::{PodConfig, PodRuntimeState};

use crate::container::Batched;
use crate::error::{Result, StateError};
use crate::lock::{LockManager, StoreLock};
use crate::store::EntityStore;

/// A pod tracked by the entity store.
pub struct Pod {
    config: PodConfig,
    state: PodRuntimeState,
    lock: Arc<dyn StoreLock>,
    store: Arc<dyn EntityStore>,
    valid: bool,
}

impl Pod {
    /// Creates a pod in the store and returns its wrapper.
    ///
    /// # Errors
    ///
    /// Fails if the name or ID is taken in the combined container+pod
    /// namespace.
    pub fn create(
        store: Arc<dyn EntityStore>,
        locks: &dyn LockManager,
        mut config: PodConfig,
        state: PodRuntimeState,
    ) -> Result<Self> {
        let lock = locks.allocate_lock()?;
        config.lock_id = lock.id();
        if let Err(err) = store.add_pod(&config, &state) {
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

    /// Loads a pod from the store by full or partial ID or full name.
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
        let (config, state) = store.lookup_pod(id_or_name)?;
        let lock = locks.retrieve_lock(config.lock_id)?;
        Ok(Self {
            config,
            state,
            lock,
            store,
            valid: true,
        })
    }

    /// Full pod ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Pod name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Cached immutable config.
    #[must_use]
    pub fn config(&self) -> &PodConfig {
        &self.config
    }

    /// Whether the wrapper still refers to a live entity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Snapshot of the current runtime state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::PodRemoved`] if another process removed the
    /// pod.
    pub fn runtime_state(&mut self, batched: Batched) -> Result<PodRuntimeState> {
        self.locked(batched, |pod| Ok(pod.state.clone()))
    }

    /// Applies a mutation to the runtime state and commits it.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::PodRemoved`] if another process removed the
    /// pod.
    pub fn update_state(
        &mut self,
        batched: Batched,
        mutate: impl FnOnce(&mut PodRuntimeState),
    ) -> Result<()> {
        self.locked(batched, |pod| {
            mutate(&mut pod.state);
            pod.store.save_pod(&pod.config.id, &pod.state)
        })
    }

    /// IDs of the pod's member containers.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::PodRemoved`] if another process removed the
    /// pod.
    pub fn containers(&mut self, batched: Batched) -> Result<Vec<String>> {
        self.locked(batched, |pod| pod.store.pod_containers(&pod.config.id))
    }

    /// Checks whether a container belongs to this pod.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::PodRemoved`] if another process removed the
    /// pod.
    pub fn has_container(&mut self, batched: Batched, ctr_id: &str) -> Result<bool> {
        self.locked(batched, |pod| {
            pod.store.pod_has_container(&pod.config.id, ctr_id)
        })
    }

    /// Removes every member container in one store transaction.
    ///
    /// # Errors
    ///
    /// Fails if a member has a dependent container outside the pod, leaving
    /// all members in place.
    pub fn remove_all_containers(&mut self, batched: Batched) -> Result<()> {
        self.locked(batched, |pod| {
            pod.store.remove_pod_containers(&pod.config.id)
        })
    }

    /// Removes the pod from the store and frees its lock.
    ///
    /// # Errors
    ///
    /// Fails (leaving the wrapper valid) while the pod still has member
    /// containers.
    pub fn remove(&mut self, locks: &dyn LockManager) -> Result<()> {
        let lock = Arc::clone(&self.lock);
        lock.lock();
        let result = (|| {
            match self.sync() {
                Ok(()) => {}
                Err(StateError::PodRemoved { .. }) => return Ok(()),
                Err(err) => return Err(err),
            }
            self.store.remove_pod(&self.config.id)?;
            self.valid = false;
            locks.free_lock(lock.id())
        })();
        lock.unlock();
        result
    }

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

    fn sync(&mut self) -> Result<()> {
        if !self.valid {
            return Err(StateError::PodRemoved {
                id: self.config.id.clone(),
            });
        }
        match self.store.update_pod(&self.config.id) {
            Ok(state) => {
                self.state = state;
                Ok(())
            }
            Err(StateError::NoSuchPod { .. }) => {
                self.valid = false;
                Err(StateError::PodRemoved {
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
    use crate::container::Container;
    use crate::lock::InProcessLockManager;
    use crate::sql::SqliteState;
    use stevedore_common::config::StoreConfig;
    use stevedore_common::types::{ContainerConfig, ContainerRuntimeState};
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Arc<dyn EntityStore>) {
        let dir = TempDir::new().expect("tempdir");
        let config = StoreConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.static_dir).expect("mkdir");
        let store = SqliteState::open(&config).expect("open store");
        (dir, Arc::new(store))
    }

    #[test]
    fn member_containers_round_trip() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut pod = Pod::create(
            Arc::clone(&store),
            &locks,
            PodConfig::new("app"),
            PodRuntimeState::default(),
        )
        .expect("create pod");

        let mut member_cfg = ContainerConfig::new("app-db");
        member_cfg.pod_id = Some(pod.id().to_owned());
        let member = Container::create_in_pod(
            Arc::clone(&store),
            &locks,
            pod.id(),
            member_cfg,
            ContainerRuntimeState::default(),
        )
        .expect("create member");

        assert!(pod.has_container(Batched::No, member.id()).expect("has"));
        assert_eq!(
            pod.containers(Batched::No).expect("containers"),
            vec![member.id().to_owned()]
        );
    }

    #[test]
    fn pod_with_members_cannot_be_removed() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut pod = Pod::create(
            Arc::clone(&store),
            &locks,
            PodConfig::new("app"),
            PodRuntimeState::default(),
        )
        .expect("create pod");

        let mut member_cfg = ContainerConfig::new("app-db");
        member_cfg.pod_id = Some(pod.id().to_owned());
        let _member = Container::create_in_pod(
            Arc::clone(&store),
            &locks,
            pod.id(),
            member_cfg,
            ContainerRuntimeState::default(),
        )
        .expect("create member");

        let err = pod.remove(&locks).expect_err("must fail while occupied");
        assert!(matches!(err, StateError::PodNotEmpty { .. }));
        assert!(pod.is_valid());

        pod.remove_all_containers(Batched::No).expect("empty pod");
        pod.remove(&locks).expect("remove now");
        assert!(!store.has_pod(pod.id()).expect("has"));
    }

    #[test]
    fn cgroup_path_survives_through_update_state() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut pod = Pod::create(
            Arc::clone(&store),
            &locks,
            PodConfig::new("app"),
            PodRuntimeState::default(),
        )
        .expect("create pod");

        pod.update_state(Batched::No, |state| {
            state.cgroup_path = Some("/machine.slice/app".into());
        })
        .expect("update");

        let persisted = store.update_pod(pod.id()).expect("read");
        assert_eq!(persisted.cgroup_path.as_deref(), Some("/machine.slice/app"));
    }
}
