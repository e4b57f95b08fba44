//! Volume wrapper applying the lock-then-resync protocol.
//!
//! Lock ordering: a container is always locked before the volumes it
//! mounts. Volume operations invoked from container code paths therefore
//! run with the container lock already held and take the volume lock inside
//! it, never the other way around.

use std::sync::Arc;

use stevedore_common::types::{VolumeConfig, VolumeRuntimeState};

use crate::container::Batched;
use crate::error::{Result, StateError};
use crate::lock::{LockManager, StoreLock};
use crate::store::EntityStore;

/// A volume tracked by the entity store.
pub struct Volume {
    config: VolumeConfig,
    state: VolumeRuntimeState,
    lock: Arc<dyn StoreLock>,
    store: Arc<dyn EntityStore>,
    valid: bool,
}

impl Volume {
    /// Creates a volume in the store and returns its wrapper.
    ///
    /// # Errors
    ///
    /// Fails if a volume with the name already exists.
    pub fn create(
        store: Arc<dyn EntityStore>,
        locks: &dyn LockManager,
        mut config: VolumeConfig,
        state: VolumeRuntimeState,
    ) -> Result<Self> {
        let lock = locks.allocate_lock()?;
        config.lock_id = lock.id();
        if let Err(err) = store.add_volume(&config, &state) {
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

    /// Loads a volume from the store by full or unambiguous partial name.
    ///
    /// # Errors
    ///
    /// Fails if the lookup does not resolve or resolves ambiguously, or if
    /// the persisted lock handle cannot be retrieved.
    pub fn load(
        store: Arc<dyn EntityStore>,
        locks: &dyn LockManager,
        name: &str,
    ) -> Result<Self> {
        let (config, state) = store.lookup_volume(name)?;
        let lock = locks.retrieve_lock(config.lock_id)?;
        Ok(Self {
            config,
            state,
            lock,
            store,
            valid: true,
        })
    }

    /// Volume name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Cached immutable config.
    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
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
    /// Returns [`StateError::VolumeRemoved`] if another process removed the
    /// volume.
    pub fn runtime_state(&mut self, batched: Batched) -> Result<VolumeRuntimeState> {
        self.locked(batched, |vol| Ok(vol.state.clone()))
    }

    /// Applies a mutation to the runtime state and commits it.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VolumeRemoved`] if another process removed the
    /// volume.
    pub fn update_state(
        &mut self,
        batched: Batched,
        mutate: impl FnOnce(&mut VolumeRuntimeState),
    ) -> Result<()> {
        self.locked(batched, |vol| {
            mutate(&mut vol.state);
            vol.store.save_volume(&vol.config.name, &vol.state)
        })
    }

    /// Records one more live mount of the volume.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VolumeRemoved`] if another process removed the
    /// volume.
    pub fn mount(&mut self, batched: Batched) -> Result<u64> {
        self.locked(batched, |vol| {
            vol.state.mount_count = vol.state.mount_count.saturating_add(1);
            vol.store.save_volume(&vol.config.name, &vol.state)?;
            Ok(vol.state.mount_count)
        })
    }

    /// Records one fewer live mount of the volume.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VolumeRemoved`] if another process removed the
    /// volume.
    pub fn unmount(&mut self, batched: Batched) -> Result<u64> {
        self.locked(batched, |vol| {
            vol.state.mount_count = vol.state.mount_count.saturating_sub(1);
            vol.store.save_volume(&vol.config.name, &vol.state)?;
            Ok(vol.state.mount_count)
        })
    }

    /// IDs of the existing containers using this volume.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VolumeRemoved`] if another process removed the
    /// volume.
    pub fn in_use(&mut self, batched: Batched) -> Result<Vec<String>> {
        self.locked(batched, |vol| vol.store.volume_in_use(&vol.config.name))
    }

    /// Removes the volume from the store and frees its lock.
    ///
    /// # Errors
    ///
    /// Fails (leaving the wrapper valid) while any existing container uses
    /// the volume.
    pub fn remove(&mut self, locks: &dyn LockManager) -> Result<()> {
        let lock = Arc::clone(&self.lock);
        lock.lock();
        let result = (|| {
            match self.sync() {
                Ok(()) => {}
                Err(StateError::VolumeRemoved { .. }) => return Ok(()),
                Err(err) => return Err(err),
            }
            self.store.remove_volume(&self.config.name)?;
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
            return Err(StateError::VolumeRemoved {
                name: self.config.name.clone(),
            });
        }
        match self.store.update_volume(&self.config.name) {
            Ok(state) => {
                self.state = state;
                Ok(())
            }
            Err(StateError::NoSuchVolume { .. }) => {
                self.valid = false;
                Err(StateError::VolumeRemoved {
                    name: self.config.name.clone(),
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
    fn mount_count_round_trips() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut vol = Volume::create(
            Arc::clone(&store),
            &locks,
            VolumeConfig::new("data"),
            VolumeRuntimeState::default(),
        )
        .expect("create");

        assert_eq!(vol.mount(Batched::No).expect("mount"), 1);
        assert_eq!(vol.mount(Batched::No).expect("mount"), 2);
        assert_eq!(vol.unmount(Batched::No).expect("unmount"), 1);
        let persisted = store.update_volume("data").expect("read");
        assert_eq!(persisted.mount_count, 1);
    }

    #[test]
    fn unmount_does_not_underflow() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut vol = Volume::create(
            Arc::clone(&store),
            &locks,
            VolumeConfig::new("data"),
            VolumeRuntimeState::default(),
        )
        .expect("create");
        assert_eq!(vol.unmount(Batched::No).expect("unmount"), 0);
    }

    #[test]
    fn volume_in_use_blocks_removal() {
        let (_dir, store) = open_store();
        let locks = InProcessLockManager::new();
        let mut vol = Volume::create(
            Arc::clone(&store),
            &locks,
            VolumeConfig::new("data"),
            VolumeRuntimeState::default(),
        )
        .expect("create volume");

        let mut cfg = ContainerConfig::new("web");
        cfg.volumes.push("data".into());
        let mut ctr = Container::create(
            Arc::clone(&store),
            &locks,
            cfg,
            ContainerRuntimeState::default(),
        )
        .expect("create container");

        assert_eq!(
            vol.in_use(Batched::No).expect("in use"),
            vec![ctr.id().to_owned()]
        );
        let err = vol.remove(&locks).expect_err("in-use volume must not remove");
        assert!(matches!(err, StateError::VolumeInUse { .. }));
        assert!(vol.is_valid());

        ctr.remove(&locks).expect("remove container");
        assert!(vol.in_use(Batched::No).expect("in use").is_empty());
        vol.remove(&locks).expect("remove volume");
    }
}
