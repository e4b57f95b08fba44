//! The entity-store contract and backend selection.
//!
//! [`EntityStore`] is the fixed operation set both backends implement with
//! identical pre- and postconditions; there is no other way to reach the
//! persisted data. [`open`] selects the backend once, per deployment
//! configuration, and validates the store's recorded host configuration
//! against the live one before returning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use stevedore_common::config::{StoreBackend, StoreConfig};
use stevedore_common::constants::{ENV_FORCE_KV_BACKEND, ENV_SILENCE_KV_DEPRECATION, KV_DB_NAME};
use stevedore_common::types::{
    ContainerConfig, ContainerRuntimeState, DbConfig, ExecSession, PerNetworkOptions, PodConfig,
    PodRuntimeState, VolumeConfig, VolumeRuntimeState,
};

use crate::error::{Result, StateError};

/// Storage contract for the engine's persistent state.
///
/// Both backends must satisfy identical pre- and postconditions for every
/// operation: byte-for-byte equivalent external semantics. Any error leaves
/// the store at its last committed state; no partially-applied multi-index
/// write is ever observable.
///
/// Lookup semantics shared by all `lookup_*` operations: an exact name match
/// wins, then an exact ID match, then a unique ID-prefix match. Two or more
/// prefix matches is an ambiguity error of the already-exists kind; zero
/// matches is a not-found error.
pub trait EntityStore: std::fmt::Debug + Send + Sync {
    /// Which backend implements this store.
    fn backend(&self) -> StoreBackend;

    /// Performs pre-exit cleanup and marks the store closed. All later
    /// operations fail with [`StateError::StoreClosed`].
    fn close(&self) -> Result<()>;

    /// Clears container and pod runtime state after a host reboot.
    ///
    /// Must be invoked once per boot cycle before any other operation. For
    /// every container: PID, mount state, and network state are cleared. For
    /// every pod: the cached cgroup path is cleared. All exec sessions and
    /// all exit-code records are deleted. Idempotent.
    fn refresh(&self) -> Result<()>;

    /// Returns the host/storage configuration recorded when the store was
    /// created.
    fn db_config(&self) -> Result<DbConfig>;

    /// Validates the recorded [`DbConfig`] against the live configuration.
    ///
    /// Path fields are compared after symlink resolution. A mismatch is
    /// fatal: two differently-configured runtimes may not share one store.
    fn validate_db_config(&self, config: &StoreConfig) -> Result<()>;

    // ── Containers ───────────────────────────────────────────────────

    /// Returns the config and state of the container with the given full ID.
    fn container(&self, id: &str) -> Result<(ContainerConfig, ContainerRuntimeState)>;

    /// Resolves a full or partial ID or full name to a full container ID.
    fn lookup_container_id(&self, id_or_name: &str) -> Result<String>;

    /// Returns the container matching a full or partial ID or full name.
    fn lookup_container(&self, id_or_name: &str) -> Result<(ContainerConfig, ContainerRuntimeState)>;

    /// Checks whether a container with the given full ID exists.
    fn has_container(&self, id: &str) -> Result<bool>;

    /// Resolves a full container ID to its name.
    fn container_name(&self, id: &str) -> Result<String>;

    /// Adds a container to the store.
    ///
    /// The container must not belong to a pod; pod members are added through
    /// [`EntityStore::add_container_to_pod`]. Name and ID must be free in the
    /// combined container+pod namespace. All dependencies and named volumes
    /// must already exist.
    fn add_container(&self, config: &ContainerConfig, state: &ContainerRuntimeState)
    -> Result<()>;

    /// Removes a container and every denormalized index entry referencing it
    /// in one transaction.
    ///
    /// Fails if the container belongs to a pod, has dependent containers, or
    /// still has registered exec sessions.
    fn remove_container(&self, id: &str) -> Result<()>;

    /// Reads the container's current runtime state from the store.
    fn update_container(&self, id: &str) -> Result<ContainerRuntimeState>;

    /// Commits the container's runtime state to the store.
    fn save_container(&self, id: &str, state: &ContainerRuntimeState) -> Result<()>;

    /// Returns the IDs of containers that depend on the given container.
    fn container_in_use(&self, id: &str) -> Result<Vec<String>>;

    /// Returns all containers with their states.
    fn all_containers(&self) -> Result<Vec<(ContainerConfig, ContainerRuntimeState)>>;

    /// Returns the config of the container with the given full ID.
    fn container_config(&self, id: &str) -> Result<ContainerConfig>;

    /// Rewrites a container's config in place. Privileged.
    ///
    /// ID and name absolutely cannot be altered; use
    /// [`EntityStore::safe_rewrite_container_config`] for renames.
    fn rewrite_container_config(&self, id: &str, new_config: &ContainerConfig) -> Result<()>;

    /// Rewrites a container's config, optionally renaming it.
    ///
    /// A rename updates the ID registry, the name registry, the
    /// all-containers index, and the owning pod's membership index together
    /// in one transaction; a failure leaves all four untouched. Pod
    /// membership, dependencies, and lock identity cannot be changed.
    fn safe_rewrite_container_config(
        &self,
        id: &str,
        old_name: &str,
        new_name: &str,
        new_config: &ContainerConfig,
    ) -> Result<()>;

    // ── Container networks ───────────────────────────────────────────

    /// Returns the networks the container is connected to with their
    /// options.
    ///
    /// Legacy pre-migration records are rewritten to the current format as a
    /// side effect; the migration commits before this returns.
    fn networks(&self, id: &str) -> Result<HashMap<String, PerNetworkOptions>>;

    /// Connects the container to a network. Fails if already connected.
    fn network_connect(&self, id: &str, network: &str, opts: &PerNetworkOptions) -> Result<()>;

    /// Replaces the container's options on a network it is already connected
    /// to. Fails if not connected.
    fn network_modify(&self, id: &str, network: &str, opts: &PerNetworkOptions) -> Result<()>;

    /// Disconnects the container from a network. Fails if not connected.
    fn network_disconnect(&self, id: &str, network: &str) -> Result<()>;

    // ── Exec sessions ────────────────────────────────────────────────

    /// Registers an exec session against a container.
    ///
    /// Records only the session-ID to container-ID mapping; the session
    /// itself lives in the container's runtime state, which callers save
    /// separately.
    fn add_exec_session(&self, session: &ExecSession) -> Result<()>;

    /// Returns the ID of the container an exec session is attached to.
    fn exec_session_container(&self, id: &str) -> Result<String>;

    /// Removes an exec session from the registry.
    fn remove_exec_session(&self, session: &ExecSession) -> Result<()>;

    /// Returns the IDs of all exec sessions registered for a container.
    fn container_exec_sessions(&self, id: &str) -> Result<Vec<String>>;

    /// Removes all exec sessions registered for a container.
    fn remove_container_exec_sessions(&self, id: &str) -> Result<()>;

    // ── Exit codes ───────────────────────────────────────────────────

    /// Records a container's exit code with the current timestamp.
    ///
    /// Kept outside the container's state blob so the hot exit path does not
    /// pay JSON (de)serialization costs. Codes outside `-1..=255` are
    /// rejected.
    fn add_container_exit_code(&self, id: &str, exit_code: i32) -> Result<()>;

    /// Returns the recorded exit code for a container ID.
    fn container_exit_code(&self, id: &str) -> Result<i32>;

    /// Returns when the exit code for a container ID was recorded.
    fn container_exit_code_timestamp(&self, id: &str) -> Result<DateTime<Utc>>;

    /// Removes exit codes older than the retention window, unless the owning
    /// container still exists.
    fn prune_container_exit_codes(&self) -> Result<()>;

    /// Checks whether a storage-layer container ID backs a volume.
    fn container_id_is_volume(&self, id: &str) -> Result<bool>;

    // ── Pods ─────────────────────────────────────────────────────────

    /// Returns the config and state of the pod with the given full ID.
    fn pod(&self, id: &str) -> Result<(PodConfig, PodRuntimeState)>;

    /// Returns the pod matching a full or partial ID or full name.
    fn lookup_pod(&self, id_or_name: &str) -> Result<(PodConfig, PodRuntimeState)>;

    /// Checks whether a pod with the given full ID exists.
    fn has_pod(&self, id: &str) -> Result<bool>;

    /// Resolves a full pod ID to its name.
    fn pod_name(&self, id: &str) -> Result<String>;

    /// Checks whether a pod has a member container with the given ID.
    fn pod_has_container(&self, pod_id: &str, ctr_id: &str) -> Result<bool>;

    /// Returns the IDs of all containers in a pod.
    fn pod_containers(&self, pod_id: &str) -> Result<Vec<String>>;

    /// Adds a pod to the store. Name and ID must be free in the combined
    /// container+pod namespace.
    fn add_pod(&self, config: &PodConfig, state: &PodRuntimeState) -> Result<()>;

    /// Removes a pod. Only empty pods can be removed.
    fn remove_pod(&self, id: &str) -> Result<()>;

    /// Removes all containers from a pod in one transaction.
    ///
    /// Fails if any member depends on a container outside the pod.
    fn remove_pod_containers(&self, id: &str) -> Result<()>;

    /// Adds a container to an existing pod, registering it in the store and
    /// in the pod's membership index atomically.
    fn add_container_to_pod(
        &self,
        pod_id: &str,
        config: &ContainerConfig,
        state: &ContainerRuntimeState,
    ) -> Result<()>;

    /// Removes a container from its pod and from the store.
    fn remove_container_from_pod(&self, pod_id: &str, ctr_id: &str) -> Result<()>;

    /// Reads the pod's current runtime state from the store.
    fn update_pod(&self, id: &str) -> Result<PodRuntimeState>;

    /// Commits the pod's runtime state to the store.
    fn save_pod(&self, id: &str, state: &PodRuntimeState) -> Result<()>;

    /// Returns all pods with their states.
    fn all_pods(&self) -> Result<Vec<(PodConfig, PodRuntimeState)>>;

    /// Rewrites a pod's config in place. Privileged; ID and name cannot be
    /// altered.
    fn rewrite_pod_config(&self, id: &str, new_config: &PodConfig) -> Result<()>;

    // ── Volumes ──────────────────────────────────────────────────────

    /// Returns the config and state of the volume with the given full name.
    fn volume(&self, name: &str) -> Result<(VolumeConfig, VolumeRuntimeState)>;

    /// Returns the volume matching a full or unambiguous partial name.
    fn lookup_volume(&self, name: &str) -> Result<(VolumeConfig, VolumeRuntimeState)>;

    /// Checks whether a volume with the given full name exists.
    fn has_volume(&self, name: &str) -> Result<bool>;

    /// Returns the IDs of existing containers using a volume.
    ///
    /// Stale entries referencing already-removed containers are filtered
    /// out, not errors; the dependency set is tolerated to lag.
    fn volume_in_use(&self, name: &str) -> Result<Vec<String>>;

    /// Adds a volume to the store. The name must be unique among volumes.
    fn add_volume(&self, config: &VolumeConfig, state: &VolumeRuntimeState) -> Result<()>;

    /// Removes a volume. Fails while any existing container depends on it.
    fn remove_volume(&self, name: &str) -> Result<()>;

    /// Reads the volume's current runtime state from the store.
    fn update_volume(&self, name: &str) -> Result<VolumeRuntimeState>;

    /// Commits the volume's runtime state to the store.
    fn save_volume(&self, name: &str, state: &VolumeRuntimeState) -> Result<()>;

    /// Returns all volumes with their states.
    fn all_volumes(&self) -> Result<Vec<(VolumeConfig, VolumeRuntimeState)>>;

    /// Rewrites a volume's config in place. Privileged; the name cannot be
    /// altered.
    fn rewrite_volume_config(&self, name: &str, new_config: &VolumeConfig) -> Result<()>;
}

/// Opens the entity store described by `config`, creating it on first use.
///
/// Backend selection is a deployment-time decision recorded implicitly by
/// which database file exists. Creating a *new* store with the deprecated
/// key-value backend requires the `STEVEDORE_FORCE_KV_BACKEND` environment
/// override; opening an existing one logs a deprecation warning unless
/// silenced.
///
/// # Errors
///
/// Returns [`StateError::BadConfig`] if the store's recorded host
/// configuration does not match `config`, or a backend error if the store
/// cannot be opened.
pub fn open(config: &StoreConfig) -> Result<Box<dyn EntityStore>> {
    std::fs::create_dir_all(&config.static_dir).map_err(|source| StateError::Io {
        path: config.static_dir.clone(),
        source,
    })?;

    match config.backend {
        StoreBackend::Sqlite => {
            tracing::info!("using sqlite as state backend");
            Ok(Box::new(crate::sql::SqliteState::open(config)?))
        }
        StoreBackend::Keyvalue => {
            let db_file = config.static_dir.join(KV_DB_NAME);
            if db_file.exists() {
                if std::env::var_os(ENV_SILENCE_KV_DEPRECATION).is_none() {
                    tracing::warn!(
                        "the key-value state backend is deprecated and will be removed; \
                         migrate this store to the sqlite backend"
                    );
                }
            } else if std::env::var_os(ENV_FORCE_KV_BACKEND).is_none() {
                return Err(StateError::invalid_arg(format!(
                    "cannot create a new store with the deprecated key-value backend \
                     (set {ENV_FORCE_KV_BACKEND}=1 to override for compatibility testing)"
                )));
            }
            tracing::info!("using key-value as state backend");
            Ok(Box::new(crate::kv::KvState::open(config)?))
        }
    }
}

/// Builds the `DbConfig` record persisted on first creation of a store.
pub(crate) fn db_config_from_store_config(config: &StoreConfig, schema_version: i64) -> DbConfig {
    DbConfig {
        schema_version,
        os: config.os.clone(),
        static_dir: config.static_dir.clone(),
        tmp_dir: config.tmp_dir.clone(),
        graph_root: config.graph_root.clone(),
        run_root: config.run_root.clone(),
        graph_driver: config.graph_driver.clone(),
        volume_path: config.volume_path.clone(),
    }
}

/// Validates an exit code before either backend records it.
///
/// The accepted range is `-1` (exit status unknown) plus the `0..=255` wait
/// status byte, matching the relational schema's column constraint. Checked
/// here so both backends reject out-of-range codes with the same error kind.
pub(crate) fn ensure_exit_code_in_range(exit_code: i32) -> Result<()> {
    if (-1..=255).contains(&exit_code) {
        Ok(())
    } else {
        Err(StateError::invalid_arg(format!(
            "exit code {exit_code} is outside the representable range -1..=255"
        )))
    }
}

/// Compares a recorded `DbConfig` against the live configuration.
///
/// Shared by both backends so their failure text and semantics stay
/// identical. Paths are resolved through symlinks before comparison; a path
/// that does not exist yet compares by its literal value.
pub(crate) fn verify_db_config(recorded: &DbConfig, live: &StoreConfig) -> Result<()> {
    check_field("OS", &recorded.os, &live.os)?;
    check_field("storage graph driver", &recorded.graph_driver, &live.graph_driver)?;
    check_path("static dir", &recorded.static_dir, &live.static_dir)?;
    check_path("tmp dir", &recorded.tmp_dir, &live.tmp_dir)?;
    check_path("storage graph root", &recorded.graph_root, &live.graph_root)?;
    check_path("storage run root", &recorded.run_root, &live.run_root)?;
    check_path("volume path", &recorded.volume_path, &live.volume_path)?;
    Ok(())
}

fn check_field(name: &str, recorded: &str, live: &str) -> Result<()> {
    if recorded == live {
        return Ok(());
    }
    Err(StateError::BadConfig {
        message: format!(
            "{name} mismatch: store was created with {recorded:?} but the runtime is \
             configured with {live:?}"
        ),
    })
}

fn check_path(name: &str, recorded: &Path, live: &Path) -> Result<()> {
    if resolve_symlinks(recorded) == resolve_symlinks(live) {
        return Ok(());
    }
    Err(StateError::BadConfig {
        message: format!(
            "{name} mismatch: store was created with {} but the runtime is configured \
             with {}",
            recorded.display(),
            live.display()
        ),
    })
}

fn resolve_symlinks(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_common::constants::SCHEMA_VERSION;

    #[test]
    fn matching_db_config_validates() {
        let cfg = StoreConfig::rooted_at("/nonexistent/stevedore-test");
        let recorded = db_config_from_store_config(&cfg, SCHEMA_VERSION);
        verify_db_config(&recorded, &cfg).expect("identical configs must validate");
    }

    #[test]
    fn graph_root_mismatch_is_bad_config() {
        let cfg = StoreConfig::rooted_at("/nonexistent/stevedore-test");
        let mut other = cfg.clone();
        other.graph_root = "/nonexistent/elsewhere".into();
        let recorded = db_config_from_store_config(&cfg, SCHEMA_VERSION);
        let err = verify_db_config(&recorded, &other).expect_err("must fail");
        assert!(matches!(err, StateError::BadConfig { .. }));
    }

    #[test]
    fn symlinked_path_compares_equal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let real = dir.path().join("real");
        std::fs::create_dir(&real).expect("mkdir");
        let link = dir.path().join("link");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&real, &link).expect("symlink");
        #[cfg(unix)]
        check_path("static dir", &real, &link).expect("symlink must resolve equal");
    }

    #[test]
    fn creating_kv_store_without_override_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = StoreConfig::rooted_at(dir.path());
        cfg.backend = StoreBackend::Keyvalue;
        // The override env var is not set in the test environment.
        if std::env::var_os(ENV_FORCE_KV_BACKEND).is_none() {
            let err = open(&cfg).expect_err("kv creation must require the override");
            assert!(matches!(err, StateError::InvalidArgument { .. }));
        }
    }
}
