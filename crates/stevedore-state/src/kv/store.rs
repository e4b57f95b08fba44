//! redb implementation of the entity store.
//!
//! Every logical operation runs inside exactly one read or one write
//! transaction; redb serializes writers store-wide and readers see the last
//! committed state, which is what gives multi-index writes their atomicity.
//! A write transaction dropped on an error path aborts, so no partial
//! fan-out write is ever observable.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use redb::{Database, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use stevedore_common::config::{StoreBackend, StoreConfig};
use stevedore_common::constants::{EXIT_CODE_RETENTION_SECS, KV_DB_NAME, SCHEMA_VERSION};
use stevedore_common::types::{
    ContainerConfig, ContainerRuntimeState, DbConfig, ExecSession, PerNetworkOptions, PodConfig,
    PodRuntimeState, VolumeConfig, VolumeRuntimeState,
};

use super::tables as t;
use crate::error::{Result, StateError};
use crate::store::{self, EntityStore};

/// Entity store backed by a single redb file.
#[derive(Debug)]
pub struct KvState {
    db: Database,
    valid: AtomicBool,
}

impl KvState {
    /// Opens (or creates) the key-value store under `config.static_dir`.
    ///
    /// First open creates every table and persists the `DbConfig` record;
    /// reopening a file that lacks expected tables re-creates them in the
    /// same write transaction. The recorded configuration is validated
    /// against `config` before the store is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::BadConfig`] on a configuration mismatch, or a
    /// backend error if the file cannot be opened.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.static_dir.join(KV_DB_NAME);
        let db = Database::create(&path)?;
        let recorded = init_schema(&db, config)?;
        store::verify_db_config(&recorded, config)?;
        tracing::debug!(path = %path.display(), "opened key-value state store");
        Ok(Self {
            db,
            valid: AtomicBool::new(true),
        })
    }

    fn check_valid(&self) -> Result<()> {
        if self.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StateError::StoreClosed)
        }
    }

    /// Shared body of [`EntityStore::add_container`] and
    /// [`EntityStore::add_container_to_pod`]; `pod_id` is the pod whose
    /// membership index gains the container, if any.
    fn add_container_inner(
        &self,
        config: &ContainerConfig,
        state: &ContainerRuntimeState,
        pod_id: Option<&str>,
    ) -> Result<()> {
        ensure_nonempty(&config.id)?;
        ensure_nonempty(&config.name)?;
        match (pod_id, config.pod_id.as_deref()) {
            (None, Some(_)) => {
                return Err(StateError::invalid_arg(
                    "cannot add a container that belongs to a pod with add_container; \
                     use add_container_to_pod",
                ));
            }
            (Some(pod), other) if other != Some(pod) => {
                return Err(StateError::invalid_arg(format!(
                    "container {} is not configured as a member of pod {pod}",
                    config.id
                )));
            }
            _ => {}
        }

        let txn = self.db.begin_write()?;
        {
            let mut id_registry = txn.open_table(t::ID_REGISTRY)?;
            let mut name_registry = txn.open_table(t::NAME_REGISTRY)?;
            let mut ctr_config = txn.open_table(t::CTR_CONFIG)?;
            let mut ctr_state = txn.open_table(t::CTR_STATE)?;
            let mut all_ctrs = txn.open_table(t::ALL_CTRS)?;
            let mut ctr_deps = txn.open_table(t::CTR_DEPS)?;
            let mut ctr_networks = txn.open_table(t::CTR_NETWORKS)?;
            let mut vol_deps = txn.open_table(t::VOL_DEPS)?;
            let vol_config = txn.open_table(t::VOL_CONFIG)?;
            let pod_config = txn.open_table(t::POD_CONFIG)?;
            let mut pod_ctrs = txn.open_table(t::POD_CTRS)?;

            if let Some(pod) = pod_id {
                if pod_config.get(pod)?.is_none() {
                    return Err(StateError::NoSuchPod { id: pod.to_owned() });
                }
            }

            if id_registry.get(config.id.as_str())?.is_some() {
                return Err(taken_id_error(&ctr_config, &config.id));
            }
            let name_owner = name_registry
                .get(config.name.as_str())?
                .map(|guard| guard.value().to_owned());
            if let Some(owner) = name_owner {
                return Err(name_in_use_error(&ctr_config, &config.name, &owner));
            }

            for dep in &config.dependencies {
                let dep_config: ContainerConfig = get_json(&ctr_config, dep)?
                    .ok_or_else(|| StateError::NoSuchContainer { id: dep.clone() })?;
                if dep_config.pod_id != config.pod_id {
                    return Err(StateError::invalid_arg(format!(
                        "container {} depends on container {dep} which is in a different pod",
                        config.id
                    )));
                }
            }
            for volume in &config.volumes {
                if vol_config.get(volume.as_str())?.is_none() {
                    return Err(StateError::NoSuchVolume {
                        name: volume.clone(),
                    });
                }
            }

            let config_json = to_json(config)?;
            let state_json = to_json(state)?;
            let _ = id_registry.insert(config.id.as_str(), config.name.as_str())?;
            let _ = name_registry.insert(config.name.as_str(), config.id.as_str())?;
            let _ = ctr_config.insert(config.id.as_str(), config_json.as_slice())?;
            let _ = ctr_state.insert(config.id.as_str(), state_json.as_slice())?;
            let _ = all_ctrs.insert(config.id.as_str(), config.name.as_str())?;
            for dep in &config.dependencies {
                let _ = ctr_deps.insert(t::scoped(dep, &config.id).as_str(), ())?;
            }
            for volume in &config.volumes {
                let _ = vol_deps.insert(t::scoped(volume, &config.id).as_str(), ())?;
            }
            for (network, opts) in &config.networks {
                let opts_json = to_json(opts)?;
                let _ = ctr_networks
                    .insert(t::scoped(&config.id, network).as_str(), opts_json.as_slice())?;
            }
            if let Some(pod) = pod_id {
                let _ = pod_ctrs.insert(t::scoped(pod, &config.id).as_str(), config.name.as_str())?;
            }
        }
        txn.commit()?;
        tracing::debug!(id = %config.id, name = %config.name, "added container");
        Ok(())
    }

    /// Shared body of [`EntityStore::remove_container`] and
    /// [`EntityStore::remove_container_from_pod`].
    fn remove_container_inner(&self, id: &str, pod_id: Option<&str>) -> Result<()> {
        ensure_nonempty(id)?;
        let txn = self.db.begin_write()?;
        {
            let mut id_registry = txn.open_table(t::ID_REGISTRY)?;
            let mut name_registry = txn.open_table(t::NAME_REGISTRY)?;
            let mut ctr_config = txn.open_table(t::CTR_CONFIG)?;
            let mut ctr_state = txn.open_table(t::CTR_STATE)?;
            let mut all_ctrs = txn.open_table(t::ALL_CTRS)?;
            let mut ctr_deps = txn.open_table(t::CTR_DEPS)?;
            let mut ctr_networks = txn.open_table(t::CTR_NETWORKS)?;
            let ctr_exec = txn.open_table(t::CTR_EXEC)?;
            let mut vol_deps = txn.open_table(t::VOL_DEPS)?;
            let mut pod_ctrs = txn.open_table(t::POD_CTRS)?;

            let config: ContainerConfig = get_json(&ctr_config, id)?
                .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;

            match (pod_id, config.pod_id.as_deref()) {
                (None, Some(pod)) => {
                    return Err(StateError::invalid_arg(format!(
                        "container {id} is part of pod {pod}; use remove_container_from_pod"
                    )));
                }
                (Some(pod), other) if other != Some(pod) => {
                    return Err(StateError::invalid_arg(format!(
                        "container {id} is not a member of pod {pod}"
                    )));
                }
                _ => {}
            }

            let dependents = children(&ctr_deps, id)?;
            if !dependents.is_empty() {
                return Err(StateError::ContainerInUse {
                    id: id.to_owned(),
                    dependents,
                });
            }
            if !children(&ctr_exec, id)?.is_empty() {
                return Err(StateError::ExecSessionsActive { id: id.to_owned() });
            }

            let _ = id_registry.remove(id)?;
            let _ = name_registry.remove(config.name.as_str())?;
            let _ = ctr_config.remove(id)?;
            let _ = ctr_state.remove(id)?;
            let _ = all_ctrs.remove(id)?;
            for key in prefix_keys(&ctr_networks, id)? {
                let _ = ctr_networks.remove(key.as_str())?;
            }
            for dep in &config.dependencies {
                let _ = ctr_deps.remove(t::scoped(dep, id).as_str())?;
            }
            // Tolerate missing entries; volume dependency sets are allowed
            // to go stale.
            for volume in &config.volumes {
                let _ = vol_deps.remove(t::scoped(volume, id).as_str())?;
            }
            if let Some(pod) = pod_id {
                let _ = pod_ctrs.remove(t::scoped(pod, id).as_str())?;
            }
        }
        txn.commit()?;
        tracing::debug!(id, "removed container");
        Ok(())
    }
}

impl EntityStore for KvState {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Keyvalue
    }

    fn close(&self) -> Result<()> {
        self.valid.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        self.check_valid()?;
        let txn = self.db.begin_write()?;
        {
            let mut id_registry = txn.open_table(t::ID_REGISTRY)?;
            let mut name_registry = txn.open_table(t::NAME_REGISTRY)?;
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            let mut ctr_state = txn.open_table(t::CTR_STATE)?;
            let pod_config = txn.open_table(t::POD_CONFIG)?;
            let mut pod_state = txn.open_table(t::POD_STATE)?;
            let mut ctr_exec = txn.open_table(t::CTR_EXEC)?;
            let mut exec_registry = txn.open_table(t::EXEC_REGISTRY)?;
            let mut exit_codes = txn.open_table(t::EXIT_CODES)?;
            let mut exit_timestamps = txn.open_table(t::EXIT_TIMESTAMPS)?;

            let mut ctr_states = Vec::new();
            for entry in ctr_state.iter()? {
                let (key, value) = entry?;
                let mut state: ContainerRuntimeState = from_json(value.value())?;
                state.reset_after_reboot();
                ctr_states.push((key.value().to_owned(), to_json(&state)?));
            }
            for (id, raw) in ctr_states {
                let _ = ctr_state.insert(id.as_str(), raw.as_slice())?;
            }

            let mut pod_states = Vec::new();
            for entry in pod_state.iter()? {
                let (key, value) = entry?;
                let mut state: PodRuntimeState = from_json(value.value())?;
                state.reset_after_reboot();
                pod_states.push((key.value().to_owned(), to_json(&state)?));
            }
            for (id, raw) in pod_states {
                let _ = pod_state.insert(id.as_str(), raw.as_slice())?;
            }

            // The global registry and the per-container sub-registry are one
            // logical mapping; they are cleared together or not at all.
            for key in all_keys(&exec_registry)? {
                let _ = exec_registry.remove(key.as_str())?;
            }
            for key in all_keys(&ctr_exec)? {
                let _ = ctr_exec.remove(key.as_str())?;
            }

            // Exit codes and their timestamps are paired invariants; neither
            // may survive without the other.
            for key in all_keys(&exit_codes)? {
                let _ = exit_codes.remove(key.as_str())?;
            }
            for key in all_keys(&exit_timestamps)? {
                let _ = exit_timestamps.remove(key.as_str())?;
            }

            // Best-effort repair: registry entries whose ID is neither a
            // container nor a pod are deleted rather than failing the boot.
            let mut dangling = Vec::new();
            for entry in id_registry.iter()? {
                let (id, name) = entry?;
                if ctr_config.get(id.value())?.is_none() && pod_config.get(id.value())?.is_none() {
                    dangling.push((id.value().to_owned(), name.value().to_owned()));
                }
            }
            for (id, name) in dangling {
                tracing::error!(id, name, "dangling registry entry (not a container or pod), removing");
                let _ = id_registry.remove(id.as_str())?;
                let _ = name_registry.remove(name.as_str())?;
            }
        }
        txn.commit()?;
        tracing::debug!("refreshed state after reboot");
        Ok(())
    }

    fn db_config(&self) -> Result<DbConfig> {
        self.check_valid()?;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(t::RUNTIME_CONFIG)?;
        get_json(&table, t::DB_CONFIG_KEY)?
            .ok_or_else(|| StateError::internal("store is missing its DbConfig record"))
    }

    fn validate_db_config(&self, config: &StoreConfig) -> Result<()> {
        store::verify_db_config(&self.db_config()?, config)
    }

    // ── Containers ───────────────────────────────────────────────────

    fn container(&self, id: &str) -> Result<(ContainerConfig, ContainerRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        let ctr_state = txn.open_table(t::CTR_STATE)?;
        read_container(&ctr_config, &ctr_state, id)
    }

    fn lookup_container_id(&self, id_or_name: &str) -> Result<String> {
        self.check_valid()?;
        ensure_nonempty(id_or_name)?;
        let txn = self.db.begin_read()?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        let name_registry = txn.open_table(t::NAME_REGISTRY)?;
        resolve_ctr_id(&ctr_config, &name_registry, id_or_name)
    }

    fn lookup_container(&self, id_or_name: &str) -> Result<(ContainerConfig, ContainerRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(id_or_name)?;
        let txn = self.db.begin_read()?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        let ctr_state = txn.open_table(t::CTR_STATE)?;
        let name_registry = txn.open_table(t::NAME_REGISTRY)?;
        let id = resolve_ctr_id(&ctr_config, &name_registry, id_or_name)?;
        read_container(&ctr_config, &ctr_state, &id)
    }

    fn has_container(&self, id: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        Ok(ctr_config.get(id)?.is_some())
    }

    fn container_name(&self, id: &str) -> Result<String> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        let id_registry = txn.open_table(t::ID_REGISTRY)?;
        if ctr_config.get(id)?.is_none() {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        id_registry
            .get(id)?
            .map(|guard| guard.value().to_owned())
            .ok_or_else(|| {
                StateError::internal(format!("container {id} is missing its registry entry"))
            })
    }

    fn add_container(
        &self,
        config: &ContainerConfig,
        state: &ContainerRuntimeState,
    ) -> Result<()> {
        self.check_valid()?;
        self.add_container_inner(config, state, None)
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        self.check_valid()?;
        self.remove_container_inner(id, None)
    }

    fn update_container(&self, id: &str) -> Result<ContainerRuntimeState> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let ctr_state = txn.open_table(t::CTR_STATE)?;
        get_json(&ctr_state, id)?
            .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })
    }

    fn save_container(&self, id: &str, state: &ContainerRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_write()?;
        {
            let mut ctr_state = txn.open_table(t::CTR_STATE)?;
            if ctr_state.get(id)?.is_none() {
                return Err(StateError::NoSuchContainer { id: id.to_owned() });
            }
            let raw = to_json(state)?;
            let _ = ctr_state.insert(id, raw.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn container_in_use(&self, id: &str) -> Result<Vec<String>> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        if ctr_config.get(id)?.is_none() {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        let ctr_deps = txn.open_table(t::CTR_DEPS)?;
        children(&ctr_deps, id)
    }

    fn all_containers(&self) -> Result<Vec<(ContainerConfig, ContainerRuntimeState)>> {
        self.check_valid()?;
        let txn = self.db.begin_read()?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        let ctr_state = txn.open_table(t::CTR_STATE)?;
        let mut out = Vec::new();
        for entry in ctr_config.iter()? {
            let (key, value) = entry?;
            let config: ContainerConfig = from_json(value.value())?;
            let state = get_json(&ctr_state, key.value())?.ok_or_else(|| {
                StateError::internal(format!("container {} is missing its state", key.value()))
            })?;
            out.push((config, state));
        }
        Ok(out)
    }

    fn container_config(&self, id: &str) -> Result<ContainerConfig> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        get_json(&ctr_config, id)?
            .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })
    }

    fn rewrite_container_config(&self, id: &str, new_config: &ContainerConfig) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_write()?;
        {
            let mut ctr_config = txn.open_table(t::CTR_CONFIG)?;
            let current: ContainerConfig = get_json(&ctr_config, id)?
                .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;
            if new_config.id != current.id || new_config.name != current.name {
                return Err(StateError::invalid_arg(
                    "rewrite_container_config cannot alter container ID or name",
                ));
            }
            let raw = to_json(new_config)?;
            let _ = ctr_config.insert(id, raw.as_slice())?;
        }
        txn.commit()?;
        tracing::debug!(id, "rewrote container config");
        Ok(())
    }

    fn safe_rewrite_container_config(
        &self,
        id: &str,
        old_name: &str,
        new_name: &str,
        new_config: &ContainerConfig,
    ) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let renaming = old_name != new_name;
        if renaming && new_name.is_empty() {
            return Err(StateError::EmptyIdentifier);
        }
        let txn = self.db.begin_write()?;
        {
            let mut id_registry = txn.open_table(t::ID_REGISTRY)?;
            let mut name_registry = txn.open_table(t::NAME_REGISTRY)?;
            let mut ctr_config = txn.open_table(t::CTR_CONFIG)?;
            let mut all_ctrs = txn.open_table(t::ALL_CTRS)?;
            let mut pod_ctrs = txn.open_table(t::POD_CTRS)?;

            let current: ContainerConfig = get_json(&ctr_config, id)?
                .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;

            if new_config.id != id {
                return Err(StateError::invalid_arg(
                    "safe_rewrite_container_config cannot alter the container ID",
                ));
            }
            if new_config.pod_id != current.pod_id {
                return Err(StateError::invalid_arg(
                    "safe_rewrite_container_config cannot alter pod membership",
                ));
            }
            if new_config.dependencies != current.dependencies
                || new_config.volumes != current.volumes
            {
                return Err(StateError::invalid_arg(
                    "safe_rewrite_container_config cannot alter dependencies",
                ));
            }
            if new_config.lock_id != current.lock_id {
                return Err(StateError::invalid_arg(
                    "safe_rewrite_container_config cannot alter the lock ID",
                ));
            }
            let expected_name = if renaming { new_name } else { old_name };
            if new_config.name != expected_name {
                return Err(StateError::invalid_arg(
                    "new config name does not match the requested name",
                ));
            }

            if renaming {
                if current.name != old_name {
                    return Err(StateError::internal(format!(
                        "container {id} is named {:?}, not {old_name:?}",
                        current.name
                    )));
                }
                // All four denormalized name indices move together; the
                // transaction aborts wholesale if any write fails.
                let _ = name_registry.remove(old_name)?;
                let _ = id_registry.insert(id, new_name)?;
                let _ = all_ctrs.insert(id, new_name)?;
                if let Some(pod) = current.pod_id.as_deref() {
                    let _ = pod_ctrs.insert(t::scoped(pod, id).as_str(), new_name)?;
                }
                // The name registry goes last. A taken name surfaces here,
                // after the other indices have already been rewritten, and
                // dropping the transaction rolls every one of them back.
                let holder = name_registry
                    .insert(new_name, id)?
                    .map(|guard| guard.value().to_owned());
                if let Some(owner) = holder {
                    return Err(name_in_use_error(&ctr_config, new_name, &owner));
                }
            }

            let raw = to_json(new_config)?;
            let _ = ctr_config.insert(id, raw.as_slice())?;
        }
        txn.commit()?;
        if renaming {
            tracing::info!(id, old_name, new_name, "renamed container");
        }
        Ok(())
    }

    // ── Container networks ───────────────────────────────────────────

    fn networks(&self, id: &str) -> Result<HashMap<String, PerNetworkOptions>> {
        self.check_valid()?;
        ensure_nonempty(id)?;

        let mut out = HashMap::new();
        let mut all_networks = Vec::new();
        let mut legacy = HashSet::new();
        {
            let txn = self.db.begin_read()?;
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            if ctr_config.get(id)?.is_none() {
                return Err(StateError::NoSuchContainer { id: id.to_owned() });
            }
            let ctr_networks = txn.open_table(t::CTR_NETWORKS)?;
            let (lower, upper) = t::prefix_bounds(id);
            for entry in ctr_networks.range::<&str>(lower.as_str()..upper.as_str())? {
                let (key, value) = entry?;
                let network = key
                    .value()
                    .split_once(':')
                    .map(|(_, network)| network.to_owned())
                    .ok_or_else(|| StateError::internal("malformed network key"))?;
                match serde_json::from_slice::<PerNetworkOptions>(value.value()) {
                    Ok(opts) => {
                        let _ = out.insert(network.clone(), opts);
                    }
                    // Pre-migration records hold the raw container ID
                    // instead of a JSON options blob.
                    Err(_) if value.value() == id.as_bytes() => {
                        let _ = legacy.insert(network.clone());
                    }
                    Err(err) => return Err(err.into()),
                }
                all_networks.push(network);
            }
        }

        if legacy.is_empty() {
            return Ok(out);
        }

        // Upgrade the legacy records in their own write transaction; no
        // partially-migrated bucket is observable outside it.
        let txn = self.db.begin_write()?;
        {
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            let config: ContainerConfig = get_json(&ctr_config, id)?
                .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;
            let mut ctr_networks = txn.open_table(t::CTR_NETWORKS)?;
            for (index, network) in all_networks.iter().enumerate() {
                if !legacy.contains(network) {
                    continue;
                }
                let mut opts = PerNetworkOptions {
                    interface_name: format!("eth{index}"),
                    aliases: vec![config.short_id().to_owned()],
                    ..PerNetworkOptions::default()
                };
                // Static addressing predates per-network options and only
                // ever applied to the first network.
                if index == 0 {
                    if let Some(ip) = config.static_ip {
                        opts.static_ips.push(ip);
                    }
                    opts.static_mac = config.static_mac.clone();
                }
                let raw = to_json(&opts)?;
                let _ = ctr_networks.insert(t::scoped(id, network).as_str(), raw.as_slice())?;
                let _ = out.insert(network.clone(), opts);
            }
        }
        txn.commit()?;
        tracing::info!(id, migrated = legacy.len(), "rewrote legacy network records");
        Ok(out)
    }

    fn network_connect(&self, id: &str, network: &str, opts: &PerNetworkOptions) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        if network.is_empty() {
            return Err(StateError::invalid_arg("network names may not be empty"));
        }
        let txn = self.db.begin_write()?;
        {
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            if ctr_config.get(id)?.is_none() {
                return Err(StateError::NoSuchContainer { id: id.to_owned() });
            }
            let mut ctr_networks = txn.open_table(t::CTR_NETWORKS)?;
            let key = t::scoped(id, network);
            if ctr_networks.get(key.as_str())?.is_some() {
                return Err(StateError::NetworkConnected {
                    id: id.to_owned(),
                    network: network.to_owned(),
                });
            }
            let raw = to_json(opts)?;
            let _ = ctr_networks.insert(key.as_str(), raw.as_slice())?;
        }
        txn.commit()?;
        tracing::debug!(id, network, "connected container to network");
        Ok(())
    }

    fn network_modify(&self, id: &str, network: &str, opts: &PerNetworkOptions) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        if network.is_empty() {
            return Err(StateError::invalid_arg("network names may not be empty"));
        }
        let txn = self.db.begin_write()?;
        {
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            if ctr_config.get(id)?.is_none() {
                return Err(StateError::NoSuchContainer { id: id.to_owned() });
            }
            let mut ctr_networks = txn.open_table(t::CTR_NETWORKS)?;
            let key = t::scoped(id, network);
            if ctr_networks.get(key.as_str())?.is_none() {
                return Err(StateError::NetworkNotConnected {
                    id: id.to_owned(),
                    network: network.to_owned(),
                });
            }
            let raw = to_json(opts)?;
            let _ = ctr_networks.insert(key.as_str(), raw.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn network_disconnect(&self, id: &str, network: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        if network.is_empty() {
            return Err(StateError::invalid_arg("network names may not be empty"));
        }
        let txn = self.db.begin_write()?;
        {
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            if ctr_config.get(id)?.is_none() {
                return Err(StateError::NoSuchContainer { id: id.to_owned() });
            }
            let mut ctr_networks = txn.open_table(t::CTR_NETWORKS)?;
            let key = t::scoped(id, network);
            if ctr_networks.remove(key.as_str())?.is_none() {
                return Err(StateError::NetworkNotConnected {
                    id: id.to_owned(),
                    network: network.to_owned(),
                });
            }
        }
        txn.commit()?;
        tracing::debug!(id, network, "disconnected container from network");
        Ok(())
    }

    // ── Exec sessions ────────────────────────────────────────────────

    fn add_exec_session(&self, session: &ExecSession) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(&session.id)?;
        ensure_nonempty(&session.container_id)?;
        let txn = self.db.begin_write()?;
        {
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            if ctr_config.get(session.container_id.as_str())?.is_none() {
                return Err(StateError::NoSuchContainer {
                    id: session.container_id.clone(),
                });
            }
            let mut exec_registry = txn.open_table(t::EXEC_REGISTRY)?;
            if exec_registry.get(session.id.as_str())?.is_some() {
                return Err(StateError::ExecSessionExists {
                    id: session.id.clone(),
                });
            }
            let mut ctr_exec = txn.open_table(t::CTR_EXEC)?;
            let _ = exec_registry.insert(session.id.as_str(), session.container_id.as_str())?;
            let _ = ctr_exec
                .insert(t::scoped(&session.container_id, &session.id).as_str(), ())?;
        }
        txn.commit()?;
        tracing::debug!(session = %session.id, container = %session.container_id, "registered exec session");
        Ok(())
    }

    fn exec_session_container(&self, id: &str) -> Result<String> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let exec_registry = txn.open_table(t::EXEC_REGISTRY)?;
        exec_registry
            .get(id)?
            .map(|guard| guard.value().to_owned())
            .ok_or_else(|| StateError::NoSuchExecSession { id: id.to_owned() })
    }

    fn remove_exec_session(&self, session: &ExecSession) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(&session.id)?;
        let txn = self.db.begin_write()?;
        {
            let mut exec_registry = txn.open_table(t::EXEC_REGISTRY)?;
            let mut ctr_exec = txn.open_table(t::CTR_EXEC)?;
            let owner = exec_registry
                .get(session.id.as_str())?
                .map(|guard| guard.value().to_owned())
                .ok_or_else(|| StateError::NoSuchExecSession {
                    id: session.id.clone(),
                })?;
            // The global registry and the container's sub-registry must
            // agree; a mismatch is a corrupted store.
            if owner != session.container_id {
                return Err(StateError::internal(format!(
                    "exec session {} is owned by container {owner}, not {}",
                    session.id, session.container_id
                )));
            }
            let _ = exec_registry.remove(session.id.as_str())?;
            let _ = ctr_exec.remove(t::scoped(&owner, &session.id).as_str())?;
        }
        txn.commit()?;
        tracing::debug!(session = %session.id, "removed exec session");
        Ok(())
    }

    fn container_exec_sessions(&self, id: &str) -> Result<Vec<String>> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        if ctr_config.get(id)?.is_none() {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        let ctr_exec = txn.open_table(t::CTR_EXEC)?;
        children(&ctr_exec, id)
    }

    fn remove_container_exec_sessions(&self, id: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_write()?;
        {
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            if ctr_config.get(id)?.is_none() {
                return Err(StateError::NoSuchContainer { id: id.to_owned() });
            }
            let mut exec_registry = txn.open_table(t::EXEC_REGISTRY)?;
            let mut ctr_exec = txn.open_table(t::CTR_EXEC)?;
            for session in children(&ctr_exec, id)? {
                let _ = exec_registry.remove(session.as_str())?;
                let _ = ctr_exec.remove(t::scoped(id, &session).as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    // ── Exit codes ───────────────────────────────────────────────────

    fn add_container_exit_code(&self, id: &str, exit_code: i32) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        store::ensure_exit_code_in_range(exit_code)?;
        let txn = self.db.begin_write()?;
        {
            let mut exit_codes = txn.open_table(t::EXIT_CODES)?;
            let mut exit_timestamps = txn.open_table(t::EXIT_TIMESTAMPS)?;
            let _ = exit_codes.insert(id, exit_code)?;
            let _ = exit_timestamps.insert(id, Utc::now().timestamp())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn container_exit_code(&self, id: &str) -> Result<i32> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let exit_codes = txn.open_table(t::EXIT_CODES)?;
        exit_codes
            .get(id)?
            .map(|guard| guard.value())
            .ok_or_else(|| StateError::NoSuchExitCode { id: id.to_owned() })
    }

    fn container_exit_code_timestamp(&self, id: &str) -> Result<DateTime<Utc>> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let exit_timestamps = txn.open_table(t::EXIT_TIMESTAMPS)?;
        let seconds = exit_timestamps
            .get(id)?
            .map(|guard| guard.value())
            .ok_or_else(|| StateError::NoSuchExitCode { id: id.to_owned() })?;
        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| StateError::internal(format!("invalid exit-code timestamp {seconds}")))
    }

    fn prune_container_exit_codes(&self) -> Result<()> {
        self.check_valid()?;
        let cutoff = Utc::now().timestamp() - EXIT_CODE_RETENTION_SECS;
        let txn = self.db.begin_write()?;
        {
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            let mut exit_codes = txn.open_table(t::EXIT_CODES)?;
            let mut exit_timestamps = txn.open_table(t::EXIT_TIMESTAMPS)?;
            let mut expired = Vec::new();
            for entry in exit_timestamps.iter()? {
                let (key, value) = entry?;
                if value.value() <= cutoff && ctr_config.get(key.value())?.is_none() {
                    expired.push(key.value().to_owned());
                }
            }
            for id in expired {
                let _ = exit_codes.remove(id.as_str())?;
                let _ = exit_timestamps.remove(id.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn container_id_is_volume(&self, id: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let vol_ctrs = txn.open_table(t::VOL_CTRS)?;
        Ok(vol_ctrs.get(id)?.is_some())
    }

    // ── Pods ─────────────────────────────────────────────────────────

    fn pod(&self, id: &str) -> Result<(PodConfig, PodRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let pod_config = txn.open_table(t::POD_CONFIG)?;
        let pod_state = txn.open_table(t::POD_STATE)?;
        read_pod(&pod_config, &pod_state, id)
    }

    fn lookup_pod(&self, id_or_name: &str) -> Result<(PodConfig, PodRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(id_or_name)?;
        let txn = self.db.begin_read()?;
        let pod_config = txn.open_table(t::POD_CONFIG)?;
        let pod_state = txn.open_table(t::POD_STATE)?;
        let name_registry = txn.open_table(t::NAME_REGISTRY)?;
        let id = resolve_pod_id(&pod_config, &name_registry, id_or_name)?;
        read_pod(&pod_config, &pod_state, &id)
    }

    fn has_pod(&self, id: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let pod_config = txn.open_table(t::POD_CONFIG)?;
        Ok(pod_config.get(id)?.is_some())
    }

    fn pod_name(&self, id: &str) -> Result<String> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let pod_config = txn.open_table(t::POD_CONFIG)?;
        let id_registry = txn.open_table(t::ID_REGISTRY)?;
        if pod_config.get(id)?.is_none() {
            return Err(StateError::NoSuchPod { id: id.to_owned() });
        }
        id_registry
            .get(id)?
            .map(|guard| guard.value().to_owned())
            .ok_or_else(|| StateError::internal(format!("pod {id} is missing its registry entry")))
    }

    fn pod_has_container(&self, pod_id: &str, ctr_id: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(pod_id)?;
        ensure_nonempty(ctr_id)?;
        let txn = self.db.begin_read()?;
        let pod_config = txn.open_table(t::POD_CONFIG)?;
        if pod_config.get(pod_id)?.is_none() {
            return Err(StateError::NoSuchPod {
                id: pod_id.to_owned(),
            });
        }
        let pod_ctrs = txn.open_table(t::POD_CTRS)?;
        Ok(pod_ctrs.get(t::scoped(pod_id, ctr_id).as_str())?.is_some())
    }

    fn pod_containers(&self, pod_id: &str) -> Result<Vec<String>> {
        self.check_valid()?;
        ensure_nonempty(pod_id)?;
        let txn = self.db.begin_read()?;
        let pod_config = txn.open_table(t::POD_CONFIG)?;
        if pod_config.get(pod_id)?.is_none() {
            return Err(StateError::NoSuchPod {
                id: pod_id.to_owned(),
            });
        }
        let pod_ctrs = txn.open_table(t::POD_CTRS)?;
        children(&pod_ctrs, pod_id)
    }

    fn add_pod(&self, config: &PodConfig, state: &PodRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(&config.id)?;
        ensure_nonempty(&config.name)?;
        let txn = self.db.begin_write()?;
        {
            let mut id_registry = txn.open_table(t::ID_REGISTRY)?;
            let mut name_registry = txn.open_table(t::NAME_REGISTRY)?;
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;
            let mut pod_config = txn.open_table(t::POD_CONFIG)?;
            let mut pod_state = txn.open_table(t::POD_STATE)?;
            let mut all_pods = txn.open_table(t::ALL_PODS)?;

            if id_registry.get(config.id.as_str())?.is_some() {
                if ctr_config.get(config.id.as_str())?.is_some() {
                    return Err(StateError::ContainerExists {
                        id: config.id.clone(),
                    });
                }
                return Err(StateError::PodExists {
                    id: config.id.clone(),
                });
            }
            let name_owner = name_registry
                .get(config.name.as_str())?
                .map(|guard| guard.value().to_owned());
            if let Some(owner) = name_owner {
                return Err(name_in_use_error(&ctr_config, &config.name, &owner));
            }

            let config_json = to_json(config)?;
            let state_json = to_json(state)?;
            let _ = id_registry.insert(config.id.as_str(), config.name.as_str())?;
            let _ = name_registry.insert(config.name.as_str(), config.id.as_str())?;
            let _ = pod_config.insert(config.id.as_str(), config_json.as_slice())?;
            let _ = pod_state.insert(config.id.as_str(), state_json.as_slice())?;
            let _ = all_pods.insert(config.id.as_str(), config.name.as_str())?;
        }
        txn.commit()?;
        tracing::debug!(id = %config.id, name = %config.name, "added pod");
        Ok(())
    }

    fn remove_pod(&self, id: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_write()?;
        {
            let mut id_registry = txn.open_table(t::ID_REGISTRY)?;
            let mut name_registry = txn.open_table(t::NAME_REGISTRY)?;
            let mut pod_config = txn.open_table(t::POD_CONFIG)?;
            let mut pod_state = txn.open_table(t::POD_STATE)?;
            let mut all_pods = txn.open_table(t::ALL_PODS)?;
            let pod_ctrs = txn.open_table(t::POD_CTRS)?;

            let config: PodConfig = get_json(&pod_config, id)?
                .ok_or_else(|| StateError::NoSuchPod { id: id.to_owned() })?;
            if !children(&pod_ctrs, id)?.is_empty() {
                return Err(StateError::PodNotEmpty { id: id.to_owned() });
            }

            let _ = id_registry.remove(id)?;
            let _ = name_registry.remove(config.name.as_str())?;
            let _ = pod_config.remove(id)?;
            let _ = pod_state.remove(id)?;
            let _ = all_pods.remove(id)?;
        }
        txn.commit()?;
        tracing::debug!(id, "removed pod");
        Ok(())
    }

    fn remove_pod_containers(&self, id: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_write()?;
        {
            let mut id_registry = txn.open_table(t::ID_REGISTRY)?;
            let mut name_registry = txn.open_table(t::NAME_REGISTRY)?;
            let mut ctr_config = txn.open_table(t::CTR_CONFIG)?;
            let mut ctr_state = txn.open_table(t::CTR_STATE)?;
            let mut all_ctrs = txn.open_table(t::ALL_CTRS)?;
            let mut ctr_deps = txn.open_table(t::CTR_DEPS)?;
            let mut ctr_networks = txn.open_table(t::CTR_NETWORKS)?;
            let mut ctr_exec = txn.open_table(t::CTR_EXEC)?;
            let mut exec_registry = txn.open_table(t::EXEC_REGISTRY)?;
            let mut vol_deps = txn.open_table(t::VOL_DEPS)?;
            let pod_config = txn.open_table(t::POD_CONFIG)?;
            let mut pod_ctrs = txn.open_table(t::POD_CTRS)?;

            if pod_config.get(id)?.is_none() {
                return Err(StateError::NoSuchPod { id: id.to_owned() });
            }
            let members = children(&pod_ctrs, id)?;
            let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();

            // Members may depend on each other (removed together), but a
            // dependent outside the pod blocks the whole operation.
            for member in &members {
                let outside: Vec<String> = children(&ctr_deps, member)?
                    .into_iter()
                    .filter(|dependent| !member_set.contains(dependent.as_str()))
                    .collect();
                if !outside.is_empty() {
                    return Err(StateError::ContainerInUse {
                        id: member.clone(),
                        dependents: outside,
                    });
                }
            }

            for member in &members {
                let config: ContainerConfig = get_json(&ctr_config, member)?.ok_or_else(|| {
                    StateError::internal(format!(
                        "pod {id} membership lists container {member} which does not exist"
                    ))
                })?;
                let _ = id_registry.remove(member.as_str())?;
                let _ = name_registry.remove(config.name.as_str())?;
                let _ = ctr_config.remove(member.as_str())?;
                let _ = ctr_state.remove(member.as_str())?;
                let _ = all_ctrs.remove(member.as_str())?;
                for key in prefix_keys(&ctr_networks, member)? {
                    let _ = ctr_networks.remove(key.as_str())?;
                }
                for dep in &config.dependencies {
                    let _ = ctr_deps.remove(t::scoped(dep, member).as_str())?;
                }
                for volume in &config.volumes {
                    let _ = vol_deps.remove(t::scoped(volume, member).as_str())?;
                }
                for session in children(&ctr_exec, member)? {
                    let _ = exec_registry.remove(session.as_str())?;
                    let _ = ctr_exec.remove(t::scoped(member, &session).as_str())?;
                }
                let _ = pod_ctrs.remove(t::scoped(id, member).as_str())?;
            }
        }
        txn.commit()?;
        tracing::debug!(id, "removed all pod containers");
        Ok(())
    }

    fn add_container_to_pod(
        &self,
        pod_id: &str,
        config: &ContainerConfig,
        state: &ContainerRuntimeState,
    ) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(pod_id)?;
        self.add_container_inner(config, state, Some(pod_id))
    }

    fn remove_container_from_pod(&self, pod_id: &str, ctr_id: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(pod_id)?;
        self.remove_container_inner(ctr_id, Some(pod_id))
    }

    fn update_pod(&self, id: &str) -> Result<PodRuntimeState> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_read()?;
        let pod_state = txn.open_table(t::POD_STATE)?;
        get_json(&pod_state, id)?.ok_or_else(|| StateError::NoSuchPod { id: id.to_owned() })
    }

    fn save_pod(&self, id: &str, state: &PodRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_write()?;
        {
            let mut pod_state = txn.open_table(t::POD_STATE)?;
            if pod_state.get(id)?.is_none() {
                return Err(StateError::NoSuchPod { id: id.to_owned() });
            }
            let raw = to_json(state)?;
            let _ = pod_state.insert(id, raw.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn all_pods(&self) -> Result<Vec<(PodConfig, PodRuntimeState)>> {
        self.check_valid()?;
        let txn = self.db.begin_read()?;
        let pod_config = txn.open_table(t::POD_CONFIG)?;
        let pod_state = txn.open_table(t::POD_STATE)?;
        let mut out = Vec::new();
        for entry in pod_config.iter()? {
            let (key, value) = entry?;
            let config: PodConfig = from_json(value.value())?;
            let state = get_json(&pod_state, key.value())?.ok_or_else(|| {
                StateError::internal(format!("pod {} is missing its state", key.value()))
            })?;
            out.push((config, state));
        }
        Ok(out)
    }

    fn rewrite_pod_config(&self, id: &str, new_config: &PodConfig) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let txn = self.db.begin_write()?;
        {
            let mut pod_config = txn.open_table(t::POD_CONFIG)?;
            let current: PodConfig = get_json(&pod_config, id)?
                .ok_or_else(|| StateError::NoSuchPod { id: id.to_owned() })?;
            if new_config.id != current.id || new_config.name != current.name {
                return Err(StateError::invalid_arg(
                    "rewrite_pod_config cannot alter pod ID or name",
                ));
            }
            let raw = to_json(new_config)?;
            let _ = pod_config.insert(id, raw.as_slice())?;
        }
        txn.commit()?;
        tracing::debug!(id, "rewrote pod config");
        Ok(())
    }

    // ── Volumes ──────────────────────────────────────────────────────

    fn volume(&self, name: &str) -> Result<(VolumeConfig, VolumeRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let txn = self.db.begin_read()?;
        let vol_config = txn.open_table(t::VOL_CONFIG)?;
        let vol_state = txn.open_table(t::VOL_STATE)?;
        read_volume(&vol_config, &vol_state, name)
    }

    fn lookup_volume(&self, name: &str) -> Result<(VolumeConfig, VolumeRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let txn = self.db.begin_read()?;
        let vol_config = txn.open_table(t::VOL_CONFIG)?;
        let vol_state = txn.open_table(t::VOL_STATE)?;
        if vol_config.get(name)?.is_some() {
            return read_volume(&vol_config, &vol_state, name);
        }
        let mut found: Option<String> = None;
        for entry in vol_config.iter()? {
            let (key, _) = entry?;
            if key.value().starts_with(name) {
                if found.is_some() {
                    return Err(StateError::VolumeExists {
                        name: name.to_owned(),
                    });
                }
                found = Some(key.value().to_owned());
            }
        }
        let full = found.ok_or_else(|| StateError::NoSuchVolume {
            name: name.to_owned(),
        })?;
        read_volume(&vol_config, &vol_state, &full)
    }

    fn has_volume(&self, name: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let txn = self.db.begin_read()?;
        let vol_config = txn.open_table(t::VOL_CONFIG)?;
        Ok(vol_config.get(name)?.is_some())
    }

    fn volume_in_use(&self, name: &str) -> Result<Vec<String>> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let txn = self.db.begin_read()?;
        let vol_config = txn.open_table(t::VOL_CONFIG)?;
        if vol_config.get(name)?.is_none() {
            return Err(StateError::NoSuchVolume {
                name: name.to_owned(),
            });
        }
        let vol_deps = txn.open_table(t::VOL_DEPS)?;
        let ctr_config = txn.open_table(t::CTR_CONFIG)?;
        // Stale entries for removed containers are filtered, not errors.
        let mut dependents = Vec::new();
        for ctr in children(&vol_deps, name)? {
            if ctr_config.get(ctr.as_str())?.is_some() {
                dependents.push(ctr);
            }
        }
        Ok(dependents)
    }

    fn add_volume(&self, config: &VolumeConfig, state: &VolumeRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(&config.name)?;
        let txn = self.db.begin_write()?;
        {
            let mut vol_config = txn.open_table(t::VOL_CONFIG)?;
            let mut vol_state = txn.open_table(t::VOL_STATE)?;
            let mut all_vols = txn.open_table(t::ALL_VOLS)?;
            let mut vol_ctrs = txn.open_table(t::VOL_CTRS)?;

            if vol_config.get(config.name.as_str())?.is_some() {
                return Err(StateError::VolumeExists {
                    name: config.name.clone(),
                });
            }

            let config_json = to_json(config)?;
            let state_json = to_json(state)?;
            let _ = vol_config.insert(config.name.as_str(), config_json.as_slice())?;
            let _ = vol_state.insert(config.name.as_str(), state_json.as_slice())?;
            let _ = all_vols.insert(config.name.as_str(), config.name.as_str())?;
            if let Some(storage_id) = config.storage_id.as_deref() {
                let _ = vol_ctrs.insert(storage_id, config.name.as_str())?;
            }
        }
        txn.commit()?;
        tracing::debug!(name = %config.name, "added volume");
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let txn = self.db.begin_write()?;
        {
            let mut vol_config = txn.open_table(t::VOL_CONFIG)?;
            let mut vol_state = txn.open_table(t::VOL_STATE)?;
            let mut all_vols = txn.open_table(t::ALL_VOLS)?;
            let mut vol_deps = txn.open_table(t::VOL_DEPS)?;
            let mut vol_ctrs = txn.open_table(t::VOL_CTRS)?;
            let ctr_config = txn.open_table(t::CTR_CONFIG)?;

            let config: VolumeConfig = get_json(&vol_config, name)?.ok_or_else(|| {
                StateError::NoSuchVolume {
                    name: name.to_owned(),
                }
            })?;

            let mut dependents = Vec::new();
            for ctr in children(&vol_deps, name)? {
                if ctr_config.get(ctr.as_str())?.is_some() {
                    dependents.push(ctr);
                }
            }
            if !dependents.is_empty() {
                return Err(StateError::VolumeInUse {
                    name: name.to_owned(),
                    dependents,
                });
            }

            let _ = vol_config.remove(name)?;
            let _ = vol_state.remove(name)?;
            let _ = all_vols.remove(name)?;
            for key in prefix_keys(&vol_deps, name)? {
                let _ = vol_deps.remove(key.as_str())?;
            }
            if let Some(storage_id) = config.storage_id.as_deref() {
                let _ = vol_ctrs.remove(storage_id)?;
            }
        }
        txn.commit()?;
        tracing::debug!(name, "removed volume");
        Ok(())
    }

    fn update_volume(&self, name: &str) -> Result<VolumeRuntimeState> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let txn = self.db.begin_read()?;
        let vol_state = txn.open_table(t::VOL_STATE)?;
        get_json(&vol_state, name)?.ok_or_else(|| StateError::NoSuchVolume {
            name: name.to_owned(),
        })
    }

    fn save_volume(&self, name: &str, state: &VolumeRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let txn = self.db.begin_write()?;
        {
            let mut vol_state = txn.open_table(t::VOL_STATE)?;
            if vol_state.get(name)?.is_none() {
                return Err(StateError::NoSuchVolume {
                    name: name.to_owned(),
                });
            }
            let raw = to_json(state)?;
            let _ = vol_state.insert(name, raw.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn all_volumes(&self) -> Result<Vec<(VolumeConfig, VolumeRuntimeState)>> {
        self.check_valid()?;
        let txn = self.db.begin_read()?;
        let vol_config = txn.open_table(t::VOL_CONFIG)?;
        let vol_state = txn.open_table(t::VOL_STATE)?;
        let mut out = Vec::new();
        for entry in vol_config.iter()? {
            let (key, value) = entry?;
            let config: VolumeConfig = from_json(value.value())?;
            let state = get_json(&vol_state, key.value())?.ok_or_else(|| {
                StateError::internal(format!("volume {} is missing its state", key.value()))
            })?;
            out.push((config, state));
        }
        Ok(out)
    }

    fn rewrite_volume_config(&self, name: &str, new_config: &VolumeConfig) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let txn = self.db.begin_write()?;
        {
            let mut vol_config = txn.open_table(t::VOL_CONFIG)?;
            let current: VolumeConfig = get_json(&vol_config, name)?.ok_or_else(|| {
                StateError::NoSuchVolume {
                    name: name.to_owned(),
                }
            })?;
            if new_config.name != current.name {
                return Err(StateError::invalid_arg(
                    "rewrite_volume_config cannot alter the volume name",
                ));
            }
            let raw = to_json(new_config)?;
            let _ = vol_config.insert(name, raw.as_slice())?;
        }
        txn.commit()?;
        tracing::debug!(name, "rewrote volume config");
        Ok(())
    }
}

// ── Schema & helpers ─────────────────────────────────────────────────

/// Creates any missing tables and persists (or reads back) the `DbConfig`
/// record, all in one write transaction.
fn init_schema(db: &Database, config: &StoreConfig) -> Result<DbConfig> {
    let txn = db.begin_write()?;
    let recorded = {
        let _ = txn.open_table(t::ID_REGISTRY)?;
        let _ = txn.open_table(t::NAME_REGISTRY)?;
        let _ = txn.open_table(t::CTR_CONFIG)?;
        let _ = txn.open_table(t::CTR_STATE)?;
        let _ = txn.open_table(t::CTR_DEPS)?;
        let _ = txn.open_table(t::CTR_NETWORKS)?;
        let _ = txn.open_table(t::CTR_EXEC)?;
        let _ = txn.open_table(t::ALL_CTRS)?;
        let _ = txn.open_table(t::POD_CONFIG)?;
        let _ = txn.open_table(t::POD_STATE)?;
        let _ = txn.open_table(t::POD_CTRS)?;
        let _ = txn.open_table(t::ALL_PODS)?;
        let _ = txn.open_table(t::VOL_CONFIG)?;
        let _ = txn.open_table(t::VOL_STATE)?;
        let _ = txn.open_table(t::VOL_DEPS)?;
        let _ = txn.open_table(t::ALL_VOLS)?;
        let _ = txn.open_table(t::VOL_CTRS)?;
        let _ = txn.open_table(t::EXEC_REGISTRY)?;
        let _ = txn.open_table(t::EXIT_CODES)?;
        let _ = txn.open_table(t::EXIT_TIMESTAMPS)?;

        let mut runtime_config = txn.open_table(t::RUNTIME_CONFIG)?;
        let existing = runtime_config
            .get(t::DB_CONFIG_KEY)?
            .map(|guard| guard.value().to_vec());
        match existing {
            Some(raw) => from_json(&raw)?,
            None => {
                let recorded = store::db_config_from_store_config(config, SCHEMA_VERSION);
                let raw = to_json(&recorded)?;
                let _ = runtime_config.insert(t::DB_CONFIG_KEY, raw.as_slice())?;
                recorded
            }
        }
    };
    txn.commit()?;
    Ok(recorded)
}

fn ensure_nonempty(value: &str) -> Result<()> {
    if value.is_empty() {
        Err(StateError::EmptyIdentifier)
    } else {
        Ok(())
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>> {
    match table.get(key)? {
        Some(guard) => Ok(Some(from_json(guard.value())?)),
        None => Ok(None),
    }
}

/// Every key of the table, collected so the caller can mutate while
/// iterating over the copy.
fn all_keys<V: redb::Value + 'static>(
    table: &impl ReadableTable<&'static str, V>,
) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in table.iter()? {
        let (key, _) = entry?;
        keys.push(key.value().to_owned());
    }
    Ok(keys)
}

/// Full composite keys under `{parent}:`.
fn prefix_keys<V: redb::Value + 'static>(
    table: &impl ReadableTable<&'static str, V>,
    parent: &str,
) -> Result<Vec<String>> {
    let (lower, upper) = t::prefix_bounds(parent);
    let mut keys = Vec::new();
    for entry in table.range::<&str>(lower.as_str()..upper.as_str())? {
        let (key, _) = entry?;
        keys.push(key.value().to_owned());
    }
    Ok(keys)
}

/// Child halves of the composite keys under `{parent}:`.
fn children<V: redb::Value + 'static>(
    table: &impl ReadableTable<&'static str, V>,
    parent: &str,
) -> Result<Vec<String>> {
    Ok(prefix_keys(table, parent)?
        .iter()
        .filter_map(|key| key.split_once(':').map(|(_, child)| child.to_owned()))
        .collect())
}

fn read_container(
    ctr_config: &impl ReadableTable<&'static str, &'static [u8]>,
    ctr_state: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> Result<(ContainerConfig, ContainerRuntimeState)> {
    let config: ContainerConfig = get_json(ctr_config, id)?
        .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;
    let state = get_json(ctr_state, id)?
        .ok_or_else(|| StateError::internal(format!("container {id} is missing its state")))?;
    Ok((config, state))
}

fn read_pod(
    pod_config: &impl ReadableTable<&'static str, &'static [u8]>,
    pod_state: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> Result<(PodConfig, PodRuntimeState)> {
    let config: PodConfig =
        get_json(pod_config, id)?.ok_or_else(|| StateError::NoSuchPod { id: id.to_owned() })?;
    let state = get_json(pod_state, id)?
        .ok_or_else(|| StateError::internal(format!("pod {id} is missing its state")))?;
    Ok((config, state))
}

fn read_volume(
    vol_config: &impl ReadableTable<&'static str, &'static [u8]>,
    vol_state: &impl ReadableTable<&'static str, &'static [u8]>,
    name: &str,
) -> Result<(VolumeConfig, VolumeRuntimeState)> {
    let config: VolumeConfig = get_json(vol_config, name)?.ok_or_else(|| {
        StateError::NoSuchVolume {
            name: name.to_owned(),
        }
    })?;
    let state = get_json(vol_state, name)?
        .ok_or_else(|| StateError::internal(format!("volume {name} is missing its state")))?;
    Ok((config, state))
}

/// Resolves a full or partial container ID or full name to a full ID.
///
/// An exact container-name match wins, then an exact ID match, then a unique
/// prefix match over all container IDs. More than one prefix match is an
/// ambiguity error; a name that resolves to a pod yields a
/// container-specific not-found error.
fn resolve_ctr_id(
    ctr_config: &impl ReadableTable<&'static str, &'static [u8]>,
    name_registry: &impl ReadableTable<&'static str, &'static str>,
    id_or_name: &str,
) -> Result<String> {
    let mut is_pod = false;
    let named = name_registry
        .get(id_or_name)?
        .map(|guard| guard.value().to_owned());
    if let Some(full_id) = named {
        if ctr_config.get(full_id.as_str())?.is_some() {
            return Ok(full_id);
        }
        // The name belongs to a pod; keep going, a container ID may still
        // start with these characters.
        is_pod = true;
    }

    if ctr_config.get(id_or_name)?.is_some() {
        return Ok(id_or_name.to_owned());
    }

    let mut found: Option<String> = None;
    for entry in ctr_config.iter()? {
        let (key, _) = entry?;
        if key.value().starts_with(id_or_name) {
            if found.is_some() {
                return Err(StateError::ContainerExists {
                    id: id_or_name.to_owned(),
                });
            }
            found = Some(key.value().to_owned());
        }
    }
    found.ok_or_else(|| {
        if is_pod {
            StateError::invalid_arg(format!("{id_or_name:?} is a pod, not a container"))
        } else {
            StateError::NoSuchContainer {
                id: id_or_name.to_owned(),
            }
        }
    })
}

/// Pod flavor of [`resolve_ctr_id`], with mirrored semantics.
fn resolve_pod_id(
    pod_config: &impl ReadableTable<&'static str, &'static [u8]>,
    name_registry: &impl ReadableTable<&'static str, &'static str>,
    id_or_name: &str,
) -> Result<String> {
    let mut is_ctr = false;
    let named = name_registry
        .get(id_or_name)?
        .map(|guard| guard.value().to_owned());
    if let Some(full_id) = named {
        if pod_config.get(full_id.as_str())?.is_some() {
            return Ok(full_id);
        }
        is_ctr = true;
    }

    if pod_config.get(id_or_name)?.is_some() {
        return Ok(id_or_name.to_owned());
    }

    let mut found: Option<String> = None;
    for entry in pod_config.iter()? {
        let (key, _) = entry?;
        if key.value().starts_with(id_or_name) {
            if found.is_some() {
                return Err(StateError::PodExists {
                    id: id_or_name.to_owned(),
                });
            }
            found = Some(key.value().to_owned());
        }
    }
    found.ok_or_else(|| {
        if is_ctr {
            StateError::invalid_arg(format!("{id_or_name:?} is a container, not a pod"))
        } else {
            StateError::NoSuchPod {
                id: id_or_name.to_owned(),
            }
        }
    })
}

/// Error for an ID already present in the shared registry, typed by which
/// entity kind holds it.
fn taken_id_error(
    ctr_config: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> StateError {
    match ctr_config.get(id) {
        Ok(Some(_)) => StateError::ContainerExists { id: id.to_owned() },
        Ok(None) => StateError::PodExists { id: id.to_owned() },
        Err(err) => err.into(),
    }
}

/// Error for a name already present in the shared registry, typed by which
/// entity kind owns it.
fn name_in_use_error(
    ctr_config: &impl ReadableTable<&'static str, &'static [u8]>,
    name: &str,
    owner_id: &str,
) -> StateError {
    match ctr_config.get(owner_id) {
        Ok(Some(_)) => StateError::ContainerExists {
            id: name.to_owned(),
        },
        Ok(None) => StateError::PodExists {
            id: name.to_owned(),
        },
        Err(err) => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, KvState) {
        let dir = TempDir::new().expect("tempdir");
        let config = StoreConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.static_dir).expect("mkdir");
        let store = KvState::open(&config).expect("open store");
        (dir, store)
    }

    #[test]
    fn reopening_validates_recorded_config() {
        let dir = TempDir::new().expect("tempdir");
        let config = StoreConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.static_dir).expect("mkdir");
        drop(KvState::open(&config).expect("first open"));

        let mut other = config.clone();
        other.graph_driver = "vfs".into();
        let err = KvState::open(&other).expect_err("mismatched driver must fail");
        assert!(matches!(err, StateError::BadConfig { .. }));

        // The original configuration still opens.
        drop(KvState::open(&config).expect("reopen"));
    }

    #[test]
    fn legacy_network_record_is_migrated_on_read() {
        let (_dir, store) = open_store();
        let mut config = ContainerConfig::new("web");
        config.static_ip = Some("10.88.0.5".parse().expect("ip"));
        let id = config.id.clone();
        store
            .add_container(&config, &ContainerRuntimeState::default())
            .expect("add");

        // Plant a pre-migration record: raw container-ID bytes as the value.
        let txn = store.db.begin_write().expect("begin");
        {
            let mut nets = txn.open_table(t::CTR_NETWORKS).expect("table");
            let _ = nets
                .insert(t::scoped(&id, "bridge").as_str(), id.as_bytes())
                .expect("insert");
        }
        txn.commit().expect("commit");

        let networks = store.networks(&id).expect("networks");
        let opts = networks.get("bridge").expect("migrated entry");
        assert_eq!(opts.interface_name, "eth0");
        assert_eq!(opts.aliases, vec![config.short_id().to_owned()]);
        assert_eq!(opts.static_ips.len(), 1);

        // The upgrade is durable: a second read parses the record as JSON.
        let again = store.networks(&id).expect("networks again");
        assert_eq!(again.get("bridge"), Some(opts));
    }

    #[test]
    fn prune_respects_retention_and_liveness() {
        let (_dir, store) = open_store();
        let live = ContainerConfig::new("live");
        store
            .add_container(&live, &ContainerRuntimeState::default())
            .expect("add");

        let gone_id = stevedore_common::types::generate_id();
        let old = Utc::now().timestamp() - EXIT_CODE_RETENTION_SECS - 10;

        // Synthetic old entries: one for a live container, one for a
        // removed one.
        let txn = store.db.begin_write().expect("begin");
        {
            let mut codes = txn.open_table(t::EXIT_CODES).expect("codes");
            let mut stamps = txn.open_table(t::EXIT_TIMESTAMPS).expect("stamps");
            let _ = codes.insert(live.id.as_str(), 0).expect("insert");
            let _ = stamps.insert(live.id.as_str(), old).expect("insert");
            let _ = codes.insert(gone_id.as_str(), 137).expect("insert");
            let _ = stamps.insert(gone_id.as_str(), old).expect("insert");
        }
        txn.commit().expect("commit");

        store.prune_container_exit_codes().expect("prune");

        // The live container's old entry survives; the orphan is gone.
        assert_eq!(store.container_exit_code(&live.id).expect("code"), 0);
        assert!(matches!(
            store.container_exit_code(&gone_id),
            Err(StateError::NoSuchExitCode { .. })
        ));
        assert!(matches!(
            store.container_exit_code_timestamp(&gone_id),
            Err(StateError::NoSuchExitCode { .. })
        ));
    }

    #[test]
    fn refresh_repairs_dangling_registry_entries() {
        let (_dir, store) = open_store();
        let config = ContainerConfig::new("kept");
        store
            .add_container(&config, &ContainerRuntimeState::default())
            .expect("add");

        // Plant a registry entry with no backing container or pod.
        let orphan_id = stevedore_common::types::generate_id();
        let txn = store.db.begin_write().expect("begin");
        {
            let mut ids = txn.open_table(t::ID_REGISTRY).expect("ids");
            let mut names = txn.open_table(t::NAME_REGISTRY).expect("names");
            let _ = ids.insert(orphan_id.as_str(), "orphan").expect("insert");
            let _ = names.insert("orphan", orphan_id.as_str()).expect("insert");
        }
        txn.commit().expect("commit");

        store.refresh().expect("refresh");

        let txn = store.db.begin_read().expect("begin read");
        let ids = txn.open_table(t::ID_REGISTRY).expect("ids");
        assert!(ids.get(orphan_id.as_str()).expect("get").is_none());
        assert!(ids.get(config.id.as_str()).expect("get").is_some());
        let names = txn.open_table(t::NAME_REGISTRY).expect("names");
        assert!(names.get("orphan").expect("get").is_none());
    }

    #[test]
    fn closed_store_rejects_operations() {
        let (_dir, store) = open_store();
        store.close().expect("close");
        assert!(matches!(
            store.has_container("0123"),
            Err(StateError::StoreClosed)
        ));
    }
}
