//! SQLite implementation of the entity store.
//!
//! One connection guarded by a mutex; every write runs in a `BEGIN
//! EXCLUSIVE` transaction so concurrent processes sharing the database file
//! serialize at the SQLite level rather than deadlocking mid-transaction.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use stevedore_common::config::{StoreBackend, StoreConfig};
use stevedore_common::constants::{
    DEFAULT_SQLITE_BUSY_TIMEOUT_MS, ENV_SQLITE_BUSY_TIMEOUT, EXIT_CODE_RETENTION_SECS,
    SCHEMA_VERSION, SQLITE_DB_NAME,
};
use stevedore_common::types::{
    ContainerConfig, ContainerRuntimeState, DbConfig, ExecSession, PerNetworkOptions, PodConfig,
    PodRuntimeState, VolumeConfig, VolumeRuntimeState,
};

use super::schema;
use crate::error::{Result, StateError};
use crate::store::{self, EntityStore};

/// Entity store backed by a single SQLite database file.
#[derive(Debug)]
pub struct SqliteState {
    conn: Mutex<Connection>,
    valid: AtomicBool,
}

impl SqliteState {
    /// Opens (or creates) the SQLite store under `config.static_dir`.
    ///
    /// Applies the connection pragmas, creates missing tables, checks the
    /// schema version, and validates the recorded host configuration against
    /// `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::BadConfig`] on a configuration or schema-version
    /// mismatch, or a backend error if the file cannot be opened.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.static_dir.join(SQLITE_DB_NAME);
        let conn = Connection::open(&path)?;

        conn.busy_timeout(Duration::from_millis(busy_timeout_ms()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // FULL trades write throughput for durability across power loss.
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "case_sensitive_like", "ON")?;

        let recorded = init_schema(&conn, config)?;
        store::verify_db_config(&recorded, config)?;
        tracing::debug!(path = %path.display(), "opened sqlite state store");
        Ok(Self {
            conn: Mutex::new(conn),
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

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

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

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        if let Some(pod) = pod_id {
            if !pod_exists(&tx, pod)? {
                return Err(StateError::NoSuchPod { id: pod.to_owned() });
            }
        }
        if id_taken(&tx, &config.id)? {
            return if ctr_exists(&tx, &config.id)? {
                Err(StateError::ContainerExists {
                    id: config.id.clone(),
                })
            } else {
                Err(StateError::PodExists {
                    id: config.id.clone(),
                })
            };
        }
        check_name_free(&tx, &config.name)?;

        for dep in &config.dependencies {
            let dep_pod: Option<String> = tx
                .query_row(
                    "SELECT PodID FROM ContainerConfig WHERE ID = ?1",
                    params![dep],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StateError::NoSuchContainer { id: dep.clone() })?;
            if dep_pod != config.pod_id {
                return Err(StateError::invalid_arg(format!(
                    "container {} depends on container {dep} which is in a different pod",
                    config.id
                )));
            }
        }
        for volume in &config.volumes {
            if !vol_exists(&tx, volume)? {
                return Err(StateError::NoSuchVolume {
                    name: volume.clone(),
                });
            }
        }

        let _ = tx.execute(
            "INSERT INTO IDNamespace (ID) VALUES (?1)",
            params![config.id],
        )?;
        let _ = tx.execute(
            "INSERT INTO ContainerConfig (ID, Name, PodID, Json) VALUES (?1, ?2, ?3, ?4)",
            params![config.id, config.name, config.pod_id, to_json(config)?],
        )?;
        let _ = tx.execute(
            "INSERT INTO ContainerState (ID, Json) VALUES (?1, ?2)",
            params![config.id, to_json(state)?],
        )?;
        for dep in &config.dependencies {
            let _ = tx.execute(
                "INSERT INTO ContainerDependency (ID, DependencyID) VALUES (?1, ?2)",
                params![config.id, dep],
            )?;
        }
        for volume in &config.volumes {
            let _ = tx.execute(
                "INSERT INTO ContainerVolume (ContainerID, VolumeName) VALUES (?1, ?2)",
                params![config.id, volume],
            )?;
        }
        for (network, opts) in &config.networks {
            let _ = tx.execute(
                "INSERT INTO ContainerNetwork (ContainerID, NetworkName, Json) \
                 VALUES (?1, ?2, ?3)",
                params![config.id, network, to_json(opts)?],
            )?;
        }
        tx.commit()?;
        tracing::debug!(id = %config.id, name = %config.name, "added container");
        Ok(())
    }

    fn remove_container_inner(&self, id: &str, pod_id: Option<&str>) -> Result<()> {
        ensure_nonempty(id)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        let member_of: Option<String> = tx
            .query_row(
                "SELECT PodID FROM ContainerConfig WHERE ID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;
        match (pod_id, member_of.as_deref()) {
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

        let dependents = dependent_ids(&tx, id)?;
        if !dependents.is_empty() {
            return Err(StateError::ContainerInUse {
                id: id.to_owned(),
                dependents,
            });
        }
        let sessions: i64 = tx.query_row(
            "SELECT COUNT(*) FROM ContainerExecSession WHERE ContainerID = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if sessions > 0 {
            return Err(StateError::ExecSessionsActive { id: id.to_owned() });
        }

        delete_container_rows(&tx, id)?;
        tx.commit()?;
        tracing::debug!(id, "removed container");
        Ok(())
    }
}

impl EntityStore for SqliteState {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sqlite
    }

    fn close(&self) -> Result<()> {
        // First close wins; later calls are no-ops on an invalid store.
        if self.valid.swap(false, Ordering::SeqCst) {
            self.conn().execute_batch("PRAGMA optimize;")?;
        }
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        self.check_valid()?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            let ctr_states: Vec<(String, String)> = {
                let mut stmt = tx.prepare("SELECT ID, Json FROM ContainerState")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            for (id, raw) in ctr_states {
                let mut state: ContainerRuntimeState = from_json(&raw)?;
                state.reset_after_reboot();
                let _ = tx.execute(
                    "UPDATE ContainerState SET Json = ?1 WHERE ID = ?2",
                    params![to_json(&state)?, id],
                )?;
            }

            let pod_states: Vec<(String, String)> = {
                let mut stmt = tx.prepare("SELECT ID, Json FROM PodState")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            for (id, raw) in pod_states {
                let mut state: PodRuntimeState = from_json(&raw)?;
                state.reset_after_reboot();
                let _ = tx.execute(
                    "UPDATE PodState SET Json = ?1 WHERE ID = ?2",
                    params![to_json(&state)?, id],
                )?;
            }

            // Sessions and exit codes cannot survive a reboot; both tables
            // are cleared in the same transaction as the state resets.
            let _ = tx.execute("DELETE FROM ContainerExecSession", [])?;
            let _ = tx.execute("DELETE FROM ContainerExitCode", [])?;
        }
        tx.commit()?;
        tracing::debug!("refreshed state after reboot");
        Ok(())
    }

    fn db_config(&self) -> Result<DbConfig> {
        self.check_valid()?;
        let conn = self.conn();
        read_db_config(&conn)?
            .ok_or_else(|| StateError::internal("store is missing its DBConfig row"))
    }

    fn validate_db_config(&self, config: &StoreConfig) -> Result<()> {
        store::verify_db_config(&self.db_config()?, config)
    }

    // ── Containers ───────────────────────────────────────────────────

    fn container(&self, id: &str) -> Result<(ContainerConfig, ContainerRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        read_container(&self.conn(), id)
    }

    fn lookup_container_id(&self, id_or_name: &str) -> Result<String> {
        self.check_valid()?;
        ensure_nonempty(id_or_name)?;
        resolve_ctr_id(&self.conn(), id_or_name)
    }

    fn lookup_container(&self, id_or_name: &str) -> Result<(ContainerConfig, ContainerRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(id_or_name)?;
        let conn = self.conn();
        let id = resolve_ctr_id(&conn, id_or_name)?;
        read_container(&conn, &id)
    }

    fn has_container(&self, id: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        ctr_exists(&self.conn(), id)
    }

    fn container_name(&self, id: &str) -> Result<String> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        self.conn()
            .query_row(
                "SELECT Name FROM ContainerConfig WHERE ID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })
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
        let raw: String = self
            .conn()
            .query_row(
                "SELECT Json FROM ContainerState WHERE ID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;
        from_json(&raw)
    }

    fn save_container(&self, id: &str, state: &ContainerRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let changed = self.conn().execute(
            "UPDATE ContainerState SET Json = ?1 WHERE ID = ?2",
            params![to_json(state)?, id],
        )?;
        if changed == 0 {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        Ok(())
    }

    fn container_in_use(&self, id: &str) -> Result<Vec<String>> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let conn = self.conn();
        if !ctr_exists(&conn, id)? {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        dependent_ids(&conn, id)
    }

    fn all_containers(&self) -> Result<Vec<(ContainerConfig, ContainerRuntimeState)>> {
        self.check_valid()?;
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.Json, s.Json FROM ContainerConfig c \
             INNER JOIN ContainerState s ON c.ID = s.ID",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (config_raw, state_raw) = row?;
            out.push((from_json(&config_raw)?, from_json(&state_raw)?));
        }
        Ok(out)
    }

    fn container_config(&self, id: &str) -> Result<ContainerConfig> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let raw: String = self
            .conn()
            .query_row(
                "SELECT Json FROM ContainerConfig WHERE ID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;
        from_json(&raw)
    }

    fn rewrite_container_config(&self, id: &str, new_config: &ContainerConfig) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            let current = container_config_row(&tx, id)?;
            if new_config.id != current.id || new_config.name != current.name {
                return Err(StateError::invalid_arg(
                    "rewrite_container_config cannot alter container ID or name",
                ));
            }
            let _ = tx.execute(
                "UPDATE ContainerConfig SET Json = ?1 WHERE ID = ?2",
                params![to_json(new_config)?, id],
            )?;
        }
        tx.commit()?;
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
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            let current = container_config_row(&tx, id)?;
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
                check_name_free(&tx, new_name)?;
                let _ = tx.execute(
                    "UPDATE ContainerConfig SET Name = ?1, Json = ?2 WHERE ID = ?3",
                    params![new_name, to_json(new_config)?, id],
                )?;
            } else {
                let _ = tx.execute(
                    "UPDATE ContainerConfig SET Json = ?1 WHERE ID = ?2",
                    params![to_json(new_config)?, id],
                )?;
            }
        }
        tx.commit()?;
        if renaming {
            tracing::info!(id, old_name, new_name, "renamed container");
        }
        Ok(())
    }

    // ── Container networks ───────────────────────────────────────────

    fn networks(&self, id: &str) -> Result<HashMap<String, PerNetworkOptions>> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let conn = self.conn();
        if !ctr_exists(&conn, id)? {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        let mut stmt = conn.prepare(
            "SELECT NetworkName, Json FROM ContainerNetwork WHERE ContainerID = ?1",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (network, raw) = row?;
            let _ = out.insert(network, from_json(&raw)?);
        }
        Ok(out)
    }

    fn network_connect(&self, id: &str, network: &str, opts: &PerNetworkOptions) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        if network.is_empty() {
            return Err(StateError::invalid_arg("network names may not be empty"));
        }
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            if !ctr_exists(&tx, id)? {
                return Err(StateError::NoSuchContainer { id: id.to_owned() });
            }
            if network_row_exists(&tx, id, network)? {
                return Err(StateError::NetworkConnected {
                    id: id.to_owned(),
                    network: network.to_owned(),
                });
            }
            let _ = tx.execute(
                "INSERT INTO ContainerNetwork (ContainerID, NetworkName, Json) \
                 VALUES (?1, ?2, ?3)",
                params![id, network, to_json(opts)?],
            )?;
        }
        tx.commit()?;
        tracing::debug!(id, network, "connected container to network");
        Ok(())
    }

    fn network_modify(&self, id: &str, network: &str, opts: &PerNetworkOptions) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        if network.is_empty() {
            return Err(StateError::invalid_arg("network names may not be empty"));
        }
        let conn = self.conn();
        if !ctr_exists(&conn, id)? {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        let changed = conn.execute(
            "UPDATE ContainerNetwork SET Json = ?1 WHERE ContainerID = ?2 AND NetworkName = ?3",
            params![to_json(opts)?, id, network],
        )?;
        if changed == 0 {
            return Err(StateError::NetworkNotConnected {
                id: id.to_owned(),
                network: network.to_owned(),
            });
        }
        Ok(())
    }

    fn network_disconnect(&self, id: &str, network: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        if network.is_empty() {
            return Err(StateError::invalid_arg("network names may not be empty"));
        }
        let conn = self.conn();
        if !ctr_exists(&conn, id)? {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        let changed = conn.execute(
            "DELETE FROM ContainerNetwork WHERE ContainerID = ?1 AND NetworkName = ?2",
            params![id, network],
        )?;
        if changed == 0 {
            return Err(StateError::NetworkNotConnected {
                id: id.to_owned(),
                network: network.to_owned(),
            });
        }
        tracing::debug!(id, network, "disconnected container from network");
        Ok(())
    }

    // ── Exec sessions ────────────────────────────────────────────────

    fn add_exec_session(&self, session: &ExecSession) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(&session.id)?;
        ensure_nonempty(&session.container_id)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            if !ctr_exists(&tx, &session.container_id)? {
                return Err(StateError::NoSuchContainer {
                    id: session.container_id.clone(),
                });
            }
            let existing: Option<String> = tx
                .query_row(
                    "SELECT ID FROM ContainerExecSession WHERE ID = ?1",
                    params![session.id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(StateError::ExecSessionExists {
                    id: session.id.clone(),
                });
            }
            let _ = tx.execute(
                "INSERT INTO ContainerExecSession (ID, ContainerID) VALUES (?1, ?2)",
                params![session.id, session.container_id],
            )?;
        }
        tx.commit()?;
        tracing::debug!(session = %session.id, container = %session.container_id, "registered exec session");
        Ok(())
    }

    fn exec_session_container(&self, id: &str) -> Result<String> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        self.conn()
            .query_row(
                "SELECT ContainerID FROM ContainerExecSession WHERE ID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchExecSession { id: id.to_owned() })
    }

    fn remove_exec_session(&self, session: &ExecSession) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(&session.id)?;
        let conn = self.conn();
        let owner: String = conn
            .query_row(
                "SELECT ContainerID FROM ContainerExecSession WHERE ID = ?1",
                params![session.id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchExecSession {
                id: session.id.clone(),
            })?;
        if owner != session.container_id {
            return Err(StateError::internal(format!(
                "exec session {} is owned by container {owner}, not {}",
                session.id, session.container_id
            )));
        }
        let _ = conn.execute(
            "DELETE FROM ContainerExecSession WHERE ID = ?1",
            params![session.id],
        )?;
        tracing::debug!(session = %session.id, "removed exec session");
        Ok(())
    }

    fn container_exec_sessions(&self, id: &str) -> Result<Vec<String>> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let conn = self.conn();
        if !ctr_exists(&conn, id)? {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        let mut stmt =
            conn.prepare("SELECT ID FROM ContainerExecSession WHERE ContainerID = ?1")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn remove_container_exec_sessions(&self, id: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let conn = self.conn();
        if !ctr_exists(&conn, id)? {
            return Err(StateError::NoSuchContainer { id: id.to_owned() });
        }
        let _ = conn.execute(
            "DELETE FROM ContainerExecSession WHERE ContainerID = ?1",
            params![id],
        )?;
        Ok(())
    }

    // ── Exit codes ───────────────────────────────────────────────────

    fn add_container_exit_code(&self, id: &str, exit_code: i32) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        store::ensure_exit_code_in_range(exit_code)?;
        let _ = self.conn().execute(
            "INSERT OR REPLACE INTO ContainerExitCode (ID, Timestamp, ExitCode) \
             VALUES (?1, ?2, ?3)",
            params![id, Utc::now().timestamp(), exit_code],
        )?;
        Ok(())
    }

    fn container_exit_code(&self, id: &str) -> Result<i32> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        self.conn()
            .query_row(
                "SELECT ExitCode FROM ContainerExitCode WHERE ID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchExitCode { id: id.to_owned() })
    }

    fn container_exit_code_timestamp(&self, id: &str) -> Result<DateTime<Utc>> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let seconds: i64 = self
            .conn()
            .query_row(
                "SELECT Timestamp FROM ContainerExitCode WHERE ID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchExitCode { id: id.to_owned() })?;
        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| StateError::internal(format!("invalid exit-code timestamp {seconds}")))
    }

    fn prune_container_exit_codes(&self) -> Result<()> {
        self.check_valid()?;
        let cutoff = Utc::now().timestamp() - EXIT_CODE_RETENTION_SECS;
        let _ = self.conn().execute(
            "DELETE FROM ContainerExitCode \
             WHERE Timestamp <= ?1 AND ID NOT IN (SELECT ID FROM ContainerConfig)",
            params![cutoff],
        )?;
        Ok(())
    }

    fn container_id_is_volume(&self, id: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let found: Option<String> = self
            .conn()
            .query_row(
                "SELECT Name FROM VolumeConfig WHERE StorageID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ── Pods ─────────────────────────────────────────────────────────

    fn pod(&self, id: &str) -> Result<(PodConfig, PodRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        read_pod(&self.conn(), id)
    }

    fn lookup_pod(&self, id_or_name: &str) -> Result<(PodConfig, PodRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(id_or_name)?;
        let conn = self.conn();
        let id = resolve_pod_id(&conn, id_or_name)?;
        read_pod(&conn, &id)
    }

    fn has_pod(&self, id: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        pod_exists(&self.conn(), id)
    }

    fn pod_name(&self, id: &str) -> Result<String> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        self.conn()
            .query_row(
                "SELECT Name FROM PodConfig WHERE ID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchPod { id: id.to_owned() })
    }

    fn pod_has_container(&self, pod_id: &str, ctr_id: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(pod_id)?;
        ensure_nonempty(ctr_id)?;
        let conn = self.conn();
        if !pod_exists(&conn, pod_id)? {
            return Err(StateError::NoSuchPod {
                id: pod_id.to_owned(),
            });
        }
        let found: Option<String> = conn
            .query_row(
                "SELECT ID FROM ContainerConfig WHERE ID = ?1 AND PodID = ?2",
                params![ctr_id, pod_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn pod_containers(&self, pod_id: &str) -> Result<Vec<String>> {
        self.check_valid()?;
        ensure_nonempty(pod_id)?;
        let conn = self.conn();
        if !pod_exists(&conn, pod_id)? {
            return Err(StateError::NoSuchPod {
                id: pod_id.to_owned(),
            });
        }
        member_ids(&conn, pod_id)
    }

    fn add_pod(&self, config: &PodConfig, state: &PodRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(&config.id)?;
        ensure_nonempty(&config.name)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            if id_taken(&tx, &config.id)? {
                return if ctr_exists(&tx, &config.id)? {
                    Err(StateError::ContainerExists {
                        id: config.id.clone(),
                    })
                } else {
                    Err(StateError::PodExists {
                        id: config.id.clone(),
                    })
                };
            }
            check_name_free(&tx, &config.name)?;
            let _ = tx.execute(
                "INSERT INTO IDNamespace (ID) VALUES (?1)",
                params![config.id],
            )?;
            let _ = tx.execute(
                "INSERT INTO PodConfig (ID, Name, Json) VALUES (?1, ?2, ?3)",
                params![config.id, config.name, to_json(config)?],
            )?;
            let _ = tx.execute(
                "INSERT INTO PodState (ID, Json) VALUES (?1, ?2)",
                params![config.id, to_json(state)?],
            )?;
        }
        tx.commit()?;
        tracing::debug!(id = %config.id, name = %config.name, "added pod");
        Ok(())
    }

    fn remove_pod(&self, id: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            if !pod_exists(&tx, id)? {
                return Err(StateError::NoSuchPod { id: id.to_owned() });
            }
            if !member_ids(&tx, id)?.is_empty() {
                return Err(StateError::PodNotEmpty { id: id.to_owned() });
            }
            let _ = tx.execute("DELETE FROM PodState WHERE ID = ?1", params![id])?;
            let _ = tx.execute("DELETE FROM PodConfig WHERE ID = ?1", params![id])?;
            let _ = tx.execute("DELETE FROM IDNamespace WHERE ID = ?1", params![id])?;
        }
        tx.commit()?;
        tracing::debug!(id, "removed pod");
        Ok(())
    }

    fn remove_pod_containers(&self, id: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            if !pod_exists(&tx, id)? {
                return Err(StateError::NoSuchPod { id: id.to_owned() });
            }
            let members = member_ids(&tx, id)?;
            let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();
            for member in &members {
                let outside: Vec<String> = dependent_ids(&tx, member)?
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
                let _ = tx.execute(
                    "DELETE FROM ContainerExecSession WHERE ContainerID = ?1",
                    params![member],
                )?;
                delete_container_rows(&tx, member)?;
            }
        }
        tx.commit()?;
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
        let raw: String = self
            .conn()
            .query_row(
                "SELECT Json FROM PodState WHERE ID = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchPod { id: id.to_owned() })?;
        from_json(&raw)
    }

    fn save_pod(&self, id: &str, state: &PodRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let changed = self.conn().execute(
            "UPDATE PodState SET Json = ?1 WHERE ID = ?2",
            params![to_json(state)?, id],
        )?;
        if changed == 0 {
            return Err(StateError::NoSuchPod { id: id.to_owned() });
        }
        Ok(())
    }

    fn all_pods(&self) -> Result<Vec<(PodConfig, PodRuntimeState)>> {
        self.check_valid()?;
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT p.Json, s.Json FROM PodConfig p INNER JOIN PodState s ON p.ID = s.ID",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (config_raw, state_raw) = row?;
            out.push((from_json(&config_raw)?, from_json(&state_raw)?));
        }
        Ok(out)
    }

    fn rewrite_pod_config(&self, id: &str, new_config: &PodConfig) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(id)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            let raw: String = tx
                .query_row(
                    "SELECT Json FROM PodConfig WHERE ID = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StateError::NoSuchPod { id: id.to_owned() })?;
            let current: PodConfig = from_json(&raw)?;
            if new_config.id != current.id || new_config.name != current.name {
                return Err(StateError::invalid_arg(
                    "rewrite_pod_config cannot alter pod ID or name",
                ));
            }
            let _ = tx.execute(
                "UPDATE PodConfig SET Json = ?1 WHERE ID = ?2",
                params![to_json(new_config)?, id],
            )?;
        }
        tx.commit()?;
        tracing::debug!(id, "rewrote pod config");
        Ok(())
    }

    // ── Volumes ──────────────────────────────────────────────────────

    fn volume(&self, name: &str) -> Result<(VolumeConfig, VolumeRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        read_volume(&self.conn(), name)
    }

    fn lookup_volume(&self, name: &str) -> Result<(VolumeConfig, VolumeRuntimeState)> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let conn = self.conn();
        if vol_exists(&conn, name)? {
            return read_volume(&conn, name);
        }
        let matches: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT Name FROM VolumeConfig WHERE Name LIKE ?1 || '%' LIMIT 2")?;
            let rows = stmt.query_map(params![name], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        match matches.as_slice() {
            [] => Err(StateError::NoSuchVolume {
                name: name.to_owned(),
            }),
            [full] => read_volume(&conn, full),
            _ => Err(StateError::VolumeExists {
                name: name.to_owned(),
            }),
        }
    }

    fn has_volume(&self, name: &str) -> Result<bool> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        vol_exists(&self.conn(), name)
    }

    fn volume_in_use(&self, name: &str) -> Result<Vec<String>> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let conn = self.conn();
        if !vol_exists(&conn, name)? {
            return Err(StateError::NoSuchVolume {
                name: name.to_owned(),
            });
        }
        volume_dependents(&conn, name)
    }

    fn add_volume(&self, config: &VolumeConfig, state: &VolumeRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(&config.name)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            if vol_exists(&tx, &config.name)? {
                return Err(StateError::VolumeExists {
                    name: config.name.clone(),
                });
            }
            let _ = tx.execute(
                "INSERT INTO VolumeConfig (Name, StorageID, Json) VALUES (?1, ?2, ?3)",
                params![config.name, config.storage_id, to_json(config)?],
            )?;
            let _ = tx.execute(
                "INSERT INTO VolumeState (Name, Json) VALUES (?1, ?2)",
                params![config.name, to_json(state)?],
            )?;
        }
        tx.commit()?;
        tracing::debug!(name = %config.name, "added volume");
        Ok(())
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            if !vol_exists(&tx, name)? {
                return Err(StateError::NoSuchVolume {
                    name: name.to_owned(),
                });
            }
            let dependents = volume_dependents(&tx, name)?;
            if !dependents.is_empty() {
                return Err(StateError::VolumeInUse {
                    name: name.to_owned(),
                    dependents,
                });
            }
            let _ = tx.execute(
                "DELETE FROM ContainerVolume WHERE VolumeName = ?1",
                params![name],
            )?;
            let _ = tx.execute("DELETE FROM VolumeState WHERE Name = ?1", params![name])?;
            let _ = tx.execute("DELETE FROM VolumeConfig WHERE Name = ?1", params![name])?;
        }
        tx.commit()?;
        tracing::debug!(name, "removed volume");
        Ok(())
    }

    fn update_volume(&self, name: &str) -> Result<VolumeRuntimeState> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let raw: String = self
            .conn()
            .query_row(
                "SELECT Json FROM VolumeState WHERE Name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StateError::NoSuchVolume {
                name: name.to_owned(),
            })?;
        from_json(&raw)
    }

    fn save_volume(&self, name: &str, state: &VolumeRuntimeState) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let changed = self.conn().execute(
            "UPDATE VolumeState SET Json = ?1 WHERE Name = ?2",
            params![to_json(state)?, name],
        )?;
        if changed == 0 {
            return Err(StateError::NoSuchVolume {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    fn all_volumes(&self) -> Result<Vec<(VolumeConfig, VolumeRuntimeState)>> {
        self.check_valid()?;
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT v.Json, s.Json FROM VolumeConfig v \
             INNER JOIN VolumeState s ON v.Name = s.Name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (config_raw, state_raw) = row?;
            out.push((from_json(&config_raw)?, from_json(&state_raw)?));
        }
        Ok(out)
    }

    fn rewrite_volume_config(&self, name: &str, new_config: &VolumeConfig) -> Result<()> {
        self.check_valid()?;
        ensure_nonempty(name)?;
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        {
            let raw: String = tx
                .query_row(
                    "SELECT Json FROM VolumeConfig WHERE Name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StateError::NoSuchVolume {
                    name: name.to_owned(),
                })?;
            let current: VolumeConfig = from_json(&raw)?;
            if new_config.name != current.name {
                return Err(StateError::invalid_arg(
                    "rewrite_volume_config cannot alter the volume name",
                ));
            }
            let _ = tx.execute(
                "UPDATE VolumeConfig SET StorageID = ?1, Json = ?2 WHERE Name = ?3",
                params![new_config.storage_id, to_json(new_config)?, name],
            )?;
        }
        tx.commit()?;
        tracing::debug!(name, "rewrote volume config");
        Ok(())
    }
}

// ── Schema & helpers ─────────────────────────────────────────────────

fn busy_timeout_ms() -> u64 {
    match std::env::var(ENV_SQLITE_BUSY_TIMEOUT) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(
                value = %raw,
                "ignoring unparsable {ENV_SQLITE_BUSY_TIMEOUT}, using default"
            );
            DEFAULT_SQLITE_BUSY_TIMEOUT_MS
        }),
        Err(_) => DEFAULT_SQLITE_BUSY_TIMEOUT_MS,
    }
}

/// Creates missing tables and persists (or reads back) the `DBConfig` row,
/// all in one exclusive transaction.
fn init_schema(conn: &Connection, config: &StoreConfig) -> Result<DbConfig> {
    conn.execute_batch("BEGIN EXCLUSIVE;")?;
    let result = (|| -> Result<DbConfig> {
        schema::create_tables(conn)?;
        match read_db_config(conn)? {
            Some(recorded) => {
                schema::check_schema_version(recorded.schema_version)?;
                Ok(recorded)
            }
            None => {
                let recorded = store::db_config_from_store_config(config, SCHEMA_VERSION);
                let _ = conn.execute(
                    "INSERT INTO DBConfig (ID, SchemaVersion, Os, StaticDir, TmpDir, \
                     GraphRoot, RunRoot, GraphDriver, VolumeDir) \
                     VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        recorded.schema_version,
                        recorded.os,
                        path_str(&recorded.static_dir),
                        path_str(&recorded.tmp_dir),
                        path_str(&recorded.graph_root),
                        path_str(&recorded.run_root),
                        recorded.graph_driver,
                        path_str(&recorded.volume_path),
                    ],
                )?;
                Ok(recorded)
            }
        }
    })();
    match &result {
        Ok(_) => conn.execute_batch("COMMIT;")?,
        Err(_) => conn.execute_batch("ROLLBACK;")?,
    }
    result
}

fn read_db_config(conn: &Connection) -> Result<Option<DbConfig>> {
    Ok(conn
        .query_row(
            "SELECT SchemaVersion, Os, StaticDir, TmpDir, GraphRoot, RunRoot, \
             GraphDriver, VolumeDir FROM DBConfig WHERE ID = 1",
            [],
            |row| {
                Ok(DbConfig {
                    schema_version: row.get(0)?,
                    os: row.get(1)?,
                    static_dir: row.get::<_, String>(2)?.into(),
                    tmp_dir: row.get::<_, String>(3)?.into(),
                    graph_root: row.get::<_, String>(4)?.into(),
                    run_root: row.get::<_, String>(5)?.into(),
                    graph_driver: row.get(6)?,
                    volume_path: row.get::<_, String>(7)?.into(),
                })
            },
        )
        .optional()?)
}

fn path_str(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

fn ensure_nonempty(value: &str) -> Result<()> {
    if value.is_empty() {
        Err(StateError::EmptyIdentifier)
    } else {
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

fn exists(conn: &Connection, sql: &str, key: &str) -> Result<bool> {
    let found: Option<i64> = conn.query_row(sql, params![key], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

fn ctr_exists(conn: &Connection, id: &str) -> Result<bool> {
    exists(conn, "SELECT 1 FROM ContainerConfig WHERE ID = ?1", id)
}

fn pod_exists(conn: &Connection, id: &str) -> Result<bool> {
    exists(conn, "SELECT 1 FROM PodConfig WHERE ID = ?1", id)
}

fn vol_exists(conn: &Connection, name: &str) -> Result<bool> {
    exists(conn, "SELECT 1 FROM VolumeConfig WHERE Name = ?1", name)
}

fn id_taken(conn: &Connection, id: &str) -> Result<bool> {
    exists(conn, "SELECT 1 FROM IDNamespace WHERE ID = ?1", id)
}

fn network_row_exists(conn: &Connection, id: &str, network: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM ContainerNetwork WHERE ContainerID = ?1 AND NetworkName = ?2",
            params![id, network],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Errors if the name is owned by any container or pod, typed by which kind
/// owns it. `UNIQUE` on a single table cannot express the combined
/// namespace, so both tables are consulted here.
fn check_name_free(conn: &Connection, name: &str) -> Result<()> {
    if exists(conn, "SELECT 1 FROM ContainerConfig WHERE Name = ?1", name)? {
        return Err(StateError::ContainerExists {
            id: name.to_owned(),
        });
    }
    if exists(conn, "SELECT 1 FROM PodConfig WHERE Name = ?1", name)? {
        return Err(StateError::PodExists {
            id: name.to_owned(),
        });
    }
    Ok(())
}

fn dependent_ids(conn: &Connection, id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT ID FROM ContainerDependency WHERE DependencyID = ?1")?;
    let rows = stmt.query_map(params![id], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn member_ids(conn: &Connection, pod_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT ID FROM ContainerConfig WHERE PodID = ?1")?;
    let rows = stmt.query_map(params![pod_id], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Existing containers using a volume. The join filters out stale
/// `ContainerVolume` rows referencing removed containers.
fn volume_dependents(conn: &Connection, name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT cv.ContainerID FROM ContainerVolume cv \
         INNER JOIN ContainerConfig c ON cv.ContainerID = c.ID \
         WHERE cv.VolumeName = ?1",
    )?;
    let rows = stmt.query_map(params![name], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn delete_container_rows(conn: &Connection, id: &str) -> Result<()> {
    let _ = conn.execute(
        "DELETE FROM ContainerNetwork WHERE ContainerID = ?1",
        params![id],
    )?;
    let _ = conn.execute(
        "DELETE FROM ContainerVolume WHERE ContainerID = ?1",
        params![id],
    )?;
    let _ = conn.execute("DELETE FROM ContainerDependency WHERE ID = ?1", params![id])?;
    let _ = conn.execute("DELETE FROM ContainerState WHERE ID = ?1", params![id])?;
    let _ = conn.execute("DELETE FROM ContainerConfig WHERE ID = ?1", params![id])?;
    let _ = conn.execute("DELETE FROM IDNamespace WHERE ID = ?1", params![id])?;
    Ok(())
}

fn container_config_row(conn: &Connection, id: &str) -> Result<ContainerConfig> {
    let raw: String = conn
        .query_row(
            "SELECT Json FROM ContainerConfig WHERE ID = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;
    from_json(&raw)
}

fn read_container(conn: &Connection, id: &str) -> Result<(ContainerConfig, ContainerRuntimeState)> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT c.Json, s.Json FROM ContainerConfig c \
             INNER JOIN ContainerState s ON c.ID = s.ID WHERE c.ID = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (config_raw, state_raw) =
        row.ok_or_else(|| StateError::NoSuchContainer { id: id.to_owned() })?;
    Ok((from_json(&config_raw)?, from_json(&state_raw)?))
}

fn read_pod(conn: &Connection, id: &str) -> Result<(PodConfig, PodRuntimeState)> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT p.Json, s.Json FROM PodConfig p \
             INNER JOIN PodState s ON p.ID = s.ID WHERE p.ID = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (config_raw, state_raw) = row.ok_or_else(|| StateError::NoSuchPod { id: id.to_owned() })?;
    Ok((from_json(&config_raw)?, from_json(&state_raw)?))
}

fn read_volume(conn: &Connection, name: &str) -> Result<(VolumeConfig, VolumeRuntimeState)> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT v.Json, s.Json FROM VolumeConfig v \
             INNER JOIN VolumeState s ON v.Name = s.Name WHERE v.Name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (config_raw, state_raw) = row.ok_or_else(|| StateError::NoSuchVolume {
        name: name.to_owned(),
    })?;
    Ok((from_json(&config_raw)?, from_json(&state_raw)?))
}

/// Resolves a full or partial container ID or full name to a full ID.
///
/// An exact container-name match wins, then an exact ID match, then a unique
/// prefix match over container IDs. More than one prefix match is an
/// ambiguity error; a name owned by a pod yields a container-specific
/// not-found error.
fn resolve_ctr_id(conn: &Connection, id_or_name: &str) -> Result<String> {
    let named: Option<String> = conn
        .query_row(
            "SELECT ID FROM ContainerConfig WHERE Name = ?1",
            params![id_or_name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(full_id) = named {
        return Ok(full_id);
    }
    if ctr_exists(conn, id_or_name)? {
        return Ok(id_or_name.to_owned());
    }
    let is_pod = exists(conn, "SELECT 1 FROM PodConfig WHERE Name = ?1", id_or_name)?;

    let matches: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT ID FROM ContainerConfig WHERE ID LIKE ?1 || '%' LIMIT 2")?;
        let rows = stmt.query_map(params![id_or_name], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    match matches.as_slice() {
        [full_id] => Ok(full_id.clone()),
        [_, ..] => Err(StateError::ContainerExists {
            id: id_or_name.to_owned(),
        }),
        [] if is_pod => Err(StateError::invalid_arg(format!(
            "{id_or_name:?} is a pod, not a container"
        ))),
        [] => Err(StateError::NoSuchContainer {
            id: id_or_name.to_owned(),
        }),
    }
}

/// Pod flavor of [`resolve_ctr_id`], with mirrored semantics.
fn resolve_pod_id(conn: &Connection, id_or_name: &str) -> Result<String> {
    let named: Option<String> = conn
        .query_row(
            "SELECT ID FROM PodConfig WHERE Name = ?1",
            params![id_or_name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(full_id) = named {
        return Ok(full_id);
    }
    if pod_exists(conn, id_or_name)? {
        return Ok(id_or_name.to_owned());
    }
    let is_ctr = exists(
        conn,
        "SELECT 1 FROM ContainerConfig WHERE Name = ?1",
        id_or_name,
    )?;

    let matches: Vec<String> = {
        let mut stmt = conn.prepare("SELECT ID FROM PodConfig WHERE ID LIKE ?1 || '%' LIMIT 2")?;
        let rows = stmt.query_map(params![id_or_name], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<_>>()?
    };
    match matches.as_slice() {
        [full_id] => Ok(full_id.clone()),
        [_, ..] => Err(StateError::PodExists {
            id: id_or_name.to_owned(),
        }),
        [] if is_ctr => Err(StateError::invalid_arg(format!(
            "{id_or_name:?} is a container, not a pod"
        ))),
        [] => Err(StateError::NoSuchPod {
            id: id_or_name.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteState) {
        let dir = TempDir::new().expect("tempdir");
        let config = StoreConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.static_dir).expect("mkdir");
        let store = SqliteState::open(&config).expect("open store");
        (dir, store)
    }

    #[test]
    fn reopening_validates_recorded_config() {
        let dir = TempDir::new().expect("tempdir");
        let config = StoreConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.static_dir).expect("mkdir");
        drop(SqliteState::open(&config).expect("first open"));

        let mut other = config.clone();
        other.graph_driver = "vfs".into();
        let err = SqliteState::open(&other).expect_err("mismatched driver must fail");
        assert!(matches!(err, StateError::BadConfig { .. }));

        drop(SqliteState::open(&config).expect("reopen"));
    }

    #[test]
    fn newer_schema_version_refuses_to_open() {
        let dir = TempDir::new().expect("tempdir");
        let config = StoreConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.static_dir).expect("mkdir");
        drop(SqliteState::open(&config).expect("first open"));

        let conn =
            Connection::open(config.static_dir.join(SQLITE_DB_NAME)).expect("raw open");
        let _ = conn
            .execute(
                "UPDATE DBConfig SET SchemaVersion = ?1 WHERE ID = 1",
                params![SCHEMA_VERSION + 1],
            )
            .expect("bump version");
        drop(conn);

        let err = SqliteState::open(&config).expect_err("newer schema must fail");
        assert!(matches!(err, StateError::BadConfig { .. }));
    }

    #[test]
    fn prune_respects_retention_and_liveness() {
        let (_dir, store) = open_store();
        let live = ContainerConfig::new("live");
        store
            .add_container(&live, &ContainerRuntimeState::default())
            .expect("add");
        store.add_container_exit_code(&live.id, 0).expect("record");

        let gone_id = stevedore_common::types::generate_id();
        store.add_container_exit_code(&gone_id, 137).expect("record");

        // Age both entries past the retention window.
        let old = Utc::now().timestamp() - EXIT_CODE_RETENTION_SECS - 10;
        let _ = store
            .conn()
            .execute("UPDATE ContainerExitCode SET Timestamp = ?1", params![old])
            .expect("age entries");

        store.prune_container_exit_codes().expect("prune");

        assert_eq!(store.container_exit_code(&live.id).expect("code"), 0);
        assert!(matches!(
            store.container_exit_code(&gone_id),
            Err(StateError::NoSuchExitCode { .. })
        ));
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
