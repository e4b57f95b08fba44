//! Domain entity types persisted by the Stevedore entity store.
//!
//! Every entity is split into an immutable `*Config` record (written once at
//! creation, changed only through the privileged rewrite operations) and a
//! mutable `*RuntimeState` record (freely updated through save/update).
//! Both halves are serialized as JSON blobs by both store backends.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generates a new 64-character hex entity ID.
///
/// IDs share one namespace across containers and pods; the store enforces
/// uniqueness at add time.
#[must_use]
pub fn generate_id() -> String {
    let a = uuid::Uuid::new_v4().simple().to_string();
    let b = uuid::Uuid::new_v4().simple().to_string();
    format!("{a}{b}")
}

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container exists in the store but has no runtime resources yet.
    #[default]
    Configured,
    /// Runtime resources have been created but the process has not started.
    Created,
    /// The init process is running.
    Running,
    /// The container was stopped by request.
    Stopped,
    /// The container is paused.
    Paused,
    /// The init process has exited.
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configured => write!(f, "configured"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Per-network options for one container attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerNetworkOptions {
    /// Name of the interface created inside the container for this network.
    pub interface_name: String,
    /// DNS aliases for the container on this network.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Static IP addresses requested on this network.
    #[serde(default)]
    pub static_ips: Vec<IpAddr>,
    /// Static MAC address requested on this network.
    #[serde(default)]
    pub static_mac: Option<String>,
}

/// Immutable configuration of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Unique identifier; shares a namespace with pod IDs.
    pub id: String,
    /// Unique name; shares a namespace with pod names.
    pub name: String,
    /// ID of the pod this container belongs to, if any.
    #[serde(default)]
    pub pod_id: Option<String>,
    /// Handle of the cross-process lock allocated for this container.
    pub lock_id: u32,
    /// Image reference the container was created from.
    #[serde(default)]
    pub image: String,
    /// Command executed as the init process.
    #[serde(default)]
    pub command: Vec<String>,
    /// User-supplied labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// IDs of containers this container depends on (shared namespaces or
    /// explicit dependencies).
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Names of named volumes this container mounts.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Networks requested at creation time with their options. The store is
    /// authoritative for attachments once the container has been added.
    #[serde(default)]
    pub networks: HashMap<String, PerNetworkOptions>,
    /// Static IP requested for the first network (legacy field, pre-dating
    /// per-network options).
    #[serde(default)]
    pub static_ip: Option<IpAddr>,
    /// Static MAC requested for the first network (legacy field).
    #[serde(default)]
    pub static_mac: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl ContainerConfig {
    /// Creates a minimal container config with a fresh ID.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            pod_id: None,
            lock_id: 0,
            image: String::new(),
            command: Vec::new(),
            labels: HashMap::new(),
            dependencies: Vec::new(),
            volumes: Vec::new(),
            networks: HashMap::new(),
            static_ip: None,
            static_mac: None,
            created_at: Utc::now(),
        }
    }

    /// Returns the short form of the container ID.
    #[must_use]
    pub fn short_id(&self) -> &str {
        let len = crate::constants::SHORT_ID_LENGTH.min(self.id.len());
        &self.id[..len]
    }
}

/// Mutable runtime state of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerRuntimeState {
    /// Current lifecycle status.
    pub status: ContainerStatus,
    /// PID of the init process, if running.
    #[serde(default)]
    pub pid: Option<i32>,
    /// Exit code of the most recent run, if the container has exited.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Whether the container's storage is currently mounted.
    #[serde(default)]
    pub mounted: bool,
    /// Mount point of the container's storage, when mounted.
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
    /// Path to the container's network namespace, when configured.
    #[serde(default)]
    pub netns_path: Option<String>,
    /// Per-network runtime status as reported by the network stack.
    #[serde(default)]
    pub network_status: HashMap<String, String>,
    /// IDs of exec sessions currently tracked for this container. Must agree
    /// with the store's global exec-session registry.
    #[serde(default)]
    pub exec_sessions: Vec<String>,
    /// Number of times the container has been restarted.
    #[serde(default)]
    pub restart_count: u64,
    /// When the init process last started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the init process last exited.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerRuntimeState {
    /// Clears every field invalidated by a host reboot.
    ///
    /// The PID, mount state, network namespace, network status, and exec
    /// sessions all refer to resources that no longer exist after a reboot.
    /// Identity and exit bookkeeping are left untouched.
    pub fn reset_after_reboot(&mut self) {
        if self.status == ContainerStatus::Running || self.status == ContainerStatus::Paused {
            self.status = ContainerStatus::Exited;
        }
        self.pid = None;
        self.mounted = false;
        self.mountpoint = None;
        self.netns_path = None;
        self.network_status.clear();
        self.exec_sessions.clear();
    }
}

/// Immutable configuration of a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodConfig {
    /// Unique identifier; shares a namespace with container IDs.
    pub id: String,
    /// Unique name; shares a namespace with container names.
    pub name: String,
    /// Handle of the cross-process lock allocated for this pod.
    pub lock_id: u32,
    /// User-supplied labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl PodConfig {
    /// Creates a minimal pod config with a fresh ID.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            lock_id: 0,
            labels: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Mutable runtime state of a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRuntimeState {
    /// Cgroup path of the pod's parent cgroup, cached while the host is up.
    #[serde(default)]
    pub cgroup_path: Option<String>,
    /// ID of the pod's infra container, if one has been created.
    #[serde(default)]
    pub infra_container_id: Option<String>,
}

impl PodRuntimeState {
    /// Clears every field invalidated by a host reboot.
    ///
    /// The cgroup path is recomputed on next start; the infra-container ID is
    /// membership, not boot state, and survives.
    pub fn reset_after_reboot(&mut self) {
        self.cgroup_path = None;
    }
}

/// Immutable configuration of a volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Unique name; volumes have their own namespace, primary key.
    pub name: String,
    /// Volume driver name ("local" for store-managed volumes).
    #[serde(default)]
    pub driver: String,
    /// Host path the volume contents live at.
    #[serde(default)]
    pub mount_point: PathBuf,
    /// Driver-specific options.
    #[serde(default)]
    pub options: HashMap<String, String>,
    /// Handle of the cross-process lock allocated for this volume.
    pub lock_id: u32,
    /// Storage-layer container ID backing this volume, for image-backed
    /// volumes. Not a container tracked by the store.
    #[serde(default)]
    pub storage_id: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl VolumeConfig {
    /// Creates a minimal volume config.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: "local".into(),
            mount_point: PathBuf::new(),
            options: HashMap::new(),
            lock_id: 0,
            storage_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Mutable runtime state of a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRuntimeState {
    /// Number of live mounts of this volume.
    #[serde(default)]
    pub mount_count: u64,
    /// Whether the volume contents still need a chown to the container user.
    #[serde(default)]
    pub needs_chown: bool,
    /// Whether image contents still need to be copied up into the volume.
    #[serde(default)]
    pub needs_copy_up: bool,
    /// Whether a copy-up has been performed.
    #[serde(default)]
    pub copied_up: bool,
}

/// A tracked secondary process running inside an already-started container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSession {
    /// Unique identifier of the exec session.
    pub id: String,
    /// ID of the container the session runs in.
    pub container_id: String,
    /// PID of the exec process, if running.
    #[serde(default)]
    pub pid: Option<i32>,
}

/// Host and storage configuration recorded when the store was first created,
/// validated against the live runtime configuration on every open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    /// On-disk schema version.
    pub schema_version: i64,
    /// Operating system the store was created on.
    pub os: String,
    /// Directory holding the store files themselves.
    pub static_dir: PathBuf,
    /// Temporary files directory.
    pub tmp_dir: PathBuf,
    /// Storage graph root.
    pub graph_root: PathBuf,
    /// Storage run root.
    pub run_root: PathBuf,
    /// Storage graph driver name.
    pub graph_driver: String,
    /// Directory volume contents live under.
    pub volume_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_64_hex_chars() {
        let id = generate_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn container_reset_clears_boot_state_only() {
        let mut state = ContainerRuntimeState {
            status: ContainerStatus::Running,
            pid: Some(4242),
            exit_code: Some(0),
            mounted: true,
            mountpoint: Some(PathBuf::from("/var/lib/stevedore/overlay/x")),
            netns_path: Some("/run/netns/cni-1234".into()),
            restart_count: 3,
            exec_sessions: vec!["abc".into()],
            ..ContainerRuntimeState::default()
        };
        state.reset_after_reboot();
        assert_eq!(state.status, ContainerStatus::Exited);
        assert!(state.pid.is_none());
        assert!(!state.mounted);
        assert!(state.mountpoint.is_none());
        assert!(state.netns_path.is_none());
        assert!(state.exec_sessions.is_empty());
        // Untouched by reboot.
        assert_eq!(state.exit_code, Some(0));
        assert_eq!(state.restart_count, 3);
    }

    #[test]
    fn container_reset_is_idempotent() {
        let mut state = ContainerRuntimeState {
            status: ContainerStatus::Running,
            pid: Some(1),
            ..ContainerRuntimeState::default()
        };
        state.reset_after_reboot();
        let once = state.clone();
        state.reset_after_reboot();
        assert_eq!(state, once);
    }

    #[test]
    fn pod_reset_keeps_infra_id() {
        let mut state = PodRuntimeState {
            cgroup_path: Some("/machine.slice/pod-x".into()),
            infra_container_id: Some("deadbeef".into()),
        };
        state.reset_after_reboot();
        assert!(state.cgroup_path.is_none());
        assert_eq!(state.infra_container_id.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn short_id_is_twelve_chars() {
        let cfg = ContainerConfig::new("web");
        assert_eq!(cfg.short_id().len(), 12);
        assert!(cfg.id.starts_with(cfg.short_id()));
    }

    #[test]
    fn config_json_round_trips() {
        let mut cfg = ContainerConfig::new("db");
        cfg.dependencies.push("0".repeat(64));
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: ContainerConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }
}
