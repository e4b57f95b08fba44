//! Store configuration model.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which storage engine backs the entity store.
///
/// Selected once, when the store is first created; every later open of the
/// same store must use the same backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Embedded relational engine. The default.
    #[default]
    Sqlite,
    /// Embedded key-value engine. Deprecated; creating new stores with it
    /// requires an explicit environment override.
    Keyvalue,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Keyvalue => write!(f, "keyvalue"),
        }
    }
}

/// Configuration of the entity store and the host paths it validates.
///
/// The path and driver fields are persisted into the store's `DbConfig`
/// record on first creation and compared (after symlink resolution) on every
/// subsequent open. A mismatch means two differently-configured runtimes are
/// sharing one store file and is a fatal startup error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage engine to use.
    #[serde(default)]
    pub backend: StoreBackend,
    /// Operating system name. Defaults to the compile-time target OS.
    pub os: String,
    /// Directory the store database files live in.
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

impl StoreConfig {
    /// Creates a store config with conventional sub-paths under one root.
    #[must_use]
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            backend: StoreBackend::default(),
            os: std::env::consts::OS.to_owned(),
            static_dir: root.join("state"),
            tmp_dir: root.join("tmp"),
            graph_root: root.join("storage"),
            run_root: root.join("run"),
            graph_driver: "overlay".to_owned(),
            volume_path: root.join("volumes"),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::rooted_at(crate::constants::SYSTEM_DATA_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backend_is_sqlite() {
        assert_eq!(StoreConfig::default().backend, StoreBackend::Sqlite);
    }

    #[test]
    fn rooted_config_nests_paths() {
        let cfg = StoreConfig::rooted_at("/tmp/stv");
        assert_eq!(cfg.static_dir, PathBuf::from("/tmp/stv/state"));
        assert_eq!(cfg.volume_path, PathBuf::from("/tmp/stv/volumes"));
        assert_eq!(cfg.os, std::env::consts::OS);
    }

    #[test]
    fn backend_serializes_lowercase() {
        let json = serde_json::to_string(&StoreBackend::Keyvalue).expect("serialize");
        assert_eq!(json, "\"keyvalue\"");
    }
}
