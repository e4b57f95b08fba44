//! Error types for the entity store.
//!
//! The taxonomy is deliberate and stable: callers match on these variants to
//! distinguish not-found from already-exists from in-use conditions, so new
//! failure modes get new variants rather than being folded into existing
//! ones. Backend errors are wrapped with operation context and surfaced
//! in kind.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by the entity store and its wrappers.
#[derive(Debug, Error)]
pub enum StateError {
    /// An empty ID or name was passed to a lookup.
    #[error("empty ID or name given")]
    EmptyIdentifier,

    /// No container with the given ID or name exists.
    #[error("no container with name or ID {id:?} found")]
    NoSuchContainer {
        /// ID or name that failed to resolve.
        id: String,
    },

    /// No pod with the given ID or name exists.
    #[error("no pod with name or ID {id:?} found")]
    NoSuchPod {
        /// ID or name that failed to resolve.
        id: String,
    },

    /// No volume with the given name exists.
    #[error("no volume with name {name:?} found")]
    NoSuchVolume {
        /// Name that failed to resolve.
        name: String,
    },

    /// No exec session with the given ID exists.
    #[error("no exec session with ID {id} found")]
    NoSuchExecSession {
        /// Exec session ID.
        id: String,
    },

    /// No exit code is recorded for the given container ID.
    #[error("no exit code recorded for container {id}")]
    NoSuchExitCode {
        /// Container ID.
        id: String,
    },

    /// A container with the given ID or name already exists, or a partial-ID
    /// lookup matched more than one container.
    #[error("container with name or ID {id} already exists, or ID is ambiguous")]
    ContainerExists {
        /// Conflicting or ambiguous ID or name.
        id: String,
    },

    /// A pod with the given ID or name already exists, or a partial-ID
    /// lookup matched more than one pod.
    #[error("pod with name or ID {id} already exists, or ID is ambiguous")]
    PodExists {
        /// Conflicting or ambiguous ID or name.
        id: String,
    },

    /// A volume with the given name already exists, or a partial-name lookup
    /// matched more than one volume.
    #[error("volume with name {name} already exists, or name is ambiguous")]
    VolumeExists {
        /// Conflicting or ambiguous name.
        name: String,
    },

    /// An exec session with the given ID is already registered.
    #[error("exec session with ID {id} already exists")]
    ExecSessionExists {
        /// Conflicting exec session ID.
        id: String,
    },

    /// Operation attempted on a container known to have been removed by
    /// another process.
    #[error("container {id} has been removed")]
    ContainerRemoved {
        /// Container ID.
        id: String,
    },

    /// Operation attempted on a pod known to have been removed by another
    /// process.
    #[error("pod {id} has been removed")]
    PodRemoved {
        /// Pod ID.
        id: String,
    },

    /// Operation attempted on a volume known to have been removed by another
    /// process.
    #[error("volume {name} has been removed")]
    VolumeRemoved {
        /// Volume name.
        name: String,
    },

    /// The store has been closed.
    #[error("state store has been closed")]
    StoreClosed,

    /// A container cannot be removed while other containers depend on it.
    #[error("container {id} is in use by containers {dependents:?}")]
    ContainerInUse {
        /// Container ID.
        id: String,
        /// IDs of containers depending on it.
        dependents: Vec<String>,
    },

    /// A volume cannot be removed while containers use it.
    #[error("volume {name} is in use by containers {dependents:?}")]
    VolumeInUse {
        /// Volume name.
        name: String,
        /// IDs of containers using it.
        dependents: Vec<String>,
    },

    /// A pod cannot be removed while it still has member containers.
    #[error("pod {id} still contains containers and cannot be removed")]
    PodNotEmpty {
        /// Pod ID.
        id: String,
    },

    /// A container cannot be removed while it has registered exec sessions.
    #[error("container {id} has active exec sessions")]
    ExecSessionsActive {
        /// Container ID.
        id: String,
    },

    /// The container is already connected to the network.
    #[error("container {id} is already connected to network {network}")]
    NetworkConnected {
        /// Container ID.
        id: String,
        /// Network name.
        network: String,
    },

    /// The container is not connected to the network.
    #[error("container {id} is not connected to network {network}")]
    NetworkNotConnected {
        /// Container ID.
        id: String,
        /// Network name.
        network: String,
    },

    /// An argument violates an operation's contract.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the violation.
        message: String,
    },

    /// The store's recorded configuration does not match the live runtime
    /// configuration. Fatal; aborts startup.
    #[error("store configuration mismatch: {message}")]
    BadConfig {
        /// Description of the mismatch.
        message: String,
    },

    /// A structural invariant was unexpectedly broken.
    #[error("internal store error: {message}")]
    Internal {
        /// Description of the inconsistency.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization of an entity blob failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// The relational backend reported an error.
    #[error("sqlite backend error: {source}")]
    Sqlite {
        /// Underlying SQLite error.
        #[from]
        source: rusqlite::Error,
    },

    /// The key-value backend reported an error.
    #[error("key-value backend error: {source}")]
    Keyvalue {
        /// Underlying redb error.
        source: Box<redb::Error>,
    },
}

impl StateError {
    /// Shorthand for an [`StateError::Internal`] with a formatted message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for an [`StateError::InvalidArgument`] with a formatted
    /// message.
    #[must_use]
    pub fn invalid_arg(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

macro_rules! from_redb {
    ($($err:ty),+ $(,)?) => {
        $(impl From<$err> for StateError {
            fn from(source: $err) -> Self {
                Self::Keyvalue {
                    source: Box::new(redb::Error::from(source)),
                }
            }
        })+
    };
}

from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Convenience alias used throughout the store.
pub type Result<T> = std::result::Result<T, StateError>;
