//! System-wide constants, default paths, and environment-variable names.

/// Default base directory for Stevedore data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/stevedore";

/// File name of the relational state database inside the static directory.
pub const SQLITE_DB_NAME: &str = "db.sql";

/// File name of the key-value state database inside the static directory.
pub const KV_DB_NAME: &str = "state.redb";

/// Current on-disk schema version shared by both backends.
pub const SCHEMA_VERSION: i64 = 1;

/// How long container exit codes are retained before pruning, in seconds.
pub const EXIT_CODE_RETENTION_SECS: i64 = 5 * 60;

/// Default busy timeout for the relational backend, in milliseconds.
///
/// Kept high so that write contention from other processes sharing the
/// store is retried rather than surfaced to the caller.
pub const DEFAULT_SQLITE_BUSY_TIMEOUT_MS: u64 = 100_000;

/// Environment variable overriding the relational backend's busy timeout
/// (milliseconds). Intended for testing only; do not document for users.
pub const ENV_SQLITE_BUSY_TIMEOUT: &str = "STEVEDORE_SQLITE_BUSY_TIMEOUT";

/// Environment variable allowing creation of a new store with the
/// deprecated key-value backend, for compatibility testing.
pub const ENV_FORCE_KV_BACKEND: &str = "STEVEDORE_FORCE_KV_BACKEND";

/// Environment variable silencing the deprecation warning emitted when an
/// existing key-value store is opened.
pub const ENV_SILENCE_KV_DEPRECATION: &str = "STEVEDORE_SILENCE_KV_DEPRECATION";

/// Number of leading ID characters used as the short, human-facing form.
pub const SHORT_ID_LENGTH: usize = 12;

/// Application name used in log output and state files.
pub const APP_NAME: &str = "stevedore";
