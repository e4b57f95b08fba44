//! redb table definitions for the key-value backend.
//!
//! redb has no nested buckets, so parent/child relations use composite
//! `{parent}:{child}` keys; a prefix scan over `{parent}:` enumerates the
//! children. Entity blobs are JSON-serialized into `&[u8]` values.
//!
//! The ID and name registries are shared between containers and pods, which
//! is what enforces the combined uniqueness namespace: an insert checks one
//! table regardless of entity kind.

use redb::TableDefinition;

/// Full ID → name, shared across containers and pods.
pub const ID_REGISTRY: TableDefinition<&str, &str> = TableDefinition::new("id-registry");

/// Name → full ID, shared across containers and pods.
pub const NAME_REGISTRY: TableDefinition<&str, &str> = TableDefinition::new("name-registry");

/// Container ID → JSON [`ContainerConfig`](stevedore_common::types::ContainerConfig).
pub const CTR_CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("ctr-config");

/// Container ID → JSON [`ContainerRuntimeState`](stevedore_common::types::ContainerRuntimeState).
pub const CTR_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("ctr-state");

/// `{dependency_id}:{dependent_id}` → (). Reverse dependency edges: a prefix
/// scan over a container's ID yields the containers depending on it.
pub const CTR_DEPS: TableDefinition<&str, ()> = TableDefinition::new("ctr-deps");

/// `{container_id}:{network}` → JSON
/// [`PerNetworkOptions`](stevedore_common::types::PerNetworkOptions).
///
/// Legacy pre-migration records hold the raw container-ID bytes instead of
/// JSON; they are upgraded on first read.
pub const CTR_NETWORKS: TableDefinition<&str, &[u8]> = TableDefinition::new("ctr-networks");

/// `{container_id}:{session_id}` → (). Per-container exec-session
/// sub-registry; must agree with [`EXEC_REGISTRY`].
pub const CTR_EXEC: TableDefinition<&str, ()> = TableDefinition::new("ctr-exec");

/// Container ID → name. Flat index for fast enumeration.
pub const ALL_CTRS: TableDefinition<&str, &str> = TableDefinition::new("all-ctrs");

/// Pod ID → JSON [`PodConfig`](stevedore_common::types::PodConfig).
pub const POD_CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("pod-config");

/// Pod ID → JSON [`PodRuntimeState`](stevedore_common::types::PodRuntimeState).
pub const POD_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("pod-state");

/// `{pod_id}:{container_id}` → container name. Pod membership index.
pub const POD_CTRS: TableDefinition<&str, &str> = TableDefinition::new("pod-ctrs");

/// Pod ID → name. Flat index for fast enumeration.
pub const ALL_PODS: TableDefinition<&str, &str> = TableDefinition::new("all-pods");

/// Volume name → JSON [`VolumeConfig`](stevedore_common::types::VolumeConfig).
pub const VOL_CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("vol-config");

/// Volume name → JSON [`VolumeRuntimeState`](stevedore_common::types::VolumeRuntimeState).
pub const VOL_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("vol-state");

/// `{volume_name}:{container_id}` → (). Containers using a volume. Entries
/// may go stale when a container is force-removed; readers filter against
/// the container table instead of trusting them.
pub const VOL_DEPS: TableDefinition<&str, ()> = TableDefinition::new("vol-deps");

/// Volume name → name. Flat index for fast enumeration.
pub const ALL_VOLS: TableDefinition<&str, &str> = TableDefinition::new("all-volumes");

/// Storage-layer container ID → volume name, for image-backed volumes.
pub const VOL_CTRS: TableDefinition<&str, &str> = TableDefinition::new("volume-ctrs");

/// Exec session ID → owning container ID. Global exec registry.
pub const EXEC_REGISTRY: TableDefinition<&str, &str> = TableDefinition::new("exec-registry");

/// Container ID → exit code. Paired with [`EXIT_TIMESTAMPS`]; kept apart
/// from the state blob so the exit path avoids JSON costs.
pub const EXIT_CODES: TableDefinition<&str, i32> = TableDefinition::new("exit-codes");

/// Container ID → Unix timestamp the exit code was recorded at. Neither this
/// nor [`EXIT_CODES`] may have an entry the other lacks.
pub const EXIT_TIMESTAMPS: TableDefinition<&str, i64> =
    TableDefinition::new("exit-code-timestamps");

/// Single-record table holding the JSON
/// [`DbConfig`](stevedore_common::types::DbConfig) under [`DB_CONFIG_KEY`].
pub const RUNTIME_CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("runtime-config");

/// Key of the sole record in [`RUNTIME_CONFIG`].
pub const DB_CONFIG_KEY: &str = "db-config";

/// Builds the composite key for a parent/child relation.
#[must_use]
pub fn scoped(parent: &str, child: &str) -> String {
    format!("{parent}:{child}")
}

/// Bounds of the half-open key range covering every `{parent}:{child}` key.
///
/// `;` is the successor byte of `:`, so the range is a pure prefix match no
/// matter what the child part contains.
#[must_use]
pub fn prefix_bounds(parent: &str) -> (String, String) {
    (format!("{parent}:"), format!("{parent};"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_bounds_cover_children_only() {
        let (lower, upper) = prefix_bounds("abc");
        assert!(scoped("abc", "x").as_str() >= lower.as_str());
        assert!(scoped("abc", "x").as_str() < upper.as_str());
        // A sibling key sharing the leading bytes is outside the range.
        assert!("abcd:x" > upper.as_str());
        assert!("abb:x" < lower.as_str());
    }
}
