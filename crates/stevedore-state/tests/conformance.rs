//! Backend conformance suite.
//!
//! Every test runs against both store backends; the two must be
//! behaviorally indistinguishable through the `EntityStore` contract.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use stevedore_common::config::StoreConfig;
use stevedore_common::types::{
    ContainerConfig, ContainerRuntimeState, ContainerStatus, ExecSession, PerNetworkOptions,
    PodConfig, PodRuntimeState, VolumeConfig, VolumeRuntimeState,
};
use stevedore_state::{EntityStore, KvState, SqliteState, StateError};
use tempfile::TempDir;

type Factory = fn(&StoreConfig) -> Box<dyn EntityStore>;

fn backends() -> Vec<(&'static str, Factory)> {
    vec![
        ("sqlite", |cfg| {
            Box::new(SqliteState::open(cfg).expect("open sqlite store"))
        }),
        ("keyvalue", |cfg| {
            Box::new(KvState::open(cfg).expect("open key-value store"))
        }),
    ]
}

fn store_config(dir: &TempDir) -> StoreConfig {
    let config = StoreConfig::rooted_at(dir.path());
    std::fs::create_dir_all(&config.static_dir).expect("mkdir static dir");
    config
}

fn for_each_backend(test: impl Fn(&'static str, Arc<dyn EntityStore>)) {
    for (name, factory) in backends() {
        let dir = TempDir::new().expect("tempdir");
        let config = store_config(&dir);
        test(name, Arc::from(factory(&config)));
    }
}

fn ctr_with_id(name: &str, id_seed: &str) -> ContainerConfig {
    let mut config = ContainerConfig::new(name);
    config.id = format!("{id_seed:0<64}");
    config
}

#[test]
fn entities_persist_across_reopen() {
    for (name, factory) in backends() {
        let dir = TempDir::new().expect("tempdir");
        let config = store_config(&dir);

        let ctr = ContainerConfig::new("web");
        let vol = VolumeConfig::new("data");
        {
            let store = factory(&config);
            store
                .add_container(&ctr, &ContainerRuntimeState::default())
                .expect("add container");
            store
                .add_volume(&vol, &VolumeRuntimeState::default())
                .expect("add volume");
            store.close().expect("close");
        }

        let store = factory(&config);
        let (read_ctr, _) = store.container(&ctr.id).expect("container survives reopen");
        assert_eq!(read_ctr, ctr, "backend {name}");
        let (read_vol, _) = store.volume("data").expect("volume survives reopen");
        assert_eq!(read_vol, vol, "backend {name}");
    }
}

#[test]
fn names_and_ids_are_unique_across_entity_kinds() {
    for_each_backend(|name, store| {
        let ctr = ContainerConfig::new("shared");
        store
            .add_container(&ctr, &ContainerRuntimeState::default())
            .expect("add container");
        let before = store.all_containers().expect("list").len();

        // A pod may not reuse a container's name, and the error names the
        // kind that owns it.
        let pod = PodConfig::new("shared");
        let err = store
            .add_pod(&pod, &PodRuntimeState::default())
            .expect_err("duplicate name across kinds must fail");
        assert!(
            matches!(err, StateError::ContainerExists { .. }),
            "backend {name}: {err}"
        );

        // Nor a container another container's name.
        let dup = ContainerConfig::new("shared");
        let err = store
            .add_container(&dup, &ContainerRuntimeState::default())
            .expect_err("duplicate container name must fail");
        assert!(
            matches!(err, StateError::ContainerExists { .. }),
            "backend {name}: {err}"
        );

        // A pod reusing a container's ID fails the same way.
        let mut pod = PodConfig::new("other");
        pod.id.clone_from(&ctr.id);
        let err = store
            .add_pod(&pod, &PodRuntimeState::default())
            .expect_err("duplicate ID across kinds must fail");
        assert!(
            matches!(err, StateError::ContainerExists { .. }),
            "backend {name}: {err}"
        );

        // Failed adds leave the store unchanged.
        assert_eq!(store.all_containers().expect("list").len(), before);
        assert!(store.all_pods().expect("pods").is_empty(), "backend {name}");
    });
}

#[test]
fn lookup_resolves_name_then_id_then_unique_prefix() {
    for_each_backend(|name, store| {
        let a = ctr_with_id("alpha", "aa1");
        let b = ctr_with_id("beta", "aa2");
        store
            .add_container(&a, &ContainerRuntimeState::default())
            .expect("add a");
        store
            .add_container(&b, &ContainerRuntimeState::default())
            .expect("add b");

        // Exact ID and exact name.
        assert_eq!(store.lookup_container_id(&a.id).expect("by id"), a.id);
        assert_eq!(store.lookup_container_id("alpha").expect("by name"), a.id);

        // When one container's name equals another's full ID, the exact name
        // match takes precedence over the exact ID match.
        let named_like_id = ctr_with_id(&a.id, "bb1");
        store
            .add_container(&named_like_id, &ContainerRuntimeState::default())
            .expect("add container named like an ID");
        assert_eq!(
            store
                .lookup_container_id(&a.id)
                .expect("name wins over full ID"),
            named_like_id.id,
            "backend {name}"
        );
        store
            .remove_container(&named_like_id.id)
            .expect("remove collision container");
        assert_eq!(store.lookup_container_id(&a.id).expect("by id again"), a.id);

        // Unique prefix resolves; shared prefix is ambiguous.
        assert_eq!(store.lookup_container_id("aa1").expect("prefix"), a.id);
        let err = store
            .lookup_container_id("aa")
            .expect_err("shared prefix must be ambiguous");
        assert!(
            matches!(err, StateError::ContainerExists { .. }),
            "backend {name}: {err}"
        );

        // A name owned by a pod is not a container match.
        let pod = PodConfig::new("podname");
        store
            .add_pod(&pod, &PodRuntimeState::default())
            .expect("add pod");
        let err = store
            .lookup_container_id("podname")
            .expect_err("pod name must not resolve to a container");
        assert!(
            matches!(err, StateError::InvalidArgument { .. }),
            "backend {name}: {err}"
        );

        // And the mirror case for pods.
        let err = store
            .lookup_pod("alpha")
            .expect_err("container name must not resolve to a pod");
        assert!(
            matches!(err, StateError::InvalidArgument { .. }),
            "backend {name}: {err}"
        );
        assert_eq!(
            store.lookup_pod(&pod.id[..10]).expect("pod prefix").0.id,
            pod.id
        );

        // Nothing matches at all.
        let err = store.lookup_container_id("zz").expect_err("no match");
        assert!(
            matches!(err, StateError::NoSuchContainer { .. }),
            "backend {name}: {err}"
        );
    });
}

#[test]
fn volume_in_use_reports_each_dependent() {
    for_each_backend(|name, store| {
        let vol = VolumeConfig::new("data");
        store
            .add_volume(&vol, &VolumeRuntimeState::default())
            .expect("add volume");
        assert!(
            store.volume_in_use("data").expect("in use").is_empty(),
            "backend {name}"
        );

        let mut first = ContainerConfig::new("one");
        first.volumes.push("data".into());
        store
            .add_container(&first, &ContainerRuntimeState::default())
            .expect("add first");
        assert_eq!(
            store.volume_in_use("data").expect("in use"),
            vec![first.id.clone()],
            "backend {name}"
        );

        let mut second = ContainerConfig::new("two");
        second.volumes.push("data".into());
        store
            .add_container(&second, &ContainerRuntimeState::default())
            .expect("add second");
        let mut dependents = store.volume_in_use("data").expect("in use");
        dependents.sort();
        let mut expected = vec![first.id.clone(), second.id.clone()];
        expected.sort();
        assert_eq!(dependents, expected, "backend {name}");

        let err = store.remove_volume("data").expect_err("in-use volume");
        assert!(
            matches!(err, StateError::VolumeInUse { ref dependents, .. } if dependents.len() == 2),
            "backend {name}: {err}"
        );

        store.remove_container(&first.id).expect("remove first");
        store.remove_container(&second.id).expect("remove second");
        store.remove_volume("data").expect("remove volume");
    });
}

#[test]
fn refresh_resets_runtime_state_and_is_idempotent() {
    for_each_backend(|name, store| {
        let ctr = ContainerConfig::new("web");
        let state = ContainerRuntimeState {
            status: ContainerStatus::Running,
            pid: Some(4242),
            netns_path: Some("/run/netns/cni-1".into()),
            ..ContainerRuntimeState::default()
        };
        store.add_container(&ctr, &state).expect("add container");
        store
            .add_exec_session(&ExecSession {
                id: "exec1".into(),
                container_id: ctr.id.clone(),
                pid: Some(4243),
            })
            .expect("add exec session");
        store
            .add_container_exit_code(&ctr.id, 0)
            .expect("record exit code");

        let pod = PodConfig::new("app");
        let pod_state = PodRuntimeState {
            cgroup_path: Some("/machine.slice/app".into()),
            infra_container_id: Some("f".repeat(64)),
        };
        store.add_pod(&pod, &pod_state).expect("add pod");

        store.refresh().expect("refresh");

        let refreshed = store.update_container(&ctr.id).expect("state");
        assert_eq!(refreshed.status, ContainerStatus::Exited, "backend {name}");
        assert!(refreshed.pid.is_none(), "backend {name}");
        assert!(refreshed.netns_path.is_none(), "backend {name}");

        let pod_refreshed = store.update_pod(&pod.id).expect("pod state");
        assert!(pod_refreshed.cgroup_path.is_none(), "backend {name}");
        assert_eq!(
            pod_refreshed.infra_container_id,
            pod_state.infra_container_id,
            "backend {name}"
        );

        // Sessions and exit codes are gone, from both sides of their
        // registries.
        assert!(
            matches!(
                store.exec_session_container("exec1"),
                Err(StateError::NoSuchExecSession { .. })
            ),
            "backend {name}"
        );
        assert!(
            store
                .container_exec_sessions(&ctr.id)
                .expect("sessions")
                .is_empty(),
            "backend {name}"
        );
        assert!(
            matches!(
                store.container_exit_code(&ctr.id),
                Err(StateError::NoSuchExitCode { .. })
            ),
            "backend {name}"
        );

        // A second refresh observes the same fixed point.
        store.refresh().expect("second refresh");
        assert_eq!(
            store.update_container(&ctr.id).expect("state"),
            refreshed,
            "backend {name}"
        );
    });
}

#[test]
fn volume_config_round_trips() {
    for_each_backend(|name, store| {
        let mut vol = VolumeConfig::new("data");
        vol.mount_point = "/var/lib/stevedore/volumes/data/_data".into();
        let _ = vol.options.insert("type".into(), "tmpfs".into());
        vol.storage_id = Some("s".repeat(64));
        store
            .add_volume(&vol, &VolumeRuntimeState::default())
            .expect("add volume");

        let (read, _) = store.volume("data").expect("read volume");
        assert_eq!(read, vol, "backend {name}");
        assert!(
            store
                .container_id_is_volume(&"s".repeat(64))
                .expect("storage id"),
            "backend {name}"
        );
    });
}

#[test]
fn rename_is_atomic_across_indices() {
    for_each_backend(|name, store| {
        let pod = PodConfig::new("app");
        store
            .add_pod(&pod, &PodRuntimeState::default())
            .expect("add pod");
        let mut member = ContainerConfig::new("old");
        member.pod_id = Some(pod.id.clone());
        store
            .add_container_to_pod(&pod.id, &member, &ContainerRuntimeState::default())
            .expect("add member");
        let holder = ContainerConfig::new("taken");
        store
            .add_container(&holder, &ContainerRuntimeState::default())
            .expect("add holder");

        // A rename to a taken name fails and changes nothing anywhere. In
        // the key-value backend the collision is detected only after the
        // registry and index rewrites have executed inside the transaction,
        // so these assertions check that the abort undoes writes that had
        // already happened, not just that nothing was attempted.
        let mut renamed = member.clone();
        renamed.name = "taken".into();
        let err = store
            .safe_rewrite_container_config(&member.id, "old", "taken", &renamed)
            .expect_err("rename to taken name must fail");
        assert!(
            matches!(err, StateError::ContainerExists { .. }),
            "backend {name}: {err}"
        );
        assert_eq!(store.container_name(&member.id).expect("name"), "old");
        assert_eq!(store.lookup_container_id("old").expect("lookup"), member.id);
        assert_eq!(
            store.lookup_container_id("taken").expect("lookup"),
            holder.id
        );
        assert!(
            store
                .pod_has_container(&pod.id, &member.id)
                .expect("membership"),
            "backend {name}"
        );
        let listed = store.all_containers().expect("list");
        assert!(
            listed
                .iter()
                .any(|(c, _)| c.id == member.id && c.name == "old"),
            "backend {name}: enumeration index must still carry the old name"
        );

        // A rename to a free name lands in every index at once.
        let mut renamed = member.clone();
        renamed.name = "new".into();
        store
            .safe_rewrite_container_config(&member.id, "old", "new", &renamed)
            .expect("rename");
        assert_eq!(store.container_name(&member.id).expect("name"), "new");
        assert_eq!(store.lookup_container_id("new").expect("lookup"), member.id);
        assert!(
            matches!(
                store.lookup_container_id("old"),
                Err(StateError::NoSuchContainer { .. })
            ),
            "backend {name}"
        );
        assert!(
            store
                .pod_has_container(&pod.id, &member.id)
                .expect("membership"),
            "backend {name}"
        );
        let (read, _) = store.container(&member.id).expect("read");
        assert_eq!(read.name, "new", "backend {name}");

        // The old name is reusable now.
        let reuse = ContainerConfig::new("old");
        store
            .add_container(&reuse, &ContainerRuntimeState::default())
            .expect("reuse name");
    });
}

#[test]
fn rename_cannot_change_identity_or_structure() {
    for_each_backend(|name, store| {
        let ctr = ContainerConfig::new("web");
        store
            .add_container(&ctr, &ContainerRuntimeState::default())
            .expect("add");

        let mut bad = ctr.clone();
        bad.name = "web2".into();
        bad.lock_id = ctr.lock_id + 1;
        let err = store
            .safe_rewrite_container_config(&ctr.id, "web", "web2", &bad)
            .expect_err("lock change must fail");
        assert!(
            matches!(err, StateError::InvalidArgument { .. }),
            "backend {name}: {err}"
        );

        let mut bad = ctr.clone();
        bad.name = "web2".into();
        bad.dependencies.push("0".repeat(64));
        let err = store
            .safe_rewrite_container_config(&ctr.id, "web", "web2", &bad)
            .expect_err("dependency change must fail");
        assert!(
            matches!(err, StateError::InvalidArgument { .. }),
            "backend {name}: {err}"
        );
        assert_eq!(store.container_name(&ctr.id).expect("name"), "web");
    });
}

#[test]
fn pod_membership_gates_removal() {
    for_each_backend(|name, store| {
        let pod = PodConfig::new("app");
        store
            .add_pod(&pod, &PodRuntimeState::default())
            .expect("add pod");
        let mut member = ContainerConfig::new("db");
        member.pod_id = Some(pod.id.clone());
        store
            .add_container_to_pod(&pod.id, &member, &ContainerRuntimeState::default())
            .expect("add member");

        assert!(
            store
                .pod_has_container(&pod.id, &member.id)
                .expect("membership"),
            "backend {name}"
        );
        assert_eq!(
            store.pod_containers(&pod.id).expect("members"),
            vec![member.id.clone()],
            "backend {name}"
        );

        // The pod is not removable while occupied, and the member is not
        // removable through the pod-less path.
        let err = store.remove_pod(&pod.id).expect_err("occupied pod");
        assert!(
            matches!(err, StateError::PodNotEmpty { .. }),
            "backend {name}: {err}"
        );
        let err = store
            .remove_container(&member.id)
            .expect_err("pod member through plain remove");
        assert!(
            matches!(err, StateError::InvalidArgument { .. }),
            "backend {name}: {err}"
        );

        store
            .remove_container_from_pod(&pod.id, &member.id)
            .expect("remove member");
        assert!(
            store.pod_containers(&pod.id).expect("members").is_empty(),
            "backend {name}"
        );
        store.remove_pod(&pod.id).expect("remove pod");
        assert!(!store.has_pod(&pod.id).expect("has"), "backend {name}");
    });
}

#[test]
fn network_attachments_follow_connect_disconnect_protocol() {
    for_each_backend(|name, store| {
        let ctr = ContainerConfig::new("web");
        store
            .add_container(&ctr, &ContainerRuntimeState::default())
            .expect("add");

        let opts = PerNetworkOptions {
            interface_name: "eth0".into(),
            ..PerNetworkOptions::default()
        };
        store
            .network_connect(&ctr.id, "frontnet", &opts)
            .expect("connect");
        let err = store
            .network_connect(&ctr.id, "frontnet", &opts)
            .expect_err("double connect");
        assert!(
            matches!(err, StateError::NetworkConnected { .. }),
            "backend {name}: {err}"
        );

        let mut changed = opts.clone();
        changed.aliases.push("web".into());
        store
            .network_modify(&ctr.id, "frontnet", &changed)
            .expect("modify");
        let networks = store.networks(&ctr.id).expect("networks");
        assert_eq!(networks.get("frontnet"), Some(&changed), "backend {name}");

        store
            .network_disconnect(&ctr.id, "frontnet")
            .expect("disconnect");
        let err = store
            .network_disconnect(&ctr.id, "frontnet")
            .expect_err("double disconnect");
        assert!(
            matches!(err, StateError::NetworkNotConnected { .. }),
            "backend {name}: {err}"
        );
        let err = store
            .network_modify(&ctr.id, "frontnet", &changed)
            .expect_err("modify after disconnect");
        assert!(
            matches!(err, StateError::NetworkNotConnected { .. }),
            "backend {name}: {err}"
        );
    });
}

#[test]
fn exec_sessions_gate_container_removal() {
    for_each_backend(|name, store| {
        let ctr = ContainerConfig::new("web");
        store
            .add_container(&ctr, &ContainerRuntimeState::default())
            .expect("add");
        let session = ExecSession {
            id: "exec1".into(),
            container_id: ctr.id.clone(),
            pid: Some(100),
        };
        store.add_exec_session(&session).expect("add session");
        assert_eq!(
            store.exec_session_container("exec1").expect("owner"),
            ctr.id,
            "backend {name}"
        );

        let err = store
            .add_exec_session(&session)
            .expect_err("duplicate session");
        assert!(
            matches!(err, StateError::ExecSessionExists { .. }),
            "backend {name}: {err}"
        );

        let err = store
            .remove_container(&ctr.id)
            .expect_err("removal with live session");
        assert!(
            matches!(err, StateError::ExecSessionsActive { .. }),
            "backend {name}: {err}"
        );

        store
            .remove_container_exec_sessions(&ctr.id)
            .expect("clear sessions");
        assert!(
            matches!(
                store.exec_session_container("exec1"),
                Err(StateError::NoSuchExecSession { .. })
            ),
            "backend {name}"
        );
        store.remove_container(&ctr.id).expect("remove now");
    });
}

#[test]
fn dependencies_block_removal_and_list_dependents() {
    for_each_backend(|name, store| {
        let base = ContainerConfig::new("base");
        store
            .add_container(&base, &ContainerRuntimeState::default())
            .expect("add base");
        let mut dependent = ContainerConfig::new("dep");
        dependent.dependencies.push(base.id.clone());
        store
            .add_container(&dependent, &ContainerRuntimeState::default())
            .expect("add dependent");

        assert_eq!(
            store.container_in_use(&base.id).expect("in use"),
            vec![dependent.id.clone()],
            "backend {name}"
        );
        let err = store.remove_container(&base.id).expect_err("in use");
        assert!(
            matches!(err, StateError::ContainerInUse { ref dependents, .. }
                if *dependents == vec![dependent.id.clone()]),
            "backend {name}: {err}"
        );

        // A dependency on a missing container is rejected at add time.
        let mut orphan = ContainerConfig::new("orphan");
        orphan.dependencies.push("e".repeat(64));
        let err = store
            .add_container(&orphan, &ContainerRuntimeState::default())
            .expect_err("missing dependency");
        assert!(
            matches!(err, StateError::NoSuchContainer { .. }),
            "backend {name}: {err}"
        );

        store
            .remove_container(&dependent.id)
            .expect("remove dependent");
        store.remove_container(&base.id).expect("remove base");
    });
}

#[test]
fn exit_codes_round_trip_with_timestamps() {
    for_each_backend(|name, store| {
        let ctr = ContainerConfig::new("web");
        store
            .add_container(&ctr, &ContainerRuntimeState::default())
            .expect("add");
        let before = chrono::Utc::now();
        store
            .add_container_exit_code(&ctr.id, 137)
            .expect("record exit code");

        assert_eq!(
            store.container_exit_code(&ctr.id).expect("code"),
            137,
            "backend {name}"
        );
        let stamp = store
            .container_exit_code_timestamp(&ctr.id)
            .expect("timestamp");
        assert!(
            (stamp - before).num_seconds().abs() <= 5,
            "backend {name}: timestamp {stamp} too far from now"
        );

        // Pruning keeps fresh entries.
        store.prune_container_exit_codes().expect("prune");
        assert_eq!(
            store.container_exit_code(&ctr.id).expect("code"),
            137,
            "backend {name}"
        );
    });
}

#[test]
fn out_of_range_exit_codes_are_rejected_by_every_backend() {
    for_each_backend(|name, store| {
        let ctr = ContainerConfig::new("web");
        store
            .add_container(&ctr, &ContainerRuntimeState::default())
            .expect("add");

        // -1 marks "exited before the status was collected"; 255 is the top
        // of the wait-status byte. Both boundaries are storable.
        store
            .add_container_exit_code(&ctr.id, -1)
            .expect("boundary -1");
        store
            .add_container_exit_code(&ctr.id, 255)
            .expect("boundary 255");

        for code in [-2, 256, 70_000] {
            let err = store
                .add_container_exit_code(&ctr.id, code)
                .expect_err("out-of-range code must be rejected");
            assert!(
                matches!(err, StateError::InvalidArgument { .. }),
                "backend {name}: code {code}: {err}"
            );
        }

        // A rejected write leaves the previous record in place.
        assert_eq!(
            store.container_exit_code(&ctr.id).expect("code"),
            255,
            "backend {name}"
        );
    });
}

#[test]
fn db_config_is_recorded_and_validated() {
    for (name, factory) in backends() {
        let dir = TempDir::new().expect("tempdir");
        let config = store_config(&dir);
        let store = factory(&config);

        let recorded = store.db_config().expect("db config");
        assert_eq!(recorded.graph_driver, config.graph_driver, "backend {name}");
        store
            .validate_db_config(&config)
            .expect("matching config validates");

        let mut other = config.clone();
        other.os = "plan9".into();
        let err = store
            .validate_db_config(&other)
            .expect_err("os mismatch must fail");
        assert!(
            matches!(err, StateError::BadConfig { .. }),
            "backend {name}: {err}"
        );
    }
}
