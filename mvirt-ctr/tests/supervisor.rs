//! Integration tests for the lifecycle supervisor.
//!
//! Run with: cargo test -p mvirt-ctr --test supervisor

mod common;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use common::Harness;
use mvirt_ctr::error::ErrorKind;
use mvirt_ctr::instance::InstanceUpdate;
use mvirt_ctr::runtime::ContainerState;
use mvirt_ctr::store::InstanceStore;
use mvirt_ctr::supervisor::StateAction;

const PROJECT: &str = "default";

/// Test: Lifecycle - create, start, freeze, stop and delete one instance.
#[tokio::test]
async fn test_instance_lifecycle() {
    let h = Harness::new().await;
    let created = h.create("web", false).await;
    assert!(created.creation_date.is_some());
    assert!(h.supervisor.paths().container("web").join("config.json").exists());

    h.supervisor.start("web").await.unwrap();
    assert_eq!(h.runtime.state_of("web"), ContainerState::Running);
    assert!(h.store.get(PROJECT, "web").await.unwrap().power_state);

    let err = h.supervisor.delete("web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    h.supervisor
        .change_state("web", StateAction::Freeze, 30, false)
        .await
        .unwrap();
    assert_eq!(h.runtime.state_of("web"), ContainerState::Frozen);
    h.supervisor
        .change_state("web", StateAction::Unfreeze, 30, false)
        .await
        .unwrap();

    // A timeout of -1 skips the graceful request.
    h.supervisor
        .change_state("web", StateAction::Stop, -1, false)
        .await
        .unwrap();
    assert!(!h.runtime.calls().contains(&"shutdown web".to_string()));
    assert!(!h.store.get(PROJECT, "web").await.unwrap().power_state);

    h.supervisor.delete("web").await.unwrap();
    assert!(h.store.get(PROJECT, "web").await.unwrap_err().is_not_found());
    assert!(!h.supervisor.paths().container("web").exists());

    let err = h.supervisor.delete("web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Test: Start failure - state and flag stay unchanged.
#[tokio::test]
async fn test_start_failure_keeps_state() {
    let h = Harness::new().await;
    h.create("web", false).await;
    h.runtime.fail_start("web");

    let err = h.supervisor.start("web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StartFailure);
    assert_eq!(h.runtime.state_of("web"), ContainerState::Stopped);
    assert!(!h.store.get(PROJECT, "web").await.unwrap().power_state);
}

/// Test: Power flag write fails after the container is up - start still
/// succeeds and the instance keeps running.
#[tokio::test]
async fn test_start_survives_power_state_failure() {
    let h = Harness::new().await;
    h.create("web", false).await;
    h.store.fail_next_power_state();

    h.supervisor.start("web").await.unwrap();
    assert_eq!(h.runtime.state_of("web"), ContainerState::Running);
    assert!(!h.store.get(PROJECT, "web").await.unwrap().power_state);
}

/// Test: Restart - a failing start leaves the instance stopped.
#[tokio::test]
async fn test_restart_failure_leaves_stopped() {
    let h = Harness::new().await;
    h.create_running("web").await;

    h.supervisor
        .restart("web", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(h.runtime.state_of("web"), ContainerState::Running);

    h.runtime.fail_start("web");
    assert!(h.supervisor.restart("web", Duration::ZERO).await.is_err());
    assert_eq!(h.runtime.state_of("web"), ContainerState::Stopped);
    assert!(!h.store.get(PROJECT, "web").await.unwrap().power_state);
}

/// Test: Mass shutdown - five running, one ignoring the graceful request;
/// all end up stopped and the call returns only after all are done.
#[tokio::test]
async fn test_shutdown_all_bounded_and_joined() {
    let h = Harness::with_config(|c| {
        c.shutdown_timeout = Duration::from_millis(300);
        c.shutdown_parallelism = 2;
    })
    .await;
    let names = ["a", "b", "c", "d", "e"];
    for name in names {
        h.create_running(name).await;
    }
    h.create("idle", false).await;
    h.runtime.ignore_term("c");

    let started = Instant::now();
    let report = h.supervisor.shutdown_all().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    assert_eq!(report.len(), 5);
    assert!(report.iter().all(|(_, result)| result.is_ok()));
    for name in names {
        assert_eq!(h.runtime.state_of(name), ContainerState::Stopped, "{name}");
        assert!(h.store.get(PROJECT, name).await.unwrap().power_state, "{name}");
    }
    // The slow one was forced.
    assert!(h.runtime.calls().contains(&"stop c".to_string()));
    assert!(!h.runtime.calls().contains(&"shutdown idle".to_string()));
}

/// Test: Restart-all - previously running instances come back, failures
/// are reported, and the flag reads false for everyone afterwards.
#[tokio::test]
async fn test_restart_all_clears_flag() {
    let h = Harness::new().await;
    for name in ["a", "b", "c"] {
        h.create_running(name).await;
    }
    h.supervisor.shutdown_all().await.unwrap();
    h.runtime.fail_start("b");

    let report = h.supervisor.restart_all().await.unwrap();
    assert_eq!(report.len(), 3);
    let failed: Vec<_> = report
        .iter()
        .filter(|(_, r)| r.is_err())
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(failed, vec!["b"]);

    assert_eq!(h.runtime.state_of("a"), ContainerState::Running);
    assert_eq!(h.runtime.state_of("c"), ContainerState::Running);
    for name in ["a", "b", "c"] {
        assert!(!h.store.get(PROJECT, name).await.unwrap().power_state, "{name}");
    }
    assert!(h.store.list_power_on().await.unwrap().is_empty());
}

/// Test: Snapshot cleanup - storage goes before rows, and a failure in
/// between can be retried.
#[tokio::test]
async fn test_snapshot_cleanup_order_and_retry() {
    let h = Harness::new().await;
    h.create("web", false).await;
    h.supervisor.snapshot("web", "snap0", false).await.unwrap();
    h.supervisor.snapshot("web", "snap1", false).await.unwrap();
    assert_eq!(h.store.snapshots(PROJECT, "web").await.unwrap().len(), 2);

    let paths = h.supervisor.paths().clone();
    h.clear_journal();
    h.store.fail_next_deletes(1);
    assert!(h.supervisor.delete_snapshots("web").await.is_err());

    // Storage is gone, rows remain.
    assert!(!paths.snapshot("web", "snap0").exists());
    assert!(!paths.snapshot("web", "snap1").exists());
    assert_eq!(h.store.snapshots(PROJECT, "web").await.unwrap().len(), 2);
    let journal = h.journal();
    assert!(journal.iter().all(|e| e.starts_with("remove ")), "{journal:?}");

    h.clear_journal();
    h.supervisor.delete_snapshots("web").await.unwrap();
    assert!(h.store.snapshots(PROJECT, "web").await.unwrap().is_empty());

    let journal = h.journal();
    let last_remove = journal.iter().rposition(|e| e.starts_with("remove ")).unwrap();
    let first_delete = journal.iter().position(|e| e.starts_with("delete-row ")).unwrap();
    assert!(last_remove < first_delete, "{journal:?}");
    assert!(h.store.get(PROJECT, "web").await.is_ok());
}

/// Test: Snapshot - copies the instance and records `parent/snap`.
#[tokio::test]
async fn test_snapshot_and_delete_snapshot() {
    let h = Harness::new().await;
    h.create("web", false).await;

    let snap = h.supervisor.snapshot("web", "before", false).await.unwrap();
    assert_eq!(snap.name, "web/before");
    assert!(snap.snapshot);
    let copied = h.supervisor.paths().snapshot("web", "before");
    assert_eq!(
        std::fs::read_to_string(copied.join("rootfs/etc/hostname")).unwrap(),
        "web\n"
    );

    let err = h.supervisor.snapshot("web", "before", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = h.supervisor.snapshot("web", "live", true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    h.supervisor.delete_snapshot("web", "before").await.unwrap();
    assert!(!copied.exists());
    assert!(h.store.snapshots(PROJECT, "web").await.unwrap().is_empty());
}

/// Test: Stateful snapshot - checkpoint lands inside the snapshot.
#[tokio::test]
async fn test_stateful_snapshot() {
    let h = Harness::new().await;
    h.create_running("web").await;

    let snap = h.supervisor.snapshot("web", "hot", true).await.unwrap();
    assert!(snap.stateful);
    let state = h.supervisor.paths().snapshot_state("web", "hot");
    assert!(state.join("pages.img").exists());
    assert_eq!(h.runtime.state_of("web"), ContainerState::Running);
}

/// Test: Rename - storage and snapshot rows follow the instance.
#[tokio::test]
async fn test_rename() {
    let h = Harness::new().await;
    h.create("web", false).await;
    h.supervisor.snapshot("web", "snap0", false).await.unwrap();

    h.supervisor.rename("web", "www").await.unwrap();
    let paths = h.supervisor.paths();
    assert!(paths.rootfs("www").join("etc/hostname").exists());
    assert!(paths.snapshot("www", "snap0").exists());
    assert!(!paths.container("web").exists());
    assert!(h.store.get(PROJECT, "www/snap0").await.is_ok());
    assert!(h.store.get(PROJECT, "web").await.unwrap_err().is_not_found());

    h.create_running("api").await;
    let err = h.supervisor.rename("api", "api2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

/// Test: Rename rollback - a failing store rename moves the storage back.
#[tokio::test]
async fn test_rename_rolls_back_storage() {
    let h = Harness::new().await;
    h.create("web", false).await;
    h.supervisor.snapshot("web", "snap0", false).await.unwrap();
    let paths = h.supervisor.paths();
    std::fs::create_dir_all(paths.logs("web")).unwrap();
    std::fs::write(paths.logs("web").join("runtime.json"), "{}").unwrap();

    h.store.fail_next_rename();
    assert!(h.supervisor.rename("web", "www").await.is_err());

    assert!(paths.rootfs("web").join("etc/hostname").exists());
    assert!(paths.snapshot("web", "snap0").exists());
    assert!(paths.logs("web").join("runtime.json").exists());
    assert!(!paths.container("www").exists());
    assert!(!paths.snapshots_dir("www").exists());
    assert!(!paths.logs("www").exists());
    assert!(h.store.get(PROJECT, "web").await.is_ok());
    assert!(h.store.get(PROJECT, "www").await.unwrap_err().is_not_found());

    // Nothing stuck: the next attempt goes through.
    h.supervisor.rename("web", "www").await.unwrap();
    assert!(paths.rootfs("www").join("etc/hostname").exists());
}

/// Test: Update - config, devices and profiles are replaced and a stopped
/// instance's bundle picks them up.
#[tokio::test]
async fn test_update_instance() {
    let h = Harness::new().await;
    h.create("web", false).await;

    let update = InstanceUpdate {
        config: [("environment.MODE".to_string(), "prod".to_string())].into(),
        devices: BTreeMap::from([(
            "eth0".to_string(),
            BTreeMap::from([("type".to_string(), "nic".to_string())]),
        )]),
        profiles: vec!["default".into(), "net".into()],
    };
    let updated = h.supervisor.update("web", update.clone()).await.unwrap();
    assert_eq!(InstanceUpdate::from(&updated), update);

    let stored = h.store.get(PROJECT, "web").await.unwrap();
    assert_eq!(InstanceUpdate::from(&stored), update);
    assert!(!stored.config.contains_key("limits.cpu"));
    let spec = std::fs::read_to_string(h.supervisor.paths().container("web").join("config.json"))
        .unwrap();
    assert!(spec.contains("MODE=prod"), "{spec}");

    let err = h.supervisor.update("ghost", update).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Test: Restore - storage and config come back from the snapshot; the
/// snapshot itself is untouched.
#[tokio::test]
async fn test_restore_from_snapshot() {
    let h = Harness::new().await;
    h.create("web", false).await;
    h.supervisor.snapshot("web", "snap0", false).await.unwrap();
    let paths = h.supervisor.paths();

    h.supervisor
        .update(
            "web",
            InstanceUpdate {
                config: [("environment.MODE".to_string(), "prod".to_string())].into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    std::fs::write(paths.rootfs("web").join("etc/hostname"), "changed\n").unwrap();
    std::fs::write(paths.rootfs("web").join("etc/extra"), "new file").unwrap();

    let restored = h.supervisor.restore("web", "snap0").await.unwrap();
    assert_eq!(restored.config["limits.cpu"], "2");
    assert!(!restored.config.contains_key("environment.MODE"));
    assert_eq!(restored.profiles, vec!["default"]);

    let stored = h.store.get(PROJECT, "web").await.unwrap();
    assert_eq!(InstanceUpdate::from(&stored), InstanceUpdate::from(&restored));
    assert_eq!(
        std::fs::read_to_string(paths.rootfs("web").join("etc/hostname")).unwrap(),
        "web\n"
    );
    assert!(!paths.rootfs("web").join("etc/extra").exists());
    let spec = std::fs::read_to_string(paths.container("web").join("config.json")).unwrap();
    assert!(!spec.contains("MODE=prod"), "{spec}");
    assert!(paths.snapshot("web", "snap0").join("rootfs/etc/hostname").exists());
    assert!(!paths.restore("web").exists());

    let err = h.supervisor.restore("web", "nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    h.supervisor.start("web").await.unwrap();
    let err = h.supervisor.restore("web", "snap0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

/// Test: Ephemeral - a final stop deletes the instance, a reboot does not.
#[tokio::test]
async fn test_ephemeral_deleted_after_final_stop() {
    let h = Harness::new().await;
    h.create("tmp", true).await;
    h.supervisor.start("tmp").await.unwrap();
    assert!(h.supervisor.watchers().is_watching("tmp").await);

    // Reboot: stopped and back within the grace window.
    h.runtime.set_state("tmp", ContainerState::Stopped);
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.runtime.set_state("tmp", ContainerState::Running);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(h.store.get(PROJECT, "tmp").await.is_ok());

    h.runtime.set_state("tmp", ContainerState::Stopped);
    wait_until_gone(&h, "tmp").await;
    assert!(!h.supervisor.paths().container("tmp").exists());
}

/// Test: Ephemeral - an instance deleted by someone else is not deleted
/// a second time.
#[tokio::test]
async fn test_ephemeral_no_double_delete() {
    let h = Harness::new().await;
    h.create("tmp", true).await;
    h.supervisor.start("tmp").await.unwrap();

    let id = h.store.get(PROJECT, "tmp").await.unwrap().id;
    assert!(h.store.delete_by_id(id).await.unwrap());
    h.clear_journal();

    h.runtime.set_state("tmp", ContainerState::Stopped);
    for _ in 0..40 {
        if !h.supervisor.watchers().is_watching("tmp").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!h.supervisor.watchers().is_watching("tmp").await);
    assert!(h.journal().is_empty(), "{:?}", h.journal());
}

async fn wait_until_gone(h: &Harness, name: &str) {
    for _ in 0..40 {
        if h.store.get(PROJECT, name).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("{name} was not deleted");
}
