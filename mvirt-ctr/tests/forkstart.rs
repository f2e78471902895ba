//! Integration tests for the forkstart sub-invocation.
//!
//! Run with: cargo test -p mvirt-ctr --test forkstart

mod common;

use common::Harness;
use mvirt_ctr::forkstart::ForkStart;
use mvirt_ctr::runtime::ContainerState;

fn forkstart(h: &Harness, name: &str) -> ForkStart {
    ForkStart {
        name: name.to_string(),
        runtime_path: "/usr/bin/youki".into(),
        runtime_root: h.config.data_dir.join("run"),
        config_path: h.supervisor.paths().container(name).join("config.json"),
        log_dir: h.config.data_dir.join("logs"),
    }
}

/// Test: Success - the container runs and the config moves to the log dir.
#[tokio::test]
async fn test_forkstart_moves_config() {
    let h = Harness::new().await;
    h.create("web", false).await;
    let fork = forkstart(&h, "web");

    fork.run_with(h.runtime.as_ref()).await.unwrap();

    assert_eq!(h.runtime.state_of("web"), ContainerState::Running);
    assert!(!fork.config_path.exists());
    assert!(fork.saved_config().exists());
    assert!(fork.saved_config().ends_with("logs/web/runtime.json"));
}

/// Test: Start failure - the config is removed.
#[tokio::test]
async fn test_forkstart_failure_removes_config() {
    let h = Harness::new().await;
    h.create("web", false).await;
    h.runtime.fail_start("web");
    let fork = forkstart(&h, "web");

    assert!(fork.run_with(h.runtime.as_ref()).await.is_err());
    assert!(!fork.config_path.exists());
    assert!(!fork.saved_config().exists());
}

/// Test: Invalid config - rejected before the runtime is called.
#[tokio::test]
async fn test_forkstart_rejects_invalid_config() {
    let h = Harness::new().await;
    h.create("web", false).await;
    let fork = forkstart(&h, "web");
    std::fs::write(&fork.config_path, "{\"ociVersion\":\"1.0.2\"}").unwrap();

    assert!(fork.run_with(h.runtime.as_ref()).await.is_err());
    assert!(!fork.config_path.exists());
    assert!(!h.runtime.calls().iter().any(|c| c.starts_with("start")));
}
