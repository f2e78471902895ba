//! Ephemeral instance watchers.
//!
//! An ephemeral instance is deleted once it stops for good. A stop that is
//! followed by a start within a second is a reboot and keeps the instance.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::runtime::{ContainerRuntime, ContainerState};

/// How long a stopped instance has to come back before it counts as gone.
pub const REBOOT_GRACE: Duration = Duration::from_secs(1);

/// Wait until `name` stops, allowing a single reboot window.
pub async fn wait_final_stop(runtime: &dyn ContainerRuntime, name: &str) -> Result<()> {
    runtime.wait(name, ContainerState::Stopped, None).await?;
    if runtime
        .wait(name, ContainerState::Running, Some(REBOOT_GRACE))
        .await
        .is_ok()
    {
        debug!(instance = %name, "Ephemeral instance rebooted");
    }
    runtime.wait(name, ContainerState::Stopped, None).await
}

/// Watcher tasks keyed by instance name, at most one per instance.
#[derive(Clone, Default)]
pub struct EphemeralWatchers {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl EphemeralWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `watch` for `name` unless a live watcher already exists.
    pub async fn spawn<F>(&self, name: &str, watch: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, task| !task.is_finished());
        if tasks.contains_key(name) {
            return false;
        }
        tasks.insert(name.to_string(), tokio::spawn(watch));
        true
    }

    pub async fn is_watching(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(name)
            .is_some_and(|task| !task.is_finished())
    }

    pub async fn cancel(&self, name: &str) {
        if let Some(task) = self.tasks.lock().await.remove(name) {
            task.abort();
        }
    }

    /// Cancel every watcher. Returns how many were still running.
    pub async fn abort_all(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let mut running = 0;
        for (_, task) in tasks.drain() {
            if !task.is_finished() {
                running += 1;
            }
            task.abort();
        }
        running
    }
}
