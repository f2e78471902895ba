//! Instance lifecycle supervisor.
//!
//! Owns the store, runtime and storage handles and drives instances through
//! create, start, stop, snapshot, delete and the daemon-wide restart-all and
//! mass shutdown. Calls for one instance are expected to be serialized by
//! the caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bundle;
use crate::config::{Config, Paths};
use crate::error::{Error, Result};
use crate::exec::{ExecRequest, ExecSession};
use crate::instance::{
    Instance, InstanceArgs, InstanceUpdate, snapshot_name, split_snapshot_name, validate_name,
    validate_snapshot_name,
};
use crate::migration::checkpoint::PreDumpPolicy;
use crate::migration::{MigrationEnv, MigrationSink, MigrationSource};
use crate::runtime::{CheckpointOptions, ContainerRuntime, ContainerState};
use crate::storage::{StorageBackend, remove_volume};
use crate::store::InstanceStore;
use crate::watcher::{EphemeralWatchers, wait_final_stop};

/// Per-instance results of a batch operation.
pub type BatchReport = Vec<(String, Result<()>)>;

/// Requested state change, as sent by API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Start,
    Stop,
    Restart,
    Freeze,
    Unfreeze,
}

impl std::str::FromStr for StateAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(StateAction::Start),
            "stop" => Ok(StateAction::Stop),
            "restart" => Ok(StateAction::Restart),
            "freeze" => Ok(StateAction::Freeze),
            "unfreeze" => Ok(StateAction::Unfreeze),
            other => Err(Error::InvalidArgument(format!("unknown action {other:?}"))),
        }
    }
}

struct Inner {
    config: Config,
    paths: Paths,
    store: Arc<dyn InstanceStore>,
    runtime: Arc<dyn ContainerRuntime>,
    storage: Arc<dyn StorageBackend>,
    watchers: EphemeralWatchers,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

fn is_active(state: ContainerState) -> bool {
    matches!(state, ContainerState::Running | ContainerState::Frozen)
}

impl Supervisor {
    pub fn new(
        config: Config,
        store: Arc<dyn InstanceStore>,
        runtime: Arc<dyn ContainerRuntime>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                paths: config.paths(),
                config,
                store,
                runtime,
                storage,
                watchers: EphemeralWatchers::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn paths(&self) -> &Paths {
        &self.inner.paths
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.inner.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    pub fn watchers(&self) -> &EphemeralWatchers {
        &self.inner.watchers
    }

    fn project(&self) -> &str {
        &self.inner.config.project
    }

    pub async fn instance(&self, name: &str) -> Result<Instance> {
        self.inner.store.get(self.project(), name).await
    }

    pub async fn state(&self, name: &str) -> Result<ContainerState> {
        self.inner.runtime.state(name).await
    }

    /// Insert the row, create the instance volume and write its bundle.
    pub async fn create(&self, mut args: InstanceArgs) -> Result<Instance> {
        validate_name(&args.name)?;
        if args.snapshot {
            return Err(Error::InvalidArgument(
                "snapshots are created with snapshot()".into(),
            ));
        }
        if args.project.is_empty() {
            args.project = self.project().to_string();
        }
        args.creation_date.get_or_insert_with(Utc::now);

        let instance = self.inner.store.create(&args).await?;
        let bundle = self.inner.paths.container(&instance.name);

        let created = async {
            self.inner.storage.create(&bundle).await?;
            bundle::write_bundle(&instance, &bundle).await
        }
        .await;

        if let Err(e) = created {
            if let Err(err) = remove_volume(self.inner.storage.as_ref(), &bundle).await {
                warn!(instance = %instance.name, error = %err, "Failed to remove partial volume");
            }
            if let Err(err) = self.inner.store.delete_by_id(instance.id).await {
                warn!(instance = %instance.name, error = %err, "Failed to remove instance row");
            }
            return Err(e);
        }

        info!(instance = %instance.name, ephemeral = instance.ephemeral, "Instance created");
        Ok(instance)
    }

    /// Start without touching the "was running" flag.
    async fn start_instance(&self, instance: &Instance) -> Result<()> {
        let bundle = self.inner.paths.container(&instance.name);
        bundle::write_bundle(instance, &bundle).await?;
        self.inner.runtime.start(&instance.name, &bundle).await?;

        if let Err(e) = self
            .inner
            .store
            .touch_last_used(instance.id, Utc::now())
            .await
        {
            warn!(instance = %instance.name, error = %e, "Failed to update last-used date");
        }
        if instance.ephemeral {
            self.watch_ephemeral(&instance.name).await;
        }
        info!(instance = %instance.name, "Instance started");
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let instance = self.instance(name).await?;
        self.start_instance(&instance).await?;
        self.record_running(&instance).await;
        Ok(())
    }

    /// Set the "was running" flag of an instance that is up. The instance
    /// stays up if the write fails.
    async fn record_running(&self, instance: &Instance) {
        if let Err(e) = self.inner.store.set_power_state(instance.id, true).await {
            warn!(instance = %instance.name, error = %e, "Failed to record power state");
        }
    }

    /// Forced stop.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let instance = self.instance(name).await?;
        self.inner.runtime.stop(name).await?;
        self.inner.store.set_power_state(instance.id, false).await?;
        info!(instance = %name, "Instance stopped");
        Ok(())
    }

    /// Graceful request, then a forced stop once `timeout` has passed.
    async fn stop_gracefully(&self, name: &str, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return self.inner.runtime.stop(name).await;
        }
        match self.inner.runtime.shutdown(name, timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(instance = %name, error = %e, "Graceful shutdown failed, stopping");
                self.inner.runtime.stop(name).await
            }
        }
    }

    pub async fn shutdown(&self, name: &str, timeout: Duration) -> Result<()> {
        let instance = self.instance(name).await?;
        self.stop_gracefully(name, timeout).await?;
        self.inner.store.set_power_state(instance.id, false).await?;
        info!(instance = %name, "Instance shut down");
        Ok(())
    }

    /// Stop, then start. A failed start leaves the instance stopped.
    pub async fn restart(&self, name: &str, timeout: Duration) -> Result<()> {
        let instance = self.instance(name).await?;
        // Keep the watcher from treating the restart as a final stop.
        self.inner.watchers.cancel(name).await;
        if is_active(self.inner.runtime.state(name).await?) {
            self.stop_gracefully(name, timeout).await?;
        }
        if let Err(e) = self.start_instance(&instance).await {
            self.inner.store.set_power_state(instance.id, false).await?;
            return Err(e);
        }
        self.record_running(&instance).await;
        Ok(())
    }

    pub async fn freeze(&self, name: &str) -> Result<()> {
        self.instance(name).await?;
        self.inner.runtime.freeze(name).await?;
        info!(instance = %name, "Instance frozen");
        Ok(())
    }

    pub async fn unfreeze(&self, name: &str) -> Result<()> {
        self.instance(name).await?;
        self.inner.runtime.unfreeze(name).await?;
        info!(instance = %name, "Instance unfrozen");
        Ok(())
    }

    /// Apply a state request. A `timeout` of zero or less, or `force`,
    /// means an immediate forced stop.
    pub async fn change_state(
        &self,
        name: &str,
        action: StateAction,
        timeout: i64,
        force: bool,
    ) -> Result<()> {
        let grace = if force || timeout <= 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(timeout as u64)
        };
        debug!(instance = %name, action = ?action, timeout, force, "State change");

        match action {
            StateAction::Start => self.start(name).await,
            StateAction::Stop if grace.is_zero() => self.stop(name).await,
            StateAction::Stop => self.shutdown(name, grace).await,
            StateAction::Restart => self.restart(name, grace).await,
            StateAction::Freeze => self.freeze(name).await,
            StateAction::Unfreeze => self.unfreeze(name).await,
        }
    }

    /// Shut down every running instance, at most `shutdown_parallelism` at
    /// a time. Each one is flagged as "was running" first so the next
    /// restart-all brings it back. Returns after all have finished.
    pub async fn shutdown_all(&self) -> Result<BatchReport> {
        let instances = self.inner.store.list_regular(self.project()).await?;
        let timeout = self.inner.config.shutdown_timeout;
        let limit = Arc::new(Semaphore::new(self.inner.config.shutdown_parallelism.max(1)));
        let mut tasks = JoinSet::new();

        for instance in instances {
            let state = match self.inner.runtime.state(&instance.name).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(instance = %instance.name, error = %e, "Failed to query state");
                    continue;
                }
            };
            if !is_active(state) {
                continue;
            }

            if let Err(e) = self.inner.store.set_power_state(instance.id, true).await {
                warn!(instance = %instance.name, error = %e, "Failed to record power state");
            }

            let this = self.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let result = match limit.acquire_owned().await {
                    Ok(_permit) => this.stop_gracefully(&instance.name, timeout).await,
                    Err(_) => Err(Error::Runtime("shutdown limiter closed".into())),
                };
                (instance.name, result)
            });
        }

        info!(count = tasks.len(), "Shutting down instances");
        let mut report = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, result)) => {
                    if let Err(e) = &result {
                        error!(instance = %name, error = %e, "Failed to shut down instance");
                    }
                    report.push((name, result));
                }
                Err(e) => error!(error = %e, "Shutdown task panicked"),
            }
        }
        Ok(report)
    }

    /// Start every instance flagged as "was running".
    ///
    /// The flag is cleared for all instances before anything starts and is
    /// not set again here, so it reads false afterwards whatever the outcome.
    pub async fn restart_all(&self) -> Result<BatchReport> {
        let instances = self.inner.store.list_power_on().await?;
        let cleared = self.inner.store.clear_power_state().await?;
        info!(count = instances.len(), cleared, "Restarting previously running instances");

        let mut report = Vec::with_capacity(instances.len());
        for instance in instances {
            if instance.snapshot {
                continue;
            }
            let result = self.start_instance(&instance).await;
            if let Err(e) = &result {
                error!(instance = %instance.name, error = %e, "Failed to restart instance");
            }
            report.push((instance.name, result));
        }
        Ok(report)
    }

    /// Register the delete-on-final-stop watcher for `name`.
    pub async fn watch_ephemeral(&self, name: &str) {
        let this = self.clone();
        let watched = name.to_string();
        let spawned = self
            .inner
            .watchers
            .spawn(name, async move {
                if let Err(e) = wait_final_stop(this.inner.runtime.as_ref(), &watched).await {
                    warn!(instance = %watched, error = %e, "Ephemeral watcher failed");
                    return;
                }
                match this.delete_if_present(&watched).await {
                    Ok(true) => info!(instance = %watched, "Ephemeral instance deleted"),
                    Ok(false) => debug!(instance = %watched, "Ephemeral instance already gone"),
                    Err(e) => error!(instance = %watched, error = %e, "Failed to delete ephemeral instance"),
                }
            })
            .await;
        if spawned {
            debug!(instance = %name, "Watching ephemeral instance");
        }
    }

    /// Watch every ephemeral instance that is currently running.
    pub async fn watch_running_ephemeral(&self) -> Result<usize> {
        let mut watched = 0;
        for instance in self.inner.store.list_regular(self.project()).await? {
            if !instance.ephemeral {
                continue;
            }
            if is_active(self.inner.runtime.state(&instance.name).await?) {
                self.watch_ephemeral(&instance.name).await;
                watched += 1;
            }
        }
        Ok(watched)
    }

    /// Delete by name; a missing row is reported as `false`.
    async fn delete_if_present(&self, name: &str) -> Result<bool> {
        let instance = match self.instance(name).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        match self.delete_instance(&instance).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove every snapshot of `name`: all storage first, then the rows,
    /// so a failure in between can simply be retried.
    pub async fn delete_snapshots(&self, name: &str) -> Result<()> {
        let snapshots = self.inner.store.snapshots(self.project(), name).await?;
        let storage = self.inner.storage.as_ref();

        for snap in &snapshots {
            remove_volume(storage, &self.inner.paths.storage(&snap.name)).await?;
        }
        storage
            .remove_all(&self.inner.paths.snapshots_dir(name))
            .await?;

        for snap in &snapshots {
            self.inner.store.delete_by_id(snap.id).await?;
        }
        if !snapshots.is_empty() {
            info!(instance = %name, count = snapshots.len(), "Snapshots deleted");
        }
        Ok(())
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        let name = &instance.name;
        self.delete_snapshots(name).await?;

        let storage = self.inner.storage.as_ref();
        remove_volume(storage, &self.inner.paths.container(name)).await?;
        storage.remove_all(&self.inner.paths.logs(name)).await?;

        if !self.inner.store.delete_by_id(instance.id).await? {
            return Err(Error::NotFound(format!("instance {name}")));
        }
        info!(instance = %name, "Instance deleted");
        Ok(())
    }

    /// Delete a stopped instance with its snapshots and storage.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let instance = self.instance(name).await?;
        if is_active(self.inner.runtime.state(name).await?) {
            return Err(Error::Conflict(format!("instance {name} is running")));
        }
        self.inner.watchers.cancel(name).await;
        self.delete_instance(&instance).await
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        validate_name(new)?;
        self.instance(old).await?;
        if is_active(self.inner.runtime.state(old).await?) {
            return Err(Error::Conflict(format!("instance {old} is running")));
        }
        if self.inner.store.get_id(self.project(), new).await?.is_some() {
            return Err(Error::Conflict(format!("instance {new} already exists")));
        }

        let paths = &self.inner.paths;
        let storage = self.inner.storage.as_ref();
        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
        let renamed = async {
            let moves = [
                (paths.container(old), paths.container(new), true),
                (paths.snapshots_dir(old), paths.snapshots_dir(new), false),
                (paths.logs(old), paths.logs(new), false),
            ];
            for (src, dst, required) in moves {
                if required || tokio::fs::try_exists(&src).await? {
                    storage.rename(&src, &dst).await?;
                    moved.push((src, dst));
                }
            }
            self.inner.store.rename(self.project(), old, new).await
        }
        .await;

        if let Err(e) = renamed {
            for (src, dst) in moved.iter().rev() {
                if let Err(err) = storage.rename(dst, src).await {
                    warn!(path = %dst.display(), error = %err, "Failed to move storage back");
                }
            }
            return Err(e);
        }
        info!(old = %old, new = %new, "Instance renamed");
        Ok(())
    }

    /// Replace config, devices and profiles of `name`. A stopped instance
    /// gets its bundle rewritten now, a running one on its next start.
    pub async fn update(&self, name: &str, update: InstanceUpdate) -> Result<Instance> {
        validate_name(name)?;
        let instance = self.instance(name).await?;
        self.inner.store.update(instance.id, &update).await?;

        let updated = Instance {
            config: update.config,
            devices: update.devices,
            profiles: update.profiles,
            ..instance
        };
        if !is_active(self.inner.runtime.state(name).await?) {
            bundle::write_bundle(&updated, &self.inner.paths.container(name)).await?;
        }
        info!(instance = %name, "Instance updated");
        Ok(updated)
    }

    /// Roll a stopped instance back to `snap`: its storage is replaced by a
    /// copy of the snapshot and config, devices and profiles are reset to
    /// the snapshot's.
    pub async fn restore(&self, name: &str, snap: &str) -> Result<Instance> {
        validate_snapshot_name(snap)?;
        let instance = self.instance(name).await?;
        let snapshot = self.instance(&snapshot_name(name, snap)).await?;
        if is_active(self.inner.runtime.state(name).await?) {
            return Err(Error::Conflict(format!("instance {name} is running")));
        }

        let paths = &self.inner.paths;
        let storage = self.inner.storage.as_ref();
        let bundle = paths.container(name);
        let staging = paths.restore(name);
        let (incoming, outgoing) = (staging.join("new"), staging.join("old"));
        storage.remove_all(&staging).await?;

        let staged = async {
            storage.snapshot(&paths.snapshot(name, snap), &incoming).await?;
            // Checkpoint images of a stateful snapshot stay with the snapshot.
            storage.remove_all(&incoming.join("state")).await
        }
        .await;
        if let Err(e) = staged {
            if let Err(err) = remove_volume(storage, &incoming).await {
                warn!(path = %incoming.display(), error = %err, "Failed to remove staged copy");
            }
            return Err(e);
        }

        storage.rename(&bundle, &outgoing).await?;
        let swapped = async {
            storage.rename(&incoming, &bundle).await?;
            self.inner
                .store
                .update(instance.id, &InstanceUpdate::from(&snapshot))
                .await
        }
        .await;
        if let Err(e) = swapped {
            if tokio::fs::try_exists(&bundle).await.unwrap_or(false)
                && let Err(err) = storage.rename(&bundle, &incoming).await
            {
                warn!(path = %bundle.display(), error = %err, "Failed to move restored copy aside");
            }
            if let Err(err) = storage.rename(&outgoing, &bundle).await {
                warn!(path = %outgoing.display(), error = %err, "Failed to put storage back");
            }
            if let Err(err) = remove_volume(storage, &incoming).await {
                warn!(path = %incoming.display(), error = %err, "Failed to remove staged copy");
            }
            return Err(e);
        }

        if let Err(e) = remove_volume(storage, &outgoing).await {
            warn!(path = %outgoing.display(), error = %e, "Failed to remove replaced storage");
        }
        if let Err(e) = storage.remove_all(&staging).await {
            warn!(path = %staging.display(), error = %e, "Failed to remove restore staging");
        }

        let restored = Instance {
            config: snapshot.config,
            devices: snapshot.devices,
            profiles: snapshot.profiles,
            ..instance
        };
        bundle::write_bundle(&restored, &bundle).await?;
        info!(instance = %name, snapshot = %snap, "Instance restored");
        Ok(restored)
    }

    /// Snapshot `name` as `name/snap`. A stateful snapshot also checkpoints
    /// the running instance into the snapshot.
    pub async fn snapshot(&self, name: &str, snap: &str, stateful: bool) -> Result<Instance> {
        validate_snapshot_name(snap)?;
        let instance = self.instance(name).await?;
        let full = snapshot_name(name, snap);
        if self.inner.store.get_id(self.project(), &full).await?.is_some() {
            return Err(Error::Conflict(format!("snapshot {full} already exists")));
        }
        if stateful && !is_active(self.inner.runtime.state(name).await?) {
            return Err(Error::InvalidArgument(format!(
                "stateful snapshot of {name} needs a running instance"
            )));
        }

        let paths = &self.inner.paths;
        let dst = paths.snapshot(name, snap);
        self.inner
            .storage
            .snapshot(&paths.container(name), &dst)
            .await?;

        let result = async {
            if stateful {
                let opts = CheckpointOptions {
                    leave_running: true,
                    ..Default::default()
                };
                self.inner
                    .runtime
                    .checkpoint(name, &paths.snapshot_state(name, snap), opts)
                    .await?;
            }

            let args = InstanceArgs {
                project: instance.project.clone(),
                name: full.clone(),
                instance_type: instance.instance_type,
                architecture: instance.architecture,
                config: instance.config.clone(),
                devices: instance.devices.clone(),
                profiles: instance.profiles.clone(),
                ephemeral: instance.ephemeral,
                stateful,
                snapshot: true,
                creation_date: Some(Utc::now()),
                last_used_date: None,
            };
            self.inner.store.create(&args).await
        }
        .await;

        match result {
            Ok(row) => {
                info!(instance = %name, snapshot = %snap, stateful, "Snapshot created");
                Ok(row)
            }
            Err(e) => {
                if let Err(err) = remove_volume(self.inner.storage.as_ref(), &dst).await {
                    warn!(path = %dst.display(), error = %err, "Failed to remove partial snapshot");
                }
                Err(e)
            }
        }
    }

    pub async fn delete_snapshot(&self, name: &str, snap: &str) -> Result<()> {
        let full = snapshot_name(name, snap);
        let row = self.instance(&full).await?;
        let (parent, Some(snap)) = split_snapshot_name(&row.name) else {
            return Err(Error::InvalidArgument(format!("{full} is not a snapshot")));
        };

        remove_volume(
            self.inner.storage.as_ref(),
            &self.inner.paths.snapshot(parent, snap),
        )
        .await?;
        self.inner.store.delete_by_id(row.id).await?;
        info!(instance = %parent, snapshot = %snap, "Snapshot deleted");
        Ok(())
    }

    pub async fn exec(&self, name: &str, request: ExecRequest) -> Result<ExecSession> {
        let instance = self.instance(name).await?;
        ExecSession::new(
            instance,
            request,
            self.inner.runtime.clone(),
            self.inner.config.connect_timeout,
        )
    }

    pub fn migration_env(&self) -> MigrationEnv {
        let config = &self.inner.config;
        MigrationEnv {
            runtime: self.inner.runtime.clone(),
            storage: self.inner.storage.clone(),
            store: self.inner.store.clone(),
            paths: self.inner.paths.clone(),
            connect_timeout: config.connect_timeout,
            predump: PreDumpPolicy {
                max_rounds: config.predump_max_rounds,
                threshold: config.predump_threshold,
            },
        }
    }

    pub async fn migration_source(&self, name: &str, live: bool) -> Result<MigrationSource> {
        let instance = self.instance(name).await?;
        let snapshots = self.inner.store.snapshots(self.project(), name).await?;
        MigrationSource::new(self.migration_env(), instance, snapshots, live).await
    }

    pub fn migration_sink(&self, name: &str, live: bool) -> Result<MigrationSink> {
        MigrationSink::new(self.migration_env(), self.project(), name, live)
    }

    /// Remove a migrated-away instance: stop whatever is left, then delete.
    pub async fn remove_migrated(&self, name: &str) -> Result<()> {
        self.inner.watchers.cancel(name).await;
        if let Err(e) = self.inner.runtime.stop(name).await {
            warn!(instance = %name, error = %e, "Failed to stop migrated instance");
        }
        let instance = self.instance(name).await?;
        self.delete_instance(&instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action() {
        assert_eq!("start".parse::<StateAction>().unwrap(), StateAction::Start);
        assert_eq!(
            "unfreeze".parse::<StateAction>().unwrap(),
            StateAction::Unfreeze
        );
        assert!("reboot".parse::<StateAction>().is_err());
    }
}
