//! Daemon wiring: store, runtime, storage, session listener and signals.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result, SessionFailure};
use crate::exec::ExecRequest;
use crate::runtime::{ContainerRuntime, OciRuntime};
use crate::storage::{HostStorage, StorageBackend};
use crate::store::{InstanceStore, SqliteStore};
use crate::supervisor::{BatchReport, Supervisor};
use crate::transport::listener::{self, SessionRegistry};
use crate::transport::{ChannelRole, Outcome, Session};

/// A started session: the secrets clients connect with and the task
/// producing the final result.
pub struct OperationHandle<T> {
    pub secrets: BTreeMap<String, String>,
    pub task: JoinHandle<Outcome<T>>,
}

impl<T> OperationHandle<T> {
    pub async fn wait(self) -> Outcome<T> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(SessionFailure::from(&Error::Runtime(format!(
                "session task failed: {e}"
            )))),
        }
    }
}

pub struct Daemon {
    supervisor: Supervisor,
    registry: Arc<SessionRegistry>,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(
        config: Config,
        store: Arc<dyn InstanceStore>,
        runtime: Arc<dyn ContainerRuntime>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            supervisor: Supervisor::new(config, store, runtime, storage),
            registry: Arc::new(SessionRegistry::new()),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Open the on-disk store and the host runtime and storage.
    pub async fn open(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        tokio::fs::create_dir_all(config.paths().containers_dir()).await?;

        info!(data_dir = %config.data_dir.display(), "Initializing mvirt-ctr");

        let store = Arc::new(SqliteStore::open(&config.data_dir).await?);
        let runtime = Arc::new(OciRuntime::new(
            config.runtime_path.clone(),
            config.runtime_root.clone(),
        ));
        if !tokio::fs::try_exists(&config.runtime_path).await? {
            warn!(path = %config.runtime_path.display(), "Container runtime binary not found");
        }

        Ok(Self::new(config, store, runtime, Arc::new(HostStorage::new())))
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bring back instances that were running and watch ephemeral ones.
    pub async fn recover(&self) -> Result<BatchReport> {
        let report = self.supervisor.restart_all().await?;
        let failed = report.iter().filter(|(_, r)| r.is_err()).count();
        let watched = self.supervisor.watch_running_ephemeral().await?;
        info!(
            restarted = report.len() - failed,
            failed,
            watched,
            "Recovered instances"
        );
        Ok(report)
    }

    /// Bind the channel listener and serve it in the background.
    pub async fn listen(&self) -> Result<JoinHandle<()>> {
        let listen = &self.supervisor.config().listen;
        let registry = self.registry.clone();
        let shutdown = self.shutdown.subscribe();

        let task = match listen.strip_prefix("unix:") {
            Some(path) => {
                let path = Path::new(path);
                if tokio::fs::try_exists(path).await? {
                    tokio::fs::remove_file(path).await?;
                }
                let listener = UnixListener::bind(path)?;
                tokio::spawn(listener::serve_unix(listener, registry, shutdown))
            }
            None => {
                let listener = TcpListener::bind(listen).await?;
                tokio::spawn(listener::serve_tcp(listener, registry, shutdown))
            }
        };
        Ok(task)
    }

    /// Run until SIGINT or SIGTERM, then shut every instance down.
    pub async fn run(self) -> Result<()> {
        self.recover().await?;
        let listener = self.listen().await?;

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }

        self.teardown().await;
        if let Err(e) = listener.await {
            error!(error = %e, "Channel listener task failed");
        }
        info!("Daemon stopped");
        Ok(())
    }

    /// Mass shutdown, then cancel watchers and stop accepting channels.
    pub async fn teardown(&self) {
        match self.supervisor.shutdown_all().await {
            Ok(report) => {
                let failed = report.iter().filter(|(_, r)| r.is_err()).count();
                info!(count = report.len(), failed, "Instances shut down");
            }
            Err(e) => error!(error = %e, "Failed to shut down instances"),
        }
        let cancelled = self.supervisor.watchers().abort_all().await;
        info!(cancelled, "Ephemeral watchers cancelled");
        self.shutdown.send_replace(true);
    }

    /// Register a session's secrets, run `work`, unregister once it ends.
    async fn spawn_session<T, F>(&self, session: Arc<Session<T>>, work: F) -> OperationHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        let secrets = session.secrets();
        let keys: Vec<String> = secrets.values().cloned().collect();
        self.registry.register(session, &keys).await;

        let registry = self.registry.clone();
        let task = tokio::spawn(async move {
            let outcome = work.await;
            registry.unregister(&keys).await;
            outcome
        });
        OperationHandle { secrets, task }
    }

    pub async fn exec(&self, name: &str, request: ExecRequest) -> Result<OperationHandle<i32>> {
        let exec = self.supervisor.exec(name, request).await?;
        let session = exec.session();
        Ok(self.spawn_session(session, exec.run()).await)
    }

    /// Offer `name` for migration. After a successful transfer the local
    /// copy is removed.
    pub async fn migrate_send(&self, name: &str, live: bool) -> Result<OperationHandle<()>> {
        let source = self.supervisor.migration_source(name, live).await?;
        let session = source.session();
        let supervisor = self.supervisor.clone();
        let name = name.to_string();

        let work = async move {
            source.run().await?;
            if let Err(e) = supervisor.remove_migrated(&name).await {
                error!(instance = %name, error = %e, "Failed to remove migrated instance");
            }
            Ok(())
        };
        Ok(self.spawn_session(session, work).await)
    }

    /// Pull `name` from a remote source listening on `remote`, using the
    /// channel secrets it handed out.
    pub async fn migrate_receive(
        &self,
        name: &str,
        live: bool,
        remote: &str,
        secrets: &BTreeMap<String, String>,
    ) -> Result<OperationHandle<()>> {
        let sink = self.supervisor.migration_sink(name, live)?;
        let session = sink.session();

        let mut roles = vec![ChannelRole::Control];
        roles.extend((0..crate::migration::data_channels(live)).map(ChannelRole::Data));
        for role in roles {
            let key = role.to_string();
            let remote_secret = secrets
                .get(&key)
                .ok_or_else(|| Error::InvalidArgument(format!("missing secret for channel {key}")))?
                .clone();
            let local_secret = session
                .secret(role)
                .ok_or_else(|| Error::Protocol(format!("no local channel {key}")))?
                .to_string();

            let remote = remote.to_string();
            let session = session.clone();
            tokio::spawn(async move {
                let attached = async {
                    let channel = listener::dial(&remote, &remote_secret).await?;
                    session.connect(&local_secret, channel).await
                }
                .await;
                if let Err(e) = attached {
                    warn!(remote = %remote, channel = %key, error = %e, "Failed to open migration channel");
                }
            });
        }

        let task = tokio::spawn(sink.run());
        Ok(OperationHandle {
            secrets: session.secrets(),
            task,
        })
    }
}
