//! Test helpers for mvirt-ctr integration tests.
//!
//! Everything runs in-process: a fake container runtime whose processes
//! are tokio tasks, storage that records what it touches, and the SQLite
//! store in memory.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use mvirt_ctr::Config;
use mvirt_ctr::error::{Error, Result};
use mvirt_ctr::instance::{Instance, InstanceArgs, InstanceUpdate};
use mvirt_ctr::runtime::{
    AttachOptions, Attached, CheckpointOptions, ContainerRuntime, ContainerState, ProcessControl,
};
use mvirt_ctr::storage::{BackendKind, StorageBackend, copy_tree};
use mvirt_ctr::store::{InstanceStore, SqliteStore};
use mvirt_ctr::supervisor::Supervisor;
use mvirt_ctr::transport::{ChannelRole, Session};

const PIPE_SIZE: usize = 64 * 1024;

/// Ordered record of storage and store side effects.
pub type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

#[derive(Default)]
struct FakeContainer {
    state: Option<ContainerState>,
    ignore_term: bool,
    fail_start: bool,
}

/// Runtime whose containers are entries in a map and whose exec'd
/// processes are tasks.
///
/// Commands understood by `attach`:
/// - `echo <words..>`: prints the words on stdout, `warning` on stderr, exits 0
/// - `exit <code>`: exits with `code`
/// - `cat`: copies stdin to stdout until EOF (exit 0) or a signal
/// - `background <words..>`: prints the words and exits 0, leaving stdout
///   open as a daemonized child would
/// - `sleep`: waits for a signal
///
/// A signalled process exits with 128 + signal.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
    signals: Arc<Mutex<Vec<i32>>>,
    calls: Mutex<Vec<String>>,
    checkpoint_sizes: Mutex<VecDeque<u64>>,
    last_attach: Mutex<Option<AttachOptions>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_state(&self, name: &str, state: ContainerState) {
        self.containers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .state = Some(state);
    }

    pub fn state_of(&self, name: &str) -> ContainerState {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .and_then(|c| c.state)
            .unwrap_or(ContainerState::Stopped)
    }

    /// Graceful shutdown requests for `name` are ignored.
    pub fn ignore_term(&self, name: &str) {
        self.containers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .ignore_term = true;
    }

    pub fn fail_start(&self, name: &str) {
        self.containers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .fail_start = true;
    }

    /// Sizes of the images written by successive checkpoint calls.
    pub fn queue_checkpoint_sizes(&self, sizes: &[u64]) {
        self.checkpoint_sizes.lock().unwrap().extend(sizes);
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<i32> {
        self.signals.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_attach(&self) -> Option<AttachOptions> {
        self.last_attach.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

struct FakeControl {
    signals: mpsc::UnboundedSender<i32>,
    sent: Arc<Mutex<Vec<i32>>>,
    resizes: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl ProcessControl for FakeControl {
    fn signal(&self, signal: i32) -> Result<()> {
        self.sent.lock().unwrap().push(signal);
        // The process may already be gone.
        let _ = self.signals.send(signal);
        Ok(())
    }

    fn resize(&self, width: u16, height: u16) -> Result<()> {
        self.resizes.lock().unwrap().push((width, height));
        Ok(())
    }
}

async fn fake_process(
    command: Vec<String>,
    mut stdin: DuplexStream,
    mut stdout: DuplexStream,
    stderr: Option<DuplexStream>,
    mut signals: mpsc::UnboundedReceiver<i32>,
) -> i32 {
    let tty = stderr.is_none();
    let program = command.first().map(String::as_str).unwrap_or_default();
    match program {
        "echo" => {
            let line = format!("{}\n", command[1..].join(" "));
            let _ = stdout.write_all(line.as_bytes()).await;
            if let Some(mut stderr) = stderr {
                let _ = stderr.write_all(b"warning\n").await;
            }
            0
        }
        "background" => {
            let line = format!("{}\n", command[1..].join(" "));
            let _ = stdout.write_all(line.as_bytes()).await;
            tokio::spawn(async move {
                let _held = stdout;
                std::future::pending::<()>().await
            });
            0
        }
        "exit" => command
            .get(1)
            .and_then(|c| c.parse().ok())
            .unwrap_or(1),
        "cat" => {
            let mut buf = [0u8; 1024];
            loop {
                tokio::select! {
                    signal = signals.recv() => break 128 + signal.unwrap_or(9),
                    read = stdin.read(&mut buf) => match read {
                        // A terminal stays open until hung up.
                        Ok(0) | Err(_) if tty => break 128 + signals.recv().await.unwrap_or(9),
                        Ok(0) | Err(_) => break 0,
                        Ok(n) => {
                            if stdout.write_all(&buf[..n]).await.is_err() {
                                break 1;
                            }
                        }
                    },
                }
            }
        }
        _ => 128 + signals.recv().await.unwrap_or(9),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, name: &str, bundle: &Path) -> Result<()> {
        self.record(format!("start {name}"));
        let mut containers = self.containers.lock().unwrap();
        let container = containers.entry(name.to_string()).or_default();
        if container.fail_start {
            return Err(Error::StartFailure(format!("{name} refused to start")));
        }
        if !bundle.join("config.json").exists() {
            return Err(Error::StartFailure(format!("{name} has no bundle")));
        }
        if matches!(
            container.state,
            Some(ContainerState::Running | ContainerState::Frozen)
        ) {
            return Err(Error::Conflict(format!("{name} is already running")));
        }
        container.state = Some(ContainerState::Running);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.record(format!("stop {name}"));
        self.set_state(name, ContainerState::Stopped);
        Ok(())
    }

    async fn shutdown(&self, name: &str, timeout: Duration) -> Result<()> {
        self.record(format!("shutdown {name}"));
        let ignore = self
            .containers
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|c| c.ignore_term);
        if ignore {
            tokio::time::sleep(timeout).await;
            return Err(Error::Runtime(format!("{name} still running after {timeout:?}")));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.set_state(name, ContainerState::Stopped);
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<ContainerState> {
        Ok(self.state_of(name))
    }

    async fn freeze(&self, name: &str) -> Result<()> {
        self.set_state(name, ContainerState::Frozen);
        Ok(())
    }

    async fn unfreeze(&self, name: &str) -> Result<()> {
        self.set_state(name, ContainerState::Running);
        Ok(())
    }

    async fn attach(
        &self,
        name: &str,
        command: &[String],
        opts: AttachOptions,
    ) -> Result<Attached> {
        self.record(format!("attach {name} {}", command.join(" ")));
        let tty = opts.tty;
        *self.last_attach.lock().unwrap() = Some(opts);

        let (stdin_w, stdin_r) = tokio::io::duplex(PIPE_SIZE);
        let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_SIZE);
        let (stderr_w, stderr_r) = if tty {
            (None, None)
        } else {
            let (w, r) = tokio::io::duplex(PIPE_SIZE);
            (Some(w), Some(r))
        };

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let command = command.to_vec();
        tokio::spawn(async move {
            let code = fake_process(command, stdin_r, stdout_w, stderr_w, signal_rx).await;
            let _ = exit_tx.send(code);
        });

        Ok(Attached {
            stdin: Some(Box::new(stdin_w)),
            stdout: Box::new(stdout_r),
            stderr: stderr_r.map(|r| Box::new(r) as _),
            control: Arc::new(FakeControl {
                signals: signal_tx,
                sent: self.signals.clone(),
                resizes: self.resizes.clone(),
            }),
            exit: Box::pin(async move {
                exit_rx
                    .await
                    .map_err(|_| Error::Runtime("fake process vanished".into()))
            }),
        })
    }

    async fn checkpoint(&self, name: &str, dir: &Path, opts: CheckpointOptions) -> Result<()> {
        self.record(format!(
            "checkpoint {name} pre_dump={} parent={}",
            opts.pre_dump,
            opts.parent
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".into())
        ));
        let size = self
            .checkpoint_sizes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(4096);
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join("pages.img"), vec![0u8; size as usize]).await?;
        if !opts.leave_running {
            self.set_state(name, ContainerState::Stopped);
        }
        Ok(())
    }

    async fn restore(&self, name: &str, bundle: &Path, dir: &Path) -> Result<()> {
        self.record(format!("restore {name}"));
        if !dir.join("pages.img").exists() || !bundle.join("config.json").exists() {
            return Err(Error::Runtime(format!("{name}: incomplete restore input")));
        }
        self.set_state(name, ContainerState::Running);
        Ok(())
    }
}

/// Plain-directory storage that journals removals and can be told to fail.
pub struct RecordingStorage {
    journal: Journal,
    fail_remove: Mutex<HashSet<PathBuf>>,
}

impl RecordingStorage {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            fail_remove: Mutex::new(HashSet::new()),
        })
    }

    /// The next removal of `path` fails.
    pub fn fail_remove_once(&self, path: &Path) {
        self.fail_remove.lock().unwrap().insert(path.to_path_buf());
    }
}

#[async_trait]
impl StorageBackend for RecordingStorage {
    async fn detect(&self, path: &Path) -> Result<BackendKind> {
        if tokio::fs::try_exists(path).await? {
            Ok(BackendKind::Dir)
        } else {
            Err(Error::NotFound(path.display().to_string()))
        }
    }

    async fn create(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<()> {
        Err(Error::Runtime(format!("{} is not a subvolume", path.display())))
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        if self.fail_remove.lock().unwrap().remove(path) {
            return Err(Error::Io(std::io::Error::other("injected removal failure")));
        }
        note(&self.journal, format!("remove {}", path.display()));
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn snapshot(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(src, dst).await?;
        Ok(())
    }
}

/// In-memory store that journals deletes and can fail some deletes,
/// renames and power-state writes.
pub struct FlakyStore {
    inner: SqliteStore,
    journal: Journal,
    failing_deletes: Mutex<u32>,
    fail_rename: Mutex<bool>,
    fail_power_state: Mutex<bool>,
}

impl FlakyStore {
    pub async fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStore::in_memory().await.expect("in-memory store"),
            journal,
            failing_deletes: Mutex::new(0),
            fail_rename: Mutex::new(false),
            fail_power_state: Mutex::new(false),
        })
    }

    pub fn fail_next_deletes(&self, count: u32) {
        *self.failing_deletes.lock().unwrap() = count;
    }

    /// The next rename fails.
    pub fn fail_next_rename(&self) {
        *self.fail_rename.lock().unwrap() = true;
    }

    /// The next power-state write fails.
    pub fn fail_next_power_state(&self) {
        *self.fail_power_state.lock().unwrap() = true;
    }
}

#[async_trait]
impl InstanceStore for FlakyStore {
    async fn create(&self, args: &InstanceArgs) -> Result<Instance> {
        self.inner.create(args).await
    }

    async fn get(&self, project: &str, name: &str) -> Result<Instance> {
        self.inner.get(project, name).await
    }

    async fn get_id(&self, project: &str, name: &str) -> Result<Option<i64>> {
        self.inner.get_id(project, name).await
    }

    async fn list_regular(&self, project: &str) -> Result<Vec<Instance>> {
        self.inner.list_regular(project).await
    }

    async fn list_power_on(&self) -> Result<Vec<Instance>> {
        self.inner.list_power_on().await
    }

    async fn update(&self, id: i64, update: &InstanceUpdate) -> Result<()> {
        self.inner.update(id, update).await
    }

    async fn set_power_state(&self, id: i64, running: bool) -> Result<()> {
        if std::mem::take(&mut *self.fail_power_state.lock().unwrap()) {
            return Err(Error::Io(std::io::Error::other("injected power-state failure")));
        }
        self.inner.set_power_state(id, running).await
    }

    async fn clear_power_state(&self) -> Result<u64> {
        self.inner.clear_power_state().await
    }

    async fn snapshots(&self, project: &str, parent: &str) -> Result<Vec<Instance>> {
        self.inner.snapshots(project, parent).await
    }

    async fn delete_by_id(&self, id: i64) -> Result<bool> {
        {
            let mut failing = self.failing_deletes.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(Error::Io(std::io::Error::other("injected delete failure")));
            }
        }
        note(&self.journal, format!("delete-row {id}"));
        self.inner.delete_by_id(id).await
    }

    async fn rename(&self, project: &str, old: &str, new: &str) -> Result<()> {
        if std::mem::take(&mut *self.fail_rename.lock().unwrap()) {
            return Err(Error::Io(std::io::Error::other("injected rename failure")));
        }
        self.inner.rename(project, old, new).await
    }

    async fn touch_last_used(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.inner.touch_last_used(id, at).await
    }
}

/// One daemon's worth of fakes in a private data directory.
pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub config: Config,
    pub runtime: Arc<FakeRuntime>,
    pub storage: Arc<RecordingStorage>,
    pub store: Arc<FlakyStore>,
    pub journal: Journal,
    pub supervisor: Supervisor,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = Config {
            data_dir: tmp.path().to_path_buf(),
            connect_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        adjust(&mut config);

        let journal = Journal::default();
        let runtime = FakeRuntime::new();
        let storage = RecordingStorage::new(journal.clone());
        let store = FlakyStore::new(journal.clone()).await;
        let supervisor = Supervisor::new(
            config.clone(),
            store.clone(),
            runtime.clone(),
            storage.clone(),
        );

        Self {
            tmp,
            config,
            runtime,
            storage,
            store,
            journal,
            supervisor,
        }
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().unwrap().clear();
    }

    /// Create `name` with a small root filesystem.
    pub async fn create(&self, name: &str, ephemeral: bool) -> Instance {
        let instance = self
            .supervisor
            .create(InstanceArgs {
                name: name.to_string(),
                architecture: 2,
                ephemeral,
                config: [("limits.cpu".to_string(), "2".to_string())].into(),
                profiles: vec!["default".into()],
                ..Default::default()
            })
            .await
            .expect("create instance");

        let rootfs = self.supervisor.paths().rootfs(name);
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/hostname"), format!("{name}\n")).unwrap();
        instance
    }

    pub async fn create_running(&self, name: &str) -> Instance {
        let instance = self.create(name, false).await;
        self.supervisor.start(name).await.expect("start instance");
        instance
    }
}

/// Attach one end of an in-memory stream to `session` as `role`; the
/// other end is returned to play the client.
pub async fn connect<T>(session: &Session<T>, role: ChannelRole) -> DuplexStream
where
    T: Clone + Send + Sync + 'static,
{
    let (client, server) = tokio::io::duplex(PIPE_SIZE);
    let secret = session.secret(role).expect("secret for role").to_string();
    session
        .connect(&secret, Box::new(server))
        .await
        .expect("connect channel");
    client
}

/// Splice a source and a sink session together channel by channel.
pub async fn splice<A, B>(source: &Session<A>, sink: &Session<B>, roles: &[ChannelRole])
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
{
    for role in roles {
        let (a, b) = tokio::io::duplex(PIPE_SIZE);
        let src_secret = source.secret(*role).expect("source secret").to_string();
        let dst_secret = sink.secret(*role).expect("sink secret").to_string();
        source
            .connect(&src_secret, Box::new(a))
            .await
            .expect("connect source");
        sink.connect(&dst_secret, Box::new(b))
            .await
            .expect("connect sink");
    }
}

/// Read until EOF or `limit`.
pub async fn read_to_end(stream: &mut DuplexStream, limit: Duration) -> String {
    let mut out = Vec::new();
    let _ = tokio::time::timeout(limit, stream.read_to_end(&mut out)).await;
    String::from_utf8_lossy(&out).into_owned()
}
