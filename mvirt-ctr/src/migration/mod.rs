//! Instance migration between daemons.
//!
//! Both sides run a [`Session`] with a control channel, a filesystem
//! channel and, for live migration, a checkpoint channel. The source
//! offers transfer methods and descriptors, the sink picks a method,
//! then snapshots (oldest first) and the instance are streamed. Live
//! migration follows with pre-dump rounds and a final dump. The sink
//! restores and reports success; any failure aborts both sides with one
//! error and the sink removes what it created.

pub mod checkpoint;
pub mod descriptor;
pub mod fs;
pub mod wire;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::checkpoint::{FinalDump, PreDumpDecision, PreDumpPolicy, PreDumpTracker};
use self::wire::{
    Body, CheckpointMethod, CheckpointRound, ControlMessage, FsMethod, MigrationControl,
    MigrationHeader, MigrationReply,
};
use crate::bundle;
use crate::config::Paths;
use crate::error::{Error, Result, SessionFailure};
use crate::instance::{Instance, validate_name};
use crate::runtime::{CheckpointOptions, ContainerRuntime, ContainerState};
use crate::storage::{BackendKind, StorageBackend, remove_volume};
use crate::store::InstanceStore;
use crate::transport::{BoxedChannel, Outcome, Session};

/// Data channel index of the filesystem stream.
pub const FS_CHANNEL: usize = 0;
/// Data channel index of the checkpoint stream (live only).
pub const CHECKPOINT_CHANNEL: usize = 1;

/// How long to wait for the peer's abort message after a transfer broke.
const PEER_ABORT_GRACE: Duration = Duration::from_millis(500);

pub fn data_channels(live: bool) -> usize {
    if live { 2 } else { 1 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Idle,
    Handshake,
    FilesystemSync,
    Checkpoint,
    Finalize,
    Done,
    Aborted,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationPhase::Idle => "idle",
            MigrationPhase::Handshake => "handshake",
            MigrationPhase::FilesystemSync => "filesystem-sync",
            MigrationPhase::Checkpoint => "checkpoint",
            MigrationPhase::Finalize => "finalize",
            MigrationPhase::Done => "done",
            MigrationPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Collaborators shared by both migration sides.
#[derive(Clone)]
pub struct MigrationEnv {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub storage: Arc<dyn StorageBackend>,
    pub store: Arc<dyn InstanceStore>,
    pub paths: Paths,
    pub connect_timeout: Duration,
    pub predump: PreDumpPolicy,
}

/// Framed control channel: a reader task feeding a queue plus the write half.
struct ControlLink {
    writer: WriteHalf<BoxedChannel>,
    rx: mpsc::Receiver<ControlMessage>,
    reader: JoinHandle<()>,
    peer_aborted: bool,
}

impl ControlLink {
    fn new(channel: BoxedChannel) -> Self {
        let (read, writer) = tokio::io::split(channel);
        let (tx, rx) = mpsc::channel(16);
        let reader = tokio::spawn(read_control(read, tx));
        Self {
            writer,
            rx,
            reader,
            peer_aborted: false,
        }
    }

    async fn send(&mut self, body: Body) -> Result<()> {
        wire::write_frame(&mut self.writer, &ControlMessage::from(body)).await
    }

    /// Next message. A failure report from the peer becomes an error.
    async fn recv(&mut self, phase: MigrationPhase) -> Result<Body> {
        let msg = self
            .rx
            .recv()
            .await
            .ok_or_else(|| Error::phase(phase.to_string(), "control channel closed"))?;

        match msg.body {
            Some(Body::Control(MigrationControl {
                success: false,
                message,
            })) => {
                self.peer_aborted = true;
                Err(Error::phase(
                    phase.to_string(),
                    format!("peer aborted: {message}"),
                ))
            }
            Some(body) => Ok(body),
            None => Err(Error::Protocol("empty control message".into())),
        }
    }

    /// The peer's abort message, if one arrives shortly.
    async fn peer_failure(&mut self) -> Option<String> {
        let deadline = tokio::time::Instant::now() + PEER_ABORT_GRACE;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .ok()??;
            if let Some(Body::Control(MigrationControl {
                success: false,
                message,
            })) = msg.body
            {
                self.peer_aborted = true;
                return Some(message);
            }
        }
    }

    async fn abort(&mut self, message: &str) {
        let body = Body::Control(MigrationControl {
            success: false,
            message: message.to_string(),
        });
        if let Err(e) = self.send(body).await {
            debug!(error = %e, "Failed to send abort message");
        }
    }
}

impl Drop for ControlLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_control(mut read: ReadHalf<BoxedChannel>, tx: mpsc::Sender<ControlMessage>) {
    loop {
        match wire::read_frame(&mut read).await {
            Ok(Some(msg)) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Invalid migration control frame");
                break;
            }
        }
    }
}

/// Turn an error from `phase` into the session's terminal failure and tell
/// the peer, unless the peer reported first.
async fn abort_with(
    err: Error,
    phase: MigrationPhase,
    link: Option<&mut ControlLink>,
) -> Error {
    // Nothing was exchanged while idle: keep the original kind.
    let mut err = if matches!(err, Error::PhaseFailure { .. }) || phase == MigrationPhase::Idle {
        err
    } else {
        Error::phase(phase.to_string(), &err)
    };

    if let Some(link) = link
        && !link.peer_aborted
    {
        match link.peer_failure().await {
            Some(message) => {
                err = Error::phase(phase.to_string(), format!("peer aborted: {message}"));
            }
            None => link.abort(&err.to_string()).await,
        }
    }
    err
}

fn take_channels(
    mut data: Vec<BoxedChannel>,
    live: bool,
) -> Result<(BoxedChannel, Option<BoxedChannel>)> {
    let checkpoint = if live {
        Some(data.pop().ok_or_else(|| {
            Error::Protocol("missing checkpoint channel".into())
        })?)
    } else {
        None
    };
    let fs = data
        .pop()
        .ok_or_else(|| Error::Protocol("missing filesystem channel".into()))?;
    Ok((fs, checkpoint))
}

async fn wait_channels(
    session: &Session<()>,
    timeout: Duration,
    link: &mut Option<ControlLink>,
) -> Result<Vec<BoxedChannel>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let control = session.wait_control(timeout).await?;
    *link = Some(ControlLink::new(control));
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    session.wait_data(remaining).await
}

/// Sending side of a migration.
pub struct MigrationSource {
    env: MigrationEnv,
    session: Arc<Session<()>>,
    instance: Instance,
    snapshots: Vec<Instance>,
    live: bool,
    phase: watch::Sender<MigrationPhase>,
}

impl MigrationSource {
    /// A running instance can only be migrated live; a live migration needs
    /// a running instance.
    pub async fn new(
        env: MigrationEnv,
        instance: Instance,
        snapshots: Vec<Instance>,
        live: bool,
    ) -> Result<Self> {
        let state = env.runtime.state(&instance.name).await?;
        let running = matches!(state, ContainerState::Running | ContainerState::Frozen);
        if running && !live {
            return Err(Error::InvalidArgument(format!(
                "instance {} is running; stop it or migrate it live",
                instance.name
            )));
        }
        if live && !running {
            return Err(Error::InvalidArgument(format!(
                "instance {} is not running; live migration needs a running instance",
                instance.name
            )));
        }

        Ok(Self {
            session: Arc::new(Session::new(data_channels(live))),
            env,
            instance,
            snapshots,
            live,
            phase: watch::Sender::new(MigrationPhase::Idle),
        })
    }

    pub fn session(&self) -> Arc<Session<()>> {
        self.session.clone()
    }

    pub fn phase(&self) -> MigrationPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: MigrationPhase) {
        debug!(instance = %self.instance.name, phase = %phase, "Migration phase");
        self.phase.send_replace(phase);
    }

    pub async fn run(self) -> Outcome<()> {
        let mut link = None;
        let mut sender = None;
        let outcome = match self.execute(&mut link, &mut sender).await {
            Ok(()) => {
                self.set_phase(MigrationPhase::Done);
                info!(instance = %self.instance.name, live = self.live, "Migration source finished");
                Ok(())
            }
            Err(e) => {
                let err = abort_with(e, self.phase(), link.as_mut()).await;
                self.set_phase(MigrationPhase::Aborted);
                warn!(instance = %self.instance.name, error = %err, "Migration source aborted");
                Err(SessionFailure::from(&err))
            }
        };

        if let Some(sender) = sender {
            sender.finish(self.env.storage.as_ref()).await;
        }
        let scratch = self.env.paths.migration(&self.instance.name);
        if let Err(e) = self.env.storage.remove_all(&scratch).await {
            warn!(path = %scratch.display(), error = %e, "Failed to remove migration scratch");
        }
        drop(link);

        self.session.finish(outcome).await;
        self.session.result().await
    }

    async fn execute(
        &self,
        link: &mut Option<ControlLink>,
        sender: &mut Option<fs::FsSender>,
    ) -> Result<()> {
        let name = &self.instance.name;
        let data = wait_channels(&self.session, self.env.connect_timeout, link).await?;
        let (mut fs_ch, mut ck_ch) = take_channels(data, self.live)?;
        let link = link
            .as_mut()
            .ok_or_else(|| Error::Protocol("control channel missing".into()))?;

        self.set_phase(MigrationPhase::Handshake);
        let snapshots = descriptor::order_snapshots(
            self.snapshots
                .iter()
                .map(descriptor::instance_to_descriptor)
                .collect(),
        )?;

        let bundle = self.env.paths.container(name);
        let mut offered = Vec::new();
        if self.env.storage.detect(&bundle).await? == BackendKind::Btrfs {
            offered.push(FsMethod::Btrfs);
        }
        offered.push(FsMethod::Tar);

        let checkpoint = if self.live {
            CheckpointMethod::Criu
        } else {
            CheckpointMethod::None
        };
        link.send(Body::Header(MigrationHeader {
            fs_methods: offered.iter().map(|m| *m as i32).collect(),
            checkpoint: checkpoint as i32,
            snapshots: snapshots.clone(),
            instance: Some(descriptor::instance_to_descriptor(&self.instance)),
            live: self.live,
        }))
        .await?;

        let reply = match link.recv(MigrationPhase::Handshake).await? {
            Body::Reply(reply) => reply,
            _ => return Err(Error::Protocol("expected migration reply".into())),
        };
        let method = FsMethod::try_from(reply.fs_method)
            .ok()
            .filter(|m| offered.contains(m))
            .ok_or_else(|| {
                Error::Protocol(format!("sink chose unoffered method {}", reply.fs_method))
            })?;
        if reply.checkpoint != checkpoint as i32 {
            return Err(Error::Protocol("sink rejected checkpoint method".into()));
        }
        info!(instance = %name, method = ?method, snapshots = snapshots.len(), "Migration negotiated");

        self.set_phase(MigrationPhase::FilesystemSync);
        let scratch = fs::send_scratch(&self.env.paths.migration(name));
        let sender = sender.insert(fs::FsSender::new(method, scratch));
        for snap in &snapshots {
            let path = self.env.paths.snapshot(name, &snap.name);
            sender.send(&path, &mut fs_ch).await?;
            debug!(instance = %name, snapshot = %snap.name, "Snapshot sent");
        }
        sender.send(&bundle, &mut fs_ch).await?;

        if let Some(ck_ch) = ck_ch.as_mut() {
            self.set_phase(MigrationPhase::Checkpoint);
            self.send_checkpoints(link, ck_ch).await?;
            // The instance stopped with the final dump; send what it left on disk.
            sender.send(&bundle, &mut fs_ch).await?;
        }

        self.set_phase(MigrationPhase::Finalize);
        match link.recv(MigrationPhase::Finalize).await? {
            Body::Control(MigrationControl { success: true, .. }) => Ok(()),
            _ => Err(Error::Protocol("expected migration result".into())),
        }
    }

    async fn send_checkpoints(
        &self,
        link: &mut ControlLink,
        channel: &mut BoxedChannel,
    ) -> Result<()> {
        let name = &self.instance.name;
        let base = self.env.paths.migration(name).join("checkpoint");
        self.env.storage.remove_all(&base).await?;
        tokio::fs::create_dir_all(&base).await?;

        let mut tracker = PreDumpTracker::new(self.env.predump);
        let mut decision = tracker.initial();
        let mut round = 0u32;

        let final_dump = loop {
            match decision {
                PreDumpDecision::Final(final_dump) => break final_dump,
                PreDumpDecision::Continue => {
                    round += 1;
                    let opts = CheckpointOptions {
                        pre_dump: true,
                        leave_running: true,
                        parent: (round > 1).then(|| checkpoint::parent_ref(round - 1)),
                    };
                    let size = self
                        .dump_and_send(link, channel, &base, round, false, opts)
                        .await?;
                    decision = tracker.record(size);
                    debug!(instance = %name, round, size, "Pre-dump round sent");
                }
            }
        };

        round += 1;
        let parent = match final_dump {
            FinalDump::Incremental { parent_round } => Some(checkpoint::parent_ref(parent_round)),
            FinalDump::Full => None,
        };
        let opts = CheckpointOptions {
            pre_dump: false,
            leave_running: false,
            parent,
        };
        let size = self
            .dump_and_send(link, channel, &base, round, true, opts)
            .await?;
        info!(
            instance = %name,
            pre_dumps = tracker.rounds(),
            final_dump = ?final_dump,
            size,
            "Final checkpoint sent"
        );
        Ok(())
    }

    async fn dump_and_send(
        &self,
        link: &mut ControlLink,
        channel: &mut BoxedChannel,
        base: &std::path::Path,
        round: u32,
        final_dump: bool,
        opts: CheckpointOptions,
    ) -> Result<u64> {
        let dir = checkpoint::round_dir(base, round);
        self.env
            .runtime
            .checkpoint(&self.instance.name, &dir, opts)
            .await?;
        let size = checkpoint::dir_size(&dir).await?;

        link.send(Body::Round(CheckpointRound {
            round,
            final_dump,
            size,
        }))
        .await?;
        fs::send_tar(&dir, channel).await?;
        Ok(size)
    }
}

/// What a sink created so far, removed again on abort.
#[derive(Default)]
struct Created {
    rows: Vec<i64>,
    volumes: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
    started: bool,
    /// Removed on success too.
    receiver: Option<fs::FsReceiver>,
}

/// Receiving side of a migration.
pub struct MigrationSink {
    env: MigrationEnv,
    session: Arc<Session<()>>,
    project: String,
    name: String,
    live: bool,
    phase: watch::Sender<MigrationPhase>,
}

impl MigrationSink {
    pub fn new(env: MigrationEnv, project: &str, name: &str, live: bool) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            session: Arc::new(Session::new(data_channels(live))),
            env,
            project: project.to_string(),
            name: name.to_string(),
            live,
            phase: watch::Sender::new(MigrationPhase::Idle),
        })
    }

    pub fn session(&self) -> Arc<Session<()>> {
        self.session.clone()
    }

    pub fn phase(&self) -> MigrationPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: MigrationPhase) {
        debug!(instance = %self.name, phase = %phase, "Migration phase");
        self.phase.send_replace(phase);
    }

    pub async fn run(self) -> Outcome<()> {
        let mut link = None;
        let mut created = Created::default();
        let outcome = match self.execute(&mut link, &mut created).await {
            Ok(()) => {
                self.set_phase(MigrationPhase::Done);
                info!(instance = %self.name, live = self.live, "Migration sink finished");
                Ok(())
            }
            Err(e) => {
                let err = abort_with(e, self.phase(), link.as_mut()).await;
                self.set_phase(MigrationPhase::Aborted);
                warn!(instance = %self.name, error = %err, "Migration sink aborted");
                self.cleanup(&created).await;
                Err(SessionFailure::from(&err))
            }
        };

        if let Some(receiver) = created.receiver.take() {
            receiver.finish(self.env.storage.as_ref()).await;
        }
        let scratch = self.env.paths.migration(&self.name);
        if let Err(e) = self.env.storage.remove_all(&scratch).await {
            warn!(path = %scratch.display(), error = %e, "Failed to remove migration scratch");
        }
        drop(link);

        self.session.finish(outcome).await;
        self.session.result().await
    }

    async fn execute(
        &self,
        link: &mut Option<ControlLink>,
        created: &mut Created,
    ) -> Result<()> {
        let name = &self.name;
        let paths = &self.env.paths;
        let data = wait_channels(&self.session, self.env.connect_timeout, link).await?;
        let (mut fs_ch, mut ck_ch) = take_channels(data, self.live)?;
        let link = link
            .as_mut()
            .ok_or_else(|| Error::Protocol("control channel missing".into()))?;

        self.set_phase(MigrationPhase::Handshake);
        let header = match link.recv(MigrationPhase::Handshake).await? {
            Body::Header(header) => header,
            _ => return Err(Error::Protocol("expected migration header".into())),
        };
        let desc = header
            .instance
            .clone()
            .ok_or_else(|| Error::Protocol("migration header without instance".into()))?;
        if header.live != self.live {
            return Err(Error::InvalidArgument(format!(
                "source live={} but sink expects live={}",
                header.live, self.live
            )));
        }
        let checkpoint = CheckpointMethod::try_from(header.checkpoint)
            .map_err(|_| Error::Protocol(format!("unknown checkpoint method {}", header.checkpoint)))?;
        if self.live != (checkpoint == CheckpointMethod::Criu) {
            return Err(Error::InvalidArgument(
                "checkpoint method does not match live flag".into(),
            ));
        }

        descriptor::validate_snapshots(&header.snapshots)?;
        let instance_args = descriptor::instance_to_args(&self.project, name, &desc)?;
        let snapshot_args = header
            .snapshots
            .iter()
            .map(|snap| descriptor::snapshot_to_instance_args(&self.project, name, snap))
            .collect::<Result<Vec<_>>>()?;

        tokio::fs::create_dir_all(paths.containers_dir()).await?;
        let local = self.env.storage.detect(&paths.containers_dir()).await?;
        let method = header
            .offered_methods()
            .into_iter()
            .find(|m| match m {
                FsMethod::Tar => true,
                FsMethod::Btrfs => local == BackendKind::Btrfs,
            })
            .ok_or_else(|| Error::InvalidArgument("no common filesystem transfer method".into()))?;

        if self.env.store.get_id(&self.project, name).await?.is_some() {
            return Err(Error::Conflict(format!("instance {name} already exists")));
        }
        for path in [paths.container(name), paths.snapshots_dir(name)] {
            if tokio::fs::try_exists(&path).await? {
                return Err(Error::Conflict(format!(
                    "storage for instance {name} already exists at {}",
                    path.display()
                )));
            }
        }

        link.send(Body::Reply(MigrationReply {
            fs_method: method as i32,
            checkpoint: checkpoint as i32,
        }))
        .await?;
        info!(instance = %name, method = ?method, snapshots = header.snapshots.len(), "Migration accepted");

        self.set_phase(MigrationPhase::FilesystemSync);
        let instance = self.env.store.create(&instance_args).await?;
        created.rows.push(instance.id);
        for args in &snapshot_args {
            let row = self.env.store.create(args).await?;
            created.rows.push(row.id);
        }

        let scratch = fs::receive_scratch(&paths.migration(name));
        let receiver = created.receiver.insert(fs::FsReceiver::new(method, scratch));
        if !header.snapshots.is_empty() {
            created.dirs.push(paths.snapshots_dir(name));
        }
        for snap in &header.snapshots {
            let dst = paths.snapshot(name, &snap.name);
            created.volumes.push(dst.clone());
            receiver.receive(&dst, &mut fs_ch).await?;
        }
        let bundle = paths.container(name);
        created.volumes.push(bundle.clone());
        receiver.receive(&bundle, &mut fs_ch).await?;

        let mut final_dir = None;
        if let Some(ck_ch) = ck_ch.as_mut() {
            self.set_phase(MigrationPhase::Checkpoint);
            let base = paths.migration(name).join("checkpoint");
            let dir = loop {
                let round = match link.recv(MigrationPhase::Checkpoint).await? {
                    Body::Round(round) => round,
                    _ => return Err(Error::Protocol("expected checkpoint round".into())),
                };
                let dir = checkpoint::round_dir(&base, round.round);
                fs::receive_tar(&dir, ck_ch).await?;
                debug!(instance = %name, round = round.round, size = round.size, "Checkpoint round received");
                if round.final_dump {
                    break dir;
                }
            };

            remove_volume(self.env.storage.as_ref(), &bundle).await?;
            receiver.receive(&bundle, &mut fs_ch).await?;
            final_dir = Some(dir);
        }

        self.set_phase(MigrationPhase::Finalize);
        bundle::write_bundle(&instance, &bundle).await?;
        if let Some(dir) = final_dir {
            created.started = true;
            self.env.runtime.restore(name, &bundle, &dir).await?;
            self.env.store.set_power_state(instance.id, true).await?;
        }

        link.send(Body::Control(MigrationControl {
            success: true,
            message: String::new(),
        }))
        .await?;
        Ok(())
    }

    /// Best-effort removal of partial state; failures are logged.
    async fn cleanup(&self, created: &Created) {
        if created.started
            && let Err(e) = self.env.runtime.stop(&self.name).await
        {
            warn!(instance = %self.name, error = %e, "Failed to stop restored instance");
        }
        for path in created.volumes.iter().rev() {
            if let Err(e) = remove_volume(self.env.storage.as_ref(), path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove received volume");
            }
        }
        for dir in &created.dirs {
            if let Err(e) = self.env.storage.remove_all(dir).await {
                warn!(path = %dir.display(), error = %e, "Failed to remove directory");
            }
        }
        for id in created.rows.iter().rev() {
            if let Err(e) = self.env.store.delete_by_id(*id).await {
                warn!(id, error = %e, "Failed to remove migrated row");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_phase_names() {
        assert_eq!(MigrationPhase::FilesystemSync.to_string(), "filesystem-sync");
        assert_eq!(MigrationPhase::Aborted.to_string(), "aborted");
        assert_eq!(data_channels(true), 2);
        assert_eq!(data_channels(false), 1);
    }

    #[tokio::test]
    async fn test_abort_with_wraps_phase() {
        let err = abort_with(
            Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
            MigrationPhase::FilesystemSync,
            None,
        )
        .await;
        assert_eq!(err.kind(), ErrorKind::PhaseFailure);
        assert!(err.to_string().contains("filesystem-sync"));

        let err = abort_with(
            Error::ConnectTimeout("missing channels: 0".into()),
            MigrationPhase::Idle,
            None,
        )
        .await;
        assert_eq!(err.kind(), ErrorKind::ConnectTimeout);
    }
}
