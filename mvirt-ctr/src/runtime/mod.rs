//! Container runtime interface.
//!
//! The supervisor, exec and migration sessions only talk to containers
//! through [`ContainerRuntime`]. [`OciRuntime`] drives a runc-compatible
//! command-line runtime; tests substitute an in-process fake.

mod oci;

pub use oci::OciRuntime;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Resolves to the exit code of an attached process.
pub type ExitFuture = Pin<Box<dyn Future<Output = Result<i32>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Created,
    Running,
    Frozen,
}

impl ContainerState {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ContainerState::Running,
            "created" | "creating" => ContainerState::Created,
            "paused" | "pausing" | "frozen" => ContainerState::Frozen,
            _ => ContainerState::Stopped,
        }
    }
}

/// How to run a command inside a container.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    pub uid: u32,
    pub gid: u32,
    /// Allocate a pseudo-terminal instead of three pipes.
    pub tty: bool,
    /// Host ids of container root, owner of the terminal slave.
    pub root_uid: u32,
    pub root_gid: u32,
}

/// Out-of-band control of an attached process.
pub trait ProcessControl: Send + Sync {
    fn signal(&self, signal: i32) -> Result<()>;
    fn resize(&self, width: u16, height: u16) -> Result<()>;
}

/// A process started inside a container.
///
/// With a terminal, `stdout` is the combined terminal stream and `stderr`
/// is `None`.
pub struct Attached {
    pub stdin: Option<BoxedWriter>,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub control: Arc<dyn ProcessControl>,
    pub exit: ExitFuture,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    /// Dump memory pages only, leaving the process running.
    pub pre_dump: bool,
    pub leave_running: bool,
    /// Previous pre-dump image directory to diff against.
    pub parent: Option<PathBuf>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start the container described by `bundle/config.json`.
    async fn start(&self, name: &str, bundle: &Path) -> Result<()>;

    /// Forced stop and removal of runtime state.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Graceful stop request. Fails if the container is still running
    /// after `timeout`.
    async fn shutdown(&self, name: &str, timeout: Duration) -> Result<()>;

    async fn state(&self, name: &str) -> Result<ContainerState>;

    async fn freeze(&self, name: &str) -> Result<()>;

    async fn unfreeze(&self, name: &str) -> Result<()>;

    async fn attach(&self, name: &str, command: &[String], opts: AttachOptions)
    -> Result<Attached>;

    async fn checkpoint(&self, name: &str, dir: &Path, opts: CheckpointOptions) -> Result<()>;

    /// Start the container from a checkpoint image directory.
    async fn restore(&self, name: &str, bundle: &Path, dir: &Path) -> Result<()>;

    /// Wait until the container reaches `state`. `None` waits forever.
    async fn wait(
        &self,
        name: &str,
        state: ContainerState,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let poll = async {
            loop {
                if self.state(name).await? == state {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        match timeout {
            Some(t) => tokio::time::timeout(t, poll).await.map_err(|_| {
                Error::Runtime(format!("{name} did not reach {state:?} within {t:?}"))
            })?,
            None => poll.await,
        }
    }
}
