//! runc-compatible command-line runtime (youki, runc, crun).

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    AttachOptions, Attached, BoxedWriter, CheckpointOptions, ContainerRuntime, ContainerState,
    ProcessControl,
};
use crate::error::{Error, Result};

/// Log file inside the bundle receiving the runtime's own output.
const RUNTIME_LOG: &str = "runtime.log";

pub struct OciRuntime {
    binary: PathBuf,
    root: Option<PathBuf>,
}

#[derive(Deserialize)]
struct StateOutput {
    status: String,
}

impl OciRuntime {
    pub fn new(binary: PathBuf, root: Option<PathBuf>) -> Self {
        Self { binary, root }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(root) = &self.root {
            cmd.arg("--root").arg(root);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// youki spells its checkpoint subcommand differently.
    fn checkpoint_subcommand(&self) -> &'static str {
        match self.binary.file_name().and_then(|n| n.to_str()) {
            Some("youki") => "checkpointt",
            _ => "checkpoint",
        }
    }

    /// Run a short-lived runtime command, returning its stdout.
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!(runtime = %self.binary.display(), args = %args.join(" "), "Executing runtime command");

        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                Error::Runtime(format!("failed to execute {}: {e}", self.binary.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Runtime(format!(
                "{} {} exited with {}: {}",
                self.binary.display(),
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    /// Run a command that may leave a container process behind. The
    /// container inherits stdio, so output goes to a file instead of a pipe.
    async fn run_detached(&self, args: &[&str], bundle: &Path) -> Result<()> {
        let log_path = bundle.join(RUNTIME_LOG);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        debug!(runtime = %self.binary.display(), args = %args.join(" "), "Executing runtime command");

        let status = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .await
            .map_err(|e| {
                Error::Runtime(format!("failed to execute {}: {e}", self.binary.display()))
            })?;

        if !status.success() {
            let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
            let tail: Vec<&str> = log.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(Error::Runtime(format!(
                "{} {} exited with {}: {}",
                self.binary.display(),
                args.first().copied().unwrap_or_default(),
                status,
                tail.join("\n")
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for OciRuntime {
    async fn start(&self, name: &str, bundle: &Path) -> Result<()> {
        let bundle_str = bundle.to_string_lossy();

        // Leftover runtime state from an unclean exit blocks create.
        if matches!(
            self.state(name).await?,
            ContainerState::Running | ContainerState::Frozen
        ) {
            return Err(Error::Conflict(format!("container {name} is already running")));
        }
        let _ = self.run(&["delete", "--force", name]).await;

        self.run_detached(&["create", "--bundle", &bundle_str, name], bundle)
            .await
            .map_err(|e| Error::StartFailure(e.to_string()))?;

        if let Err(e) = self.run(&["start", name]).await {
            let _ = self.run(&["delete", "--force", name]).await;
            return Err(Error::StartFailure(e.to_string()));
        }

        info!(container = %name, "Container started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        if self.state(name).await? == ContainerState::Frozen {
            let _ = self.run(&["resume", name]).await;
        }

        match self.run(&["delete", "--force", name]).await {
            Ok(_) => {}
            Err(e) if is_missing(&e) => {}
            Err(e) => return Err(e),
        }

        info!(container = %name, "Container stopped");
        Ok(())
    }

    async fn shutdown(&self, name: &str, timeout: Duration) -> Result<()> {
        if self.state(name).await? == ContainerState::Stopped {
            let _ = self.run(&["delete", name]).await;
            return Ok(());
        }

        self.run(&["kill", name, "TERM"]).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.state(name).await? == ContainerState::Stopped {
                let _ = self.run(&["delete", name]).await;
                info!(container = %name, "Container shut down gracefully");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(Error::Runtime(format!(
            "container {name} did not stop within {timeout:?}"
        )))
    }

    async fn state(&self, name: &str) -> Result<ContainerState> {
        match self.run(&["state", name]).await {
            Ok(stdout) => {
                let state: StateOutput = serde_json::from_slice(&stdout)?;
                Ok(ContainerState::parse(&state.status))
            }
            Err(e) if is_missing(&e) => Ok(ContainerState::Stopped),
            Err(e) => Err(e),
        }
    }

    async fn freeze(&self, name: &str) -> Result<()> {
        self.run(&["pause", name]).await?;
        Ok(())
    }

    async fn unfreeze(&self, name: &str) -> Result<()> {
        self.run(&["resume", name]).await?;
        Ok(())
    }

    async fn attach(
        &self,
        name: &str,
        command: &[String],
        opts: AttachOptions,
    ) -> Result<Attached> {
        if command.is_empty() {
            return Err(Error::InvalidArgument("empty command".into()));
        }

        let mut cmd = self.command();
        cmd.arg("exec")
            .arg("--user")
            .arg(format!("{}:{}", opts.uid, opts.gid));
        if let Some(cwd) = &opts.cwd {
            cmd.arg("--cwd").arg(cwd);
        }
        for (key, value) in &opts.env {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }
        if opts.tty {
            cmd.arg("--tty");
        }
        cmd.arg(name).args(command);

        if opts.tty {
            attach_tty(cmd, &opts)
        } else {
            attach_pipes(cmd)
        }
    }

    async fn checkpoint(&self, name: &str, dir: &Path, opts: CheckpointOptions) -> Result<()> {
        let dir_str = dir.to_string_lossy().into_owned();
        let parent_str = opts
            .parent
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let mut args = vec![self.checkpoint_subcommand(), "--image-path", dir_str.as_str()];
        if opts.pre_dump {
            args.push("--pre-dump");
        }
        if opts.leave_running {
            args.push("--leave-running");
        }
        if let Some(parent) = &parent_str {
            args.push("--parent-path");
            args.push(parent);
        }
        args.push(name);

        tokio::fs::create_dir_all(dir).await?;
        self.run(&args).await?;
        info!(container = %name, dir = %dir.display(), pre_dump = opts.pre_dump, "Checkpoint written");
        Ok(())
    }

    async fn restore(&self, name: &str, bundle: &Path, dir: &Path) -> Result<()> {
        let bundle_str = bundle.to_string_lossy();
        let dir_str = dir.to_string_lossy();
        self.run_detached(
            &[
                "restore",
                "--detach",
                "--image-path",
                &dir_str,
                "--bundle",
                &bundle_str,
                name,
            ],
            bundle,
        )
        .await
        .map_err(|e| Error::StartFailure(e.to_string()))?;

        info!(container = %name, "Container restored from checkpoint");
        Ok(())
    }
}

fn is_missing(e: &Error) -> bool {
    match e {
        Error::Runtime(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("does not exist") || msg.contains("not found") || msg.contains("no such")
        }
        _ => false,
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

struct ExecControl {
    pid: Option<u32>,
    /// Terminal master, when one was allocated.
    pty: Option<Arc<OwnedFd>>,
}

impl ProcessControl for ExecControl {
    fn signal(&self, signal: i32) -> Result<()> {
        let pid = self
            .pid
            .ok_or_else(|| Error::Runtime("process has already exited".into()))?;
        let signal = Signal::try_from(signal)
            .map_err(|_| Error::InvalidArgument(format!("invalid signal {signal}")))?;
        kill(Pid::from_raw(pid as i32), signal)?;
        Ok(())
    }

    fn resize(&self, width: u16, height: u16) -> Result<()> {
        let pty = self
            .pty
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("process has no terminal".into()))?;

        let ws = libc::winsize {
            ws_row: height,
            ws_col: width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: fd is a valid terminal master owned by `pty`.
        let rc = unsafe { libc::ioctl(pty.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

fn attach_pipes(mut cmd: Command) -> Result<Attached> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::StartFailure(format!("failed to spawn exec: {e}")))?;

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::StartFailure("exec stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::StartFailure("exec stderr not captured".into()))?;

    let control = Arc::new(ExecControl {
        pid: child.id(),
        pty: None,
    });

    Ok(Attached {
        stdin: stdin.map(|s| Box::new(s) as BoxedWriter),
        stdout: Box::new(stdout),
        stderr: Some(Box::new(stderr)),
        control,
        exit: Box::pin(async move {
            let status = child.wait().await?;
            Ok(exit_code(status))
        }),
    })
}

fn attach_tty(mut cmd: Command, opts: &AttachOptions) -> Result<Attached> {
    let pty = nix::pty::openpty(None, None)?;
    let master = pty.master;
    let slave = pty.slave;

    // Container root must own its terminal.
    if let Err(e) =
        std::os::unix::fs::fchown(&slave, Some(opts.root_uid), Some(opts.root_gid))
    {
        warn!(error = %e, "Failed to chown terminal");
    }

    cmd.stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave.try_clone()?));

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::StartFailure(format!("failed to spawn exec: {e}")))?;

    // The child holds its own copies; ours would keep the terminal open forever.
    drop(slave);

    let reader = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));
    let writer = tokio::fs::File::from_std(std::fs::File::from(master.try_clone()?));

    let control = Arc::new(ExecControl {
        pid: child.id(),
        pty: Some(Arc::new(master)),
    });

    Ok(Attached {
        stdin: Some(Box::new(writer)),
        stdout: Box::new(reader),
        stderr: None,
        control,
        exit: Box::pin(async move {
            let status = child.wait().await?;
            Ok(exit_code(status))
        }),
    })
}
