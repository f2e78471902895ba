//! Interactive command execution inside a running instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, SessionFailure};
use crate::instance::Instance;
use crate::runtime::{AttachOptions, Attached, ContainerRuntime, ContainerState, ProcessControl};
use crate::transport::relay::pump;
use crate::transport::{BoxedChannel, Outcome, Session};

/// Default for how long output relays may keep draining after the process
/// exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const SIGHUP: i32 = 1;
const SIGKILL: i32 = 9;
/// Highest real-time signal on Linux.
const MAX_SIGNAL: i64 = 64;

/// Body of an exec request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub interactive: bool,
    /// Start the command only once every channel is connected.
    #[serde(alias = "wait-for-websocket")]
    pub wait_for_connection: bool,
    pub cwd: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl ExecRequest {
    /// Data channels: one terminal channel or three stdio channels.
    pub fn data_channels(&self) -> usize {
        if self.interactive { 1 } else { 3 }
    }

    fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            (
                "PATH".to_string(),
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ),
            ("HOME".to_string(), "/root".to_string()),
        ]);
        if self.interactive {
            env.insert("TERM".to_string(), "xterm".to_string());
        }
        env.extend(self.environment.clone());
        env
    }
}

#[derive(Debug, Deserialize)]
struct ControlMessage {
    command: String,
    #[serde(default)]
    args: HashMap<String, String>,
    #[serde(default)]
    signal: i64,
}

#[derive(Debug, PartialEq, Eq)]
enum ControlAction {
    Resize { width: u16, height: u16 },
    Signal(i32),
}

fn parse_control(line: &str) -> std::result::Result<ControlAction, String> {
    let msg: ControlMessage =
        serde_json::from_str(line).map_err(|e| format!("malformed control message: {e}"))?;

    match msg.command.as_str() {
        "window-resize" => {
            let dim = |key: &str| -> std::result::Result<u16, String> {
                let raw = msg
                    .args
                    .get(key)
                    .ok_or_else(|| format!("window-resize without {key}"))?;
                match raw.parse::<u16>() {
                    Ok(v) if v > 0 => Ok(v),
                    _ => Err(format!("invalid {key} {raw:?}")),
                }
            };
            Ok(ControlAction::Resize {
                width: dim("width")?,
                height: dim("height")?,
            })
        }
        "signal" => {
            if !(1..=MAX_SIGNAL).contains(&msg.signal) {
                return Err(format!("signal {} out of range", msg.signal));
            }
            Ok(ControlAction::Signal(msg.signal as i32))
        }
        other => Err(format!("unknown control command {other:?}")),
    }
}

/// One exec operation bound to its channels.
pub struct ExecSession {
    session: Arc<Session<i32>>,
    instance: Instance,
    request: ExecRequest,
    runtime: Arc<dyn ContainerRuntime>,
    connect_timeout: Duration,
    drain_timeout: Duration,
}

impl ExecSession {
    pub fn new(
        instance: Instance,
        request: ExecRequest,
        runtime: Arc<dyn ContainerRuntime>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        if request.command.is_empty() {
            return Err(Error::InvalidArgument("exec command is empty".into()));
        }

        Ok(Self {
            session: Arc::new(Session::new(request.data_channels())),
            instance,
            request,
            runtime,
            connect_timeout,
            drain_timeout: OUTPUT_DRAIN_TIMEOUT,
        })
    }

    /// Bound on draining output after exit. Relays still open afterwards,
    /// say because a background child holds the output, are cut off.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn session(&self) -> Arc<Session<i32>> {
        self.session.clone()
    }

    /// Run to completion and publish the exit code (or failure) once.
    pub async fn run(self) -> Outcome<i32> {
        let outcome = self.execute().await.map_err(|e| {
            warn!(instance = %self.instance.name, error = %e, "Exec failed");
            SessionFailure::from(&e)
        });
        self.session.finish(outcome).await;
        self.session.result().await
    }

    fn attach_options(&self) -> AttachOptions {
        let (root_uid, root_gid) = self.instance.root_ids();
        AttachOptions {
            env: self.request.environment(),
            cwd: self.request.cwd.clone(),
            uid: self.request.uid.unwrap_or(0),
            gid: self.request.gid.unwrap_or(0),
            tty: self.request.interactive,
            root_uid,
            root_gid,
        }
    }

    async fn attach(&self) -> Result<Attached> {
        self.runtime
            .attach(
                &self.instance.name,
                &self.request.command,
                self.attach_options(),
            )
            .await
            .map_err(|e| match e {
                Error::StartFailure(_) => e,
                e => Error::StartFailure(e.to_string()),
            })
    }

    async fn wait_channels(&self) -> Result<(BoxedChannel, Vec<BoxedChannel>)> {
        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        let control = self.session.wait_control(self.connect_timeout).await?;
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let data = self.session.wait_data(remaining).await?;
        Ok((control, data))
    }

    async fn execute(&self) -> Result<i32> {
        let name = &self.instance.name;
        let state = self.runtime.state(name).await?;
        if state != ContainerState::Running {
            return Err(Error::StartFailure(format!(
                "instance {name} is not running ({state:?})"
            )));
        }

        let (attached, control, data) = if self.request.wait_for_connection {
            let (control, data) = self.wait_channels().await?;
            let attached = self.attach().await?;
            (attached, control, data)
        } else {
            // Output produced meanwhile stays in the pipe or terminal buffer.
            let attached = self.attach().await?;
            match self.wait_channels().await {
                Ok((control, data)) => (attached, control, data),
                Err(e) => {
                    if let Err(kill_err) = attached.control.signal(SIGKILL) {
                        debug!(instance = %name, error = %kill_err, "Kill after connect timeout failed");
                    }
                    let _ = attached.exit.await;
                    return Err(e);
                }
            }
        };

        info!(
            instance = %name,
            command = ?self.request.command,
            interactive = self.request.interactive,
            "Exec started"
        );

        let Attached {
            stdin,
            stdout,
            stderr,
            control: process,
            exit,
        } = attached;

        let control_task = spawn_control(control, process.clone(), name.clone());
        let (input_task, mut output_tasks) = if self.request.interactive {
            relay_terminal(data, stdin, stdout, process.clone())?
        } else {
            relay_pipes(data, stdin, stdout, stderr)?
        };

        let exit_code = exit.await;

        let drain = async {
            for task in output_tasks.iter_mut() {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!(instance = %name, "Output relay did not finish after process exit");
        }
        for task in &output_tasks {
            task.abort();
        }
        input_task.abort();
        control_task.abort();

        let exit_code = exit_code?;
        info!(instance = %name, exit_code, "Exec finished");
        Ok(exit_code)
    }
}

fn spawn_control(
    channel: BoxedChannel,
    process: Arc<dyn ProcessControl>,
    instance: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(channel).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(instance = %instance, error = %e, "Control channel read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let result = match parse_control(&line) {
                Ok(ControlAction::Resize { width, height }) => {
                    debug!(instance = %instance, width, height, "Resizing terminal");
                    process.resize(width, height)
                }
                Ok(ControlAction::Signal(signal)) => {
                    debug!(instance = %instance, signal, "Forwarding signal");
                    process.signal(signal)
                }
                Err(reason) => {
                    warn!(instance = %instance, reason = %reason, "Ignoring control message");
                    continue;
                }
            };
            if let Err(e) = result {
                warn!(instance = %instance, error = %e, "Control message failed");
            }
        }
    })
}

type RelayTasks = (JoinHandle<()>, Vec<JoinHandle<()>>);

fn relay_terminal(
    mut data: Vec<BoxedChannel>,
    stdin: Option<crate::runtime::BoxedWriter>,
    stdout: crate::runtime::BoxedReader,
    process: Arc<dyn ProcessControl>,
) -> Result<RelayTasks> {
    let channel = data
        .pop()
        .ok_or_else(|| Error::Protocol("missing terminal channel".into()))?;
    let (net_read, net_write) = tokio::io::split(channel);

    let input = tokio::spawn(async move {
        let Some(stdin) = stdin else { return };
        if let Err(e) = pump(net_read, stdin).await {
            debug!(error = %e, "Terminal input relay ended");
        }
        // The client hung up.
        if let Err(e) = process.signal(SIGHUP) {
            debug!(error = %e, "Failed to send SIGHUP");
        }
    });

    let output = tokio::spawn(async move {
        if let Err(e) = pump(stdout, net_write).await {
            debug!(error = %e, "Terminal output relay ended");
        }
    });

    Ok((input, vec![output]))
}

fn relay_pipes(
    data: Vec<BoxedChannel>,
    stdin: Option<crate::runtime::BoxedWriter>,
    stdout: crate::runtime::BoxedReader,
    stderr: Option<crate::runtime::BoxedReader>,
) -> Result<RelayTasks> {
    let mut data = data.into_iter();
    let (Some(stdin_ch), Some(stdout_ch), Some(stderr_ch)) = (data.next(), data.next(), data.next())
    else {
        return Err(Error::Protocol("expected three stdio channels".into()));
    };

    let input = tokio::spawn(async move {
        if let Some(stdin) = stdin
            && let Err(e) = pump(stdin_ch, stdin).await
        {
            debug!(error = %e, "stdin relay ended");
        }
    });

    let mut outputs = vec![tokio::spawn(async move {
        if let Err(e) = pump(stdout, stdout_ch).await {
            debug!(error = %e, "stdout relay ended");
        }
    })];

    match stderr {
        Some(stderr) => outputs.push(tokio::spawn(async move {
            if let Err(e) = pump(stderr, stderr_ch).await {
                debug!(error = %e, "stderr relay ended");
            }
        })),
        None => drop(stderr_ch),
    }

    Ok((input, outputs))
}
