//! Spawned peer processes for connect mode.
//!
//! The peer's stdin/stdout become the endpoint's transport. Its stderr is
//! handled per [`StderrMode`]. Termination escalates SIGTERM -> SIGKILL on
//! Unix; elsewhere the process is killed directly.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use crate::config::{PeerSettings, StderrMode};
use crate::error::{BridgeError, BridgeResult};
use crate::transport::Transport;

const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Program and arguments for the peer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
}

impl PeerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// A running peer process.
///
/// Dropping it kills the process.
#[derive(Debug)]
pub struct PeerProcess {
    child: Child,
    program: String,
    stderr_task: Option<JoinHandle<()>>,
}

impl PeerProcess {
    /// Start the peer with piped stdin/stdout.
    pub fn spawn(command: &PeerCommand, settings: &PeerSettings) -> BridgeResult<(Self, Transport)> {
        let spawn_error = |source: std::io::Error| BridgeError::Spawn {
            program: command.program.clone(),
            source,
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match settings.stderr {
                StderrMode::Log => Stdio::piped(),
                StderrMode::Inherit => Stdio::inherit(),
                StderrMode::Discard => Stdio::null(),
            })
            .kill_on_drop(true);
        if let Some(dir) = &command.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(spawn_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("stdin was not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("stdout was not captured")))?;
        let stderr_task = child.stderr.take().map(forward_stderr);

        log::debug!(
            target: "crosspulse::process",
            "Spawned peer '{}' (pid {:?})",
            command.program,
            child.id()
        );

        let process = Self {
            child,
            program: command.program.clone(),
            stderr_task,
        };
        Ok((process, Transport::new(stdout, stdin)))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the peer has already exited.
    pub fn try_status(&mut self) -> BridgeResult<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Stop the peer, waiting at most `grace` before killing it.
    pub async fn terminate(mut self, grace: Duration) -> BridgeResult<ExitStatus> {
        let status = self.terminate_inner(grace).await;
        if let Some(task) = self.stderr_task.take() {
            // A grandchild may still hold the pipe open; don't wait on it forever
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }
        status
    }

    async fn terminate_inner(&mut self, grace: Duration) -> BridgeResult<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        self.request_exit();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                log::warn!(
                    target: "crosspulse::process",
                    "Peer '{}' did not exit within {:?}, killing",
                    self.program,
                    grace
                );
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }

    #[cfg(unix)]
    fn request_exit(&mut self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return;
        };
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            // ESRCH: already gone
            if e != nix::errno::Errno::ESRCH {
                log::debug!(
                    target: "crosspulse::process",
                    "Failed to send SIGTERM to '{}': {}",
                    self.program,
                    e
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) {
        if let Err(e) = self.child.start_kill() {
            log::debug!(
                target: "crosspulse::process",
                "Failed to kill '{}': {}",
                self.program,
                e
            );
        }
    }
}

fn forward_stderr(stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => log::info!(target: "crosspulse::peer_stderr", "{}", line),
                Ok(None) => break,
                Err(e) => {
                    log::debug!(target: "crosspulse::peer_stderr", "stderr read error: {}", e);
                    break;
                }
            }
        }
    })
}
