//! Container launch.
//!
//! Builds the `docker run` invocation for an agent run and starts it either
//! with captured output (fed to the multiplexer for the live log view) or
//! attached directly to the terminal.

use crate::mux::{self, ExitOutcome, OutputStream, ProcessControl};
use crate::preflight::IMAGE_NAME;
use homun_core::{BranchDirs, RunId, RunParams};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Script executed inside the container.
pub const ENTRYPOINT: &str = "/home/homun/runner.bash";
/// Where the branch workspace is mounted inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Where the report directory is mounted inside the container.
pub const REPORT_MOUNT: &str = "/report";

/// How long a cancelled process group gets to exit after SIGTERM before SIGKILL.
/// Also bounds the stop command.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("failed to create {0} pipe")]
    Pipe(&'static str),
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, LaunchError>;

/// How the container's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// stdout/stderr piped back for the live log view; stdin closed.
    Captured,
    /// Interactive TTY inheriting the launcher's streams.
    Passthrough,
}

/// Environment value passed into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EnvArg {
    /// Copied from the launcher's own environment by name.
    Inherit(&'static str),
    /// Set explicitly.
    Value(&'static str, String),
}

/// A fully resolved container invocation.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    program: String,
    image: String,
    name: String,
    params: RunParams,
    dirs: BranchDirs,
}

impl ContainerSpec {
    pub fn new(params: RunParams, dirs: BranchDirs, run_id: &RunId) -> Self {
        Self {
            program: "docker".to_string(),
            image: IMAGE_NAME.to_string(),
            name: format!("homun-{}-{run_id}", params.branch),
            params,
            dirs,
        }
    }

    /// Use a different container CLI (e.g. `podman`).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Container name, `homun-<branch>-<run-id>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn env(&self) -> Vec<EnvArg> {
        vec![
            EnvArg::Inherit("ANTHROPIC_API_KEY"),
            EnvArg::Inherit("HOMUNCULUS_GITEA_API_KEY"),
            EnvArg::Inherit("HOMUNCULUS_GH_API_KEY"),
            EnvArg::Value("HOMUNCULUS_REPO_URL", self.params.repo_url.clone()),
            EnvArg::Value("HOMUNCULUS_REPO", self.params.repo.clone()),
            EnvArg::Value("HOMUNCULUS_BRANCH", self.params.branch.clone()),
            EnvArg::Inherit("HOMUNCULUS_SSH_KEY_PRIVATE"),
            EnvArg::Inherit("HOMUNCULUS_SSH_KEY_PUBLIC"),
        ]
    }

    /// Arguments passed to the container CLI.
    pub fn args(&self, mode: LaunchMode) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if mode == LaunchMode::Passthrough {
            args.push("-it".to_string());
        }
        args.push("--rm".to_string());
        args.push("--name".to_string());
        args.push(self.name.clone());
        args.push("--cap-add=NET_ADMIN".to_string());
        args.push("--cap-add=NET_RAW".to_string());

        for env in self.env() {
            args.push("-e".to_string());
            args.push(match env {
                EnvArg::Inherit(name) => name.to_string(),
                EnvArg::Value(name, value) => format!("{name}={value}"),
            });
        }

        args.push("-v".to_string());
        args.push(format!("{}:{WORKSPACE_MOUNT}", self.dirs.workspace.display()));
        args.push("-v".to_string());
        args.push(format!("{}:{REPORT_MOUNT}", self.dirs.report.display()));
        args.push("-w".to_string());
        args.push(WORKSPACE_MOUNT.to_string());
        args.push(self.image.clone());
        args.push("bash".to_string());
        args.push("-c".to_string());
        args.push(ENTRYPOINT.to_string());
        args
    }

    /// Build the command for `mode`, with standard streams wired accordingly.
    pub fn command(&self, mode: LaunchMode) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(mode));
        match mode {
            LaunchMode::Captured => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
            LaunchMode::Passthrough => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }
        cmd
    }

    /// `<program> kill <name>`. Signals sent to the local CLI do not stop a
    /// container whose init ignores SIGTERM; this stops the container itself.
    pub fn kill_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("kill")
            .arg(&self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// A captured process: its output stream plus the handle to stop it.
#[derive(Debug)]
pub struct Launched {
    pub output: OutputStream,
    pub control: ProcessControl,
}

/// Spawn `cmd` with captured output and start multiplexing it.
///
/// `cmd` must have piped stdout and stderr (see [`ContainerSpec::command`]).
/// It runs in a process group of its own so cancellation reaches every
/// descendant. On cancellation `stop`, if given, runs first.
/// Must be called from within a tokio runtime.
pub fn launch_captured(mut cmd: Command, program: &str, stop: Option<Command>) -> Result<Launched> {
    cmd.process_group(0);
    let mut child = spawn(&mut cmd, program)?;
    let stdout = child.stdout.take().ok_or(LaunchError::Pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(LaunchError::Pipe("stderr"))?;
    info!(program, pid = child.id(), "process started with captured output");

    let cancel = CancellationToken::new();
    let (output, supervisor) = mux::spawn(stdout, stderr, watch(child, cancel.clone(), stop));

    Ok(Launched {
        output,
        control: ProcessControl::new(cancel, supervisor),
    })
}

/// Run `spec` attached to the terminal and wait for it to exit.
pub async fn run_passthrough(spec: &ContainerSpec) -> Result<ExitOutcome> {
    let mut cmd = spec.command(LaunchMode::Passthrough);
    let mut child = spawn(&mut cmd, spec.program())?;
    info!(program = spec.program(), pid = child.id(), "process started in passthrough mode");

    let status = child.wait().await.map_err(|source| LaunchError::Wait {
        program: spec.program().to_string(),
        source,
    })?;
    Ok(ExitOutcome::from_status(status))
}

fn spawn(cmd: &mut Command, program: &str) -> Result<Child> {
    debug!(program, "spawning process");
    cmd.kill_on_drop(false).spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LaunchError::NotFound(program.to_string())
        } else {
            LaunchError::Spawn {
                program: program.to_string(),
                source: e,
            }
        }
    })
}

/// Wait for `child` to exit, terminating it if `cancel` fires first.
async fn watch(mut child: Child, cancel: CancellationToken, stop: Option<Command>) -> ExitOutcome {
    tokio::select! {
        result = child.wait() => match result {
            Ok(status) => ExitOutcome::from_status(status),
            Err(err) => ExitOutcome::WaitFailed(err.to_string()),
        },
        () = cancel.cancelled() => {
            info!(pid = child.id(), "cancellation requested; terminating process");
            terminate(&mut child, stop).await;
            ExitOutcome::Cancelled
        }
    }
}

/// Run `stop`, then SIGTERM the child's process group, then SIGKILL
/// whatever is left of the group once the grace period is over.
async fn terminate(child: &mut Child, stop: Option<Command>) {
    if let Some(mut stop) = stop {
        match tokio::time::timeout(TERMINATE_GRACE, stop.status()).await {
            Ok(Ok(status)) if status.success() => debug!("stop command succeeded"),
            Ok(Ok(status)) => warn!(%status, "stop command failed"),
            Ok(Err(err)) => warn!(error = %err, "failed to run stop command"),
            Err(_) => warn!(grace_sec = TERMINATE_GRACE.as_secs(), "stop command timed out"),
        }
    }

    // The child leads its own group, so its pid is the group id.
    let Some(group) = child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .map(Pid::from_raw)
    else {
        // Already reaped.
        return;
    };

    signal_group(group, Signal::SIGTERM);
    let exited = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok();
    if !exited {
        warn!(
            pgid = group.as_raw(),
            grace_sec = TERMINATE_GRACE.as_secs(),
            "process ignored SIGTERM; killing"
        );
    }

    // Also catches descendants that outlived the group leader.
    signal_group(group, Signal::SIGKILL);
    if !exited {
        if let Err(err) = child.wait().await {
            warn!(error = %err, "failed to reap process");
        }
    }
}

fn signal_group(group: Pid, signal: Signal) {
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid = group.as_raw(), ?signal, error = %err, "failed to signal process group"),
    }
}
