//! Core types for a summoning run.
//!
//! A run moves through a fixed sequence of phases: preflight validation,
//! three input prompts, workspace provisioning, instructions editing,
//! confirmation, and finally the container run itself.

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Unique identifier for a run.
/// Uses `UUIDv7` so log records sort by start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Preflight checks are in flight.
    #[default]
    Validating,
    InputRepoUrl,
    InputRepo,
    InputBranch,
    /// Branch directories are being created on a background task.
    Provisioning,
    EditInstructions,
    /// Instructions are being written to disk.
    SavingInstructions,
    Confirm,
    /// The container has been requested but has not started yet.
    Launching,
    Running,
    Done,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::InputRepoUrl => "input_repo_url",
            Self::InputRepo => "input_repo",
            Self::InputBranch => "input_branch",
            Self::Provisioning => "provisioning",
            Self::EditInstructions => "edit_instructions",
            Self::SavingInstructions => "saving_instructions",
            Self::Confirm => "confirm",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Whether the phase collects free-form text from the keyboard.
    pub fn is_text_input(&self) -> bool {
        matches!(self, Self::InputRepoUrl | Self::InputRepo | Self::InputBranch)
    }

    /// Whether the run has ended (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// The three values collected from the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParams {
    pub repo_url: String,
    pub repo: String,
    pub branch: String,
}

/// The per-run directory pair under `<repo-root>/.homun/branches/<branch>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchDirs {
    /// `<repo-root>/.homun/branches/<branch>`
    pub root: PathBuf,
    /// Mounted at `/report` inside the container.
    pub report: PathBuf,
    /// Mounted at `/workspace` inside the container.
    pub workspace: PathBuf,
}

impl BranchDirs {
    /// Compute the directory layout for a branch. Touches nothing on disk.
    pub fn for_branch(repo_root: &Path, branch: &str) -> Self {
        let root = repo_root.join(".homun").join("branches").join(branch);
        Self {
            report: root.join("report"),
            workspace: root.join("workspace"),
            root,
        }
    }

    /// Location of the instructions file handed to the agent.
    pub fn instructions_path(&self) -> PathBuf {
        self.report.join("instructions.md")
    }
}

/// One line of subprocess output.
///
/// Lines carry no stream tag: stdout and stderr are merged and only
/// arrival order is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine(pub String);

impl OutputLine {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OutputLine {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OutputLine {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for OutputLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
