//! The run state machine.
//!
//! [`App`] owns every piece of run state and changes only inside
//! [`App::update`], which takes one [`Msg`] and returns the [`Effect`]s the
//! runtime should carry out. Effects do their work off the event loop and
//! report back with further messages, so nothing here blocks or touches the
//! terminal, the filesystem, or a process directly.

use crate::docker::{ContainerSpec, LaunchError, LaunchMode, Launched};
use crate::mux::{OutputEvent, OutputStream, ProcessControl};
use crate::preflight::PreflightError;
use crate::provision::ProvisionError;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use homun_core::branch::{is_valid_branch_name, INVALID_BRANCH_MESSAGE};
use homun_core::instructions::InstructionsError;
use homun_core::{BranchDirs, Config, LogBuffer, Phase, RunId, RunParams, TextBuffer};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Shown when a prompt is left blank and there is no default to fall back on.
pub const NO_DEFAULT_MESSAGE: &str = "No default available. Please enter a value";

/// Failures that end a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Instructions(#[from] InstructionsError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("background task failed: {0}")]
    Task(String),
}

/// Everything known before the first frame is drawn.
#[derive(Debug, Clone)]
pub struct Startup {
    pub repo_root: PathBuf,
    /// Name of the working directory, used for the default repository name.
    pub folder_name: String,
    /// `origin` remote of the working directory; empty if there is none.
    pub default_repo_url: String,
    pub config: Config,
    /// Issue text to seed new instructions with.
    pub issue: Option<String>,
    /// `HOMUNCULUS_REPO_URL`, if set.
    pub repo_url_override: Option<String>,
    /// `HOMUNCULUS_REPO`, if set. Only used together with the URL override.
    pub repo_override: Option<String>,
    pub launch_mode: LaunchMode,
}

/// Branch directories plus the instructions text loaded from them.
#[derive(Debug)]
pub struct Workspace {
    pub dirs: BranchDirs,
    pub instructions: String,
}

/// Input to [`App::update`].
#[derive(Debug)]
pub enum Msg {
    Key(KeyEvent),
    /// The terminal changed size; nothing to update beyond a redraw.
    Resize,
    /// One second of run time has passed.
    Tick,
    Validated(Result<(), RunError>),
    Provisioned(Result<Workspace, RunError>),
    InstructionsSaved(Result<(), RunError>),
    Launched(Result<Launched, RunError>),
    Output(OutputEvent),
}

/// Work requested by [`App::update`].
#[derive(Debug)]
pub enum Effect {
    /// Run preflight checks.
    Validate,
    /// Create the branch directories and load the instructions file.
    Provision {
        repo_root: PathBuf,
        branch: String,
        issue: Option<String>,
    },
    SaveInstructions { path: PathBuf, content: String },
    /// Start the container with captured output.
    Launch(ContainerSpec),
    /// Deliver [`Msg::Tick`] after one second.
    ArmTick,
    /// Wait for the next output line (or closure) from the stream.
    PullOutput(OutputStream),
    /// Stop a running container and wait briefly for it to go.
    Shutdown(ProcessControl),
    /// Leave the terminal and run the container attached to it.
    Handoff(ContainerSpec),
    Quit,
}

/// A single summoning run.
#[derive(Debug)]
pub struct App {
    run_id: RunId,
    phase: Phase,
    params: RunParams,
    input: String,
    validation_error: Option<String>,
    repo_root: PathBuf,
    folder_name: String,
    default_repo_url: String,
    config: Config,
    issue: Option<String>,
    repo_url_override: Option<String>,
    repo_override: Option<String>,
    launch_mode: LaunchMode,
    dirs: Option<BranchDirs>,
    editor: TextBuffer,
    elapsed: Duration,
    logs: LogBuffer,
    error: Option<String>,
    control: Option<ProcessControl>,
}

impl App {
    pub fn new(startup: Startup) -> Self {
        Self {
            run_id: RunId::new(),
            phase: Phase::Validating,
            params: RunParams::default(),
            input: String::new(),
            validation_error: None,
            repo_root: startup.repo_root,
            folder_name: startup.folder_name,
            default_repo_url: startup.default_repo_url,
            config: startup.config,
            issue: startup.issue,
            repo_url_override: startup.repo_url_override,
            repo_override: startup.repo_override,
            launch_mode: startup.launch_mode,
            dirs: None,
            editor: TextBuffer::default(),
            elapsed: Duration::ZERO,
            logs: LogBuffer::new(),
            error: None,
            control: None,
        }
    }

    /// Effects to run before any input arrives.
    pub fn init(&self) -> Vec<Effect> {
        info!(run_id = %self.run_id, repo_root = %self.repo_root.display(), "run started");
        vec![Effect::Validate]
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn params(&self) -> &RunParams {
        &self.params
    }

    /// Text typed at the current prompt.
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn validation_error(&self) -> Option<&str> {
        self.validation_error.as_deref()
    }

    pub fn default_repo_url(&self) -> &str {
        &self.default_repo_url
    }

    /// Repository name used when the repository prompt is left blank.
    pub fn default_repo(&self) -> String {
        self.config.repo_name(&self.params.repo_url, &self.folder_name)
    }

    pub fn dirs(&self) -> Option<&BranchDirs> {
        self.dirs.as_ref()
    }

    pub fn instructions(&self) -> &str {
        self.editor.text()
    }

    /// Instructions text together with the editing cursor.
    pub fn editor(&self) -> &TextBuffer {
        &self.editor
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    /// Message of the failure that ended the run, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether the run ended without any failure.
    pub fn succeeded(&self) -> bool {
        self.phase == Phase::Done && self.error.is_none()
    }

    /// Apply one message.
    pub fn update(&mut self, msg: Msg) -> Vec<Effect> {
        match msg {
            Msg::Key(key) => self.on_key(key),
            Msg::Resize => Vec::new(),
            Msg::Tick => self.on_tick(),
            Msg::Validated(result) => self.on_validated(result),
            Msg::Provisioned(result) => self.on_provisioned(result),
            Msg::InstructionsSaved(result) => self.on_saved(result),
            Msg::Launched(result) => self.on_launched(result),
            Msg::Output(event) => self.on_output(event),
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!(run_id = %self.run_id, from = self.phase.as_str(), to = phase.as_str(), "phase change");
        self.phase = phase;
    }

    fn fail(&mut self, err: &RunError) -> Vec<Effect> {
        error!(run_id = %self.run_id, phase = self.phase.as_str(), error = %err, "run failed");
        self.error = Some(err.to_string());
        self.set_phase(Phase::Error);
        Vec::new()
    }

    fn quit(&mut self) -> Vec<Effect> {
        info!(run_id = %self.run_id, phase = self.phase.as_str(), "quit requested");
        let mut effects = Vec::new();
        if let Some(control) = self.control.take() {
            effects.push(Effect::Shutdown(control));
        }
        effects.push(Effect::Quit);
        effects
    }

    /// The terminal stopped delivering input; treat it as a quit.
    pub fn input_closed(&mut self) -> Vec<Effect> {
        self.quit()
    }

    fn on_key(&mut self, key: KeyEvent) -> Vec<Effect> {
        if key.kind != KeyEventKind::Press {
            return Vec::new();
        }

        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        if key.code == KeyCode::Esc || (ctrl && key.code == KeyCode::Char('c')) {
            return self.quit();
        }

        match self.phase {
            phase if phase.is_text_input() => self.on_prompt_key(key.code, ctrl),
            Phase::EditInstructions => self.on_editor_key(key.code, ctrl),
            Phase::Confirm => self.on_confirm_key(key.code),
            // Any key dismisses the final screen.
            phase if phase.is_terminal() => vec![Effect::Quit],
            _ => Vec::new(),
        }
    }

    fn on_prompt_key(&mut self, code: KeyCode, ctrl: bool) -> Vec<Effect> {
        match code {
            KeyCode::Enter => self.submit_prompt(),
            KeyCode::Backspace => {
                self.input.pop();
                Vec::new()
            }
            KeyCode::Char(c) if !ctrl => {
                self.input.push(c);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn submit_prompt(&mut self) -> Vec<Effect> {
        let typed = self.input.trim().to_string();
        match self.phase {
            Phase::InputRepoUrl => {
                let Some(url) = resolve(typed, &self.default_repo_url) else {
                    self.validation_error = Some(NO_DEFAULT_MESSAGE.to_string());
                    return Vec::new();
                };
                self.params.repo_url = url;
                self.next_prompt(Phase::InputRepo);
                Vec::new()
            }
            Phase::InputRepo => {
                let default = self.default_repo();
                let Some(repo) = resolve(typed, &default) else {
                    self.validation_error = Some(NO_DEFAULT_MESSAGE.to_string());
                    return Vec::new();
                };
                self.params.repo = repo;
                self.next_prompt(Phase::InputBranch);
                Vec::new()
            }
            Phase::InputBranch => {
                if !is_valid_branch_name(&typed) {
                    debug!(run_id = %self.run_id, branch = %typed, "branch name rejected");
                    self.validation_error = Some(INVALID_BRANCH_MESSAGE.to_string());
                    self.input.clear();
                    return Vec::new();
                }
                self.params.branch = typed;
                self.next_prompt(Phase::Provisioning);
                info!(
                    run_id = %self.run_id,
                    repo_url = %self.params.repo_url,
                    repo = %self.params.repo,
                    branch = %self.params.branch,
                    "inputs collected"
                );
                vec![Effect::Provision {
                    repo_root: self.repo_root.clone(),
                    branch: self.params.branch.clone(),
                    issue: self.issue.clone(),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn next_prompt(&mut self, phase: Phase) {
        self.input.clear();
        self.validation_error = None;
        self.set_phase(phase);
    }

    fn on_editor_key(&mut self, code: KeyCode, ctrl: bool) -> Vec<Effect> {
        match code {
            KeyCode::Char('s') if ctrl => {
                let Some(dirs) = &self.dirs else {
                    return Vec::new();
                };
                let path = dirs.instructions_path();
                self.set_phase(Phase::SavingInstructions);
                return vec![Effect::SaveInstructions {
                    path,
                    content: self.instructions().to_string(),
                }];
            }
            KeyCode::Char(c) if !ctrl => self.editor.insert(c),
            KeyCode::Tab => self.editor.insert('\t'),
            KeyCode::Enter => self.editor.insert('\n'),
            KeyCode::Backspace => self.editor.backspace(),
            KeyCode::Delete => self.editor.delete(),
            KeyCode::Left => self.editor.move_left(),
            KeyCode::Right => self.editor.move_right(),
            KeyCode::Up => self.editor.move_up(),
            KeyCode::Down => self.editor.move_down(),
            KeyCode::Home => self.editor.move_home(),
            KeyCode::End => self.editor.move_end(),
            _ => {}
        }
        Vec::new()
    }

    fn on_confirm_key(&mut self, code: KeyCode) -> Vec<Effect> {
        let KeyCode::Char(c) = code else {
            return Vec::new();
        };
        match c.to_ascii_lowercase() {
            'y' => {
                let Some(dirs) = self.dirs.clone() else {
                    return Vec::new();
                };
                let spec = ContainerSpec::new(self.params.clone(), dirs, &self.run_id);
                match self.launch_mode {
                    LaunchMode::Captured => {
                        self.set_phase(Phase::Launching);
                        vec![Effect::Launch(spec)]
                    }
                    LaunchMode::Passthrough => {
                        info!(run_id = %self.run_id, "handing terminal to container");
                        vec![Effect::Handoff(spec)]
                    }
                }
            }
            'n' => self.quit(),
            _ => Vec::new(),
        }
    }

    fn on_tick(&mut self) -> Vec<Effect> {
        if self.phase != Phase::Running {
            return Vec::new();
        }
        self.elapsed += Duration::from_secs(1);
        vec![Effect::ArmTick]
    }

    fn on_validated(&mut self, result: Result<(), RunError>) -> Vec<Effect> {
        if let Err(err) = result {
            return self.fail(&err);
        }

        let Some(url) = self.repo_url_override.clone() else {
            self.set_phase(Phase::InputRepoUrl);
            return Vec::new();
        };
        debug!(run_id = %self.run_id, "repository URL taken from environment");
        self.params.repo_url = url;

        let Some(repo) = self.repo_override.clone() else {
            self.set_phase(Phase::InputRepo);
            return Vec::new();
        };
        debug!(run_id = %self.run_id, "repository name taken from environment");
        self.params.repo = repo;

        self.set_phase(Phase::InputBranch);
        Vec::new()
    }

    fn on_provisioned(&mut self, result: Result<Workspace, RunError>) -> Vec<Effect> {
        match result {
            Ok(workspace) => {
                info!(run_id = %self.run_id, path = %workspace.dirs.root.display(), "branch directories ready");
                self.dirs = Some(workspace.dirs);
                self.editor = TextBuffer::new(workspace.instructions);
                self.set_phase(Phase::EditInstructions);
                Vec::new()
            }
            Err(err) => self.fail(&err),
        }
    }

    fn on_saved(&mut self, result: Result<(), RunError>) -> Vec<Effect> {
        match result {
            Ok(()) => {
                self.set_phase(Phase::Confirm);
                Vec::new()
            }
            Err(err) => self.fail(&err),
        }
    }

    fn on_launched(&mut self, result: Result<Launched, RunError>) -> Vec<Effect> {
        match result {
            Ok(Launched { output, control }) => {
                info!(run_id = %self.run_id, branch = %self.params.branch, "container running");
                self.control = Some(control);
                self.elapsed = Duration::ZERO;
                self.set_phase(Phase::Running);
                vec![Effect::ArmTick, Effect::PullOutput(output)]
            }
            Err(err) => self.fail(&err),
        }
    }

    fn on_output(&mut self, event: OutputEvent) -> Vec<Effect> {
        match event {
            OutputEvent::Line(line, stream) => {
                self.logs.push(line);
                vec![Effect::PullOutput(stream)]
            }
            OutputEvent::Closed(outcome) => {
                self.control = None;
                match outcome.error_message() {
                    Some(message) => {
                        warn!(run_id = %self.run_id, outcome = ?outcome, elapsed_sec = self.elapsed.as_secs(), "container exited with error");
                        self.error = Some(message);
                    }
                    None => {
                        info!(run_id = %self.run_id, elapsed_sec = self.elapsed.as_secs(), "container finished");
                    }
                }
                self.set_phase(Phase::Done);
                Vec::new()
            }
        }
    }

    /// Path of the instructions file, once directories exist.
    pub fn instructions_path(&self) -> Option<PathBuf> {
        self.dirs.as_ref().map(BranchDirs::instructions_path)
    }
}

/// Typed text if any, else the default; `None` if both are empty.
fn resolve(typed: String, default: &str) -> Option<String> {
    if !typed.is_empty() {
        return Some(typed);
    }
    let default = default.trim();
    (!default.is_empty()).then(|| default.to_string())
}
