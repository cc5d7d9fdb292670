//! Event loop and effect executor.
//!
//! One task owns the [`App`]. It waits on terminal events and on messages
//! from background work, applies each through [`App::update`], carries out
//! the resulting effects, and redraws. Anything that blocks runs on another
//! task and reports back over an unbounded channel.

use crate::app::{App, Effect, Msg, RunError, Workspace};
use crate::docker::{self, ContainerSpec, LaunchMode};
use crate::preflight::{self, DockerCli, ImageRegistry};
use crate::provision::Provisioner;
use crate::view;
use crossterm::cursor::Show;
use crossterm::event::{Event, EventStream};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use futures_util::{Stream, StreamExt};
use homun_core::instructions;
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use std::collections::VecDeque;
use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Interval between [`Msg::Tick`]s while running.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// How long quitting waits for a cancelled container to be reaped.
/// Covers the launcher's stop command and SIGTERM grace with room for SIGKILL.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("terminal error: {0}")]
    Terminal(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Environment lookup used by preflight checks.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// External collaborators used by effects.
pub struct Services {
    pub registry: Arc<dyn ImageRegistry>,
    pub env: EnvLookup,
    pub provisioner: Provisioner,
    /// Container CLI to launch.
    pub container_program: String,
}

impl Services {
    /// The real docker CLI, process environment, and `homun` group.
    pub fn system() -> Self {
        Self {
            registry: Arc::new(DockerCli),
            env: Arc::new(preflight::process_env),
            provisioner: Provisioner::default(),
            container_program: "docker".to_string(),
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("provisioner", &self.provisioner)
            .field("container_program", &self.container_program)
            .finish_non_exhaustive()
    }
}

/// Why the loop ended.
#[derive(Debug)]
pub enum Exit {
    Quit,
    /// Run the container attached to the terminal after it is restored.
    Handoff(ContainerSpec),
}

enum Flow {
    Continue,
    Exit(Exit),
}

/// Carries out effects, reporting results as messages.
struct Executor {
    services: Arc<Services>,
    tx: mpsc::UnboundedSender<Msg>,
}

impl Executor {
    async fn execute(&self, effect: Effect) -> Flow {
        match effect {
            Effect::Validate => {
                let services = Arc::clone(&self.services);
                self.blocking(Msg::Validated, move || {
                    preflight::check(services.registry.as_ref(), |name| (services.env)(name))?;
                    Ok(())
                });
            }
            Effect::Provision {
                repo_root,
                branch,
                issue,
            } => {
                let services = Arc::clone(&self.services);
                self.blocking(Msg::Provisioned, move || {
                    let dirs = services.provisioner.provision(&repo_root, &branch)?;
                    let instructions =
                        instructions::load(&dirs.instructions_path(), issue.as_deref())?;
                    Ok(Workspace { dirs, instructions })
                });
            }
            Effect::SaveInstructions { path, content } => {
                self.blocking(Msg::InstructionsSaved, move || {
                    instructions::save(&path, &content)?;
                    Ok(())
                });
            }
            Effect::Launch(spec) => {
                let spec = spec.with_program(self.services.container_program.clone());
                let result = docker::launch_captured(
                    spec.command(LaunchMode::Captured),
                    spec.program(),
                    Some(spec.kill_command()),
                )
                .map_err(RunError::from);
                self.send(Msg::Launched(result));
            }
            Effect::ArmTick => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(TICK_INTERVAL).await;
                    let _ = tx.send(Msg::Tick);
                });
            }
            Effect::PullOutput(stream) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let event = stream.next().await;
                    let _ = tx.send(Msg::Output(event));
                });
            }
            Effect::Shutdown(control) => control.shutdown(SHUTDOWN_GRACE).await,
            Effect::Handoff(spec) => {
                let spec = spec.with_program(self.services.container_program.clone());
                return Flow::Exit(Exit::Handoff(spec));
            }
            Effect::Quit => return Flow::Exit(Exit::Quit),
        }
        Flow::Continue
    }

    /// Run `work` on the blocking pool and deliver its result as `into_msg`.
    fn blocking<T, F>(&self, into_msg: fn(std::result::Result<T, RunError>) -> Msg, work: F)
    where
        T: Send + 'static,
        F: FnOnce() -> std::result::Result<T, RunError> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(work)
                .await
                .unwrap_or_else(|err| Err(RunError::Task(err.to_string())));
            let _ = tx.send(into_msg(result));
        });
    }

    fn send(&self, msg: Msg) {
        if self.tx.send(msg).is_err() {
            warn!("event loop gone; dropping message");
        }
    }
}

/// Map a terminal event to a message, if it is one the app cares about.
fn translate(event: Event) -> Option<Msg> {
    match event {
        Event::Key(key) => Some(Msg::Key(key)),
        Event::Resize(..) => Some(Msg::Resize),
        _ => None,
    }
}

/// Run the loop against an arbitrary event source and renderer.
///
/// `draw` is called after every batch of effects. The loop ends on a quit
/// or handoff effect, or when `events` is exhausted.
pub async fn drive<S, D>(app: &mut App, services: Services, events: S, mut draw: D) -> Result<Exit>
where
    S: Stream<Item = io::Result<Event>>,
    D: FnMut(&App) -> io::Result<()>,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let executor = Executor {
        services: Arc::new(services),
        tx,
    };
    let mut events = std::pin::pin!(events);
    let mut pending: VecDeque<Effect> = app.init().into();

    loop {
        while let Some(effect) = pending.pop_front() {
            if let Flow::Exit(exit) = executor.execute(effect).await {
                debug!(run_id = %app.run_id(), phase = app.phase().as_str(), exit = ?exit, "event loop exiting");
                return Ok(exit);
            }
        }
        draw(app)?;

        let msg = tokio::select! {
            Some(msg) = rx.recv() => msg,
            event = events.next() => match event {
                Some(Ok(event)) => match translate(event) {
                    Some(msg) => msg,
                    None => continue,
                },
                Some(Err(err)) => return Err(err.into()),
                None => {
                    debug!("terminal event stream ended");
                    pending.extend(app.input_closed());
                    continue;
                }
            },
        };
        pending.extend(app.update(msg));
    }
}

/// Run the app in the terminal until it quits or hands off.
pub async fn run(app: &mut App, services: Services) -> Result<Exit> {
    let mut session = TerminalSession::enter()?;
    drive(app, services, EventStream::new(), |app| {
        session
            .terminal
            .draw(|frame| view::render(app, frame))
            .map(|_| ())
    })
    .await
}

/// Raw mode plus the alternate screen, restored on drop.
struct TerminalSession {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalSession {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        if let Err(err) = execute!(stdout, EnterAlternateScreen) {
            let _ = disable_raw_mode();
            return Err(err);
        }
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        terminal.clear()?;
        Ok(Self { terminal })
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen, Show);
    }
}
