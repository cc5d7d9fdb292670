//! summon-homun - interactive launcher for the Homunculus agent container.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::{Result, WrapErr};
use homun_core::{Config, Phase};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use summon_homun::docker::{self, LaunchMode};
use summon_homun::{git, issue, runtime, App, Exit, Services, Startup};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "summon-homun",
    about = "Summon a Homunculus agent to work on a branch of this repository",
    version
)]
struct Cli {
    /// Seed the instructions with this issue from the repository's host
    #[arg(long)]
    issue: Option<u64>,

    /// Settings file (default: ~/.config/homun/config.yml)
    #[arg(long, env = "HOMUN_CONFIG")]
    config: Option<PathBuf>,

    /// Attach the container to this terminal instead of showing the live log view
    #[arg(long)]
    passthrough: bool,

    /// Write logs here instead of the per-user log directory
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_path = match init_logging(cli.log_file.clone()) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "summon-homun failed");
            eprintln!("error: {err:#}");
            eprintln!("log: {}", log_path.display());
            ExitCode::FAILURE
        }
    }
}

/// Send logs to a file; the terminal belongs to the UI.
fn init_logging(path: Option<PathBuf>) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => default_log_path()?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let file = File::create(&path)
        .wrap_err_with(|| format!("failed to create log file {}", path.display()))?;

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(path)
}

fn default_log_path() -> Result<PathBuf> {
    let dir = dirs::data_local_dir()
        .ok_or_else(|| eyre::eyre!("cannot determine a local data directory for logs"))?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Ok(dir
        .join("homun")
        .join("logs")
        .join(format!("summon-{stamp}.log")))
}

fn load_config(explicit: Option<&Path>, username: &str) -> Result<Config> {
    if let Some(path) = explicit {
        return Config::from_file(path, username).wrap_err("failed to load settings");
    }
    match Config::default_path() {
        Some(path) => Config::load_or_default(&path, username).wrap_err("failed to load settings"),
        None => Ok(Config::defaults_for(username)),
    }
}

/// Non-empty value of an environment variable.
fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cwd = std::env::current_dir().wrap_err("failed to read current directory")?;
    let repo_root =
        git::repo_root(&cwd).wrap_err("summon-homun must be run inside a git repository")?;
    let username = git::current_username()?;
    let config = load_config(cli.config.as_deref(), &username)?;

    let issue = match cli.issue {
        Some(number) => {
            info!(number, "fetching issue");
            let text = issue::fetch_issue(&number.to_string(), &repo_root, &config)
                .wrap_err_with(|| format!("failed to fetch issue #{number}"))?;
            Some(text)
        }
        None => None,
    };

    let startup = Startup {
        repo_root,
        folder_name: git::folder_name(&cwd),
        default_repo_url: git::default_repo_url(&cwd),
        config,
        issue,
        repo_url_override: env_override("HOMUNCULUS_REPO_URL"),
        repo_override: env_override("HOMUNCULUS_REPO"),
        launch_mode: if cli.passthrough {
            LaunchMode::Passthrough
        } else {
            LaunchMode::Captured
        },
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;
    rt.block_on(summon(startup))
}

async fn summon(startup: Startup) -> Result<ExitCode> {
    let mut app = App::new(startup);
    let exit = runtime::run(&mut app, Services::system())
        .await
        .wrap_err("terminal UI failed")?;

    let Exit::Handoff(spec) = exit else {
        return Ok(report(&app));
    };

    println!("Summoning Homunculus on branch {}...", app.params().branch);
    let outcome = docker::run_passthrough(&spec)
        .await
        .wrap_err("failed to launch container")?;
    info!(run_id = %app.run_id(), outcome = ?outcome, "passthrough run finished");
    match outcome.error_message() {
        None => {
            println!("Homunculus completed successfully!");
            Ok(ExitCode::SUCCESS)
        }
        Some(message) => {
            eprintln!("Homunculus exited with error: {message}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Repeat the final state on the restored terminal and pick the exit code.
fn report(app: &App) -> ExitCode {
    match (app.phase(), app.error()) {
        (Phase::Error, Some(err)) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
        (Phase::Done, Some(err)) => {
            eprintln!("Homunculus exited with error: {err}");
            ExitCode::FAILURE
        }
        (Phase::Done, None) => {
            println!("Homunculus completed successfully!");
            ExitCode::SUCCESS
        }
        // Quit before the run finished.
        _ => ExitCode::SUCCESS,
    }
}
