//! Preflight validation.
//!
//! Runs before any state is touched: the container image must exist
//! locally and every required secret must be present in the environment.
//! Checks run in a fixed order and stop at the first failure.

use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Image the agent runs in.
pub const IMAGE_NAME: &str = "homun-dev";

/// Environment variables that must be set, in the order they are checked.
pub const REQUIRED_ENV_VARS: [&str; 4] = [
    "ANTHROPIC_API_KEY",
    "HOMUNCULUS_SSH_KEY_PRIVATE",
    "HOMUNCULUS_SSH_KEY_PUBLIC",
    "HOMUNCULUS_GITEA_API_KEY",
];

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("failed to check Docker image: {0}")]
    ImageQuery(String),
    #[error("Docker image '{0}' not found. Please build it first")]
    ImageMissing(String),
    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),
}

pub type Result<T> = std::result::Result<T, PreflightError>;

/// Query for locally available container images.
pub trait ImageRegistry: Send + Sync {
    /// Whether `name` is present in the local image store.
    fn image_exists(&self, name: &str) -> Result<bool>;
}

/// Image registry backed by the `docker` CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerCli;

impl ImageRegistry for DockerCli {
    fn image_exists(&self, name: &str) -> Result<bool> {
        let output = Command::new("docker")
            .args([
                "images",
                "--format",
                "{{.Repository}}",
                "--filter",
                &format!("reference={name}"),
            ])
            .output()
            .map_err(|e| PreflightError::ImageQuery(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PreflightError::ImageQuery(stderr.trim().to_string()));
        }

        Ok(listing_contains(&String::from_utf8_lossy(&output.stdout), name))
    }
}

/// Whether a `docker images --format {{.Repository}}` listing names `image`.
fn listing_contains(listing: &str, image: &str) -> bool {
    listing.lines().any(|line| line.trim() == image)
}

/// Run all preflight checks.
///
/// `env` looks up a variable; unset and empty values both count as missing.
pub fn check<R, F>(registry: &R, env: F) -> Result<()>
where
    R: ImageRegistry + ?Sized,
    F: Fn(&str) -> Option<String>,
{
    debug!(image = IMAGE_NAME, "checking container image");
    if !registry.image_exists(IMAGE_NAME)? {
        return Err(PreflightError::ImageMissing(IMAGE_NAME.to_string()));
    }

    for var in REQUIRED_ENV_VARS {
        if env(var).filter(|value| !value.is_empty()).is_none() {
            return Err(PreflightError::MissingEnv(var));
        }
    }

    info!("preflight checks passed");
    Ok(())
}

/// Environment lookup against the real process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
