//! Git and identity lookups used to compute input defaults.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("failed to resolve current user: {0}")]
    User(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Top-level directory of the repository containing `dir`.
pub fn repo_root(dir: &Path) -> Result<PathBuf> {
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(dir)
        .output()?;

    if !output.status.success() {
        return Err(GitError::NotARepo(dir.display().to_string()));
    }

    let root = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(PathBuf::from(root.trim()))
}

/// URL of the `origin` remote.
pub fn origin_url(dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(dir)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(stderr.trim().to_string()));
    }

    let url = String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)?;
    Ok(url.trim().to_string())
}

/// Default repository URL: the `origin` remote, or empty if there is none.
pub fn default_repo_url(dir: &Path) -> String {
    origin_url(dir).unwrap_or_default()
}

/// Final path component of `dir`, used as the default repository name.
pub fn folder_name(dir: &Path) -> String {
    dir.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Login name of the user running the process.
pub fn current_username() -> Result<String> {
    let uid = nix::unistd::getuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(GitError::User(format!("no passwd entry for uid {uid}"))),
        Err(errno) => Err(GitError::User(errno.to_string())),
    }
}
