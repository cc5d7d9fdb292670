//! Git remote URL helpers.

use crate::config::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("unable to parse repository from URL: {0}")]
    Unparseable(String),
    #[error("unsupported git hosting platform: {0}")]
    UnsupportedHost(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Hosting platform behind a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    GitHub,
    Gitea,
}

impl Host {
    /// Detect the platform for a remote URL.
    pub fn detect(url: &str, config: &Config) -> Result<Self> {
        if url.contains("github.com") {
            Ok(Self::GitHub)
        } else if config.is_gitea_url(url) {
            Ok(Self::Gitea)
        } else {
            Err(RemoteError::UnsupportedHost(url.to_string()))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Gitea => "gitea",
        }
    }
}

/// Extract `owner/repo` from a remote URL.
///
/// Handles `git@host:owner/repo(.git)` and `http(s)://host/owner/repo(.git)`.
pub fn repo_from_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let stripped = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    if stripped.starts_with("git@") {
        if let Some((_, path)) = stripped.split_once(':') {
            if !path.is_empty() {
                return Ok(path.to_string());
            }
        }
    }

    if let Some(rest) = stripped
        .strip_prefix("https://")
        .or_else(|| stripped.strip_prefix("http://"))
    {
        let parts: Vec<&str> = rest.split('/').filter(|p| !p.is_empty()).collect();
        // host, owner, repo at minimum
        if parts.len() >= 3 {
            return Ok(parts[parts.len() - 2..].join("/"));
        }
    }

    Err(RemoteError::Unparseable(url.to_string()))
}
