//! Fetches an issue's text from the repository's hosting platform so it
//! can be seeded into the instructions file.
//!
//! Uses the platform CLIs (`gh` for GitHub, `tea` for Gitea) rather than
//! talking to the APIs directly, so authentication is whatever the
//! operator already has configured for those tools.

use crate::git;
use homun_core::remote::{self, Host};
use homun_core::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("failed to get git remote URL: {0}")]
    Remote(#[from] git::GitError),
    #[error(transparent)]
    Url(#[from] remote::RemoteError),
    #[error("{program} CLI is not installed. Please install it from {install_url}")]
    CliMissing {
        program: &'static str,
        install_url: &'static str,
    },
    #[error("failed to run {program}: {source}")]
    Execution {
        program: &'static str,
        source: std::io::Error,
    },
    #[error("failed to fetch {host} issue: {status}\nOutput: {output}")]
    CommandFailed {
        host: &'static str,
        status: String,
        output: String,
    },
}

pub type Result<T> = std::result::Result<T, IssueError>;

/// A resolved issue lookup: which CLI to run and with what arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueQuery {
    pub host: Host,
    pub repo: String,
    pub number: String,
}

impl IssueQuery {
    /// Resolve the query for issue `number` of the repository at `repo_root`.
    pub fn resolve(number: &str, repo_root: &Path, config: &Config) -> Result<Self> {
        let url = git::origin_url(repo_root)?;
        Self::for_remote(number, &url, config)
    }

    /// Resolve the query against an explicit remote URL.
    pub fn for_remote(number: &str, url: &str, config: &Config) -> Result<Self> {
        let repo = remote::repo_from_url(url)?;
        let host = Host::detect(url, config)?;
        Ok(Self {
            host,
            repo,
            number: number.to_string(),
        })
    }

    pub fn program(&self) -> &'static str {
        match self.host {
            Host::GitHub => "gh",
            Host::Gitea => "tea",
        }
    }

    fn install_url(&self) -> &'static str {
        match self.host {
            Host::GitHub => "https://cli.github.com/",
            Host::Gitea => "https://gitea.com/gitea/tea",
        }
    }

    fn host_label(&self) -> &'static str {
        match self.host {
            Host::GitHub => "GitHub",
            Host::Gitea => "Gitea",
        }
    }

    /// Arguments for [`IssueQuery::program`].
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "issue".to_string(),
            "view".to_string(),
            self.number.clone(),
            "--repo".to_string(),
            self.repo.clone(),
        ];
        // Only gh can include the discussion in the same call.
        if self.host == Host::GitHub {
            args.push("--comments".to_string());
        }
        args
    }

    /// Run the CLI and return its combined output.
    pub fn fetch(&self) -> Result<String> {
        let program = self.program();
        debug!(program, repo = %self.repo, number = %self.number, "fetching issue");

        let output = Command::new(program)
            .args(self.args())
            .output()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    IssueError::CliMissing {
                        program,
                        install_url: self.install_url(),
                    }
                } else {
                    IssueError::Execution { program, source }
                }
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(IssueError::CommandFailed {
                host: self.host_label(),
                status: output.status.to_string(),
                output: text,
            });
        }

        info!(host = self.host.as_str(), repo = %self.repo, number = %self.number, bytes = text.len(), "issue fetched");
        Ok(text)
    }
}

/// Fetch issue `number` for the repository at `repo_root`.
pub fn fetch_issue(number: &str, repo_root: &Path, config: &Config) -> Result<String> {
    IssueQuery::resolve(number, repo_root, config)?.fetch()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn config() -> Config {
        let mut config = Config::defaults_for("me");
        config.gitea.base_url = "https://git.example.org".to_string();
        config
    }

    #[test]
    fn github_query_includes_comments() {
        let query =
            IssueQuery::for_remote("42", "git@github.com:owner/repo.git", &config()).unwrap();
        assert_eq!(query.host, Host::GitHub);
        assert_eq!(query.program(), "gh");
        assert_eq!(
            query.args(),
            vec!["issue", "view", "42", "--repo", "owner/repo", "--comments"]
        );
    }

    #[test]
    fn gitea_query_uses_tea() {
        let query =
            IssueQuery::for_remote("7", "https://git.example.org/team/tool.git", &config())
                .unwrap();
        assert_eq!(query.host, Host::Gitea);
        assert_eq!(query.program(), "tea");
        assert_eq!(query.args(), vec!["issue", "view", "7", "--repo", "team/tool"]);
    }

    #[test]
    fn unknown_host_is_rejected() {
        let err = IssueQuery::for_remote("1", "https://gitlab.com/a/b.git", &config()).unwrap_err();
        assert!(matches!(
            err,
            IssueError::Url(remote::RemoteError::UnsupportedHost(_))
        ));
    }

    #[test]
    fn unparseable_remote_is_rejected() {
        let err = IssueQuery::for_remote("1", "not a url", &config()).unwrap_err();
        assert!(matches!(
            err,
            IssueError::Url(remote::RemoteError::Unparseable(_))
        ));
    }

    #[test]
    fn repository_without_origin_fails() {
        let dir = TempDir::new().unwrap();
        StdCommand::new("git")
            .arg("init")
            .current_dir(dir.path())
            .output()
            .unwrap();

        let err = fetch_issue("1", dir.path(), &config()).unwrap_err();
        assert!(matches!(err, IssueError::Remote(_)));
    }

    #[test]
    fn missing_cli_message_names_install_location() {
        let err = IssueError::CliMissing {
            program: "gh",
            install_url: "https://cli.github.com/",
        };
        assert_eq!(
            err.to_string(),
            "gh CLI is not installed. Please install it from https://cli.github.com/"
        );
    }
}
