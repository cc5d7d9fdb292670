//! Settings for the summoning tool.
//!
//! Read from `~/.config/homun/config.yml` on every platform.
//! A missing file is not an error: every field has a default, and empty
//! usernames fall back to the local system user.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default base URL for GitHub.
pub const DEFAULT_GITHUB_BASE_URL: &str = "https://github.com";
/// Default base URL for Gitea.
pub const DEFAULT_GITEA_BASE_URL: &str = "https://gitea.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Identity on one hosting platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub username: String,
    pub base_url: String,
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub github: HostConfig,
    pub gitea: HostConfig,
}

impl Config {
    /// Defaults for a given system user.
    pub fn defaults_for(system_username: &str) -> Self {
        let mut config = Self::default();
        config.apply_defaults(system_username);
        config
    }

    /// Default settings path: `~/.config/homun/config.yml`.
    /// The same location on every platform, macOS included.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("homun").join("config.yml"))
    }

    /// Load settings from `path`, or return defaults if it does not exist.
    pub fn load_or_default(path: &Path, system_username: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::defaults_for(system_username));
        }
        Self::from_file(path, system_username)
    }

    /// Load settings from a file that must exist, filling blanks with defaults.
    pub fn from_file(path: &Path, system_username: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_defaults(system_username);
        Ok(config)
    }

    fn parse(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // An empty document deserializes to `null`; treat it as all-defaults.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Fill in any empty field.
    fn apply_defaults(&mut self, system_username: &str) {
        if self.github.username.is_empty() {
            self.github.username = system_username.to_string();
        }
        if self.github.base_url.is_empty() {
            self.github.base_url = DEFAULT_GITHUB_BASE_URL.to_string();
        }
        if self.gitea.username.is_empty() {
            self.gitea.username = system_username.to_string();
        }
        if self.gitea.base_url.is_empty() {
            self.gitea.base_url = DEFAULT_GITEA_BASE_URL.to_string();
        }
    }

    /// Whether a remote URL points at the configured Gitea host.
    pub fn is_gitea_url(&self, repo_url: &str) -> bool {
        repo_url.contains("gitea")
            || (!self.gitea.base_url.is_empty() && repo_url.contains(&self.gitea.base_url))
    }

    /// Default `<owner>/<name>` identifier for a repository.
    ///
    /// The owner is the username for whichever host the URL points at;
    /// GitHub wins when the host cannot be told apart.
    pub fn repo_name(&self, repo_url: &str, folder_name: &str) -> String {
        let owner = if repo_url.contains("github.com") {
            &self.github.username
        } else if self.is_gitea_url(repo_url) {
            &self.gitea.username
        } else {
            &self.github.username
        };
        format!("{owner}/{folder_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_config() -> Config {
        Config {
            github: HostConfig {
                username: "ghuser".to_string(),
                base_url: DEFAULT_GITHUB_BASE_URL.to_string(),
            },
            gitea: HostConfig {
                username: "teauser".to_string(),
                base_url: "https://gitea.example.com".to_string(),
            },
        }
    }

    #[test]
    fn default_path_is_under_home_dot_config() {
        let path = Config::default_path().unwrap();
        assert!(path.starts_with(dirs::home_dir().unwrap()));
        assert!(path.ends_with(".config/homun/config.yml"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("homun/config.yml");

        let config = Config::load_or_default(&path, "alice").unwrap();
        assert_eq!(config, Config::defaults_for("alice"));
        assert_eq!(config.github.username, "alice");
        assert_eq!(config.github.base_url, DEFAULT_GITHUB_BASE_URL);
        assert_eq!(config.gitea.username, "alice");
        assert_eq!(config.gitea.base_url, DEFAULT_GITEA_BASE_URL);
    }

    #[test]
    fn loads_values_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "github:\n  username: testuser\n  base_url: https://github.com\n\n\
             gitea:\n  username: giteauser\n  base_url: https://gitea.example.com\n",
        )
        .unwrap();

        let config = Config::load_or_default(&path, "alice").unwrap();
        assert_eq!(config.github.username, "testuser");
        assert_eq!(config.gitea.username, "giteauser");
        assert_eq!(config.gitea.base_url, "https://gitea.example.com");
    }

    #[test]
    fn partial_file_is_filled_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "gitea:\n  username: giteauser\n").unwrap();

        let config = Config::from_file(&path, "alice").unwrap();
        assert_eq!(config.github.username, "alice");
        assert_eq!(config.github.base_url, DEFAULT_GITHUB_BASE_URL);
        assert_eq!(config.gitea.username, "giteauser");
        assert_eq!(config.gitea.base_url, DEFAULT_GITEA_BASE_URL);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "\n").unwrap();

        let config = Config::from_file(&path, "bob").unwrap();
        assert_eq!(config, Config::defaults_for("bob"));
    }

    #[test]
    fn invalid_yaml_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "github: [not, a, map").unwrap();

        let err = Config::from_file(&path, "alice").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.yml"));
    }

    #[test]
    fn repo_name_picks_owner_by_host() {
        let config = sample_config();

        assert_eq!(
            config.repo_name("git@github.com:someone/proj.git", "proj"),
            "ghuser/proj"
        );
        assert_eq!(
            config.repo_name("https://gitea.internal/org/proj.git", "proj"),
            "teauser/proj"
        );
        assert_eq!(
            config.repo_name("https://gitea.example.com/org/proj", "proj"),
            "teauser/proj"
        );
        // Unknown host falls back to the GitHub identity.
        assert_eq!(
            config.repo_name("https://gitlab.com/org/proj", "proj"),
            "ghuser/proj"
        );
        assert_eq!(config.repo_name("", "proj"), "ghuser/proj");
    }
}
