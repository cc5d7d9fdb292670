//! The instructions file handed to the agent via the report mount.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Template used when a branch has no instructions yet.
pub const DEFAULT_TEMPLATE: &str = "# Instructions for Homunculus

## Task Description
[Describe what you want Homunculus to accomplish]

## Context
[Provide any relevant context or background information]

## Requirements
[List specific requirements or constraints]

## Expected Output
[Describe what the final result should look like]
";

#[derive(Debug, Error)]
pub enum InstructionsError {
    #[error("failed to read instructions file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write instructions file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, InstructionsError>;

/// Starting text for a fresh instructions file, optionally seeded with an issue.
pub fn initial_text(issue: Option<&str>) -> String {
    match issue.map(str::trim).filter(|s| !s.is_empty()) {
        Some(issue) => format!("{DEFAULT_TEMPLATE}\n## Issue\n{issue}\n"),
        None => DEFAULT_TEMPLATE.to_string(),
    }
}

/// Load existing instructions, or the initial text if the file is absent.
pub fn load(path: &Path, issue: Option<&str>) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(initial_text(issue)),
        Err(source) => Err(InstructionsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write instructions, replacing any previous content.
pub fn save(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).map_err(|source| InstructionsError::Write {
        path: path.to_path_buf(),
        source,
    })
}
