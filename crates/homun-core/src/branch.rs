//! Branch name rules.
//!
//! The branch name becomes a directory under `.homun/branches/` and is
//! passed into the container, so only a conservative character set is
//! accepted.

/// Message shown when a branch name is rejected.
pub const INVALID_BRANCH_MESSAGE: &str =
    "Branch name must contain only alphanumeric characters, hyphens, or underscores";

/// Check a branch name: one or more ASCII letters, digits, `-` or `_`.
pub fn is_valid_branch_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
