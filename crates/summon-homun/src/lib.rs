//! summon-homun - launches a Homunculus agent container for one branch.
//!
//! Validates the host, collects the repository and branch to work on,
//! prepares `<repo-root>/.homun/branches/<branch>`, and runs the agent
//! container while streaming its output into a terminal UI.

pub mod app;
pub mod docker;
pub mod git;
pub mod issue;
pub mod mux;
pub mod preflight;
pub mod provision;
pub mod runtime;
pub mod view;

pub use app::{App, Startup};
pub use runtime::{Exit, Services};
