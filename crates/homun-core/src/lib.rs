pub mod branch;
pub mod config;
pub mod editor;
pub mod instructions;
pub mod log_buffer;
pub mod remote;
pub mod types;

pub use config::Config;
pub use editor::TextBuffer;
pub use log_buffer::{LogBuffer, MAX_LOG_LINES};
pub use types::*;
