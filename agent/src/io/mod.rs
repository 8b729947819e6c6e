//! Side-effecting helpers: config, workspace files, prompts, processes.

pub mod background;
pub mod config;
pub mod paths;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod transcript;
