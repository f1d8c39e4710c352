//! I/O helpers for the agent.

pub mod config;
pub mod files;
pub mod history_store;
pub mod merge;
pub mod model;
pub mod process;
pub mod prompt;
pub mod session;
pub mod workspace;
