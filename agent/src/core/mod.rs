//! Deterministic, pure logic shared by the agent.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod conversation;
pub mod directive;
pub mod edit_script;
pub mod patch;
pub mod types;
pub mod window;
