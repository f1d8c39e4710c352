//! Autonomous coding agent.
//!
//! A chat model is driven in a loop: each reply is scanned for bracketed
//! directives (run a shell command, write, append, or merge a file), the
//! directives are executed inside a working directory, and their outcomes
//! are fed back as the next turn. The layout keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (conversation model, context
//!   window policies, directive parsing, edit scripts, patching).
//! - **[`io`]**: Side effects (configuration, execution sessions, model
//!   transports, workspace snapshots, persistence).
//!
//! Orchestration modules ([`context`], [`actions`], [`orchestrator`],
//! [`console`]) combine the two into the agent state machine and its
//! interactive front end.

pub mod actions;
pub mod console;
pub mod context;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
