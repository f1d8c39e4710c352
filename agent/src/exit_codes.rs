//! Stable exit codes for agent CLI commands.

/// Command succeeded, or the interactive session reached end of input.
pub const OK: i32 = 0;
/// Command failed due to invalid config, arguments, or other errors.
pub const INVALID: i32 = 1;
/// Ctrl-C with no run in flight.
pub const INTERRUPTED: i32 = 130;
