//! Development-time tracing for debugging the agent.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG` when set, else by
//! the `-v` count given on the command line. Model replies and action
//! outcomes are product output: the console prints them to stdout regardless
//! of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "agent=info,warn",
        _ => "agent=debug,info",
    }
}

/// Initialize the tracing subscriber. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=agent::io::session=debug agent run --prompt "list the files"
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity > 1)
                .compact(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_widens_the_default_filter() {
        assert_eq!(default_directive(0), "warn");
        assert!(default_directive(1).contains("agent=info"));
        assert!(default_directive(5).contains("agent=debug"));
    }
}
