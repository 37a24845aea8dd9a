//! Tracing setup for the CLI.
//!
//! Diagnostics go to stderr and are controlled by `RUST_LOG`; the agents'
//! product artifacts under `.commitly/logs/` are written unconditionally and
//! never pass through this subscriber.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Quiet by default: only `warn` and above
/// unless `RUST_LOG` says otherwise (e.g. `RUST_LOG=commitly=debug` to watch
/// agent dispatch and git traffic).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
