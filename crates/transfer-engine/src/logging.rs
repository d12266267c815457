//! Tracing setup for binaries and tests

use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber. `RUST_LOG` wins when set;
/// `default_directives` covers the rest. Calling it twice is a no-op,
/// so tests can each ask for it.
pub fn init_logging(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
