//! Subscriber setup for binaries and tests embedding the generator

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding the filter directives, e.g.
/// `taskgraph_core=debug`
pub const LOG_ENV: &str = "TASKGRAPH_LOG";

/// Install a fmt subscriber filtered by `TASKGRAPH_LOG`, or by
/// `default_filter` when the variable is unset or invalid.
///
/// Returns false if a global subscriber was already installed.
pub fn init_logging(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .try_init()
        .is_ok()
}
