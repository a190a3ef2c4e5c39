//! Structured logging setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global `tracing` subscriber. `debug` forces a verbose
/// default filter when `RUST_LOG` is unset; otherwise `RUST_LOG` wins.
pub fn init(debug: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
