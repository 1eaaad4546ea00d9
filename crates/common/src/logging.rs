//! Logging setup and configuration
//!
//! Device loops and the broker dispatcher run on named OS threads, so the
//! thread name is included in every line.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Build the level filter, preferring `RUST_LOG` over `default_level`
pub fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

/// Setup tracing subscriber for the application
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = build_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))
}
