//! Logging initialization and configuration.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the logging system with tracing.
///
/// Sets up tracing-subscriber with environment-based filtering (`RUST_LOG`)
/// and a compact fmt layer. Defaults to `info` globally and `debug` for the
/// ashframe crates when `RUST_LOG` is unset.
///
/// # Example
/// ```
/// ashframe_core::init_logging();
/// tracing::info!("Graphics context initialized");
/// ```
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ashframe_rhi=debug,ashframe_renderer=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}
