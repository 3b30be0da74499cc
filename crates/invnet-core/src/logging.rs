//! Structured logging with tracing.
//!
//! Library code only emits events; binaries, benches and tests pick one of the
//! subscribers below.

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,invnet_layers=info,invnet_dims=info,invnet_core=info";

/// Initialize JSON logging.
///
/// Reads the filter from RUST_LOG (defaults to info for invnet crates).
/// Returns false when a global subscriber was already installed.
pub fn init_logging() -> bool {
    let installed = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok();
    if installed {
        info!("Structured logging initialized");
    }
    installed
}

/// Initialize human-readable console logging (for benches/debugging).
pub fn init_console_logging() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().pretty())
        .try_init()
        .is_ok()
}
