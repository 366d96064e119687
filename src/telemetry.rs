//! Tracing subscriber bootstrap, similar to a plain `FmtSubscriber`
//! setup but driven by `RUST_LOG` via `EnvFilter` instead of a
//! hardcoded level.

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Call once from `main`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
