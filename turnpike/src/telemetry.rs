//! Tracing initialization.
//!
//! Sets up `tracing-subscriber` with an env-filter (`RUST_LOG`, defaulting
//! to `info`) and a console fmt layer. Trace export is intentionally not
//! wired here; an external collector can be attached at the process level.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize structured logging for the process.
///
/// Safe to call once; returns an error if a global subscriber is already set.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
