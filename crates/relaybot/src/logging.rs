//! Logging initialization
//!
//! `RUST_LOG` wins over the default filter. Records emitted through the `log`
//! facade (teloxide, reqwest) are bridged into tracing.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "relaybot=info,relaycore=info,tower_http=warn";

/// Initialize the global tracing subscriber
///
/// # Errors
/// Fails if a global subscriber or `log` logger is already installed.
pub fn init_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;
    tracing_log::LogTracer::init().context("Failed to bridge log records into tracing")?;

    Ok(())
}
