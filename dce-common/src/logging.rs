//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured filter.

use crate::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber
///
/// Calling this more than once is harmless: later calls keep the subscriber
/// that is already installed.
pub fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| Error::Config(format!("Invalid log filter {:?}: {}", default_filter, e)))?,
    };

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
