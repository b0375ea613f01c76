//! Structured JSON logging

use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Install the process-wide JSON subscriber on stdout
///
/// The filter comes from `service.log_level` and falls back to `info` when it
/// does not parse. Fails if a global subscriber is already installed.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.service.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize tracing: {}", e)))?;

    tracing::info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "Tracing initialized"
    );

    Ok(())
}

/// Flush buffered log output before exit
pub fn shutdown_tracing() {
    use std::io::Write;

    tracing::info!("Tracing shutdown");
    let _ = std::io::stdout().flush();
}
