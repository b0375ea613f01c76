//! Database connection pool management

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::{
    config::DatabaseConfig,
    error::{sanitize_url, DatabaseError, Result},
};

/// Create a PostgreSQL connection pool (single attempt)
///
/// Connection failures are returned to the caller; startup decides whether to
/// give up.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| {
            tracing::error!(
                url = %sanitize_url(&config.url),
                category = categorize_db_error(&e),
                "Failed to connect to database: {}",
                e
            );
            DatabaseError::connection_failed(format!(
                "{} at '{}': {}",
                categorize_db_error(&e),
                sanitize_url(&config.url),
                e
            ))
        })?;

    tracing::info!(
        max = config.max_connections,
        min = config.min_connections,
        "Database connection pool created"
    );
    Ok(pool)
}

/// Categorize a connection error for operator guidance
fn categorize_db_error(err: &sqlx::Error) -> &'static str {
    use sqlx::Error;
    match err {
        Error::Configuration(_) => "Configuration error",
        Error::Database(_) => "Database query error",
        Error::Io(_) => "Network I/O error - check connectivity",
        Error::Tls(_) => "TLS/SSL error - check certificate configuration",
        Error::PoolTimedOut => "Connection pool timeout - database may be overloaded",
        Error::PoolClosed => "Connection pool closed",
        Error::WorkerCrashed => "Database worker crashed",
        _ => "Connection error",
    }
}
