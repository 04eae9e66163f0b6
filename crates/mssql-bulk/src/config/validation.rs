//! Configuration validation.

use super::Config;
use crate::error::{BulkError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let connection = &config.connection;
    if connection.host.is_empty() {
        return Err(BulkError::config("connection.host is required"));
    }
    if connection.database.is_empty() {
        return Err(BulkError::config("connection.database is required"));
    }
    if connection.user.is_empty() {
        return Err(BulkError::config("connection.user is required"));
    }
    if connection.pool_size == 0 {
        return Err(BulkError::config("connection.pool_size must be at least 1"));
    }

    if let Some(0) = config.bulk.batch_size {
        return Err(BulkError::config("bulk.batch_size must be at least 1"));
    }
    if let Some(0) = config.bulk.timeout_secs {
        return Err(BulkError::config("bulk.timeout_secs must be at least 1"));
    }
    config
        .bulk
        .staging_options()
        .validate()
        .map_err(|e| BulkError::config(format!("bulk.staging_prefix: {}", e)))?;

    Ok(())
}
