//! Configuration type definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tiberius::{AuthMethod, EncryptionLevel};

use crate::options::{
    BulkInsertOptions, MssqlUpsertOptions, PrimaryKeyTiming, StagingTableOptions, UpsertOptions,
};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SQL Server connection.
    pub connection: ConnectionConfig,

    /// Defaults applied to bulk operations.
    #[serde(default)]
    pub bulk: BulkDefaults,
}

/// SQL Server connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    pub password: String,

    /// "disable" turns encryption off; anything else requires it (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// Trust the server certificate without validation (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl ConnectionConfig {
    /// Build the tiberius client configuration.
    pub fn tiberius_config(&self) -> tiberius::Config {
        let mut config = tiberius::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);
        config.authentication(AuthMethod::sql_server(&self.user, &self.password));

        match self.ssl_mode.to_lowercase().as_str() {
            "disable" => {
                config.encryption(EncryptionLevel::NotSupported);
            }
            _ => {
                config.encryption(EncryptionLevel::Required);
            }
        }
        if self.trust_server_cert {
            config.trust_cert();
        }

        config
    }
}

/// Defaults for bulk operations, turned into per-call options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDefaults {
    /// Rows per bulk-copy batch; unset sends a single batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Bulk-copy timeout in seconds; unset waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Resolve values while sending (default: true).
    #[serde(default = "default_true")]
    pub enable_streaming: bool,

    /// Add HOLDLOCK to MERGE statements (default: true).
    #[serde(default = "default_true")]
    pub hold_lock: bool,

    /// When staging tables get their primary key (default: after_bulk_insert).
    #[serde(default)]
    pub primary_key_timing: PrimaryKeyTiming,

    /// Prefix of generated staging table names (default: "bulk_").
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,
}

impl Default for BulkDefaults {
    fn default() -> Self {
        Self {
            batch_size: None,
            timeout_secs: None,
            enable_streaming: true,
            hold_lock: true,
            primary_key_timing: PrimaryKeyTiming::default(),
            staging_prefix: default_staging_prefix(),
        }
    }
}

impl BulkDefaults {
    pub fn insert_options(&self) -> BulkInsertOptions {
        BulkInsertOptions {
            batch_size: self.batch_size,
            timeout: self.timeout_secs.map(Duration::from_secs),
            enable_streaming: self.enable_streaming,
            ..Default::default()
        }
    }

    pub fn staging_options(&self) -> StagingTableOptions {
        StagingTableOptions {
            prefix: self.staging_prefix.clone(),
            primary_key_timing: self.primary_key_timing,
            ..Default::default()
        }
    }

    /// Widen `selection` with these defaults.
    pub fn upsert_options(&self, selection: UpsertOptions) -> MssqlUpsertOptions {
        let mut options = MssqlUpsertOptions::from(selection).with_hold_lock(self.hold_lock);
        options.copy = self.insert_options();
        options.staging = self.staging_options();
        options
    }
}

// Default value functions for serde
fn default_mssql_port() -> u16 {
    1433
}

fn default_require() -> String {
    "require".to_string()
}

fn default_pool_size() -> u32 {
    4
}

fn default_staging_prefix() -> String {
    "bulk_".to_string()
}

fn default_true() -> bool {
    true
}
