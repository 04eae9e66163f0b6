//! Per-call option values.
//!
//! Options are immutable snapshots handed to one call. The plain
//! [`UpsertOptions`] carry only the selectors and widen into the SQL Server
//! specific [`MssqlUpsertOptions`] through a single `From` conversion.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BulkError, Result};
use crate::hints::{validate_merge_hints, TableHint};
use crate::mapping::PropertySelector;
use crate::sql::{validate_identifier, MAX_TEMP_TABLE_NAME_LENGTH};
use crate::staging::MAX_STAGING_PREFIX_LENGTH;

/// Options of a plain bulk load.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkInsertOptions {
    pub properties: PropertySelector,
    /// Rows per `INSERT BULK` batch; `None` sends a single batch.
    pub batch_size: Option<usize>,
    /// Upper bound for the whole transfer.
    pub timeout: Option<Duration>,
    /// Resolve values while sending. When off, each batch is resolved fully
    /// before its first row goes out.
    pub enable_streaming: bool,
}

impl Default for BulkInsertOptions {
    fn default() -> Self {
        Self {
            properties: PropertySelector::All,
            batch_size: None,
            timeout: None,
            enable_streaming: true,
        }
    }
}

impl BulkInsertOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == Some(0) {
            return Err(BulkError::config("batch_size must be greater than 0"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(BulkError::config("timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// When the staging table gets its primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKeyTiming {
    /// No primary key at all.
    None,
    /// Declared in the CREATE TABLE statement.
    BeforeBulkInsert,
    /// Added once the rows are loaded.
    #[default]
    AfterBulkInsert,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StagingTableName {
    /// `#<prefix><table>_<uuid>`, unique per call.
    #[default]
    Generated,
    /// Caller-chosen name; `#` is prepended when missing.
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTableOptions {
    pub name: StagingTableName,
    pub prefix: String,
    pub primary_key_timing: PrimaryKeyTiming,
    /// Drop an existing table with the custom name instead of failing.
    pub drop_if_exists: bool,
    /// Create the table with the insert column set only.
    pub use_insert_columns: bool,
}

impl Default for StagingTableOptions {
    fn default() -> Self {
        Self {
            name: StagingTableName::Generated,
            prefix: "bulk_".to_string(),
            primary_key_timing: PrimaryKeyTiming::AfterBulkInsert,
            drop_if_exists: false,
            use_insert_columns: false,
        }
    }
}

impl StagingTableOptions {
    pub fn validate(&self) -> Result<()> {
        if self.prefix.contains(['#', '\0']) {
            return Err(BulkError::config(format!(
                "Invalid staging table prefix {:?}",
                self.prefix
            )));
        }
        if self.prefix.chars().count() > MAX_STAGING_PREFIX_LENGTH {
            return Err(BulkError::config(format!(
                "Staging table prefix exceeds {} characters: {:?}",
                MAX_STAGING_PREFIX_LENGTH, self.prefix
            )));
        }
        if let StagingTableName::Custom(name) = &self.name {
            validate_identifier(name)?;
            if name.trim_start_matches('#').is_empty() {
                return Err(BulkError::config("Staging table name cannot be empty"));
            }
            if name.chars().count() > MAX_TEMP_TABLE_NAME_LENGTH {
                return Err(BulkError::config(format!(
                    "Staging table name exceeds {} characters: {:?}",
                    MAX_TEMP_TABLE_NAME_LENGTH, name
                )));
            }
        }
        Ok(())
    }
}

/// Bulk load into a staging table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingBulkInsertOptions {
    pub copy: BulkInsertOptions,
    pub staging: StagingTableOptions,
}

impl StagingBulkInsertOptions {
    pub fn validate(&self) -> Result<()> {
        self.copy.validate()?;
        self.staging.validate()
    }
}

/// Provider-neutral upsert selectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertOptions {
    pub insert: PropertySelector,
    pub update: PropertySelector,
    /// Defaults to the primary key.
    pub key: PropertySelector,
}

/// SQL Server upsert options.
#[derive(Debug, Clone, PartialEq)]
pub struct MssqlUpsertOptions {
    pub insert: PropertySelector,
    pub update: PropertySelector,
    pub key: PropertySelector,
    /// Hints on the MERGE target. `HOLDLOCK` by default.
    pub merge_table_hints: Vec<TableHint>,
    pub staging: StagingTableOptions,
    /// Options of the staging load. `properties` is ignored; the staging
    /// columns come from the insert, update and key selectors.
    pub copy: BulkInsertOptions,
    /// Insert caller-supplied values into identity columns.
    pub keep_identity: bool,
}

impl Default for MssqlUpsertOptions {
    fn default() -> Self {
        Self::from(UpsertOptions::default())
    }
}

impl From<UpsertOptions> for MssqlUpsertOptions {
    fn from(options: UpsertOptions) -> Self {
        Self {
            insert: options.insert,
            update: options.update,
            key: options.key,
            merge_table_hints: vec![TableHint::HoldLock],
            staging: StagingTableOptions::default(),
            copy: BulkInsertOptions::default(),
            keep_identity: false,
        }
    }
}

impl MssqlUpsertOptions {
    /// Add or remove `HOLDLOCK`; idempotent.
    pub fn with_hold_lock(mut self, hold_lock: bool) -> Self {
        let present = self.merge_table_hints.contains(&TableHint::HoldLock);
        if hold_lock && !present {
            self.merge_table_hints.push(TableHint::HoldLock);
        } else if !hold_lock {
            self.merge_table_hints.retain(|h| *h != TableHint::HoldLock);
        }
        self
    }

    pub fn with_hints(mut self, hints: impl IntoIterator<Item = TableHint>) -> Self {
        for hint in hints {
            if !self.merge_table_hints.contains(&hint) {
                self.merge_table_hints.push(hint);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_merge_hints(&self.merge_table_hints)?;
        self.copy.validate()?;
        self.staging.validate()
    }

    /// Options for the staging load.
    pub fn staging_insert_options(&self) -> StagingBulkInsertOptions {
        StagingBulkInsertOptions {
            copy: self.copy.clone(),
            staging: self.staging.clone(),
        }
    }
}
