//! Error types for bulk operations.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The pipeline step an I/O failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Creating a destination or staging table.
    CreateTable,
    /// Streaming rows through the bulk-copy channel.
    BulkCopy,
    /// Adding a primary key constraint after the load.
    CreatePrimaryKey,
    /// Executing the set-based MERGE.
    Merge,
    /// Dropping a staging table.
    DropTable,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::CreateTable => "create table",
            Step::BulkCopy => "bulk copy",
            Step::CreatePrimaryKey => "create primary key",
            Step::Merge => "merge",
            Step::DropTable => "drop table",
        };
        f.write_str(name)
    }
}

/// Main error type for bulk operations.
#[derive(Error, Debug)]
pub enum BulkError {
    /// Invalid property/navigation selection, missing key set, invalid options.
    /// Always raised before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Destination table or column is missing or does not accept the bound columns.
    #[error("Destination schema error on {table} during {step}: {message}")]
    DestinationSchema {
        table: String,
        step: Step,
        message: String,
    },

    /// A row value could not be resolved; the stream is aborted.
    #[error("Row mapping failed for {table} at row {row}, property '{property}': {message}")]
    RowMapping {
        table: String,
        row: usize,
        property: String,
        message: String,
    },

    /// Staging table name is already taken in this session.
    #[error("Table {table} already exists")]
    DuplicateTable { table: String },

    /// TDS transport or statement failure.
    #[error("Database error on {table} during {step}: {source}")]
    Database {
        table: String,
        step: Step,
        #[source]
        source: tiberius::error::Error,
    },

    /// Statement failure reported by a non-TDS backend.
    #[error("Statement failed on {table} during {step}: {message}")]
    Statement {
        table: String,
        step: Step,
        message: String,
    },

    /// The step did not finish within the configured timeout.
    #[error("Timed out on {table} during {step} after {after:?}")]
    Timeout {
        table: String,
        step: Step,
        after: Duration,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation on {table} cancelled during {step}")]
    Cancelled { table: String, step: Step },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Connection-level TDS error outside of a pipeline step.
    #[error("Connection error: {0}")]
    Connection(#[from] tiberius::error::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl BulkError {
    /// Create a Configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        BulkError::Configuration(message.into())
    }

    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl fmt::Display, context: impl Into<String>) -> Self {
        BulkError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Statement error.
    pub fn statement(table: impl Into<String>, step: Step, message: impl Into<String>) -> Self {
        BulkError::Statement {
            table: table.into(),
            step,
            message: message.into(),
        }
    }

    /// Create a DestinationSchema error.
    pub fn destination_schema(
        table: impl Into<String>,
        step: Step,
        message: impl Into<String>,
    ) -> Self {
        BulkError::DestinationSchema {
            table: table.into(),
            step,
            message: message.into(),
        }
    }

    /// Table the failure is attributed to, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            BulkError::DestinationSchema { table, .. }
            | BulkError::RowMapping { table, .. }
            | BulkError::DuplicateTable { table }
            | BulkError::Database { table, .. }
            | BulkError::Statement { table, .. }
            | BulkError::Timeout { table, .. }
            | BulkError::Cancelled { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Step the failure happened in, if any.
    pub fn step(&self) -> Option<Step> {
        match self {
            BulkError::DestinationSchema { step, .. }
            | BulkError::Database { step, .. }
            | BulkError::Statement { step, .. }
            | BulkError::Timeout { step, .. }
            | BulkError::Cancelled { step, .. } => Some(*step),
            BulkError::RowMapping { .. } => Some(Step::BulkCopy),
            _ => None,
        }
    }

    /// Whether the caller may reasonably retry the whole operation.
    ///
    /// The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            BulkError::Database { source, .. } | BulkError::Connection(source) => {
                source.is_deadlock()
            }
            BulkError::DuplicateTable { .. } | BulkError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for bulk operations.
pub type Result<T> = std::result::Result<T, BulkError>;
