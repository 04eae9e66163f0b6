//! Transport seam between the pipeline and a destination database.
//!
//! Everything that performs I/O goes through [`BulkConnection`]. The
//! connection is borrowed for the duration of a call: implementations never
//! open, close, commit or roll back anything on their own.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BulkError, Result, Step};
use crate::hints::TableHint;
use crate::options::BulkInsertOptions;
use crate::reader::RowReader;
use crate::shape::TableName;
use crate::value::SqlValue;

/// Column of a table created by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: String,
    pub nullable: bool,
    pub identity: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable,
            identity: false,
        }
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self.nullable = false;
        self
    }
}

/// Table to create; a non-empty `primary_key` is declared inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub table: TableName,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<String>,
}

/// `OUTPUT` clause of a MERGE: the source ordinal plus the inserted key
/// values of every affected row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutput {
    pub ordinal_column: String,
    pub key_columns: Vec<String>,
}

/// One set-based insert-or-update from `source` into `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeStatement {
    pub target: TableName,
    pub source: TableName,
    pub key_columns: Vec<String>,
    pub insert_columns: Vec<String>,
    /// Empty means matched rows are left alone.
    pub update_columns: Vec<String>,
    pub hints: Vec<TableHint>,
    /// Wrap the statement in `SET IDENTITY_INSERT ON/OFF`.
    pub identity_insert: bool,
    pub output: Option<MergeOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Insert,
    Update,
}

impl MergeAction {
    /// Parse the `$action` column of a MERGE `OUTPUT` row.
    pub fn parse(action: &str) -> Option<Self> {
        match action.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(MergeAction::Insert),
            "UPDATE" => Some(MergeAction::Update),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutputRow {
    pub action: MergeAction,
    pub ordinal: i64,
    /// Values of `MergeOutput::key_columns`, as stored by the destination.
    pub key: Vec<SqlValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub affected: u64,
    pub rows: Vec<MergeOutputRow>,
}

impl MergeOutcome {
    pub fn inserted(&self) -> u64 {
        self.count(MergeAction::Insert)
    }

    pub fn updated(&self) -> u64 {
        self.count(MergeAction::Update)
    }

    fn count(&self, action: MergeAction) -> u64 {
        self.rows.iter().filter(|r| r.action == action).count() as u64
    }
}

/// Destination operations used by the bulk pipeline.
#[async_trait]
pub trait BulkConnection: Send {
    /// Create a table. Fails with `DuplicateTable` if the name is taken.
    async fn create_table(&mut self, definition: &TableDefinition) -> Result<()>;

    async fn table_exists(&mut self, table: &TableName) -> Result<bool>;

    /// Drop a table if it exists; returns whether anything was dropped.
    async fn drop_table(&mut self, table: &TableName) -> Result<bool>;

    /// Add a primary key constraint to an existing table. Temp tables get an
    /// unnamed constraint when `constraint` is `None`.
    async fn add_primary_key(
        &mut self,
        table: &TableName,
        constraint: Option<&str>,
        columns: &[String],
    ) -> Result<()>;

    /// Stream every row of `reader` into `destination`, binding columns by
    /// name. Returns the number of rows transferred.
    async fn bulk_copy(
        &mut self,
        destination: &TableName,
        reader: &mut (dyn RowReader + '_),
        options: &BulkInsertOptions,
    ) -> Result<u64>;

    async fn merge(&mut self, statement: &MergeStatement) -> Result<MergeOutcome>;
}

/// Race `fut` against `cancel`. The future is dropped when the token fires
/// first.
pub async fn cancellable<T, F>(
    cancel: &CancellationToken,
    table: &TableName,
    step: Step,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(cancelled(table, step));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled(table, step)),
        result = fut => result,
    }
}

pub(crate) fn cancelled(table: &TableName, step: Step) -> BulkError {
    BulkError::Cancelled {
        table: table.qualified(),
        step,
    }
}
