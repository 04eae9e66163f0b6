//! Row streaming adapter.
//!
//! [`EntityDataReader`] presents a sequence of records as a forward-only
//! columnar cursor. Column indexes are fixed when the reader is built and
//! values are resolved only when the transport asks for them, so memory use
//! does not grow with the input size.

use std::sync::Arc;

use crate::error::{BulkError, Result};
use crate::mapping::PropertyWithNavigation;
use crate::record::Record;
use crate::value::{SqlNullType, SqlValue};

/// Column carrying the input position of each row, used to map `OUTPUT`
/// rows of a MERGE back to records.
pub const ROW_ORDINAL_COLUMN: &str = "__row_ordinal";

/// Where a streamed column takes its values from.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSource {
    Property(PropertyWithNavigation),
    RowOrdinal,
}

/// One column of a row stream, bound to the destination by `name`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamColumn {
    pub name: String,
    pub column_type: String,
    pub null_type: SqlNullType,
    pub source: ColumnSource,
}

impl StreamColumn {
    pub fn from_property(property: PropertyWithNavigation) -> Self {
        Self {
            name: property.column().to_string(),
            column_type: property.property.column_type.clone(),
            null_type: property.property.null_type,
            source: ColumnSource::Property(property),
        }
    }

    pub fn row_ordinal() -> Self {
        Self {
            name: ROW_ORDINAL_COLUMN.to_string(),
            column_type: "bigint".to_string(),
            null_type: SqlNullType::I64,
            source: ColumnSource::RowOrdinal,
        }
    }

    pub fn property(&self) -> Option<&PropertyWithNavigation> {
        match &self.source {
            ColumnSource::Property(p) => Some(p),
            ColumnSource::RowOrdinal => None,
        }
    }
}

/// Forward-only row source consumed by the bulk-copy transport.
pub trait RowReader: Send {
    /// Table the rows are destined for (used in errors).
    fn table(&self) -> &str;

    fn columns(&self) -> &[StreamColumn];

    fn field_count(&self) -> usize {
        self.columns().len()
    }

    /// Advance to the next row. Returns `false` at the end of the stream.
    fn read(&mut self) -> Result<bool>;

    /// Value of column `index` in the current row.
    fn value(&self, index: usize) -> Result<SqlValue>;

    /// Number of rows handed out so far.
    fn rows_read(&self) -> usize;
}

/// A record positioned in the input, with foreign-key bindings when it is
/// an owned child row.
#[derive(Clone)]
pub struct EntityRow<'a> {
    pub record: &'a dyn Record,
    pub ordinal: usize,
    pub parent_key: Option<Arc<[(String, SqlValue)]>>,
}

impl<'a> EntityRow<'a> {
    pub fn new(record: &'a dyn Record, ordinal: usize) -> Self {
        Self {
            record,
            ordinal,
            parent_key: None,
        }
    }

    pub fn with_parent_key(mut self, parent_key: Arc<[(String, SqlValue)]>) -> Self {
        self.parent_key = Some(parent_key);
        self
    }

    fn bound(&self, property: &str) -> Option<&SqlValue> {
        self.parent_key
            .as_deref()?
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, value)| value)
    }
}

fn indexed_properties(
    columns: &[StreamColumn],
) -> impl Iterator<Item = (usize, &PropertyWithNavigation)> {
    columns
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.property().map(|p| (i, p)))
}

/// Reader over an iterator of [`EntityRow`]s.
pub struct EntityDataReader<'a, I>
where
    I: Iterator<Item = EntityRow<'a>>,
{
    table: String,
    rows: I,
    columns: Vec<StreamColumn>,
    current: Option<EntityRow<'a>>,
    rows_read: usize,
}

impl<'a, I> EntityDataReader<'a, I>
where
    I: Iterator<Item = EntityRow<'a>> + Send,
{
    /// Build a reader; the column order is exactly `properties`, followed by
    /// the row ordinal column when requested.
    pub fn new(
        table: impl Into<String>,
        rows: I,
        properties: Vec<PropertyWithNavigation>,
        include_ordinal: bool,
    ) -> Self {
        let mut columns: Vec<StreamColumn> =
            properties.into_iter().map(StreamColumn::from_property).collect();
        if include_ordinal {
            columns.push(StreamColumn::row_ordinal());
        }

        Self {
            table: table.into(),
            rows,
            columns,
            current: None,
            rows_read: 0,
        }
    }

    /// Resolved properties with their assigned column index.
    pub fn properties(&self) -> impl Iterator<Item = (usize, &PropertyWithNavigation)> + '_ {
        indexed_properties(&self.columns)
    }

    pub fn property_index(&self, property: &PropertyWithNavigation) -> Option<usize> {
        self.properties()
            .find(|(_, p)| *p == property)
            .map(|(i, _)| i)
    }

    fn mapping_error(&self, row: usize, property: String, message: String) -> BulkError {
        BulkError::RowMapping {
            table: self.table.clone(),
            row,
            property,
            message,
        }
    }

    fn resolve(&self, row: &EntityRow<'a>, property: &PropertyWithNavigation) -> Result<SqlValue> {
        let name = &property.property.name;

        if property.navigations.is_empty() {
            if let Some(value) = row.bound(name) {
                return Ok(value.clone());
            }
        }

        let mut record: &dyn Record = row.record;
        for step in &property.navigations {
            match record.owned(step.name()).into_iter().next() {
                Some(owned) => record = owned,
                // absent inline owned value
                None => return Ok(SqlValue::Null(property.property.null_type)),
            }
        }

        record
            .value(name)
            .map_err(|e| self.mapping_error(row.ordinal, property.path(), e.to_string()))
    }
}

impl<'a, I> RowReader for EntityDataReader<'a, I>
where
    I: Iterator<Item = EntityRow<'a>> + Send,
{
    fn table(&self) -> &str {
        &self.table
    }

    fn columns(&self) -> &[StreamColumn] {
        &self.columns
    }

    fn read(&mut self) -> Result<bool> {
        self.current = self.rows.next();
        if self.current.is_some() {
            self.rows_read += 1;
        }
        Ok(self.current.is_some())
    }

    fn value(&self, index: usize) -> Result<SqlValue> {
        let Some(row) = &self.current else {
            return Err(self.mapping_error(
                self.rows_read,
                format!("#{}", index),
                "no current row".to_string(),
            ));
        };

        let Some(column) = self.columns.get(index) else {
            return Err(self.mapping_error(
                row.ordinal,
                format!("#{}", index),
                format!("column index out of range ({} columns)", self.columns.len()),
            ));
        };

        match &column.source {
            ColumnSource::RowOrdinal => Ok(SqlValue::I64(row.ordinal as i64)),
            ColumnSource::Property(property) => self.resolve(row, property),
        }
    }

    fn rows_read(&self) -> usize {
        self.rows_read
    }
}
