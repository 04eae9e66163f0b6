//! SQL Server transport: [`BulkConnection`] for a tiberius [`Client`].
//!
//! Rows go through the TDS `INSERT BULK` channel. Tiberius only accepts
//! values for updateable columns, in destination order, so every bulk copy
//! first reads the destination's column metadata and binds the reader's
//! columns to it by name.

use std::borrow::Cow;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use futures::{AsyncRead, AsyncWrite};
use rust_decimal::Decimal;
use tiberius::{Client, ColumnData, FromSql, Row, ToSql, TokenRow};
use tracing::{debug, warn};

use crate::connection::{
    BulkConnection, MergeAction, MergeOutcome, MergeOutputRow, MergeStatement, TableDefinition,
};
use crate::error::{BulkError, Result, Step};
use crate::options::BulkInsertOptions;
use crate::reader::{RowReader, StreamColumn};
use crate::shape::TableName;
use crate::sql::{
    build_create_table_sql, build_drop_table_sql, build_merge_sql, build_primary_key_sql,
    catalog_prefix, object_id_name, quote_ident,
};
use crate::value::{SqlNullType, SqlValue};

/// Maximum string length (in bytes) for TDS bulk insert.
/// Tiberius bulk insert has a hard limit of 65535 bytes for UTF-16 encoded strings.
const BULK_INSERT_STRING_LIMIT: usize = 65535;

/// SQL Server parameter limit per statement.
const MAX_PARAMETERS: usize = 2100;

/// Column of an existing destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationColumn {
    pub name: String,
    pub type_name: String,
    pub is_identity: bool,
    pub is_computed: bool,
    pub scale: u8,
}

impl DestinationColumn {
    /// Whether `INSERT BULK` accepts values for this column.
    pub fn is_updateable(&self) -> bool {
        let type_name = self.type_name.to_ascii_lowercase();
        !(self.is_identity || self.is_computed || type_name == "timestamp" || type_name == "rowversion")
    }

    fn null_type(&self) -> SqlNullType {
        SqlNullType::from_type_name(&self.type_name)
    }
}

/// An updateable destination column and the reader column feeding it.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundColumn {
    pub destination: DestinationColumn,
    /// Reader column index; `None` sends NULL.
    pub source: Option<usize>,
}

/// Bind reader columns to destination columns by name.
///
/// Returns the updateable destination columns in table order. Unknown
/// names and bindings to identity, computed or rowversion columns are
/// schema errors.
pub fn bind_columns(
    table: &TableName,
    destination: Vec<DestinationColumn>,
    columns: &[StreamColumn],
) -> Result<Vec<BoundColumn>> {
    if destination.is_empty() {
        return Err(BulkError::destination_schema(
            table.qualified(),
            Step::BulkCopy,
            format!("Invalid object name '{}'", table.qualified()),
        ));
    }

    let mut sources: Vec<Option<usize>> = vec![None; destination.len()];
    for (index, column) in columns.iter().enumerate() {
        let position = destination
            .iter()
            .position(|d| d.name.eq_ignore_ascii_case(&column.name))
            .ok_or_else(|| {
                BulkError::destination_schema(
                    table.qualified(),
                    Step::BulkCopy,
                    format!("Invalid column name '{}'", column.name),
                )
            })?;
        if !destination[position].is_updateable() {
            return Err(BulkError::destination_schema(
                table.qualified(),
                Step::BulkCopy,
                format!(
                    "Column '{}' is an identity, computed or rowversion column and cannot be bulk loaded",
                    column.name
                ),
            ));
        }
        sources[position] = Some(index);
    }

    Ok(destination
        .into_iter()
        .zip(sources)
        .filter(|(d, _)| d.is_updateable())
        .map(|(destination, source)| BoundColumn {
            destination,
            source,
        })
        .collect())
}

/// Map a driver error to the pipeline error for `table` and `step`.
fn db_error(table: &TableName, step: Step, e: tiberius::error::Error) -> BulkError {
    if let tiberius::error::Error::Server(token) = &e {
        match token.code() {
            2714 => {
                return BulkError::DuplicateTable {
                    table: table.qualified(),
                }
            }
            207 | 208 => {
                return BulkError::destination_schema(table.qualified(), step, token.message())
            }
            _ => {}
        }
    }
    BulkError::Database {
        table: table.qualified(),
        step,
        source: e,
    }
}

/// Check if a row contains any string values that exceed the bulk insert limit.
fn row_has_oversized_strings(row: &[SqlValue]) -> bool {
    row.iter().any(|value| match value {
        SqlValue::String(s) => {
            let utf16_len: usize = s.chars().map(|c| c.len_utf16() * 2).sum();
            utf16_len > BULK_INSERT_STRING_LIMIT
        }
        _ => false,
    })
}

/// Adjust a value to the destination column: integer width and decimal
/// scale.
fn fit_to_column(value: SqlValue, column: &DestinationColumn) -> SqlValue {
    match (value, column.null_type()) {
        (SqlValue::Null(_), target) => SqlValue::Null(target),
        (SqlValue::Decimal(mut d), SqlNullType::Decimal) => {
            d.rescale(u32::from(column.scale));
            SqlValue::Decimal(d)
        }
        (SqlValue::DateTime(dt), SqlNullType::Date) => SqlValue::Date(dt.date()),
        (value, target) => value.coerce_to(target),
    }
}

/// Read the next row in bound-column order.
fn next_row(reader: &mut (dyn RowReader + '_), bound: &[BoundColumn]) -> Result<Option<Vec<SqlValue>>> {
    if !reader.read()? {
        return Ok(None);
    }
    bound
        .iter()
        .map(|b| match b.source {
            Some(index) => Ok(fit_to_column(reader.value(index)?, &b.destination)),
            None => Ok(SqlValue::Null(b.destination.null_type())),
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Bulk load batches, each fully resolved before it is sent.
///
/// A bulk load request cannot be abandoned once opened, so a row that fails
/// to map must surface here rather than halfway through a request. When
/// streaming is disabled the whole input is resolved up front.
struct BatchSource<'a, 'r> {
    reader: &'a mut (dyn RowReader + 'r),
    bound: &'a [BoundColumn],
    batch_size: usize,
    resolved: Option<std::vec::IntoIter<Vec<SqlValue>>>,
    done: bool,
}

impl<'a, 'r> BatchSource<'a, 'r> {
    fn new(
        reader: &'a mut (dyn RowReader + 'r),
        bound: &'a [BoundColumn],
        options: &BulkInsertOptions,
    ) -> Result<Self> {
        let resolved = if options.enable_streaming {
            None
        } else {
            let mut rows = Vec::new();
            while let Some(row) = next_row(reader, bound)? {
                rows.push(row);
            }
            Some(rows.into_iter())
        };
        Ok(Self {
            reader,
            bound,
            batch_size: options.batch_size.unwrap_or(usize::MAX),
            resolved,
            done: false,
        })
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Vec<SqlValue>>>> {
        if self.done {
            return Ok(None);
        }
        let batch: Vec<Vec<SqlValue>> = match &mut self.resolved {
            Some(rows) => rows.by_ref().take(self.batch_size).collect(),
            None => {
                let mut batch = Vec::new();
                while batch.len() < self.batch_size {
                    match next_row(self.reader, self.bound)? {
                        Some(row) => batch.push(row),
                        None => break,
                    }
                }
                batch
            }
        };
        if batch.len() < self.batch_size {
            self.done = true;
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

fn days_since_epoch(date: NaiveDate) -> Option<u32> {
    let epoch = NaiveDate::from_ymd_opt(1, 1, 1)?;
    u32::try_from((date - epoch).num_days()).ok()
}

fn time_increments(time: chrono::NaiveTime) -> u64 {
    let nanos =
        time.num_seconds_from_midnight() as u64 * 1_000_000_000 + time.nanosecond() as u64;
    // scale 7: 100 nanosecond increments
    nanos / 100
}

fn datetime2(dt: &NaiveDateTime) -> Option<tiberius::time::DateTime2> {
    let days = days_since_epoch(dt.date())?;
    Some(tiberius::time::DateTime2::new(
        tiberius::time::Date::new(days),
        tiberius::time::Time::new(time_increments(dt.time()), 7),
    ))
}

/// Convert SqlValue to Tiberius ColumnData for bulk insert.
fn sql_value_to_column_data(value: &SqlValue) -> ColumnData<'static> {
    match value {
        SqlValue::Null(null_type) => match null_type {
            SqlNullType::Bool => ColumnData::Bit(None),
            SqlNullType::U8 => ColumnData::U8(None),
            SqlNullType::I16 => ColumnData::I16(None),
            SqlNullType::I32 => ColumnData::I32(None),
            SqlNullType::I64 => ColumnData::I64(None),
            SqlNullType::F32 => ColumnData::F32(None),
            SqlNullType::F64 => ColumnData::F64(None),
            SqlNullType::String => ColumnData::String(None),
            SqlNullType::Bytes => ColumnData::Binary(None),
            SqlNullType::Uuid => ColumnData::Guid(None),
            SqlNullType::Decimal => ColumnData::Numeric(None),
            SqlNullType::DateTime => ColumnData::DateTime2(None),
            SqlNullType::DateTimeOffset => ColumnData::DateTimeOffset(None),
            SqlNullType::Date => ColumnData::Date(None),
            SqlNullType::Time => ColumnData::Time(None),
        },
        SqlValue::Bool(b) => ColumnData::Bit(Some(*b)),
        SqlValue::U8(i) => ColumnData::U8(Some(*i)),
        SqlValue::I16(i) => ColumnData::I16(Some(*i)),
        SqlValue::I32(i) => ColumnData::I32(Some(*i)),
        SqlValue::I64(i) => ColumnData::I64(Some(*i)),
        SqlValue::F32(f) => {
            if f.is_nan() || f.is_infinite() {
                warn!("Converting F32 NaN/Infinity to NULL for MSSQL compatibility");
                ColumnData::F32(None)
            } else {
                ColumnData::F32(Some(*f))
            }
        }
        SqlValue::F64(f) => {
            if f.is_nan() || f.is_infinite() {
                warn!("Converting F64 NaN/Infinity to NULL for MSSQL compatibility");
                ColumnData::F64(None)
            } else {
                ColumnData::F64(Some(*f))
            }
        }
        SqlValue::String(s) => ColumnData::String(Some(Cow::Owned(s.clone()))),
        SqlValue::Bytes(b) => ColumnData::Binary(Some(Cow::Owned(b.clone()))),
        SqlValue::Uuid(u) => ColumnData::Guid(Some(*u)),
        SqlValue::Decimal(d) => ColumnData::Numeric(Some(
            tiberius::numeric::Numeric::new_with_scale(d.mantissa(), d.scale() as u8),
        )),
        SqlValue::DateTime(dt) => match datetime2(dt) {
            Some(v) => ColumnData::DateTime2(Some(v)),
            None => {
                warn!("DateTime {} out of valid range, converting to NULL", dt);
                ColumnData::DateTime2(None)
            }
        },
        SqlValue::DateTimeOffset(dto) => match datetime2(&dto.naive_utc()) {
            Some(v) => {
                let offset_minutes = (dto.offset().local_minus_utc() / 60) as i16;
                ColumnData::DateTimeOffset(Some(tiberius::time::DateTimeOffset::new(
                    v,
                    offset_minutes,
                )))
            }
            None => {
                warn!("DateTimeOffset {} out of valid range, converting to NULL", dto);
                ColumnData::DateTimeOffset(None)
            }
        },
        SqlValue::Date(d) => match days_since_epoch(*d) {
            Some(days) => ColumnData::Date(Some(tiberius::time::Date::new(days))),
            None => {
                warn!("Date {} out of valid range, converting to NULL", d);
                ColumnData::Date(None)
            }
        },
        SqlValue::Time(t) => ColumnData::Time(Some(tiberius::time::Time::new(time_increments(*t), 7))),
    }
}

fn token_row(row: &[SqlValue]) -> TokenRow<'static> {
    let mut token_row = TokenRow::new();
    for value in row {
        token_row.push(sql_value_to_column_data(value));
    }
    token_row
}

fn sql_value_to_sql_param(value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(_) => Box::new(Option::<String>::None),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::U8(i) => Box::new(*i),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::String(s) => Box::new(s.clone()),
        SqlValue::Bytes(b) => Box::new(b.clone()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::Time(t) => Box::new(*t),
    }
}

/// Read a key value produced by a MERGE `OUTPUT` clause.
fn column_data_to_sql_value(data: &ColumnData<'static>) -> SqlValue {
    match data {
        ColumnData::Bit(v) => (*v).into(),
        ColumnData::U8(v) => (*v).into(),
        ColumnData::I16(v) => (*v).into(),
        ColumnData::I32(v) => (*v).into(),
        ColumnData::I64(v) => (*v).into(),
        ColumnData::F32(v) => (*v).into(),
        ColumnData::F64(v) => (*v).into(),
        ColumnData::Guid(v) => (*v).into(),
        ColumnData::String(v) => v.as_ref().map(|s| s.to_string()).into(),
        ColumnData::Binary(v) => v.as_ref().map(|b| b.to_vec()).into(),
        ColumnData::Numeric(_) => Decimal::from_sql(data).ok().flatten().into(),
        ColumnData::Date(_) => NaiveDate::from_sql(data).ok().flatten().into(),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data).ok().flatten().into()
        }
        ColumnData::DateTimeOffset(_) => {
            chrono::DateTime::<chrono::FixedOffset>::from_sql(data)
                .ok()
                .flatten()
                .into()
        }
        ColumnData::Time(_) => chrono::NaiveTime::from_sql(data).ok().flatten().into(),
        _ => SqlValue::Null(SqlNullType::String),
    }
}

fn parse_output_row(table: &TableName, row: Row) -> Result<MergeOutputRow> {
    let malformed = |what: &str| {
        BulkError::statement(
            table.qualified(),
            Step::Merge,
            format!("Malformed MERGE OUTPUT row: {}", what),
        )
    };

    let action = row
        .try_get::<&str, _>(0)
        .ok()
        .flatten()
        .and_then(MergeAction::parse)
        .ok_or_else(|| malformed("unknown $action"))?;
    let ordinal = row
        .try_get::<i64, _>(1)
        .ok()
        .flatten()
        .ok_or_else(|| malformed("missing row ordinal"))?;
    let key = row
        .into_iter()
        .skip(2)
        .map(|data| column_data_to_sql_value(&data))
        .collect();

    Ok(MergeOutputRow {
        action,
        ordinal,
        key,
    })
}

async fn destination_columns<S>(
    client: &mut Client<S>,
    table: &TableName,
) -> Result<Vec<DestinationColumn>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let query = format!(
        "SELECT c.name, TYPE_NAME(c.user_type_id), c.is_identity, c.is_computed, c.scale \
         FROM {}sys.columns c WHERE c.object_id = OBJECT_ID(@P1) ORDER BY c.column_id",
        catalog_prefix(table)
    );
    let object_name = object_id_name(table);
    let rows = client
        .query(query.as_str(), &[&object_name])
        .await
        .map_err(|e| db_error(table, Step::BulkCopy, e))?
        .into_first_result()
        .await
        .map_err(|e| db_error(table, Step::BulkCopy, e))?;

    Ok(rows
        .iter()
        .map(|row| DestinationColumn {
            name: row.get::<&str, _>(0).unwrap_or_default().to_string(),
            type_name: row.get::<&str, _>(1).unwrap_or_default().to_string(),
            is_identity: row.get::<bool, _>(2).unwrap_or(false),
            is_computed: row.get::<bool, _>(3).unwrap_or(false),
            scale: row.get::<u8, _>(4).unwrap_or(0),
        })
        .collect())
}

/// Insert rows using parameterized INSERT statements (fallback for oversized strings).
async fn insert_rows_fallback<S>(
    client: &mut Client<S>,
    table: &TableName,
    bound: &[BoundColumn],
    rows: &[Vec<SqlValue>],
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if rows.is_empty() || bound.is_empty() {
        return Ok(0);
    }

    let col_str = bound
        .iter()
        .map(|b| quote_ident(&b.destination.name))
        .collect::<Vec<_>>()
        .join(", ");
    let max_rows_per_batch = (MAX_PARAMETERS / bound.len()).max(1);
    let mut total_inserted = 0u64;

    for batch in rows.chunks(max_rows_per_batch) {
        let mut param_idx = 1;
        let value_groups: Vec<String> = batch
            .iter()
            .map(|_| {
                let placeholders: Vec<String> = (0..bound.len())
                    .map(|_| {
                        let p = format!("@P{}", param_idx);
                        param_idx += 1;
                        p
                    })
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            table.qualified(),
            col_str,
            value_groups.join(", ")
        );

        let params: Vec<Box<dyn ToSql>> = batch
            .iter()
            .flat_map(|row| row.iter().map(sql_value_to_sql_param))
            .collect();
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        client
            .execute(sql.as_str(), &param_refs)
            .await
            .map_err(|e| db_error(table, Step::BulkCopy, e))?;
        total_inserted += batch.len() as u64;
    }

    debug!(
        "Inserted {} rows with oversized strings into {} via parameterized INSERT",
        total_inserted, table
    );
    Ok(total_inserted)
}

#[async_trait]
impl<S> BulkConnection for Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn create_table(&mut self, definition: &TableDefinition) -> Result<()> {
        let sql = build_create_table_sql(definition);
        debug!("{}", sql);
        self.execute(sql.as_str(), &[])
            .await
            .map_err(|e| db_error(&definition.table, Step::CreateTable, e))?;
        Ok(())
    }

    async fn table_exists(&mut self, table: &TableName) -> Result<bool> {
        let object_name = object_id_name(table);
        let rows = self
            .query("SELECT OBJECT_ID(@P1, N'U')", &[&object_name])
            .await
            .map_err(|e| db_error(table, Step::CreateTable, e))?
            .into_first_result()
            .await
            .map_err(|e| db_error(table, Step::CreateTable, e))?;

        Ok(rows.first().and_then(|r| r.get::<i32, _>(0)).is_some())
    }

    async fn drop_table(&mut self, table: &TableName) -> Result<bool> {
        let existed = self.table_exists(table).await?;
        if existed {
            let sql = build_drop_table_sql(table);
            debug!("{}", sql);
            self.execute(sql.as_str(), &[])
                .await
                .map_err(|e| db_error(table, Step::DropTable, e))?;
        }
        Ok(existed)
    }

    async fn add_primary_key(
        &mut self,
        table: &TableName,
        constraint: Option<&str>,
        columns: &[String],
    ) -> Result<()> {
        let sql = build_primary_key_sql(table, constraint, columns);
        debug!("{}", sql);
        self.execute(sql.as_str(), &[])
            .await
            .map_err(|e| db_error(table, Step::CreatePrimaryKey, e))?;
        Ok(())
    }

    async fn bulk_copy(
        &mut self,
        destination: &TableName,
        reader: &mut (dyn RowReader + '_),
        options: &BulkInsertOptions,
    ) -> Result<u64> {
        let metadata = destination_columns(self, destination).await?;
        let bound = bind_columns(destination, metadata, reader.columns())?;
        let qualified = destination.qualified();

        let mut batches = BatchSource::new(reader, &bound, options)?;
        let mut total = 0u64;
        while let Some(batch) = batches.next_batch()? {
            let (oversized, rows): (Vec<_>, Vec<_>) =
                batch.into_iter().partition(|row| row_has_oversized_strings(row));

            if !rows.is_empty() {
                let mut request = self
                    .bulk_insert(&qualified)
                    .await
                    .map_err(|e| db_error(destination, Step::BulkCopy, e))?;
                for row in &rows {
                    request
                        .send(token_row(row))
                        .await
                        .map_err(|e| db_error(destination, Step::BulkCopy, e))?;
                }
                request
                    .finalize()
                    .await
                    .map_err(|e| db_error(destination, Step::BulkCopy, e))?;
                debug!("Sent bulk copy batch of {} rows to {}", rows.len(), qualified);
                total += rows.len() as u64;
            }
            total += insert_rows_fallback(self, destination, &bound, &oversized).await?;
        }

        Ok(total)
    }

    async fn merge(&mut self, statement: &MergeStatement) -> Result<MergeOutcome> {
        let sql = build_merge_sql(statement);
        debug!("Executing MERGE:\n{}", sql);
        let target = &statement.target;

        if statement.output.is_none() {
            let result = self
                .execute(sql.as_str(), &[])
                .await
                .map_err(|e| db_error(target, Step::Merge, e))?;
            return Ok(MergeOutcome {
                affected: result.total(),
                rows: Vec::new(),
            });
        }

        let results = self
            .simple_query(sql.as_str())
            .await
            .map_err(|e| db_error(target, Step::Merge, e))?
            .into_results()
            .await
            .map_err(|e| db_error(target, Step::Merge, e))?;

        let rows = results
            .into_iter()
            .flatten()
            .map(|row| parse_output_row(target, row))
            .collect::<Result<Vec<_>>>()?;

        Ok(MergeOutcome {
            affected: rows.len() as u64,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PropertyWithNavigation;
    use crate::reader::{EntityDataReader, EntityRow};
    use crate::record::{DynamicRecord, Record};
    use crate::shape::PropertyDefinition;

    fn dest(name: &str, type_name: &str) -> DestinationColumn {
        DestinationColumn {
            name: name.into(),
            type_name: type_name.into(),
            is_identity: false,
            is_computed: false,
            scale: 0,
        }
    }

    fn stream(name: &str, type_name: &str) -> StreamColumn {
        StreamColumn::from_property(PropertyWithNavigation::own(PropertyDefinition::new(
            name, type_name,
        )))
    }

    fn records_with_gap() -> Vec<DynamicRecord> {
        vec![
            DynamicRecord::new().with("id", 1i32),
            DynamicRecord::new().with("id", 2i32),
            DynamicRecord::new(),
        ]
    }

    fn batches_of(
        records: &[DynamicRecord],
        batch_size: usize,
        enable_streaming: bool,
    ) -> (Vec<usize>, Option<BulkError>) {
        let rows = records
            .iter()
            .enumerate()
            .map(|(i, r)| EntityRow::new(r as &dyn Record, i));
        let id = PropertyWithNavigation::own(PropertyDefinition::new("id", "int"));
        let mut reader = EntityDataReader::new("[dbo].[ids]", rows, vec![id], false);
        let table = TableName::new("dbo", "ids");
        let bound = bind_columns(&table, vec![dest("id", "int")], reader.columns()).unwrap();
        let options = BulkInsertOptions {
            batch_size: Some(batch_size),
            enable_streaming,
            ..Default::default()
        };

        let mut sizes = Vec::new();
        let mut source = match BatchSource::new(&mut reader, &bound, &options) {
            Ok(source) => source,
            Err(e) => return (sizes, Some(e)),
        };
        loop {
            match source.next_batch() {
                Ok(Some(batch)) => sizes.push(batch.len()),
                Ok(None) => return (sizes, None),
                Err(e) => return (sizes, Some(e)),
            }
        }
    }

    #[test]
    fn test_batches_split_by_batch_size() {
        let records: Vec<DynamicRecord> =
            (1..=5).map(|i| DynamicRecord::new().with("id", i)).collect();
        for (batch_size, streaming, expected) in [
            (2, true, vec![2, 2, 1]),
            (2, false, vec![2, 2, 1]),
            (5, true, vec![5]),
        ] {
            let (sizes, err) = batches_of(&records, batch_size, streaming);
            assert!(err.is_none());
            assert_eq!(sizes, expected);
        }
    }

    #[test]
    fn test_streaming_mapping_error_surfaces_before_batch_is_sent() {
        let (sizes, err) = batches_of(&records_with_gap(), 2, true);
        assert_eq!(sizes, vec![2]);
        assert!(matches!(err, Some(BulkError::RowMapping { row: 2, .. })));
    }

    #[test]
    fn test_buffered_mapping_error_surfaces_before_any_batch() {
        let (sizes, err) = batches_of(&records_with_gap(), 2, false);
        assert!(sizes.is_empty());
        assert!(matches!(err, Some(BulkError::RowMapping { row: 2, .. })));
    }

    #[test]
    fn test_bind_columns_skips_identity_and_fills_unbound() {
        let table = TableName::new("dbo", "orders");
        let mut id = dest("id", "int");
        id.is_identity = true;
        let metadata = vec![id, dest("number", "nvarchar"), dest("note", "nvarchar")];

        let bound = bind_columns(&table, metadata, &[stream("Number", "nvarchar(20)")]).unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].destination.name, "number");
        assert_eq!(bound[0].source, Some(0));
        assert_eq!(bound[1].source, None);
    }

    #[test]
    fn test_bind_columns_rejects_identity_binding() {
        let table = TableName::new("dbo", "orders");
        let mut id = dest("id", "int");
        id.is_identity = true;
        let err = bind_columns(&table, vec![id], &[stream("id", "int")]).unwrap_err();
        assert!(matches!(err, BulkError::DestinationSchema { .. }));
    }

    #[test]
    fn test_bind_columns_missing_table_or_column() {
        let table = TableName::new("dbo", "orders");
        let err = bind_columns(&table, Vec::new(), &[stream("id", "int")]).unwrap_err();
        assert!(err.to_string().contains("Invalid object name"));

        let err = bind_columns(&table, vec![dest("id", "int")], &[stream("sku", "int")]).unwrap_err();
        assert!(err.to_string().contains("Invalid column name 'sku'"));
    }

    #[test]
    fn test_rowversion_is_not_updateable() {
        assert!(!dest("rv", "rowversion").is_updateable());
        assert!(!dest("ts", "timestamp").is_updateable());
        assert!(dest("n", "int").is_updateable());
    }

    #[test]
    fn test_fit_to_column() {
        let int = dest("id", "int");
        assert_eq!(fit_to_column(SqlValue::I64(5), &int), SqlValue::I32(5));
        assert_eq!(
            fit_to_column(SqlValue::Null(SqlNullType::String), &int),
            SqlValue::Null(SqlNullType::I32)
        );

        let mut price = dest("price", "decimal");
        price.scale = 2;
        let fitted = fit_to_column(SqlValue::Decimal(Decimal::new(15, 1)), &price);
        assert_eq!(fitted, SqlValue::Decimal(Decimal::new(150, 2)));
        if let SqlValue::Decimal(d) = fitted {
            assert_eq!(d.scale(), 2);
        }
    }

    #[test]
    fn test_sql_value_to_column_data_nan_converts_to_null() {
        assert!(matches!(sql_value_to_column_data(&SqlValue::F32(f32::NAN)), ColumnData::F32(None)));
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::F64(f64::NEG_INFINITY)),
            ColumnData::F64(None)
        ));
        assert!(matches!(sql_value_to_column_data(&SqlValue::F64(1.5)), ColumnData::F64(Some(_))));
    }

    #[test]
    fn test_sql_value_to_column_data_null_types() {
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::Null(SqlNullType::Bool)),
            ColumnData::Bit(None)
        ));
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::Null(SqlNullType::Date)),
            ColumnData::Date(None)
        ));
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::Null(SqlNullType::U8)),
            ColumnData::U8(None)
        ));
    }

    #[test]
    fn test_sql_value_to_column_data_dates() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert!(matches!(sql_value_to_column_data(&SqlValue::Date(date)), ColumnData::Date(Some(_))));
        let dt = date.and_hms_opt(10, 30, 0).unwrap();
        assert!(matches!(
            sql_value_to_column_data(&SqlValue::DateTime(dt)),
            ColumnData::DateTime2(Some(_))
        ));
        assert_eq!(days_since_epoch(NaiveDate::from_ymd_opt(1, 1, 2).unwrap()), Some(1));
    }

    #[test]
    fn test_output_values_round_trip_through_column_data() {
        assert_eq!(column_data_to_sql_value(&ColumnData::I32(Some(7))), SqlValue::I32(7));
        assert_eq!(
            column_data_to_sql_value(&ColumnData::String(Some(Cow::Owned("k".into())))),
            SqlValue::from("k")
        );
        assert!(column_data_to_sql_value(&ColumnData::I64(None)).is_null());
    }

    #[test]
    fn test_row_has_oversized_strings() {
        assert!(!row_has_oversized_strings(&[]));
        assert!(!row_has_oversized_strings(&[SqlValue::String("a".repeat(32767))]));
        assert!(row_has_oversized_strings(&[
            SqlValue::I32(1),
            SqlValue::String("a".repeat(32768)),
        ]));
        // surrogate pairs count four bytes
        assert!(row_has_oversized_strings(&[SqlValue::String("😀".repeat(16384))]));
    }
}
