//! In-memory [`BulkConnection`].
//!
//! Implements the same contract as the SQL Server backend with real table
//! semantics: name binding, identity generation, NOT NULL and primary key
//! enforcement, MERGE with SQL null matching and `OUTPUT` rows. Failures and
//! cancellations can be injected per step, which is what the integration
//! tests use to exercise the cleanup paths.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{
    BulkConnection, ColumnDefinition, MergeAction, MergeOutcome, MergeOutputRow, MergeStatement,
    TableDefinition,
};
use crate::error::{BulkError, Result, Step};
use crate::options::BulkInsertOptions;
use crate::reader::RowReader;
use crate::shape::TableName;
use crate::sql::build_merge_sql;
use crate::value::{SqlNullType, SqlValue};

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<ColumnDefinition>,
    primary_key: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    next_identity: i64,
}

impl MemoryTable {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn null_type(&self, index: usize) -> SqlNullType {
        SqlNullType::from_type_name(&self.columns[index].column_type)
    }

    fn empty_row(&self) -> Vec<SqlValue> {
        (0..self.columns.len())
            .map(|i| SqlValue::Null(self.null_type(i)))
            .collect()
    }

    /// Fill identity columns the caller did not bind and enforce NOT NULL.
    fn complete_row(
        &mut self,
        row: &mut [SqlValue],
        explicit: &HashSet<usize>,
    ) -> std::result::Result<(), String> {
        for (i, column) in self.columns.iter().enumerate() {
            if column.identity {
                if explicit.contains(&i) {
                    if let Some(v) = row[i].as_i64() {
                        self.next_identity = self.next_identity.max(v + 1);
                    }
                } else {
                    row[i] = SqlValue::I64(self.next_identity)
                        .coerce_to(SqlNullType::from_type_name(&column.column_type));
                    self.next_identity += 1;
                }
            }
            if !column.nullable && row[i].is_null() {
                return Err(format!(
                    "Cannot insert the value NULL into column '{}', column does not allow nulls",
                    column.name
                ));
            }
        }
        Ok(())
    }

    fn key_indexes(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }

    /// Primary key check for `candidates` against the existing rows and each
    /// other.
    fn check_primary_key(
        &self,
        existing: &[Vec<SqlValue>],
        candidates: &[Vec<SqlValue>],
    ) -> std::result::Result<(), String> {
        let keys = self.key_indexes();
        if keys.is_empty() {
            return Ok(());
        }
        let same = |a: &[SqlValue], b: &[SqlValue]| keys.iter().all(|&k| a[k] == b[k]);

        for (i, row) in candidates.iter().enumerate() {
            if keys.iter().any(|&k| row[k].is_null()) {
                return Err("Cannot insert NULL into a primary key column".to_string());
            }
            let clash = existing.iter().any(|r| same(r, row))
                || candidates[..i].iter().any(|r| same(r, row));
            if clash {
                let values: Vec<String> = keys.iter().map(|&k| row[k].to_string()).collect();
                return Err(format!(
                    "Violation of PRIMARY KEY constraint. The duplicate key value is ({})",
                    values.join(", ")
                ));
            }
        }
        Ok(())
    }
}

/// In-memory destination with injectable failures.
#[derive(Debug, Default)]
pub struct MemoryConnection {
    tables: BTreeMap<String, MemoryTable>,
    failures: Vec<Step>,
    cancellations: Vec<(Step, CancellationToken)>,
    batches: Vec<usize>,
    merges: Vec<MergeStatement>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table synchronously (test setup).
    pub fn with_table(mut self, definition: TableDefinition) -> Self {
        self.insert_table(&definition);
        self
    }

    fn insert_table(&mut self, definition: &TableDefinition) {
        self.tables.insert(
            definition.table.qualified(),
            MemoryTable {
                columns: definition.columns.clone(),
                primary_key: definition.primary_key.clone(),
                rows: Vec::new(),
                next_identity: 1,
            },
        );
    }

    /// Fail the next operation of `step` with a statement error.
    pub fn fail_on(&mut self, step: Step) {
        self.failures.push(step);
    }

    /// Cancel `token` when the next operation of `step` starts, then never
    /// finish that operation.
    pub fn cancel_on(&mut self, step: Step, token: CancellationToken) {
        self.cancellations.push((step, token));
    }

    /// Insert one row by column name; unnamed identity columns are generated.
    pub fn insert_row(&mut self, table: &TableName, values: &[(&str, SqlValue)]) -> Result<()> {
        let name = table.qualified();
        let target = self
            .tables
            .get_mut(&name)
            .ok_or_else(|| missing_table(table, Step::BulkCopy))?;

        let mut row = target.empty_row();
        let mut explicit = HashSet::new();
        for (column, value) in values {
            let index = target.column_index(column).ok_or_else(|| {
                BulkError::destination_schema(
                    &name,
                    Step::BulkCopy,
                    format!("Invalid column name '{}'", column),
                )
            })?;
            row[index] = value.clone().coerce_to(target.null_type(index));
            explicit.insert(index);
        }

        target
            .complete_row(&mut row, &explicit)
            .map_err(|m| BulkError::statement(&name, Step::BulkCopy, m))?;
        target
            .check_primary_key(&target.rows, std::slice::from_ref(&row))
            .map_err(|m| BulkError::statement(&name, Step::BulkCopy, m))?;
        target.rows.push(row);
        Ok(())
    }

    /// Rows of `table` keyed by column name, in insertion order.
    pub fn rows(&self, table: &TableName) -> Vec<BTreeMap<String, SqlValue>> {
        let Some(t) = self.tables.get(&table.qualified()) else {
            return Vec::new();
        };
        t.rows
            .iter()
            .map(|row| {
                t.columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.name.clone(), v.clone()))
                    .collect()
            })
            .collect()
    }

    pub fn row_count(&self, table: &TableName) -> usize {
        self.tables
            .get(&table.qualified())
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn primary_key(&self, table: &TableName) -> Option<&[String]> {
        self.tables
            .get(&table.qualified())
            .map(|t| t.primary_key.as_slice())
    }

    pub fn column_names(&self, table: &TableName) -> Vec<String> {
        self.tables
            .get(&table.qualified())
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Qualified names of the session temp tables still present.
    pub fn temp_tables(&self) -> Vec<String> {
        self.tables
            .keys()
            .filter(|name| name.starts_with("[#"))
            .cloned()
            .collect()
    }

    /// Row counts of every bulk-copy batch sent so far.
    pub fn batches(&self) -> &[usize] {
        &self.batches
    }

    /// Every MERGE executed so far.
    pub fn merges(&self) -> &[MergeStatement] {
        &self.merges
    }

    async fn interrupt(&mut self, step: Step, table: &TableName) -> Result<()> {
        if let Some(pos) = self.failures.iter().position(|s| *s == step) {
            self.failures.remove(pos);
            return Err(BulkError::statement(
                table.qualified(),
                step,
                "injected failure",
            ));
        }
        if let Some(pos) = self.cancellations.iter().position(|(s, _)| *s == step) {
            let (_, token) = self.cancellations.remove(pos);
            token.cancel();
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

fn missing_table(table: &TableName, step: Step) -> BulkError {
    BulkError::destination_schema(
        table.qualified(),
        step,
        format!("Invalid object name '{}'", table.qualified()),
    )
}

fn column_indexes(
    table: &MemoryTable,
    name: &TableName,
    columns: &[String],
    step: Step,
) -> Result<Vec<usize>> {
    columns
        .iter()
        .map(|c| {
            table.column_index(c).ok_or_else(|| {
                BulkError::destination_schema(
                    name.qualified(),
                    step,
                    format!("Invalid column name '{}'", c),
                )
            })
        })
        .collect()
}

#[async_trait]
impl BulkConnection for MemoryConnection {
    async fn create_table(&mut self, definition: &TableDefinition) -> Result<()> {
        self.interrupt(Step::CreateTable, &definition.table).await?;
        let name = definition.table.qualified();
        if self.tables.contains_key(&name) {
            return Err(BulkError::DuplicateTable { table: name });
        }
        self.insert_table(definition);
        debug!("Created table {}", name);
        Ok(())
    }

    async fn table_exists(&mut self, table: &TableName) -> Result<bool> {
        Ok(self.tables.contains_key(&table.qualified()))
    }

    async fn drop_table(&mut self, table: &TableName) -> Result<bool> {
        self.interrupt(Step::DropTable, table).await?;
        Ok(self.tables.remove(&table.qualified()).is_some())
    }

    async fn add_primary_key(
        &mut self,
        table: &TableName,
        _constraint: Option<&str>,
        columns: &[String],
    ) -> Result<()> {
        self.interrupt(Step::CreatePrimaryKey, table).await?;
        let name = table.qualified();
        let target = self
            .tables
            .get_mut(&name)
            .ok_or_else(|| missing_table(table, Step::CreatePrimaryKey))?;

        if !target.primary_key.is_empty() {
            return Err(BulkError::statement(
                &name,
                Step::CreatePrimaryKey,
                "Table already has a primary key defined on it",
            ));
        }
        column_indexes(target, table, columns, Step::CreatePrimaryKey)?;

        let mut candidate = target.clone();
        candidate.primary_key = columns.to_vec();
        candidate
            .check_primary_key(&[], &candidate.rows)
            .map_err(|m| BulkError::statement(&name, Step::CreatePrimaryKey, m))?;

        target.primary_key = columns.to_vec();
        Ok(())
    }

    async fn bulk_copy(
        &mut self,
        destination: &TableName,
        reader: &mut (dyn RowReader + '_),
        options: &BulkInsertOptions,
    ) -> Result<u64> {
        self.interrupt(Step::BulkCopy, destination).await?;
        let name = destination.qualified();
        let target = self
            .tables
            .get_mut(&name)
            .ok_or_else(|| missing_table(destination, Step::BulkCopy))?;

        let mut bindings = Vec::with_capacity(reader.field_count());
        for column in reader.columns() {
            let index = target.column_index(&column.name).ok_or_else(|| {
                BulkError::destination_schema(
                    &name,
                    Step::BulkCopy,
                    format!("Invalid column name '{}'", column.name),
                )
            })?;
            if target.columns[index].identity {
                return Err(BulkError::destination_schema(
                    &name,
                    Step::BulkCopy,
                    format!("Column '{}' is an identity column", column.name),
                ));
            }
            bindings.push(index);
        }
        let explicit: HashSet<usize> = bindings.iter().copied().collect();

        let batch_size = options.batch_size.unwrap_or(usize::MAX);
        let mut batch: Vec<Vec<SqlValue>> = Vec::new();
        let mut total = 0u64;

        loop {
            let more = reader.read()?;
            if more {
                let mut row = target.empty_row();
                for (i, &index) in bindings.iter().enumerate() {
                    row[index] = reader.value(i)?.coerce_to(target.null_type(index));
                }
                target
                    .complete_row(&mut row, &explicit)
                    .map_err(|m| BulkError::statement(&name, Step::BulkCopy, m))?;
                batch.push(row);
            }

            if !batch.is_empty() && (!more || batch.len() >= batch_size) {
                target
                    .check_primary_key(&target.rows, &batch)
                    .map_err(|m| BulkError::statement(&name, Step::BulkCopy, m))?;
                total += batch.len() as u64;
                self.batches.push(batch.len());
                target.rows.append(&mut batch);
            }

            if !more {
                break;
            }
        }

        Ok(total)
    }

    async fn merge(&mut self, statement: &MergeStatement) -> Result<MergeOutcome> {
        self.interrupt(Step::Merge, &statement.target).await?;
        debug!("Merge statement:\n{}", build_merge_sql(statement));
        let target_name = statement.target.qualified();

        let source = self
            .tables
            .get(&statement.source.qualified())
            .ok_or_else(|| missing_table(&statement.source, Step::Merge))?
            .clone();
        let target = self
            .tables
            .get_mut(&target_name)
            .ok_or_else(|| missing_table(&statement.target, Step::Merge))?;

        let source_keys = column_indexes(&source, &statement.source, &statement.key_columns, Step::Merge)?;
        let target_keys = column_indexes(target, &statement.target, &statement.key_columns, Step::Merge)?;
        let source_insert =
            column_indexes(&source, &statement.source, &statement.insert_columns, Step::Merge)?;
        let target_insert =
            column_indexes(target, &statement.target, &statement.insert_columns, Step::Merge)?;
        let source_update =
            column_indexes(&source, &statement.source, &statement.update_columns, Step::Merge)?;
        let target_update =
            column_indexes(target, &statement.target, &statement.update_columns, Step::Merge)?;

        let identity_targeted = target_insert
            .iter()
            .chain(&target_update)
            .any(|&i| target.columns[i].identity);
        if identity_targeted && !statement.identity_insert {
            return Err(BulkError::statement(
                &target_name,
                Step::Merge,
                "Cannot insert explicit value for identity column when IDENTITY_INSERT is set to OFF",
            ));
        }
        if target_update.iter().any(|&i| target.columns[i].identity) {
            return Err(BulkError::statement(
                &target_name,
                Step::Merge,
                "Cannot update identity column",
            ));
        }

        let (ordinal_index, output_keys) = match &statement.output {
            Some(output) => {
                let ordinal = column_indexes(
                    &source,
                    &statement.source,
                    std::slice::from_ref(&output.ordinal_column),
                    Step::Merge,
                )?[0];
                let keys =
                    column_indexes(target, &statement.target, &output.key_columns, Step::Merge)?;
                (Some(ordinal), keys)
            }
            None => (None, Vec::new()),
        };

        // all-or-nothing: work on a copy, commit at the end
        let mut working = target.clone();
        let original_len = working.rows.len();
        let mut touched: HashSet<usize> = HashSet::new();
        let mut inserted: Vec<(usize, Vec<SqlValue>)> = Vec::new();
        let mut updated: Vec<(usize, usize)> = Vec::new();

        for (s, source_row) in source.rows.iter().enumerate() {
            let matches: Vec<usize> = (0..original_len)
                .filter(|&t| {
                    source_keys
                        .iter()
                        .zip(&target_keys)
                        .all(|(&sk, &tk)| source_row[sk].sql_eq(&working.rows[t][tk]))
                })
                .collect();

            if matches.is_empty() {
                let mut row = working.empty_row();
                let mut explicit = HashSet::new();
                for (&si, &ti) in source_insert.iter().zip(&target_insert) {
                    row[ti] = source_row[si].clone().coerce_to(working.null_type(ti));
                    explicit.insert(ti);
                }
                working
                    .complete_row(&mut row, &explicit)
                    .map_err(|m| BulkError::statement(&target_name, Step::Merge, m))?;
                inserted.push((s, row));
                continue;
            }

            for t in matches {
                if !touched.insert(t) {
                    return Err(BulkError::statement(
                        &target_name,
                        Step::Merge,
                        "The MERGE statement attempted to UPDATE or DELETE the same row more than once",
                    ));
                }
                if target_update.is_empty() {
                    continue;
                }
                for (&si, &ti) in source_update.iter().zip(&target_update) {
                    let value = source_row[si].clone().coerce_to(working.null_type(ti));
                    if value.is_null() && !working.columns[ti].nullable {
                        return Err(BulkError::statement(
                            &target_name,
                            Step::Merge,
                            format!(
                                "Cannot update column '{}' to NULL",
                                working.columns[ti].name
                            ),
                        ));
                    }
                    working.rows[t][ti] = value;
                }
                updated.push((s, t));
            }
        }

        let new_rows: Vec<Vec<SqlValue>> = inserted.iter().map(|(_, r)| r.clone()).collect();
        working
            .check_primary_key(&working.rows, &new_rows)
            .map_err(|m| BulkError::statement(&target_name, Step::Merge, m))?;

        let mut outcome = MergeOutcome {
            affected: (updated.len() + inserted.len()) as u64,
            rows: Vec::new(),
        };

        if let Some(ordinal_index) = ordinal_index {
            let ordinal_of = |s: usize| source.rows[s][ordinal_index].as_i64().unwrap_or(-1);
            for &(s, t) in &updated {
                outcome.rows.push(MergeOutputRow {
                    action: MergeAction::Update,
                    ordinal: ordinal_of(s),
                    key: output_keys.iter().map(|&k| working.rows[t][k].clone()).collect(),
                });
            }
            for (s, row) in &inserted {
                outcome.rows.push(MergeOutputRow {
                    action: MergeAction::Insert,
                    ordinal: ordinal_of(*s),
                    key: output_keys.iter().map(|&k| row[k].clone()).collect(),
                });
            }
        }

        working.rows.extend(new_rows);
        *target = working;
        self.merges.push(statement.clone());

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MergeOutput;
    use crate::hints::TableHint;

    fn users() -> TableDefinition {
        TableDefinition {
            table: TableName::new("dbo", "users"),
            columns: vec![
                ColumnDefinition::new("id", "int", false),
                ColumnDefinition::new("name", "nvarchar(50)", true),
                ColumnDefinition::new("email", "nvarchar(50)", true),
            ],
            primary_key: vec!["id".into()],
        }
    }

    fn stage() -> TableDefinition {
        TableDefinition {
            table: TableName::unqualified("#stage"),
            columns: vec![
                ColumnDefinition::new("id", "int", true),
                ColumnDefinition::new("name", "nvarchar(50)", true),
                ColumnDefinition::new("__row_ordinal", "bigint", false),
            ],
            primary_key: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_and_drop() {
        let mut conn = MemoryConnection::new();
        conn.create_table(&stage()).await.unwrap();
        assert_eq!(conn.temp_tables(), vec!["[#stage]".to_string()]);

        let err = conn.create_table(&stage()).await.unwrap_err();
        assert!(matches!(err, BulkError::DuplicateTable { .. }));

        assert!(conn.drop_table(&stage().table).await.unwrap());
        assert!(!conn.drop_table(&stage().table).await.unwrap());
        assert!(conn.temp_tables().is_empty());
    }

    #[tokio::test]
    async fn test_identity_generation() {
        let mut conn = MemoryConnection::new().with_table(TableDefinition {
            table: TableName::new("dbo", "orders"),
            columns: vec![
                ColumnDefinition::new("id", "int", false).identity(),
                ColumnDefinition::new("number", "nvarchar(10)", true),
            ],
            primary_key: vec!["id".into()],
        });
        let orders = TableName::new("dbo", "orders");
        conn.insert_row(&orders, &[("number", "a".into())]).unwrap();
        conn.insert_row(&orders, &[("number", "b".into())]).unwrap();

        let rows = conn.rows(&orders);
        assert_eq!(rows[0]["id"], SqlValue::I32(1));
        assert_eq!(rows[1]["id"], SqlValue::I32(2));
    }

    #[tokio::test]
    async fn test_merge_updates_and_inserts() {
        let mut conn = MemoryConnection::new().with_table(users()).with_table(stage());
        let users_table = users().table;
        conn.insert_row(&users_table, &[("id", 1i32.into()), ("name", "old".into()), ("email", "e".into())])
            .unwrap();

        let stage_table = stage().table;
        conn.insert_row(&stage_table, &[("id", 1i32.into()), ("name", "new".into()), ("__row_ordinal", 0i64.into())])
            .unwrap();
        conn.insert_row(&stage_table, &[("id", 2i32.into()), ("name", "two".into()), ("__row_ordinal", 1i64.into())])
            .unwrap();

        let outcome = conn
            .merge(&MergeStatement {
                target: users_table.clone(),
                source: stage_table,
                key_columns: vec!["id".into()],
                insert_columns: vec!["id".into(), "name".into()],
                update_columns: vec!["name".into()],
                hints: vec![TableHint::HoldLock],
                identity_insert: false,
                output: Some(MergeOutput {
                    ordinal_column: "__row_ordinal".into(),
                    key_columns: vec!["id".into()],
                }),
            })
            .await
            .unwrap();

        assert_eq!(outcome.affected, 2);
        assert_eq!(outcome.updated(), 1);
        assert_eq!(outcome.inserted(), 1);

        let rows = conn.rows(&users_table);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], SqlValue::from("new"));
        assert_eq!(rows[0]["email"], SqlValue::from("e"));
        assert_eq!(rows[1]["id"], SqlValue::I32(2));
        assert!(rows[1]["email"].is_null());
        assert_eq!(conn.merges().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let mut conn = MemoryConnection::new();
        conn.fail_on(Step::CreateTable);
        assert!(conn.create_table(&stage()).await.is_err());
        assert!(conn.create_table(&stage()).await.is_ok());
    }

    #[tokio::test]
    async fn test_add_primary_key_rejects_duplicates() {
        let mut conn = MemoryConnection::new().with_table(stage());
        let table = stage().table;
        for ordinal in 0..2i64 {
            conn.insert_row(&table, &[("id", 1i32.into()), ("__row_ordinal", ordinal.into())])
                .unwrap();
        }
        let err = conn
            .add_primary_key(&table, None, &["id".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PRIMARY KEY"));

        conn.add_primary_key(&table, None, &["__row_ordinal".to_string()])
            .await
            .unwrap();
        assert_eq!(conn.primary_key(&table), Some(&["__row_ordinal".to_string()][..]));
    }
}
