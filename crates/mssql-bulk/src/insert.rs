//! Plain bulk inserts.
//!
//! Records are streamed straight into their table through the bulk-copy
//! channel. Owned records stored in separate tables are loaded afterwards,
//! one navigation at a time, with their foreign key columns bound to the
//! parent's key values.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bulk_copy;
use crate::connection::BulkConnection;
use crate::error::{BulkError, Result};
use crate::mapping::{resolve, separate, InsertPlan, PropertySelector, Purpose};
use crate::options::{
    BulkInsertOptions, PrimaryKeyTiming, StagingBulkInsertOptions,
};
use crate::reader::{EntityDataReader, EntityRow, StreamColumn};
use crate::record::{DynamicRecord, Record};
use crate::shape::{EntityShape, OwnedNavigation, PropertyDefinition, TableName};
use crate::staging::{self, StagingTableReference};
use crate::value::SqlValue;

/// Rows written per table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertResult {
    pub rows_inserted: u64,
    /// Per owned table navigation, in declaration order.
    pub children: Vec<(String, InsertResult)>,
}

impl InsertResult {
    /// Rows written across this table and all owned tables.
    pub fn total(&self) -> u64 {
        self.rows_inserted + self.children.iter().map(|(_, c)| c.total()).sum::<u64>()
    }
}

/// Bulk insert `records` into the shape's table.
pub async fn bulk_insert<C, R>(
    conn: &mut C,
    shape: &Arc<EntityShape>,
    records: &[R],
    options: &BulkInsertOptions,
    cancel: &CancellationToken,
) -> Result<InsertResult>
where
    C: BulkConnection + ?Sized,
    R: Record,
{
    bulk_insert_into_table(conn, shape, &shape.table, records, options, cancel).await
}

/// Bulk insert `records` into `table`. Owned tables still go to their own
/// shape's table.
pub async fn bulk_insert_into_table<C, R>(
    conn: &mut C,
    shape: &Arc<EntityShape>,
    table: &TableName,
    records: &[R],
    options: &BulkInsertOptions,
    cancel: &CancellationToken,
) -> Result<InsertResult>
where
    C: BulkConnection + ?Sized,
    R: Record,
{
    options.validate()?;
    let plan = InsertPlan::build(shape, &options.properties, false)?;
    check_parent_keys(&plan)?;

    let rows: Vec<EntityRow<'_>> = records
        .iter()
        .enumerate()
        .map(|(i, r)| EntityRow::new(r as &dyn Record, i))
        .collect();

    let result = insert_level(conn, &plan, table, rows, options, cancel).await?;
    debug!(
        "Bulk inserted {} rows into {} ({} across owned tables)",
        result.rows_inserted,
        table,
        result.total()
    );
    Ok(result)
}

/// `INSERT BULK` does not return generated values, so children cannot be
/// linked to a parent whose key the destination generates.
fn check_parent_keys(plan: &InsertPlan) -> Result<()> {
    for child in &plan.children {
        for fk in child.navigation.foreign_key() {
            let generated = plan
                .shape
                .property(&fk.principal)
                .is_some_and(PropertyDefinition::is_generated);
            if generated {
                return Err(BulkError::config(format!(
                    "The owned navigation '{}.{}' references the generated key '{}'; use bulk-insert-or-update to propagate generated keys.",
                    plan.shape.name, child.navigation.name, fk.principal
                )));
            }
        }
        check_parent_keys(&child.plan)?;
    }
    Ok(())
}

fn insert_level<'a, C>(
    conn: &'a mut C,
    plan: &'a InsertPlan,
    table: &'a TableName,
    rows: Vec<EntityRow<'a>>,
    options: &'a BulkInsertOptions,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<InsertResult>>
where
    C: BulkConnection + ?Sized,
{
    Box::pin(async move {
        let mut reader = EntityDataReader::new(
            table.qualified(),
            rows.iter().cloned(),
            plan.properties.clone(),
            false,
        );
        let rows_inserted = bulk_copy::execute(conn, table, &mut reader, options, cancel).await?;

        let mut result = InsertResult {
            rows_inserted,
            children: Vec::new(),
        };
        for child in &plan.children {
            let child_rows = owned_rows(table, &rows, &child.navigation)?;
            let child_result = insert_level(
                conn,
                &child.plan,
                &child.plan.shape.table,
                child_rows,
                options,
                cancel,
            )
            .await?;
            result
                .children
                .push((child.navigation.name.clone(), child_result));
        }
        Ok(result)
    })
}

/// Value of an own property of `row`, honoring its own parent bindings.
pub(crate) fn row_value(table: &TableName, row: &EntityRow<'_>, property: &str) -> Result<SqlValue> {
    if let Some(bound) = row
        .parent_key
        .as_deref()
        .and_then(|keys| keys.iter().find(|(name, _)| name == property))
    {
        return Ok(bound.1.clone());
    }
    row.record.value(property).map_err(|e| BulkError::RowMapping {
        table: table.qualified(),
        row: row.ordinal,
        property: property.to_string(),
        message: e.to_string(),
    })
}

/// Child rows behind a table navigation, each bound to its parent's key.
pub(crate) fn owned_rows<'a>(
    table: &TableName,
    parents: &[EntityRow<'a>],
    navigation: &OwnedNavigation,
) -> Result<Vec<EntityRow<'a>>> {
    let mut rows = Vec::new();
    for parent in parents {
        let children = parent.record.owned(&navigation.name);
        if children.is_empty() {
            continue;
        }
        let key: Arc<[(String, SqlValue)]> = navigation
            .foreign_key()
            .iter()
            .map(|fk| Ok((fk.property.clone(), row_value(table, parent, &fk.principal)?)))
            .collect::<Result<Vec<_>>>()?
            .into();
        for child in children {
            let ordinal = rows.len();
            rows.push(EntityRow::new(child, ordinal).with_parent_key(Arc::clone(&key)));
        }
    }
    Ok(rows)
}

/// Create a staging table, load `records` into it and add the deferred key.
///
/// On success the caller owns the returned reference and must dispose it.
/// On failure the table is dropped before the error is returned.
pub async fn bulk_insert_into_staging<C, R>(
    conn: &mut C,
    shape: &Arc<EntityShape>,
    records: &[R],
    options: &StagingBulkInsertOptions,
    cancel: &CancellationToken,
) -> Result<StagingTableReference>
where
    C: BulkConnection + ?Sized,
    R: Record,
{
    options.validate()?;

    let selected = resolve(shape, &options.copy.properties, Purpose::Insert { keep_identity: false })?;
    let (own, external) = separate(selected);
    // `All` simply leaves owned tables out
    if options.copy.properties != PropertySelector::All {
        if let Some(first) = external.first() {
            return Err(BulkError::config(format!(
                "The property '{}' is stored in an owned table and cannot be loaded into a staging table.",
                first
            )));
        }
    }

    let table_properties = if options.staging.use_insert_columns {
        own.clone()
    } else {
        let (all_own, _) = separate(resolve(
            shape,
            &PropertySelector::All,
            Purpose::Insert { keep_identity: true },
        )?);
        all_own
    };
    let keys: Vec<_> = table_properties
        .iter()
        .filter(|p| p.navigations.is_empty() && shape.is_key(&p.property.name))
        .cloned()
        .collect();
    let columns: Vec<StreamColumn> = table_properties
        .into_iter()
        .map(StreamColumn::from_property)
        .collect();

    let mut staging = staging::create(conn, &shape.table, columns, &keys, &options.staging, cancel).await?;

    let outcome = async {
        let rows = records
            .iter()
            .enumerate()
            .map(|(i, r)| EntityRow::new(r as &dyn Record, i));
        let mut reader = EntityDataReader::new(staging.table().qualified(), rows, own, false);
        bulk_copy::execute(conn, staging.table(), &mut reader, &options.copy, cancel).await?;

        if options.staging.primary_key_timing == PrimaryKeyTiming::AfterBulkInsert {
            staging::create_primary_key(conn, &staging, cancel).await?;
        }
        Ok::<_, BulkError>(())
    }
    .await;

    match outcome {
        Ok(()) => Ok(staging),
        Err(e) => {
            if let Err(cleanup) = staging.dispose(conn).await {
                warn!(
                    "Failed to drop staging table {} after error: {}",
                    staging.table(),
                    cleanup
                );
            }
            Err(e)
        }
    }
}

/// Load a single column of values (typically a key list) into a staging
/// table whose only column is `column`.
pub async fn bulk_insert_values_into_staging<C, I>(
    conn: &mut C,
    column: PropertyDefinition,
    values: I,
    options: &StagingBulkInsertOptions,
    cancel: &CancellationToken,
) -> Result<StagingTableReference>
where
    C: BulkConnection + ?Sized,
    I: IntoIterator,
    I::Item: Into<SqlValue>,
{
    let name = column.name.clone();
    let records: Vec<DynamicRecord> = values
        .into_iter()
        .map(|v| DynamicRecord::new().with(name.as_str(), v))
        .collect();
    values_into_staging(conn, vec![column], &records, options, cancel).await
}

/// Load pairs of values (composite key lists) into a staging table with the
/// two columns `first` and `second`, keyed on both.
pub async fn bulk_insert_value_pairs_into_staging<C, I, A, B>(
    conn: &mut C,
    first: PropertyDefinition,
    second: PropertyDefinition,
    values: I,
    options: &StagingBulkInsertOptions,
    cancel: &CancellationToken,
) -> Result<StagingTableReference>
where
    C: BulkConnection + ?Sized,
    I: IntoIterator<Item = (A, B)>,
    A: Into<SqlValue>,
    B: Into<SqlValue>,
{
    let records: Vec<DynamicRecord> = values
        .into_iter()
        .map(|(a, b)| {
            DynamicRecord::new()
                .with(first.name.as_str(), a)
                .with(second.name.as_str(), b)
        })
        .collect();
    values_into_staging(conn, vec![first, second], &records, options, cancel).await
}

async fn values_into_staging<C>(
    conn: &mut C,
    columns: Vec<PropertyDefinition>,
    records: &[DynamicRecord],
    options: &StagingBulkInsertOptions,
    cancel: &CancellationToken,
) -> Result<StagingTableReference>
where
    C: BulkConnection + ?Sized,
{
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    let shape = columns
        .into_iter()
        .fold(
            EntityShape::builder("Values", TableName::unqualified("values")),
            |builder, column| builder.property(column.not_null()),
        )
        .key(names)
        .build()?;

    let mut options = options.clone();
    options.copy.properties = PropertySelector::All;
    bulk_insert_into_staging(conn, &shape, records, &options, cancel).await
}
