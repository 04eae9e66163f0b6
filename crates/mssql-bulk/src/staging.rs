//! Session-scoped staging tables.
//!
//! A staging table is created per call, loaded through the bulk-copy channel
//! and dropped again on every exit path. [`release`] is the single exit
//! point: it disposes the table and then hands back the body's outcome,
//! never letting a cleanup failure hide the original error.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{cancellable, BulkConnection, ColumnDefinition, TableDefinition};
use crate::error::{BulkError, Result, Step};
use crate::mapping::PropertyWithNavigation;
use crate::options::{PrimaryKeyTiming, StagingTableName, StagingTableOptions};
use crate::reader::{StreamColumn, ROW_ORDINAL_COLUMN};
use crate::shape::TableName;
use crate::sql::{default_primary_key_name, MAX_TEMP_TABLE_NAME_LENGTH};

/// Characters of the destination name kept in generated staging names.
const STAGING_NAME_TABLE_CHARS: usize = 60;

/// Longest prefix that keeps a generated name (`#`, prefix, table, `_`,
/// 32 hex digits) within the temp table name limit.
pub const MAX_STAGING_PREFIX_LENGTH: usize =
    MAX_TEMP_TABLE_NAME_LENGTH - 1 - STAGING_NAME_TABLE_CHARS - 1 - 32;

/// Handle to a created staging table.
///
/// Must be disposed through [`StagingTableReference::dispose`] or
/// [`release`]; dropping a live reference only logs a warning because
/// dropping the table needs the connection.
#[derive(Debug)]
pub struct StagingTableReference {
    table: TableName,
    columns: Vec<StreamColumn>,
    primary_key: Vec<String>,
    created: bool,
    disposed: bool,
}

impl StagingTableReference {
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Columns in table order.
    pub fn columns(&self) -> &[StreamColumn] {
        &self.columns
    }

    /// Columns of the staging primary key (declared or deferred).
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed || !self.created
    }

    /// Drop the table. Idempotent; a table that is already gone is not an
    /// error.
    pub async fn dispose<C>(&mut self, conn: &mut C) -> Result<()>
    where
        C: BulkConnection + ?Sized,
    {
        if self.is_disposed() {
            return Ok(());
        }
        // a failed drop is not retried by a second dispose
        self.disposed = true;
        let dropped = conn.drop_table(&self.table).await?;
        debug!("Disposed staging table {} (dropped: {})", self.table, dropped);
        Ok(())
    }
}

impl Drop for StagingTableReference {
    fn drop(&mut self) {
        if !self.is_disposed() {
            warn!(
                "Staging table {} was not disposed; it lives until the session ends",
                self.table
            );
        }
    }
}

/// Name of the staging table for `target`.
pub fn staging_table_name(target: &TableName, options: &StagingTableOptions) -> TableName {
    match &options.name {
        StagingTableName::Generated => {
            let base: String = target
                .name
                .trim_start_matches('#')
                .chars()
                .take(STAGING_NAME_TABLE_CHARS)
                .collect();
            TableName::unqualified(format!(
                "#{}{}_{}",
                options.prefix,
                base,
                Uuid::new_v4().simple()
            ))
        }
        StagingTableName::Custom(name) if name.starts_with('#') => TableName::unqualified(name),
        StagingTableName::Custom(name) => TableName::unqualified(format!("#{}", name)),
    }
}

/// Staging key columns: the key properties present in `columns`, or the row
/// ordinal when a key is generated by the destination (its placeholders are
/// NULL in staging).
pub fn staging_primary_key(
    columns: &[StreamColumn],
    keys: &[PropertyWithNavigation],
) -> Vec<String> {
    let has_ordinal = columns.iter().any(|c| c.name == ROW_ORDINAL_COLUMN);
    if keys.iter().any(|k| k.property.is_generated()) {
        return if has_ordinal {
            vec![ROW_ORDINAL_COLUMN.to_string()]
        } else {
            Vec::new()
        };
    }

    keys.iter()
        .filter(|k| columns.iter().any(|c| c.property() == Some(*k)))
        .map(|k| k.column().to_string())
        .collect()
}

fn column_definition(column: &StreamColumn, key: bool) -> ColumnDefinition {
    let nullable = match column.property() {
        _ if key => false,
        Some(p) => p.property.nullable || p.property.is_generated(),
        None => false,
    };
    ColumnDefinition::new(&column.name, &column.column_type, nullable)
}

/// Create a staging table for rows destined to `target`.
///
/// `columns` become the table's columns in order. Generated columns are
/// created without `IDENTITY` so the staging table can hold placeholders.
pub async fn create<C>(
    conn: &mut C,
    target: &TableName,
    columns: Vec<StreamColumn>,
    keys: &[PropertyWithNavigation],
    options: &StagingTableOptions,
    cancel: &CancellationToken,
) -> Result<StagingTableReference>
where
    C: BulkConnection + ?Sized,
{
    options.validate()?;
    if columns.is_empty() {
        return Err(BulkError::config(format!(
            "Staging table for {} needs at least one column",
            target
        )));
    }

    let table = staging_table_name(target, options);
    let primary_key = match options.primary_key_timing {
        PrimaryKeyTiming::None => Vec::new(),
        _ => staging_primary_key(&columns, keys),
    };

    let definition = TableDefinition {
        table: table.clone(),
        columns: columns
            .iter()
            .map(|c| column_definition(c, primary_key.contains(&c.name)))
            .collect(),
        primary_key: match options.primary_key_timing {
            PrimaryKeyTiming::BeforeBulkInsert => primary_key.clone(),
            _ => Vec::new(),
        },
    };

    if matches!(options.name, StagingTableName::Custom(_)) {
        let exists = cancellable(cancel, &table, Step::CreateTable, conn.table_exists(&table)).await?;
        if exists {
            if !options.drop_if_exists {
                return Err(BulkError::DuplicateTable {
                    table: table.qualified(),
                });
            }
            debug!("Dropping existing staging table {}", table);
            cancellable(cancel, &table, Step::DropTable, conn.drop_table(&table)).await?;
        }
    }

    let created = cancellable(cancel, &table, Step::CreateTable, conn.create_table(&definition)).await;
    if let Err(e) = created {
        if matches!(e, BulkError::Cancelled { .. } | BulkError::Timeout { .. }) {
            // the CREATE may have reached the server before the interruption
            if let Err(cleanup) = conn.drop_table(&table).await {
                warn!("Failed to drop staging table {} after {}: {}", table, e, cleanup);
            }
        }
        return Err(e);
    }

    debug!(
        "Created staging table {} ({} columns, key timing {:?})",
        table,
        definition.columns.len(),
        options.primary_key_timing
    );

    Ok(StagingTableReference {
        table,
        columns,
        primary_key,
        created: true,
        disposed: false,
    })
}

/// Add the deferred primary key. Temp tables get an unnamed constraint
/// because constraint names are global in tempdb.
pub async fn create_primary_key<C>(
    conn: &mut C,
    staging: &StagingTableReference,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: BulkConnection + ?Sized,
{
    if staging.primary_key.is_empty() {
        return Ok(());
    }
    let constraint = (!staging.table.is_temporary()).then(|| default_primary_key_name(&staging.table));
    cancellable(
        cancel,
        &staging.table,
        Step::CreatePrimaryKey,
        conn.add_primary_key(&staging.table, constraint.as_deref(), &staging.primary_key),
    )
    .await?;
    debug!(
        "Created primary key on {} ({})",
        staging.table,
        staging.primary_key.join(", ")
    );
    Ok(())
}

/// Dispose `staging` and return `outcome`. A dispose failure is returned
/// only when the body succeeded; otherwise it is logged and the body's
/// error wins.
pub async fn release<C, T>(
    conn: &mut C,
    staging: &mut StagingTableReference,
    outcome: Result<T>,
) -> Result<T>
where
    C: BulkConnection + ?Sized,
{
    let disposed = staging.dispose(conn).await;
    match (outcome, disposed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            warn!(
                "Failed to drop staging table {} after error: {}",
                staging.table, cleanup
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use crate::shape::PropertyDefinition;

    fn columns() -> (Vec<StreamColumn>, Vec<PropertyWithNavigation>) {
        let id = PropertyWithNavigation::own(PropertyDefinition::new("id", "int").not_null());
        let name = PropertyWithNavigation::own(PropertyDefinition::new("name", "nvarchar(50)"));
        let cols = vec![
            StreamColumn::from_property(id.clone()),
            StreamColumn::from_property(name),
            StreamColumn::row_ordinal(),
        ];
        (cols, vec![id])
    }

    #[test]
    fn test_generated_names_are_unique_temp_tables() {
        let target = TableName::new("dbo", "customers");
        let options = StagingTableOptions::default();
        let a = staging_table_name(&target, &options);
        let b = staging_table_name(&target, &options);
        assert!(a.is_temporary());
        assert!(a.name.starts_with("#bulk_customers_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_longest_generated_name_fits() {
        let target = TableName::new("dbo", "t".repeat(128));
        let options = StagingTableOptions {
            prefix: "p".repeat(MAX_STAGING_PREFIX_LENGTH),
            ..Default::default()
        };
        let name = staging_table_name(&target, &options);
        assert_eq!(name.name.chars().count(), MAX_TEMP_TABLE_NAME_LENGTH);
    }

    #[test]
    fn test_custom_name_gets_hash_prefix() {
        let target = TableName::new("dbo", "customers");
        let options = StagingTableOptions {
            name: StagingTableName::Custom("stage".into()),
            ..Default::default()
        };
        assert_eq!(staging_table_name(&target, &options).name, "#stage");
    }

    #[test]
    fn test_generated_key_uses_row_ordinal() {
        let id = PropertyWithNavigation::own(PropertyDefinition::new("id", "int").generated_on_add());
        let cols = vec![StreamColumn::from_property(id.clone()), StreamColumn::row_ordinal()];
        assert_eq!(staging_primary_key(&cols, &[id.clone()]), vec![ROW_ORDINAL_COLUMN]);
        assert!(staging_primary_key(&cols[..1], &[id]).is_empty());
    }

    #[tokio::test]
    async fn test_create_and_dispose() {
        let mut conn = MemoryConnection::new();
        let cancel = CancellationToken::new();
        let (cols, keys) = columns();
        let target = TableName::new("dbo", "customers");

        let mut staging = create(&mut conn, &target, cols, &keys, &StagingTableOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(conn.temp_tables().len(), 1);
        assert_eq!(staging.primary_key(), ["id".to_string()]);
        // deferred: no key yet
        assert_eq!(conn.primary_key(staging.table()), Some(&[][..]));

        create_primary_key(&mut conn, &staging, &cancel).await.unwrap();
        assert_eq!(conn.primary_key(staging.table()), Some(&["id".to_string()][..]));

        staging.dispose(&mut conn).await.unwrap();
        staging.dispose(&mut conn).await.unwrap();
        assert!(conn.temp_tables().is_empty());
    }

    #[tokio::test]
    async fn test_custom_name_collision() {
        let mut conn = MemoryConnection::new();
        let cancel = CancellationToken::new();
        let target = TableName::new("dbo", "customers");
        let mut options = StagingTableOptions {
            name: StagingTableName::Custom("#stage".into()),
            ..Default::default()
        };

        let (cols, keys) = columns();
        let mut first = create(&mut conn, &target, cols.clone(), &keys, &options, &cancel)
            .await
            .unwrap();
        let err = create(&mut conn, &target, cols.clone(), &keys, &options, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BulkError::DuplicateTable { .. }));

        options.drop_if_exists = true;
        let mut second = create(&mut conn, &target, cols, &keys, &options, &cancel)
            .await
            .unwrap();
        assert_eq!(conn.temp_tables(), vec!["[#stage]".to_string()]);

        second.dispose(&mut conn).await.unwrap();
        first.dispose(&mut conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_keeps_body_error() {
        let mut conn = MemoryConnection::new();
        let cancel = CancellationToken::new();
        let (cols, keys) = columns();
        let target = TableName::new("dbo", "customers");
        let mut staging = create(&mut conn, &target, cols, &keys, &StagingTableOptions::default(), &cancel)
            .await
            .unwrap();

        conn.fail_on(Step::DropTable);
        let outcome: Result<()> = Err(BulkError::config("body failed"));
        let err = release(&mut conn, &mut staging, outcome).await.unwrap_err();
        assert!(matches!(err, BulkError::Configuration(_)));
        assert!(staging.is_disposed());
    }
}
