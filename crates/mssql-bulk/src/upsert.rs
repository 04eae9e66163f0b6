//! Set-based insert-or-update through a staging table.
//!
//! Each table of the record graph goes through the same steps: create a
//! staging table, bulk copy the rows into it, optionally add the deferred
//! key, MERGE it into the destination and drop it again. Owned tables are
//! processed after their parent, so they see the parent's generated keys.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bulk_copy;
use crate::connection::{cancellable, BulkConnection, MergeOutcome, MergeOutput, MergeStatement};
use crate::error::{BulkError, Result, Step};
use crate::insert::row_value;
use crate::mapping::{PropertyWithNavigation, UpsertPlan};
use crate::options::{MssqlUpsertOptions, PrimaryKeyTiming};
use crate::reader::{EntityDataReader, EntityRow, StreamColumn, ROW_ORDINAL_COLUMN};
use crate::record::Record;
use crate::shape::{EntityShape, OwnedNavigation, TableName};
use crate::staging;
use crate::value::SqlValue;

/// Progress of one table's upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertState {
    Idle,
    StagingCreated,
    Loaded,
    KeyConstraintApplied,
    Merged,
    Disposed,
    Failed,
}

impl fmt::Display for UpsertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpsertState::Idle => "idle",
            UpsertState::StagingCreated => "staging created",
            UpsertState::Loaded => "loaded",
            UpsertState::KeyConstraintApplied => "key constraint applied",
            UpsertState::Merged => "merged",
            UpsertState::Disposed => "disposed",
            UpsertState::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct StateTracker<'a> {
    table: &'a TableName,
    state: UpsertState,
}

impl<'a> StateTracker<'a> {
    fn new(table: &'a TableName) -> Self {
        Self {
            table,
            state: UpsertState::Idle,
        }
    }

    fn advance(&mut self, next: UpsertState) {
        debug!("Upsert {}: {} -> {}", self.table, self.state, next);
        self.state = next;
    }
}

/// Outcome of an upsert of one table and its owned tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertResult {
    pub rows_affected: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Per owned table navigation, in declaration order.
    pub children: Vec<(String, UpsertResult)>,
}

impl UpsertResult {
    pub fn child(&self, navigation: &str) -> Option<&UpsertResult> {
        self.children
            .iter()
            .find(|(name, _)| name == navigation)
            .map(|(_, r)| r)
    }
}

/// A record at one level of the graph.
struct UpsertNode<'r> {
    record: &'r mut dyn Record,
    ordinal: usize,
    parent_key: Option<Arc<[(String, SqlValue)]>>,
}

impl<'r> UpsertNode<'r> {
    fn row(&self) -> EntityRow<'_> {
        EntityRow {
            record: &*self.record,
            ordinal: self.ordinal,
            parent_key: self.parent_key.clone(),
        }
    }
}

/// Insert-or-update `records` into the shape's table.
///
/// Selections are validated and planned before any I/O. Generated values
/// reported by the MERGE are written back into the records.
pub async fn bulk_upsert<C, R>(
    conn: &mut C,
    shape: &Arc<EntityShape>,
    records: &mut [R],
    options: &MssqlUpsertOptions,
    cancel: &CancellationToken,
) -> Result<UpsertResult>
where
    C: BulkConnection + ?Sized,
    R: Record,
{
    options.validate()?;
    let plan = UpsertPlan::build(
        shape,
        &options.insert,
        &options.update,
        &options.key,
        options.keep_identity,
    )?;
    check_key_propagation(&plan)?;

    info!(
        table = %shape.table,
        records = records.len(),
        hints = ?options.merge_table_hints,
        "Executing bulk upsert"
    );
    let start = Instant::now();

    let mut nodes: Vec<UpsertNode<'_>> = records
        .iter_mut()
        .enumerate()
        .map(|(i, r)| UpsertNode {
            record: r as &mut dyn Record,
            ordinal: i,
            parent_key: None,
        })
        .collect();

    match upsert_level(conn, &plan, &mut nodes, options, cancel).await {
        Ok(result) => {
            info!(
                table = %shape.table,
                elapsed_ms = start.elapsed().as_millis() as u64,
                inserted = result.inserted,
                updated = result.updated,
                "Executed bulk upsert"
            );
            Ok(result)
        }
        Err(e) => {
            error!(table = %shape.table, "Bulk upsert failed: {}", e);
            Err(e)
        }
    }
}

/// Columns reported back by the MERGE: the key plus every generated own
/// column of the shape, whether or not it is staged.
fn output_properties(plan: &UpsertPlan) -> Vec<PropertyWithNavigation> {
    let mut out: Vec<PropertyWithNavigation> = plan.key_columns().cloned().collect();
    for property in plan.shape.properties.iter().filter(|p| p.is_generated()) {
        let property = PropertyWithNavigation::own(property.clone());
        if !out.contains(&property) {
            out.push(property);
        }
    }
    out
}

/// Owned tables take their foreign keys from the parent record. A generated
/// principal that is not part of the match key is only known for rows the
/// MERGE reports, and matched rows are reported only when they are updated.
fn check_key_propagation(plan: &UpsertPlan) -> Result<()> {
    let has_update = plan.update_columns().next().is_some();
    for child in &plan.children {
        for fk in child.navigation.foreign_key() {
            let generated = plan
                .shape
                .property(&fk.principal)
                .is_some_and(|p| p.is_generated());
            let matched_on = plan.key_columns().any(|k| k.property.name == fk.principal);
            if generated && !matched_on && !has_update {
                return Err(BulkError::config(format!(
                    "The owned navigation '{}.{}' needs the generated key '{}' of matched rows, but no property of '{}' is selected for update.",
                    plan.shape.name, child.navigation.name, fk.principal, plan.shape.name
                )));
            }
        }
        check_key_propagation(&child.plan)?;
    }
    Ok(())
}

fn column_names<'a>(properties: impl Iterator<Item = &'a PropertyWithNavigation>) -> Vec<String> {
    properties.map(|p| p.column().to_string()).collect()
}

fn merge_statement(
    plan: &UpsertPlan,
    source: &TableName,
    output: &[PropertyWithNavigation],
    options: &MssqlUpsertOptions,
) -> MergeStatement {
    MergeStatement {
        target: plan.shape.table.clone(),
        source: source.clone(),
        key_columns: column_names(plan.key_columns()),
        insert_columns: column_names(plan.insert_columns()),
        update_columns: column_names(plan.update_columns()),
        hints: options.merge_table_hints.clone(),
        identity_insert: plan.has_identity_insert(),
        output: Some(MergeOutput {
            ordinal_column: ROW_ORDINAL_COLUMN.to_string(),
            key_columns: column_names(output.iter()),
        }),
    }
}

fn upsert_level<'a, 'r, C>(
    conn: &'a mut C,
    plan: &'a UpsertPlan,
    nodes: &'a mut [UpsertNode<'r>],
    options: &'a MssqlUpsertOptions,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<UpsertResult>>
where
    C: BulkConnection + ?Sized,
{
    Box::pin(async move {
        // nothing to stage
        if nodes.is_empty() {
            return Ok(UpsertResult::default());
        }

        let table = &plan.shape.table;
        let mut state = StateTracker::new(table);

        let mut columns: Vec<StreamColumn> = plan
            .properties()
            .into_iter()
            .map(StreamColumn::from_property)
            .collect();
        columns.push(StreamColumn::row_ordinal());
        let keys: Vec<PropertyWithNavigation> = plan.key_columns().cloned().collect();

        let mut staging_table =
            match staging::create(conn, table, columns, &keys, &options.staging, cancel).await {
                Ok(reference) => reference,
                Err(e) => {
                    state.advance(UpsertState::Failed);
                    return Err(e);
                }
            };
        state.advance(UpsertState::StagingCreated);

        let output = output_properties(plan);
        let statement = merge_statement(plan, staging_table.table(), &output, options);

        let outcome = async {
            let rows = nodes.iter().map(|n| n.row());
            let mut reader = EntityDataReader::new(
                staging_table.table().qualified(),
                rows,
                plan.properties(),
                true,
            );
            bulk_copy::execute(conn, staging_table.table(), &mut reader, &options.copy, cancel)
                .await?;
            state.advance(UpsertState::Loaded);

            if options.staging.primary_key_timing == PrimaryKeyTiming::AfterBulkInsert {
                staging::create_primary_key(conn, &staging_table, cancel).await?;
                state.advance(UpsertState::KeyConstraintApplied);
            }

            let merged = cancellable(cancel, table, Step::Merge, conn.merge(&statement)).await?;
            state.advance(UpsertState::Merged);
            Ok::<_, BulkError>(merged)
        }
        .await;

        if outcome.is_err() {
            state.advance(UpsertState::Failed);
        }
        let outcome = staging::release(conn, &mut staging_table, outcome).await;
        state.advance(UpsertState::Disposed);
        let merged = outcome?;

        write_back(table, &output, &merged, nodes)?;

        let mut result = UpsertResult {
            rows_affected: merged.affected,
            inserted: merged.inserted(),
            updated: merged.updated(),
            children: Vec::new(),
        };
        debug!(
            "Merged {} rows into {} ({} inserted, {} updated)",
            result.rows_affected, table, result.inserted, result.updated
        );

        for child in &plan.children {
            let mut child_nodes = owned_nodes(table, nodes, &child.navigation)?;
            let child_result =
                upsert_level(conn, &child.plan, &mut child_nodes, options, cancel).await?;
            result
                .children
                .push((child.navigation.name.clone(), child_result));
        }

        Ok(result)
    })
}

/// Store generated values reported for inserted and updated rows in their
/// records.
fn write_back(
    table: &TableName,
    output: &[PropertyWithNavigation],
    merged: &MergeOutcome,
    nodes: &mut [UpsertNode<'_>],
) -> Result<()> {
    if !output.iter().any(|p| p.property.is_generated()) {
        return Ok(());
    }

    for row in &merged.rows {
        let node = usize::try_from(row.ordinal)
            .ok()
            .and_then(|i| nodes.get_mut(i))
            .ok_or_else(|| {
                BulkError::statement(
                    table.qualified(),
                    Step::Merge,
                    format!("MERGE reported unknown row ordinal {}", row.ordinal),
                )
            })?;

        for (property, value) in output.iter().zip(&row.key) {
            if !property.property.is_generated() {
                continue;
            }
            let value = value.clone().coerce_to(property.property.null_type);
            node.record
                .set_value(&property.property.name, value)
                .map_err(|e| BulkError::RowMapping {
                    table: table.qualified(),
                    row: node.ordinal,
                    property: property.path(),
                    message: e.to_string(),
                })?;
        }
    }
    Ok(())
}

/// Child records behind `navigation`, bound to their parent's key values.
fn owned_nodes<'b>(
    table: &TableName,
    nodes: &'b mut [UpsertNode<'_>],
    navigation: &OwnedNavigation,
) -> Result<Vec<UpsertNode<'b>>> {
    let mut children = Vec::new();
    for node in nodes.iter_mut() {
        if node.record.owned(&navigation.name).is_empty() {
            continue;
        }

        let key: Arc<[(String, SqlValue)]> = {
            let parent = node.row();
            navigation
                .foreign_key()
                .iter()
                .map(|fk| Ok((fk.property.clone(), row_value(table, &parent, &fk.principal)?)))
                .collect::<Result<Vec<_>>>()?
                .into()
        };

        for record in node.record.owned_mut(&navigation.name) {
            let ordinal = children.len();
            children.push(UpsertNode {
                record,
                ordinal,
                parent_key: Some(Arc::clone(&key)),
            });
        }
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PropertySelector;
    use crate::shape::PropertyDefinition;

    fn shape() -> Arc<EntityShape> {
        EntityShape::builder("Order", TableName::new("dbo", "orders"))
            .property(PropertyDefinition::new("id", "int").generated_on_add())
            .property(PropertyDefinition::new("code", "nvarchar(20)").not_null())
            .property(PropertyDefinition::new("number", "nvarchar(20)"))
            .key(["code"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_output_includes_generated_columns() {
        let plan = UpsertPlan::build(
            &shape(),
            &PropertySelector::All,
            &PropertySelector::All,
            &PropertySelector::All,
            false,
        )
        .unwrap();
        let output: Vec<String> = output_properties(&plan).iter().map(|p| p.path()).collect();
        assert_eq!(output, vec!["code", "id"]);
    }

    #[test]
    fn test_output_includes_unstaged_generated_columns() {
        let plan = UpsertPlan::build(
            &shape(),
            &PropertySelector::include(["code"]),
            &PropertySelector::include(["number"]),
            &PropertySelector::All,
            false,
        )
        .unwrap();
        assert!(plan.properties().iter().all(|p| p.path() != "id"));
        let output: Vec<String> = output_properties(&plan).iter().map(|p| p.path()).collect();
        assert_eq!(output, vec!["code", "id"]);
    }

    #[test]
    fn test_merge_statement_columns() {
        let plan = UpsertPlan::build(
            &shape(),
            &PropertySelector::All,
            &PropertySelector::include(["number"]),
            &PropertySelector::All,
            false,
        )
        .unwrap();
        let options = MssqlUpsertOptions::default();
        let output = output_properties(&plan);
        let statement = merge_statement(&plan, &TableName::unqualified("#stage"), &output, &options);

        assert_eq!(statement.key_columns, vec!["code"]);
        assert_eq!(statement.insert_columns, vec!["code", "number"]);
        assert_eq!(statement.update_columns, vec!["number"]);
        assert!(!statement.identity_insert);
        assert_eq!(statement.hints, options.merge_table_hints);
        assert_eq!(
            statement.output.unwrap().ordinal_column,
            ROW_ORDINAL_COLUMN.to_string()
        );
    }

    #[test]
    fn test_identity_insert_when_keeping_identity() {
        let plan = UpsertPlan::build(
            &shape(),
            &PropertySelector::All,
            &PropertySelector::All,
            &PropertySelector::All,
            true,
        )
        .unwrap();
        let statement = merge_statement(
            &plan,
            &TableName::unqualified("#stage"),
            &output_properties(&plan),
            &MssqlUpsertOptions::default(),
        );
        assert!(statement.identity_insert);
        assert_eq!(statement.insert_columns, vec!["id", "code", "number"]);
        assert_eq!(statement.update_columns, vec!["number"]);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(UpsertState::KeyConstraintApplied.to_string(), "key constraint applied");
        let table = TableName::new("dbo", "orders");
        let mut tracker = StateTracker::new(&table);
        tracker.advance(UpsertState::StagingCreated);
        assert_eq!(tracker.state, UpsertState::StagingCreated);
    }
}
