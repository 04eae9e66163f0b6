//! Bulk copy executor.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::connection::{cancellable, BulkConnection};
use crate::error::{BulkError, Result, Step};
use crate::options::BulkInsertOptions;
use crate::reader::RowReader;
use crate::shape::TableName;

fn describe_columns(reader: &dyn RowReader) -> String {
    reader
        .columns()
        .iter()
        .map(|c| format!("{} {}", c.name, c.column_type))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Stream every row of `reader` into `destination`.
///
/// The connection is only borrowed: whatever transaction it carries is
/// joined, never opened or finished here.
pub async fn execute<C>(
    conn: &mut C,
    destination: &TableName,
    reader: &mut (dyn RowReader + '_),
    options: &BulkInsertOptions,
    cancel: &CancellationToken,
) -> Result<u64>
where
    C: BulkConnection + ?Sized,
{
    options.validate()?;

    let columns = describe_columns(reader);
    info!(
        table = %destination,
        columns = %columns,
        batch_size = ?options.batch_size,
        timeout = ?options.timeout,
        streaming = options.enable_streaming,
        "Executing bulk copy"
    );

    let start = Instant::now();
    let copy = conn.bulk_copy(destination, reader, options);
    let result = match options.timeout {
        Some(after) => {
            let limited = async {
                tokio::time::timeout(after, copy)
                    .await
                    .unwrap_or_else(|_| {
                        Err(BulkError::Timeout {
                            table: destination.qualified(),
                            step: Step::BulkCopy,
                            after,
                        })
                    })
            };
            cancellable(cancel, destination, Step::BulkCopy, limited).await
        }
        None => cancellable(cancel, destination, Step::BulkCopy, copy).await,
    };

    match result {
        Ok(rows) => {
            info!(
                table = %destination,
                elapsed_ms = start.elapsed().as_millis() as u64,
                rows,
                "Executed bulk copy"
            );
            Ok(rows)
        }
        Err(e) => {
            error!(
                table = %destination,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Bulk copy failed: {}",
                e
            );
            Err(e)
        }
    }
}
