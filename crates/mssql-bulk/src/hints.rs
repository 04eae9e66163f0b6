//! SQL Server table hints.

use std::fmt;

use crate::error::{BulkError, Result};
use crate::sql::quote_ident;

/// Table hint attached to a table reference, e.g. the MERGE target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableHint {
    NoExpand,
    ForceScan,
    ForceSeek,
    HoldLock,
    NoLock,
    NoWait,
    PagLock,
    ReadCommitted,
    ReadCommittedLock,
    ReadPast,
    ReadUncommitted,
    RepeatableRead,
    RowLock,
    Serializable,
    Snapshot,
    TabLock,
    TabLockX,
    UpdLock,
    XLock,
    /// `INDEX(name)`; the name is quoted when rendered.
    Index(String),
    SpatialWindowMaxCells(u32),
}

impl TableHint {
    /// Hints SQL Server rejects on the target of an INSERT/UPDATE/MERGE.
    pub fn is_merge_compatible(&self) -> bool {
        !matches!(
            self,
            TableHint::NoLock
                | TableHint::ReadUncommitted
                | TableHint::NoExpand
                | TableHint::ReadPast
                | TableHint::SpatialWindowMaxCells(_)
        )
    }
}

impl fmt::Display for TableHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableHint::NoExpand => f.write_str("NOEXPAND"),
            TableHint::ForceScan => f.write_str("FORCESCAN"),
            TableHint::ForceSeek => f.write_str("FORCESEEK"),
            TableHint::HoldLock => f.write_str("HOLDLOCK"),
            TableHint::NoLock => f.write_str("NOLOCK"),
            TableHint::NoWait => f.write_str("NOWAIT"),
            TableHint::PagLock => f.write_str("PAGLOCK"),
            TableHint::ReadCommitted => f.write_str("READCOMMITTED"),
            TableHint::ReadCommittedLock => f.write_str("READCOMMITTEDLOCK"),
            TableHint::ReadPast => f.write_str("READPAST"),
            TableHint::ReadUncommitted => f.write_str("READUNCOMMITTED"),
            TableHint::RepeatableRead => f.write_str("REPEATABLEREAD"),
            TableHint::RowLock => f.write_str("ROWLOCK"),
            TableHint::Serializable => f.write_str("SERIALIZABLE"),
            TableHint::Snapshot => f.write_str("SNAPSHOT"),
            TableHint::TabLock => f.write_str("TABLOCK"),
            TableHint::TabLockX => f.write_str("TABLOCKX"),
            TableHint::UpdLock => f.write_str("UPDLOCK"),
            TableHint::XLock => f.write_str("XLOCK"),
            TableHint::Index(name) => write!(f, "INDEX({})", quote_ident(name)),
            TableHint::SpatialWindowMaxCells(n) => write!(f, "SPATIAL_WINDOW_MAX_CELLS = {}", n),
        }
    }
}

/// Reject hints that are not allowed on a MERGE target.
pub fn validate_merge_hints(hints: &[TableHint]) -> Result<()> {
    if let Some(hint) = hints.iter().find(|h| !h.is_merge_compatible()) {
        return Err(BulkError::config(format!(
            "Table hint {} is not allowed on the target of a MERGE statement",
            hint
        )));
    }
    Ok(())
}

/// Render ` WITH (A, B)` with duplicates collapsed, or an empty string.
pub fn render_hints(hints: &[TableHint]) -> String {
    let mut seen: Vec<&TableHint> = Vec::with_capacity(hints.len());
    for hint in hints {
        if !seen.contains(&hint) {
            seen.push(hint);
        }
    }

    if seen.is_empty() {
        return String::new();
    }

    let rendered: Vec<String> = seen.iter().map(|h| h.to_string()).collect();
    format!(" WITH ({})", rendered.join(", "))
}
