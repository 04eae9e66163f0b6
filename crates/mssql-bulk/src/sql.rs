//! SQL Server statement text.
//!
//! Identifiers cannot be bound as parameters, so every table and column name
//! that ends up in statement text goes through [`quote_ident`].

use crate::connection::{MergeStatement, TableDefinition};
use crate::error::{BulkError, Result};
use crate::hints::render_hints;
use crate::shape::TableName;

/// SQL Server identifier length limit.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Temp table names are truncated by SQL Server beyond this length.
pub const MAX_TEMP_TABLE_NAME_LENGTH: usize = 116;

/// Reject empty identifiers, null bytes and over-long names.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BulkError::config("Identifier cannot be empty"));
    }

    if name.contains('\0') {
        return Err(BulkError::config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(BulkError::config(format!(
            "Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote an MSSQL identifier with brackets.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// `[schema].[name]`, or `[name]` without a schema.
pub fn qualify(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        None => quote_ident(name),
    }
}

/// Name to pass to `OBJECT_ID`; temp tables live in tempdb.
pub fn object_id_name(table: &TableName) -> String {
    if table.is_temporary() {
        format!("tempdb..{}", quote_ident(&table.name))
    } else {
        table.qualified()
    }
}

/// Catalog prefix for `sys.columns` lookups of `table`.
pub fn catalog_prefix(table: &TableName) -> &'static str {
    if table.is_temporary() {
        "tempdb."
    } else {
        ""
    }
}

/// Build CREATE TABLE. Temp tables get an unnamed primary key because
/// constraint names are global in tempdb.
pub fn build_create_table_sql(definition: &TableDefinition) -> String {
    let mut parts: Vec<String> = definition
        .columns
        .iter()
        .map(|c| {
            let identity = if c.identity { " IDENTITY(1,1)" } else { "" };
            let null_str = if c.nullable { "NULL" } else { "NOT NULL" };
            format!(
                "{} {}{} {}",
                quote_ident(&c.name),
                c.column_type,
                identity,
                null_str
            )
        })
        .collect();

    if !definition.primary_key.is_empty() {
        let pk_cols: Vec<String> = definition.primary_key.iter().map(|c| quote_ident(c)).collect();
        if definition.table.is_temporary() {
            parts.push(format!("PRIMARY KEY CLUSTERED ({})", pk_cols.join(", ")));
        } else {
            parts.push(format!(
                "CONSTRAINT {} PRIMARY KEY CLUSTERED ({})",
                quote_ident(&default_primary_key_name(&definition.table)),
                pk_cols.join(", ")
            ));
        }
    }

    format!(
        "CREATE TABLE {} ({})",
        definition.table.qualified(),
        parts.join(", ")
    )
}

pub fn build_drop_table_sql(table: &TableName) -> String {
    format!("DROP TABLE IF EXISTS {}", table.qualified())
}

pub fn default_primary_key_name(table: &TableName) -> String {
    format!("PK_{}", table.name.trim_start_matches('#'))
}

/// Build ALTER TABLE ... ADD PRIMARY KEY.
pub fn build_primary_key_sql(
    table: &TableName,
    constraint: Option<&str>,
    columns: &[String],
) -> String {
    let pk_cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    match constraint {
        Some(name) => format!(
            "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY CLUSTERED ({})",
            table.qualified(),
            quote_ident(name),
            pk_cols.join(", ")
        ),
        None => format!(
            "ALTER TABLE {} ADD PRIMARY KEY CLUSTERED ({})",
            table.qualified(),
            pk_cols.join(", ")
        ),
    }
}

/// Build the MERGE statement from staging table to target table.
///
/// Matched rows update the update columns (the clause is omitted when there
/// are none), unmatched rows insert the insert columns. With an output
/// clause every affected row reports `$action`, its source ordinal and the
/// key values the destination stored.
pub fn build_merge_sql(statement: &MergeStatement) -> String {
    let target = statement.target.qualified();

    let join_condition: Vec<String> = statement
        .key_columns
        .iter()
        .map(|k| format!("target.{} = source.{}", quote_ident(k), quote_ident(k)))
        .collect();

    let mut sql = String::new();

    if statement.identity_insert {
        sql.push_str(&format!("SET IDENTITY_INSERT {} ON;\n", target));
    }

    sql.push_str(&format!(
        "MERGE INTO {}{} AS target\nUSING {} AS source\nON {}\n",
        target,
        render_hints(&statement.hints),
        statement.source.qualified(),
        join_condition.join(" AND ")
    ));

    if !statement.update_columns.is_empty() {
        let update_cols: Vec<String> = statement
            .update_columns
            .iter()
            .map(|c| format!("{} = source.{}", quote_ident(c), quote_ident(c)))
            .collect();
        sql.push_str(&format!(
            "WHEN MATCHED THEN UPDATE SET {}\n",
            update_cols.join(", ")
        ));
    }

    if statement.insert_columns.is_empty() {
        sql.push_str("WHEN NOT MATCHED THEN INSERT DEFAULT VALUES");
    } else {
        let col_list: Vec<String> = statement.insert_columns.iter().map(|c| quote_ident(c)).collect();
        let source_cols: Vec<String> = statement
            .insert_columns
            .iter()
            .map(|c| format!("source.{}", quote_ident(c)))
            .collect();
        sql.push_str(&format!(
            "WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            col_list.join(", "),
            source_cols.join(", ")
        ));
    }

    if let Some(output) = &statement.output {
        let mut cols = vec![
            "$action".to_string(),
            format!("source.{}", quote_ident(&output.ordinal_column)),
        ];
        cols.extend(
            output
                .key_columns
                .iter()
                .map(|k| format!("INSERTED.{}", quote_ident(k))),
        );
        sql.push_str(&format!("\nOUTPUT {}", cols.join(", ")));
    }
    sql.push(';');

    if statement.identity_insert {
        sql.push_str(&format!("\nSET IDENTITY_INSERT {} OFF;", target));
    }

    sql
}
