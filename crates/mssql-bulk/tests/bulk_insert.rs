//! Bulk insert integration tests against the in-memory backend.

mod common;

use common::*;
use mssql_bulk::{
    bulk_insert, bulk_insert_into_table, BulkError, BulkInsertOptions, CancellationToken, ColumnDefinition,
    DynamicRecord, EntityShape, MemoryConnection, PropertyDefinition, PropertySelector, SqlValue,
    TableDefinition, TableName,
};

#[tokio::test]
async fn test_thousand_flat_records() {
    init_tracing();
    let mut conn = MemoryConnection::new().with_table(customers_table());
    let records: Vec<DynamicRecord> = (1..=1000)
        .map(|i| customer(i, &format!("customer {}", i), "c@example.com"))
        .collect();

    let options = BulkInsertOptions {
        batch_size: Some(250),
        ..Default::default()
    };
    let result = bulk_insert(&mut conn, &customer_shape(), &records, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.rows_inserted, 1000);
    assert_eq!(result.total(), 1000);
    assert_eq!(conn.row_count(&customers()), 1000);
    assert_eq!(conn.batches(), &[250, 250, 250, 250]);
    assert!(conn.temp_tables().is_empty());
}

#[tokio::test]
async fn test_selected_properties_only() {
    let mut conn = MemoryConnection::new().with_table(customers_table());
    let options = BulkInsertOptions {
        properties: PropertySelector::exclude(["email"]),
        ..Default::default()
    };
    bulk_insert(
        &mut conn,
        &customer_shape(),
        &[customer(1, "Ada", "ada@example.com")],
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let rows = conn.rows(&customers());
    assert_eq!(rows[0]["name"], text("Ada"));
    assert!(rows[0]["email"].is_null());
}

#[tokio::test]
async fn test_declaration_order_does_not_change_values() {
    fn shape(table: &str, first: &str, second: &str) -> std::sync::Arc<EntityShape> {
        EntityShape::builder("Pair", TableName::new("dbo", table))
            .property(PropertyDefinition::new(first, "int"))
            .property(PropertyDefinition::new(second, "int"))
            .build()
            .unwrap()
    }
    fn table(name: &str) -> TableDefinition {
        TableDefinition {
            table: TableName::new("dbo", name),
            columns: vec![
                ColumnDefinition::new("a", "int", true),
                ColumnDefinition::new("b", "int", true),
            ],
            primary_key: Vec::new(),
        }
    }

    let mut conn = MemoryConnection::new().with_table(table("ab")).with_table(table("ba"));
    let records = vec![
        DynamicRecord::new().with("a", 1).with("b", 2),
        DynamicRecord::new().with("a", 3).with("b", 4),
    ];
    let cancel = CancellationToken::new();
    let options = BulkInsertOptions::default();
    bulk_insert(&mut conn, &shape("ab", "a", "b"), &records, &options, &cancel)
        .await
        .unwrap();
    bulk_insert(&mut conn, &shape("ba", "b", "a"), &records, &options, &cancel)
        .await
        .unwrap();

    assert_eq!(
        conn.rows(&TableName::new("dbo", "ab")),
        conn.rows(&TableName::new("dbo", "ba"))
    );
    assert_eq!(conn.rows(&TableName::new("dbo", "ba"))[1]["b"], SqlValue::I32(4));
}

#[tokio::test]
async fn test_missing_value_aborts_with_row_mapping_error() {
    let mut conn = MemoryConnection::new().with_table(customers_table());
    let records = vec![
        customer(1, "Ada", "ada@example.com"),
        DynamicRecord::new().with("id", 2).with("name", "Bob"),
    ];

    let err = bulk_insert(
        &mut conn,
        &customer_shape(),
        &records,
        &BulkInsertOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    match err {
        BulkError::RowMapping { row, property, .. } => {
            assert_eq!(row, 1);
            assert_eq!(property, "email");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(conn.row_count(&customers()), 0);
}

#[tokio::test]
async fn test_missing_destination_table() {
    let mut conn = MemoryConnection::new();
    let err = bulk_insert(
        &mut conn,
        &customer_shape(),
        &[customer(1, "Ada", "ada@example.com")],
        &BulkInsertOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BulkError::DestinationSchema { .. }));
}

#[tokio::test]
async fn test_zero_batch_size_rejected_before_io() {
    let mut conn = MemoryConnection::new().with_table(customers_table());
    let options = BulkInsertOptions {
        batch_size: Some(0),
        ..Default::default()
    };
    let err = bulk_insert(
        &mut conn,
        &customer_shape(),
        &[customer(1, "Ada", "ada@example.com")],
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BulkError::Configuration(_)));
    assert!(conn.batches().is_empty());
}

#[tokio::test]
async fn test_insert_into_named_table() {
    let archive = TableName::new("dbo", "customers_archive");
    let mut conn = MemoryConnection::new()
        .with_table(customers_table())
        .with_table(TableDefinition {
            table: archive.clone(),
            ..customers_table()
        });

    let result = bulk_insert_into_table(
        &mut conn,
        &customer_shape(),
        &archive,
        &[customer(7, "Grace", "g@example.com")],
        &BulkInsertOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.rows_inserted, 1);
    assert_eq!(conn.row_count(&archive), 1);
    assert_eq!(conn.row_count(&customers()), 0);
    assert_eq!(conn.rows(&archive)[0]["id"], SqlValue::I32(7));
}
