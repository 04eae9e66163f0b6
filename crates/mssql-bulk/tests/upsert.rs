//! Insert-or-update integration tests against the in-memory backend.

mod common;

use common::*;
use mssql_bulk::{
    bulk_upsert, BulkError, CancellationToken, DynamicRecord, MemoryConnection,
    MssqlUpsertOptions, PropertySelector, SqlValue, TableHint, UpsertOptions,
};

fn seeded_customers() -> MemoryConnection {
    let mut conn = MemoryConnection::new().with_table(customers_table());
    for (id, name) in [(1i32, "Ada"), (2i32, "Bob")] {
        conn.insert_row(
            &customers(),
            &[("id", id.into()), ("name", name.into()), ("email", "keep@example.com".into())],
        )
        .unwrap();
    }
    conn
}

fn name_only() -> MssqlUpsertOptions {
    MssqlUpsertOptions::from(UpsertOptions {
        insert: PropertySelector::include(["id", "name"]),
        update: PropertySelector::include(["name"]),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_updates_matched_and_inserts_new() {
    init_tracing();
    let mut conn = seeded_customers();
    let mut records = vec![
        customer(1, "Ada Lovelace", "new@example.com"),
        customer(2, "Bob Dylan", "new@example.com"),
        customer(3, "Cy", "new@example.com"),
    ];

    let result = bulk_upsert(&mut conn, &customer_shape(), &mut records, &name_only(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.rows_affected, 3);
    assert_eq!(result.updated, 2);
    assert_eq!(result.inserted, 1);

    let rows = conn.rows(&customers());
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["name"], text("Ada Lovelace"));
    assert_eq!(rows[0]["email"], text("keep@example.com"));
    assert_eq!(rows[1]["name"], text("Bob Dylan"));
    assert_eq!(rows[1]["email"], text("keep@example.com"));
    assert_eq!(rows[2]["id"], SqlValue::I32(3));
    assert_eq!(rows[2]["name"], text("Cy"));
    assert!(rows[2]["email"].is_null());

    assert!(conn.temp_tables().is_empty());
}

#[tokio::test]
async fn test_empty_input_creates_no_staging_table() {
    let mut conn = seeded_customers();
    let mut records: Vec<DynamicRecord> = Vec::new();

    let result = bulk_upsert(&mut conn, &customer_shape(), &mut records, &name_only(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.rows_affected, 0);
    assert!(conn.merges().is_empty());
    assert!(conn.batches().is_empty());
}

#[tokio::test]
async fn test_hold_lock_by_default_and_extra_hints() {
    let mut conn = seeded_customers();
    let mut records = vec![customer(1, "Ada", "a@example.com")];
    let options = name_only().with_hints([TableHint::RowLock]);

    bulk_upsert(&mut conn, &customer_shape(), &mut records, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(conn.merges()[0].hints, vec![TableHint::HoldLock, TableHint::RowLock]);
}

#[tokio::test]
async fn test_without_hold_lock() {
    let mut conn = seeded_customers();
    let mut records = vec![customer(1, "Ada", "a@example.com")];
    let options = name_only().with_hold_lock(false);

    bulk_upsert(&mut conn, &customer_shape(), &mut records, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert!(conn.merges()[0].hints.is_empty());
}

#[tokio::test]
async fn test_incompatible_hint_rejected_before_io() {
    let mut conn = seeded_customers();
    let mut records = vec![customer(1, "Ada", "a@example.com")];
    let options = name_only().with_hints([TableHint::NoLock]);

    let err = bulk_upsert(&mut conn, &customer_shape(), &mut records, &options, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BulkError::Configuration(_)));
    assert!(conn.batches().is_empty());
    assert!(conn.temp_tables().is_empty());
}

#[tokio::test]
async fn test_unknown_property_rejected_before_io() {
    let mut conn = seeded_customers();
    let mut records = vec![customer(1, "Ada", "a@example.com")];
    let options = MssqlUpsertOptions::from(UpsertOptions {
        update: PropertySelector::include(["nickname"]),
        ..Default::default()
    });

    let err = bulk_upsert(&mut conn, &customer_shape(), &mut records, &options, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BulkError::Configuration(_)));
    assert!(conn.batches().is_empty());
}

#[tokio::test]
async fn test_generated_parent_key_reaches_children() {
    init_tracing();
    let mut conn = order_tables();
    conn.insert_row(&orders(), &[("number", "A-old".into())]).unwrap();
    conn.insert_row(
        &order_items(),
        &[("order_id", 1i32.into()), ("line", 1i32.into()), ("sku", "old".into())],
    )
    .unwrap();

    let mut records = vec![
        order(Some(1), "A", &[(1, "new"), (2, "second")]),
        order(None, "B", &[(1, "b1"), (2, "b2")]),
        order(None, "C", &[]),
    ];

    let result = bulk_upsert(
        &mut conn,
        &order_shape(),
        &mut records,
        &MssqlUpsertOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(result.inserted, 2);
    let items = result.child("Items").unwrap();
    assert_eq!(items.updated, 1);
    assert_eq!(items.inserted, 3);

    // generated keys are written back in input order
    assert_eq!(records[0].get("id"), Some(&SqlValue::I32(1)));
    assert_eq!(records[1].get("id"), Some(&SqlValue::I32(2)));
    assert_eq!(records[2].get("id"), Some(&SqlValue::I32(3)));

    let order_rows = conn.rows(&orders());
    assert_eq!(order_rows.len(), 3);
    assert_eq!(order_rows[0]["number"], text("A"));
    assert_eq!(order_rows[1]["number"], text("B"));

    let item_rows = conn.rows(&order_items());
    assert_eq!(item_rows.len(), 4);
    assert_eq!(item_rows[0]["sku"], text("new"));
    let for_b: Vec<&SqlValue> = item_rows
        .iter()
        .filter(|r| r["order_id"] == SqlValue::I32(2))
        .map(|r| &r["sku"])
        .collect();
    assert_eq!(for_b, vec![&text("b1"), &text("b2")]);
    assert!(item_rows.iter().all(|r| r["order_id"] != SqlValue::I32(3)));

    assert!(conn.temp_tables().is_empty());
}

#[tokio::test]
async fn test_keep_identity_uses_identity_insert() {
    let mut conn = order_tables();
    let mut records = vec![order(Some(40), "K", &[(1, "k1")])];
    let options = MssqlUpsertOptions {
        keep_identity: true,
        ..Default::default()
    };

    let result = bulk_upsert(&mut conn, &order_shape(), &mut records, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.inserted, 1);
    assert!(conn.merges()[0].identity_insert);
    assert_eq!(conn.rows(&orders())[0]["id"], SqlValue::I32(40));
    assert_eq!(conn.rows(&order_items())[0]["order_id"], SqlValue::I32(40));
}

#[tokio::test]
async fn test_child_without_update_columns_is_rejected() {
    let mut conn = order_tables();
    let mut records = vec![order(None, "A", &[(1, "a1")])];
    let options = MssqlUpsertOptions::from(UpsertOptions {
        update: PropertySelector::include(["number"]),
        ..Default::default()
    });

    let err = bulk_upsert(&mut conn, &order_shape(), &mut records, &options, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BulkError::Configuration(_)));
    assert_eq!(conn.row_count(&orders()), 0);
}

fn order_by_number(number: &str, note: &str, items: &[(i32, &str)]) -> DynamicRecord {
    DynamicRecord::new()
        .with("number", number)
        .with("note", note)
        .with_many(
            "Items",
            items
                .iter()
                .map(|(line, sku)| DynamicRecord::new().with("line", *line).with("sku", *sku)),
        )
}

#[tokio::test]
async fn test_alternate_key_reports_generated_ids_to_children() {
    init_tracing();
    let mut conn = order_tables();
    conn.insert_row(&orders(), &[("number", "A".into())]).unwrap();
    conn.insert_row(
        &order_items(),
        &[("order_id", 1i32.into()), ("line", 1i32.into()), ("sku", "old".into())],
    )
    .unwrap();

    let mut records = vec![
        order_by_number("A", "first", &[(1, "a1")]),
        order_by_number("B", "second", &[(1, "b1")]),
    ];
    let options = MssqlUpsertOptions::from(UpsertOptions {
        update: PropertySelector::include(["note", "Items.sku"]),
        key: PropertySelector::include(["number"]),
        ..Default::default()
    });

    let result = bulk_upsert(&mut conn, &order_shape(), &mut records, &options, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(result.inserted, 1);
    let items = result.child("Items").unwrap();
    assert_eq!(items.updated, 1);
    assert_eq!(items.inserted, 1);

    // matched and inserted rows both receive their identity value
    assert_eq!(records[0].get("id"), Some(&SqlValue::I32(1)));
    assert_eq!(records[1].get("id"), Some(&SqlValue::I32(2)));

    let order_rows = conn.rows(&orders());
    assert_eq!(order_rows.len(), 2);
    assert_eq!(order_rows[0]["note"], text("first"));
    assert_eq!(order_rows[1]["id"], SqlValue::I32(2));
    assert_eq!(order_rows[1]["number"], text("B"));

    let item_rows = conn.rows(&order_items());
    assert_eq!(item_rows.len(), 2);
    assert_eq!(item_rows[0]["order_id"], SqlValue::I32(1));
    assert_eq!(item_rows[0]["sku"], text("a1"));
    assert_eq!(item_rows[1]["order_id"], SqlValue::I32(2));
    assert_eq!(item_rows[1]["sku"], text("b1"));

    assert!(conn.temp_tables().is_empty());
}

#[tokio::test]
async fn test_alternate_key_without_parent_update_is_rejected() {
    let mut conn = order_tables();
    let mut records = vec![order_by_number("A", "first", &[(1, "a1")])];
    let options = MssqlUpsertOptions::from(UpsertOptions {
        update: PropertySelector::include(["Items.sku"]),
        key: PropertySelector::include(["number"]),
        ..Default::default()
    });

    let err = bulk_upsert(&mut conn, &order_shape(), &mut records, &options, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BulkError::Configuration(_)));
    assert!(err.to_string().contains("Order.Items"));
    assert!(conn.batches().is_empty());
    assert!(conn.merges().is_empty());
}
