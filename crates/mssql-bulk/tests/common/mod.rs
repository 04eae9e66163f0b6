//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use mssql_bulk::{
    ColumnDefinition, DynamicRecord, EntityShape, MemoryConnection, PropertyDefinition,
    SqlValue, TableDefinition, TableName,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn customers() -> TableName {
    TableName::new("dbo", "customers")
}

pub fn customer_shape() -> Arc<EntityShape> {
    EntityShape::builder("Customer", customers())
        .property(PropertyDefinition::new("id", "int").not_null())
        .property(PropertyDefinition::new("name", "nvarchar(100)"))
        .property(PropertyDefinition::new("email", "nvarchar(100)"))
        .key(["id"])
        .build()
        .unwrap()
}

pub fn customers_table() -> TableDefinition {
    TableDefinition {
        table: customers(),
        columns: vec![
            ColumnDefinition::new("id", "int", false),
            ColumnDefinition::new("name", "nvarchar(100)", true),
            ColumnDefinition::new("email", "nvarchar(100)", true),
        ],
        primary_key: vec!["id".into()],
    }
}

pub fn customer(id: i32, name: &str, email: &str) -> DynamicRecord {
    DynamicRecord::new()
        .with("id", id)
        .with("name", name)
        .with("email", email)
}

pub fn orders() -> TableName {
    TableName::new("dbo", "orders")
}

pub fn order_items() -> TableName {
    TableName::new("dbo", "order_items")
}

/// Orders with an identity key owning a collection of items.
pub fn order_shape() -> Arc<EntityShape> {
    let item = EntityShape::builder("OrderItem", order_items())
        .property(PropertyDefinition::new("order_id", "int").not_null())
        .property(PropertyDefinition::new("line", "int").not_null())
        .property(PropertyDefinition::new("sku", "nvarchar(20)"))
        .key(["order_id", "line"])
        .build()
        .unwrap();

    EntityShape::builder("Order", orders())
        .property(PropertyDefinition::new("id", "int").not_null().generated_on_add())
        .property(PropertyDefinition::new("number", "nvarchar(20)"))
        .property(PropertyDefinition::new("note", "nvarchar(100)"))
        .key(["id"])
        .owns_many("Items", item, &[("order_id", "id")])
        .build()
        .unwrap()
}

pub fn order_tables() -> MemoryConnection {
    MemoryConnection::new()
        .with_table(TableDefinition {
            table: orders(),
            columns: vec![
                ColumnDefinition::new("id", "int", false).identity(),
                ColumnDefinition::new("number", "nvarchar(20)", true),
                ColumnDefinition::new("note", "nvarchar(100)", true),
            ],
            primary_key: vec!["id".into()],
        })
        .with_table(TableDefinition {
            table: order_items(),
            columns: vec![
                ColumnDefinition::new("order_id", "int", false),
                ColumnDefinition::new("line", "int", false),
                ColumnDefinition::new("sku", "nvarchar(20)", true),
            ],
            primary_key: vec!["order_id".into(), "line".into()],
        })
}

pub fn order(id: Option<i32>, number: &str, items: &[(i32, &str)]) -> DynamicRecord {
    DynamicRecord::new()
        .with("id", id)
        .with("number", number)
        .with("note", None::<&str>)
        .with_many(
            "Items",
            items
                .iter()
                .map(|(line, sku)| DynamicRecord::new().with("line", *line).with("sku", *sku)),
        )
}

pub fn text(value: &str) -> SqlValue {
    SqlValue::from(value)
}
