//! # mssql-bulk
//!
//! Bulk loading and set-based upsert for Microsoft SQL Server.
//!
//! Records described by an [`EntityShape`] are streamed into SQL Server
//! through the TDS bulk-copy channel. Upserts load the records into a
//! temporary staging table and apply them with a single `MERGE`; owned
//! tables follow their parent and receive its generated keys.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_bulk::{
//!     CancellationToken, Config, DynamicRecord, EntityShape, MssqlPool, PropertyDefinition,
//!     PropertySelector, TableName, UpsertOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> mssql_bulk::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let pool = MssqlPool::new(&config.connection).await?;
//!
//!     let shape = EntityShape::builder("Customer", TableName::new("dbo", "customers"))
//!         .property(PropertyDefinition::new("id", "int").not_null())
//!         .property(PropertyDefinition::new("name", "nvarchar(100)"))
//!         .key(["id"])
//!         .build()?;
//!
//!     let mut records = vec![DynamicRecord::new().with("id", 1).with("name", "Ada")];
//!     let options = config.bulk.upsert_options(UpsertOptions {
//!         update: PropertySelector::include(["name"]),
//!         ..Default::default()
//!     });
//!     let result = pool
//!         .bulk_upsert(&shape, &mut records, &options, &CancellationToken::new())
//!         .await?;
//!     println!("{} inserted, {} updated", result.inserted, result.updated);
//!     Ok(())
//! }
//! ```

pub mod bulk_copy;
pub mod config;
pub mod connection;
pub mod error;
pub mod hints;
pub mod insert;
pub mod mapping;
pub mod memory;
pub mod mssql;
pub mod options;
pub mod pool;
pub mod reader;
pub mod record;
pub mod shape;
pub mod sql;
pub mod staging;
pub mod upsert;
pub mod value;

// Re-exports for convenient access
pub use config::{BulkDefaults, Config, ConnectionConfig};
pub use connection::{BulkConnection, ColumnDefinition, MergeOutcome, MergeStatement, TableDefinition};
pub use error::{BulkError, Result, Step};
pub use hints::TableHint;
pub use insert::{
    bulk_insert, bulk_insert_into_staging, bulk_insert_into_table,
    bulk_insert_value_pairs_into_staging, bulk_insert_values_into_staging, InsertResult,
};
pub use mapping::{PropertySelector, PropertyWithNavigation};
pub use memory::MemoryConnection;
pub use options::{
    BulkInsertOptions, MssqlUpsertOptions, PrimaryKeyTiming, StagingBulkInsertOptions,
    StagingTableName, StagingTableOptions, UpsertOptions,
};
pub use pool::{MssqlClient, MssqlPool};
pub use reader::{EntityDataReader, RowReader};
pub use record::{DynamicRecord, Record};
pub use shape::{EntityShape, PropertyDefinition, TableName};
pub use staging::StagingTableReference;
pub use tokio_util::sync::CancellationToken;
pub use upsert::{bulk_upsert, UpsertResult, UpsertState};
pub use value::{SqlNullType, SqlValue};
