//! Pooled SQL Server connections.
//!
//! Staging tables are session-scoped temporary tables, so a staging
//! reference must be used and disposed on the connection that created it.
//! Hold the [`PooledConnection`] from [`MssqlPool::get`] for that long.

use std::sync::Arc;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use tiberius::Client;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ConnectionConfig;
use crate::error::{BulkError, Result};
use crate::insert::{self, InsertResult};
use crate::options::{BulkInsertOptions, MssqlUpsertOptions};
use crate::record::Record;
use crate::shape::EntityShape;
use crate::upsert::{self, UpsertResult};

pub type MssqlClient = Client<Compat<TcpStream>>;

/// bb8 connection manager for tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: ConnectionConfig,
}

impl TiberiusConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.config.tiberius_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            }
        })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// A pool of SQL Server connections usable as bulk targets.
#[derive(Clone)]
pub struct MssqlPool {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlPool {
    /// Create the pool and check that one connection can be opened.
    pub async fn new(config: &ConnectionConfig) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| BulkError::pool(e, "creating MSSQL pool"))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| BulkError::pool(e, "testing MSSQL connection"))?;
            conn.simple_query("SELECT 1").await?;
        }

        info!(
            "Connected to MSSQL: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self { pool })
    }

    pub async fn get(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| BulkError::pool(e, "getting MSSQL connection"))
    }

    /// [`insert::bulk_insert`] on a connection taken from the pool.
    pub async fn bulk_insert<R: Record>(
        &self,
        shape: &Arc<EntityShape>,
        records: &[R],
        options: &BulkInsertOptions,
        cancel: &CancellationToken,
    ) -> Result<InsertResult> {
        let mut conn = self.get().await?;
        insert::bulk_insert(&mut *conn, shape, records, options, cancel).await
    }

    /// [`upsert::bulk_upsert`] on a connection taken from the pool.
    pub async fn bulk_upsert<R: Record>(
        &self,
        shape: &Arc<EntityShape>,
        records: &mut [R],
        options: &MssqlUpsertOptions,
        cancel: &CancellationToken,
    ) -> Result<UpsertResult> {
        let mut conn = self.get().await?;
        upsert::bulk_upsert(&mut *conn, shape, records, options, cancel).await
    }
}
