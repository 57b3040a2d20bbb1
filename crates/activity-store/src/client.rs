//! Store client: a thin, cloneable handle over one PostgreSQL connection.
//!
//! Every driver error leaving this module has already been classified into
//! the [`StoreError`](crate::error::StoreError) taxonomy. Transactions are
//! driven as explicit `BEGIN`/`COMMIT`/`ROLLBACK` statements over the shared
//! client handle, so writers can hold the transaction open across several
//! statements without exclusive borrows.

use std::sync::Arc;

use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::event::{RowVersion, StoredEvent};
use crate::schema;

/// A handle to one store connection, shared by the writers.
///
/// Cloning is cheap and clones address the same underlying connection; one
/// connection runs at most one transaction at a time, so concurrent writers
/// should each connect their own client.
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<tokio_postgres::Client>,
}

impl StoreClient {
    /// Connect to the store named by `config.url`.
    ///
    /// The driver's connection task is spawned onto the current runtime; its
    /// terminal error, if any, is logged rather than panicking the caller.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(&config.url, NoTls)
            .await
            .map_err(|e| StoreError::from_pg(e, None))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "store connection terminated");
            }
        });

        info!("connected to activity store");
        Ok(Self {
            inner: Arc::new(client),
        })
    }

    /// Wrap an already-established driver client (used by tests and pools)
    pub fn from_client(client: tokio_postgres::Client) -> Self {
        Self {
            inner: Arc::new(client),
        }
    }

    /// Create the event and staging tables if they do not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        debug!("applying schema bootstrap DDL");
        self.batch_execute(schema::SCHEMA_DDL).await
    }

    /// Read one stored event with its current version token
    pub async fn fetch_event(&self, event_id: Uuid) -> Result<Option<StoredEvent>> {
        let rows = self.query(schema::SELECT_EVENT, &[&event_id]).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(Some(decode_stored_event(row)?))
    }

    /// The underlying driver client, for COPY operations
    pub(crate) fn pg(&self) -> &tokio_postgres::Client {
        &self.inner
    }

    /// Execute a statement, returning the affected row count
    pub(crate) async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        self.inner
            .execute(sql, params)
            .await
            .map_err(|e| StoreError::from_pg(e, Some(sql)))
    }

    /// Execute a query, returning its rows
    pub(crate) async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        self.inner
            .query(sql, params)
            .await
            .map_err(|e| StoreError::from_pg(e, Some(sql)))
    }

    /// Execute a semicolon-separated batch of statements
    pub(crate) async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.inner
            .batch_execute(sql)
            .await
            .map_err(|e| StoreError::from_pg(e, Some(sql)))
    }

    /// Open an explicit transaction
    pub(crate) async fn begin(&self) -> Result<()> {
        self.execute("BEGIN", &[]).await.map(|_| ())
    }

    /// Commit the open transaction
    pub(crate) async fn commit(&self) -> Result<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    /// Roll back the open transaction, swallowing any rollback failure.
    ///
    /// The original fault is what the caller propagates; a rollback error on
    /// an already-broken connection would only mask it.
    pub(crate) async fn rollback_quietly(&self) {
        if let Err(e) = self.execute("ROLLBACK", &[]).await {
            debug!(error = %e, "rollback after failed transaction also failed");
        }
    }
}

fn decode_stored_event(row: &Row) -> Result<StoredEvent> {
    let decode = |e: tokio_postgres::Error| StoreError::from_pg(e, Some(schema::SELECT_EVENT));
    Ok(StoredEvent {
        event_id: row.try_get("event_id").map_err(decode)?,
        customer_id: row.try_get("customer_id").map_err(decode)?,
        activity_type: row.try_get("activity_type").map_err(decode)?,
        time_stamp_utc: row.try_get("time_stamp_utc").map_err(decode)?,
        details_json: row.try_get("details_json").map_err(decode)?,
        row_version: RowVersion::new(row.try_get("row_version").map_err(decode)?),
    })
}
