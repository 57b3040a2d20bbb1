//! Set-based upsert writer.
//!
//! Marshals a whole batch as six parallel arrays and ships it in a single
//! round-trip sequence: the store expands the arrays with
//! `unnest(...) WITH ORDINALITY` into the candidate relation and the shared
//! reconciliation runs server-side in one transaction. Capacity is bounded
//! only by what one parameter set can hold; beyond tens of thousands of
//! rows, prefer [`StagingWriter`](crate::staging::StagingWriter).

use chrono::{DateTime, Utc};
use tokio_postgres::types::ToSql;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::client::StoreClient;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::event::{CustomerActivityEvent, ReconcileSummary};
use crate::reconcile;
use crate::retry::RetryPolicy;

/// Batch upsert writer backed by array parameters
pub struct StructuredWriter {
    client: StoreClient,
    retry: RetryPolicy,
}

impl StructuredWriter {
    /// Create a writer with retry tunables taken from `config`
    pub fn new(client: StoreClient, config: &StoreConfig) -> Self {
        Self {
            client,
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Create a writer with an explicit retry policy
    pub fn with_retry(client: StoreClient, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Upsert a batch in one reconciliation transaction.
    ///
    /// Duplicate `event_id`s within the batch are deduplicated server-side
    /// before the merge (greatest timestamp wins, last-in-batch breaks
    /// ties). Version conflicts never abort the batch; they are returned in
    /// the summary. An empty batch returns a zero summary without touching
    /// the network.
    pub async fn upsert_batch(
        &self,
        events: &[CustomerActivityEvent],
        cancel: &CancellationToken,
    ) -> Result<ReconcileSummary> {
        if events.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        let event_ids: Vec<Uuid> = events.iter().map(|e| e.event_id).collect();
        let customer_ids: Vec<i32> = events.iter().map(|e| e.customer_id).collect();
        let activity_types: Vec<&str> = events.iter().map(|e| e.activity_type.as_str()).collect();
        let time_stamps: Vec<DateTime<Utc>> = events.iter().map(|e| e.time_stamp_utc).collect();
        let details: Vec<Option<&str>> = events.iter().map(|e| e.details_json.as_deref()).collect();
        let expected: Vec<Option<i64>> = events
            .iter()
            .map(|e| e.expected_row_version.map(|v| v.value()))
            .collect();

        let params: [&(dyn ToSql + Sync); 6] = [
            &event_ids,
            &customer_ids,
            &activity_types,
            &time_stamps,
            &details,
            &expected,
        ];

        let summary = self
            .retry
            .execute(cancel, || {
                let client = self.client.clone();
                async move { reconcile_arrays(&client, &params).await }
            })
            .await?;

        info!(
            batch = events.len(),
            updated = summary.rows_updated,
            inserted = summary.rows_inserted,
            conflicted = summary.rows_conflicted,
            "structured batch reconciled"
        );
        Ok(summary)
    }
}

async fn reconcile_arrays(
    client: &StoreClient,
    params: &[&(dyn ToSql + Sync)],
) -> Result<ReconcileSummary> {
    client.begin().await?;
    match reconcile::run(client, reconcile::PICK_FROM_ARRAYS, params).await {
        Ok(summary) => {
            client.commit().await?;
            Ok(summary)
        }
        Err(e) => {
            client.rollback_quietly().await;
            Err(e)
        }
    }
}
