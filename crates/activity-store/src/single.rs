//! Single-row transactional upsert writer.
//!
//! One transactional round trip per event: a guarded update, then an
//! insert-if-absent. Intended for low-volume callers (an API handler
//! persisting one event at a time); batches belong on
//! [`StructuredWriter`](crate::structured::StructuredWriter) or
//! [`StagingWriter`](crate::staging::StagingWriter).

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::StoreClient;
use crate::config::StoreConfig;
use crate::error::Result;
use crate::event::CustomerActivityEvent;
use crate::retry::RetryPolicy;

/// Guarded update: applies only when the incoming timestamp is strictly
/// newer and the expected version (when supplied) still matches.
const UPDATE_ONE: &str = "\
UPDATE customer_activity_events
SET customer_id    = $2,
    activity_type  = $3,
    time_stamp_utc = $4,
    details_json   = $5,
    row_version    = row_version + 1
WHERE event_id = $1
  AND time_stamp_utc < $4
  AND ($6::bigint IS NULL OR row_version = $6)";

/// Insert-if-absent. Concurrent first-time writers of the same id
/// serialize on the primary key; exactly one insert wins and the rest fall
/// through as no-ops.
const INSERT_ONE: &str = "\
INSERT INTO customer_activity_events
    (event_id, customer_id, activity_type, time_stamp_utc, details_json, row_version)
VALUES ($1, $2, $3, $4, $5, 1)
ON CONFLICT (event_id) DO NOTHING";

/// Per-event transactional upsert writer
pub struct SingleRowWriter {
    client: StoreClient,
    retry: RetryPolicy,
}

impl SingleRowWriter {
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

    /// Upsert one event, retried on transient store faults.
    ///
    /// A stored row with an equal-or-newer timestamp, or a stale
    /// `expected_row_version`, leaves the row untouched without error.
    pub async fn upsert(
        &self,
        event: &CustomerActivityEvent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.retry
            .execute(cancel, || {
                let client = self.client.clone();
                async move { upsert_once(&client, event).await }
            })
            .await
    }
}

async fn upsert_once(client: &StoreClient, event: &CustomerActivityEvent) -> Result<()> {
    let expected = event.expected_row_version.map(|v| v.value());

    client.begin().await?;
    let outcome = async {
        let updated = client
            .execute(
                UPDATE_ONE,
                &[
                    &event.event_id,
                    &event.customer_id,
                    &event.activity_type,
                    &event.time_stamp_utc,
                    &event.details_json,
                    &expected,
                ],
            )
            .await?;

        if updated == 0 {
            let inserted = client
                .execute(
                    INSERT_ONE,
                    &[
                        &event.event_id,
                        &event.customer_id,
                        &event.activity_type,
                        &event.time_stamp_utc,
                        &event.details_json,
                    ],
                )
                .await?;
            debug!(event_id = %event.event_id, inserted, "single-row upsert fell through to insert");
        } else {
            debug!(event_id = %event.event_id, "single-row upsert updated existing row");
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => client.commit().await,
        Err(e) => {
            client.rollback_quietly().await;
            Err(e)
        }
    }
}
