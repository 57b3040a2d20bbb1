//! Bulk-staging upsert writer.
//!
//! Streams very large or unbounded event sequences into the staging table
//! via the PostgreSQL binary COPY protocol, tagged with a fresh batch id,
//! then reconciles that batch against the primary table and purges the
//! consumed staging rows.
//!
//! The load runs in physical sub-batches, each its own transaction under a
//! table lock; only one sub-batch is ever buffered, so memory use is bounded
//! regardless of input size. A crash between load and reconcile leaves the
//! staged rows for that batch behind — [`StagingWriter::sweep_orphaned`]
//! exists for the external maintenance task that cleans those up.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::SinkExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::StoreClient;
use crate::config::StoreConfig;
use crate::cursor::{CopyField, EventRowCursor};
use crate::error::{Result, StoreError};
use crate::event::{CustomerActivityEvent, ReconcileSummary};
use crate::reconcile;
use crate::retry::RetryPolicy;

/// PostgreSQL binary COPY signature (11 bytes)
const PGCOPY_SIGNATURE: [u8; 11] = *b"PGCOPY\n\xff\r\n\x00";
/// Flags field (4 bytes): no OIDs
const PGCOPY_FLAGS: [u8; 4] = 0_i32.to_be_bytes();
/// Header extension area length (4 bytes): none
const PGCOPY_EXT_LEN: [u8; 4] = 0_i32.to_be_bytes();
/// File trailer: field count -1 signals end of data
const PGCOPY_TRAILER: [u8; 2] = (-1_i16).to_be_bytes();

/// Microseconds between the Unix epoch and the PostgreSQL epoch
/// (2000-01-01T00:00:00Z)
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Staged columns: the cursor's six event columns plus the batch tag
const STAGED_FIELD_COUNT: i16 = 7;

const COPY_INTO_STAGING: &str = "\
COPY customer_activity_events_staging
    (event_id, customer_id, activity_type, time_stamp_utc, details_json,
     expected_row_version, batch_id)
FROM STDIN WITH (FORMAT binary)";

/// Table lock taken for the duration of each sub-batch transaction
const LOCK_STAGING: &str = "LOCK TABLE customer_activity_events_staging IN EXCLUSIVE MODE";

const DELETE_BATCH: &str = "DELETE FROM customer_activity_events_staging WHERE batch_id = $1";

const SWEEP_STAGING: &str = "DELETE FROM customer_activity_events_staging WHERE loaded_at < $1";

/// Bulk upsert writer backed by staging COPY
pub struct StagingWriter {
    client: StoreClient,
    retry: RetryPolicy,
    batch_size: usize,
    flush_bytes: usize,
    copy_timeout: Duration,
}

impl StagingWriter {
    /// Create a writer with tunables taken from `config`
    pub fn new(client: StoreClient, config: &StoreConfig) -> Self {
        Self {
            client,
            retry: RetryPolicy::from_config(config),
            batch_size: config.staging_batch_size.max(1),
            flush_bytes: config.copy_flush_bytes.max(1),
            copy_timeout: config.copy_timeout,
        }
    }

    /// Upsert an event stream through the staging table.
    ///
    /// The stream is consumed exactly once, in sub-batches of the
    /// configured size. Each sub-batch load and the final reconciliation
    /// are individually retried on transient faults; the reconciliation
    /// deletes the staged rows it consumed, so a retried reconciliation is
    /// idempotent for its batch id.
    pub async fn upsert_via_staging<I>(
        &self,
        events: I,
        cancel: &CancellationToken,
    ) -> Result<ReconcileSummary>
    where
        I: IntoIterator<Item = CustomerActivityEvent>,
    {
        let batch_id = Uuid::new_v4();
        let mut cursor = EventRowCursor::new(events.into_iter());
        let mut staged: u64 = 0;

        loop {
            let (payload, rows) = encode_sub_batch(&mut cursor, batch_id, self.batch_size)?;
            if rows == 0 {
                break;
            }

            self.retry
                .execute(cancel, || {
                    let client = self.client.clone();
                    let payload = &payload;
                    async move {
                        load_sub_batch(&client, payload, self.flush_bytes, self.copy_timeout).await
                    }
                })
                .await?;

            staged += rows as u64;
            debug!(%batch_id, rows, staged, "staging sub-batch loaded");
        }

        if staged == 0 {
            return Ok(ReconcileSummary::default());
        }

        let summary = self
            .retry
            .execute(cancel, || {
                let client = self.client.clone();
                async move { reconcile_staged(&client, batch_id).await }
            })
            .await?;

        info!(
            %batch_id,
            staged,
            updated = summary.rows_updated,
            inserted = summary.rows_inserted,
            conflicted = summary.rows_conflicted,
            "staged batch reconciled"
        );
        Ok(summary)
    }

    /// Delete staging rows loaded before `now - older_than`, returning the
    /// count removed.
    ///
    /// Never runs automatically: orphaned rows only exist after a crash
    /// between load and reconcile, and sweeping them is an operator
    /// decision. Choose a cutoff comfortably longer than any legitimate
    /// in-flight batch.
    pub async fn sweep_orphaned(
        &self,
        older_than: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let cutoff: DateTime<Utc> = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| StoreError::config(format!("sweep cutoff out of range: {e}")))?;

        let removed = self
            .retry
            .execute(cancel, || {
                let client = self.client.clone();
                async move { client.execute(SWEEP_STAGING, &[&cutoff]).await }
            })
            .await?;

        if removed > 0 {
            info!(removed, %cutoff, "swept orphaned staging rows");
        }
        Ok(removed)
    }
}

/// Encode up to `max_rows` rows from the cursor as one complete binary COPY
/// payload (header, tuples, trailer). Returns the payload and the row count;
/// zero rows means the cursor is exhausted and the payload must not be sent.
fn encode_sub_batch<I>(
    cursor: &mut EventRowCursor<I>,
    batch_id: Uuid,
    max_rows: usize,
) -> Result<(Vec<u8>, usize)>
where
    I: Iterator<Item = CustomerActivityEvent>,
{
    let mut buf = Vec::with_capacity(64 * 1024);
    buf.extend_from_slice(&PGCOPY_SIGNATURE);
    buf.extend_from_slice(&PGCOPY_FLAGS);
    buf.extend_from_slice(&PGCOPY_EXT_LEN);

    let mut rows = 0usize;
    while rows < max_rows {
        if !cursor.advance()? {
            break;
        }
        buf.extend_from_slice(&STAGED_FIELD_COUNT.to_be_bytes());
        for index in 0..cursor.field_count() {
            write_field(&mut buf, cursor.field(index)?);
        }
        write_field(&mut buf, CopyField::Uuid(batch_id));
        rows += 1;
    }

    buf.extend_from_slice(&PGCOPY_TRAILER);
    Ok((buf, rows))
}

/// Append one binary COPY field: a big-endian i32 byte length (-1 for NULL)
/// followed by the value bytes.
fn write_field(buf: &mut Vec<u8>, field: CopyField<'_>) {
    match field {
        CopyField::Uuid(value) => {
            buf.extend_from_slice(&16_i32.to_be_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
        CopyField::Int4(value) => {
            buf.extend_from_slice(&4_i32.to_be_bytes());
            buf.extend_from_slice(&value.to_be_bytes());
        }
        CopyField::Text(value) => write_text(buf, value),
        CopyField::TimestampTz(value) => {
            let micros = value.timestamp_micros() - PG_EPOCH_OFFSET_MICROS;
            buf.extend_from_slice(&8_i32.to_be_bytes());
            buf.extend_from_slice(&micros.to_be_bytes());
        }
        CopyField::NullableText(Some(value)) => write_text(buf, value),
        CopyField::NullableInt8(Some(value)) => {
            buf.extend_from_slice(&8_i32.to_be_bytes());
            buf.extend_from_slice(&value.to_be_bytes());
        }
        CopyField::NullableText(None) | CopyField::NullableInt8(None) => {
            buf.extend_from_slice(&(-1_i32).to_be_bytes());
        }
    }
}

fn write_text(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as i32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Load one encoded sub-batch: a transaction taking the staging table lock,
/// streaming the payload through COPY in flush-sized chunks, bounded by the
/// configured timeout. The payload is retained by the caller, so a failed
/// sub-batch can be retried wholesale after its transaction rolls back.
async fn load_sub_batch(
    client: &StoreClient,
    payload: &[u8],
    flush_bytes: usize,
    copy_timeout: Duration,
) -> Result<()> {
    client.begin().await?;

    let copy = async {
        client.execute(LOCK_STAGING, &[]).await?;

        let sink = client
            .pg()
            .copy_in::<_, Bytes>(COPY_INTO_STAGING)
            .await
            .map_err(|e| StoreError::from_pg(e, Some(COPY_INTO_STAGING)))?;
        let mut sink = Box::pin(sink);

        for chunk in payload.chunks(flush_bytes) {
            sink.send(Bytes::copy_from_slice(chunk))
                .await
                .map_err(|e| StoreError::from_pg(e, Some(COPY_INTO_STAGING)))?;
        }
        sink.as_mut()
            .finish()
            .await
            .map_err(|e| StoreError::from_pg(e, Some(COPY_INTO_STAGING)))?;
        Ok(())
    };

    let outcome = match tokio::time::timeout(copy_timeout, copy).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::timeout(format!(
            "staging COPY exceeded {copy_timeout:?}"
        ))),
    };

    match outcome {
        Ok(()) => client.commit().await,
        Err(e) => {
            client.rollback_quietly().await;
            Err(e)
        }
    }
}

/// Reconcile one staged batch and purge its rows, all in one transaction.
async fn reconcile_staged(client: &StoreClient, batch_id: Uuid) -> Result<ReconcileSummary> {
    client.begin().await?;

    let outcome = async {
        let summary = reconcile::run(client, reconcile::PICK_FROM_STAGING, &[&batch_id]).await?;
        let purged = client.execute(DELETE_BATCH, &[&batch_id]).await?;
        debug!(%batch_id, purged, "consumed staging rows deleted");
        Ok(summary)
    }
    .await;

    match outcome {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::EVENT_FIELD_COUNT;
    use chrono::TimeZone;

    /// The timestamp that encodes as zero in the COPY wire format
    fn pg_epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
    }

    fn event_at_epoch(customer_id: i32) -> CustomerActivityEvent {
        CustomerActivityEvent::new(Uuid::nil(), customer_id, "login", pg_epoch())
    }

    #[test]
    fn payload_frames_header_and_trailer() {
        let mut cursor = EventRowCursor::new(std::iter::empty());
        let (payload, rows) = encode_sub_batch(&mut cursor, Uuid::nil(), 10).unwrap();

        assert_eq!(rows, 0);
        assert_eq!(&payload[..11], b"PGCOPY\n\xff\r\n\x00");
        assert_eq!(&payload[11..15], &[0, 0, 0, 0]);
        assert_eq!(&payload[15..19], &[0, 0, 0, 0]);
        assert_eq!(&payload[19..], &(-1_i16).to_be_bytes());
    }

    #[test]
    fn tuple_layout_matches_staging_columns() {
        let mut cursor = EventRowCursor::new(std::iter::once(event_at_epoch(7)));
        let (payload, rows) = encode_sub_batch(&mut cursor, Uuid::nil(), 10).unwrap();
        assert_eq!(rows, 1);

        let tuple = &payload[19..payload.len() - 2];
        // field count: six cursor columns plus batch_id
        assert_eq!(&tuple[..2], &7_i16.to_be_bytes());
        assert_eq!(EVENT_FIELD_COUNT as i16 + 1, STAGED_FIELD_COUNT);

        let mut at = 2;
        // event_id: 16-byte uuid
        assert_eq!(&tuple[at..at + 4], &16_i32.to_be_bytes());
        at += 4 + 16;
        // customer_id: int4
        assert_eq!(&tuple[at..at + 4], &4_i32.to_be_bytes());
        assert_eq!(&tuple[at + 4..at + 8], &7_i32.to_be_bytes());
        at += 4 + 4;
        // activity_type: text
        assert_eq!(&tuple[at..at + 4], &5_i32.to_be_bytes());
        assert_eq!(&tuple[at + 4..at + 9], b"login");
        at += 4 + 5;
        // time_stamp_utc: the store epoch encodes as zero micros
        assert_eq!(&tuple[at..at + 4], &8_i32.to_be_bytes());
        assert_eq!(&tuple[at + 4..at + 12], &0_i64.to_be_bytes());
        at += 4 + 8;
        // details_json, expected_row_version: both NULL here
        assert_eq!(&tuple[at..at + 4], &(-1_i32).to_be_bytes());
        at += 4;
        assert_eq!(&tuple[at..at + 4], &(-1_i32).to_be_bytes());
        at += 4;
        // batch_id uuid
        assert_eq!(&tuple[at..at + 4], &16_i32.to_be_bytes());
        at += 4 + 16;
        assert_eq!(at, tuple.len());
    }

    #[test]
    fn timestamp_encoding_is_relative_to_store_epoch() {
        let ts = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 1).unwrap();
        let event = CustomerActivityEvent::new(Uuid::nil(), 1, "x", ts);
        let mut cursor = EventRowCursor::new(std::iter::once(event));
        let (payload, _) = encode_sub_batch(&mut cursor, Uuid::nil(), 1).unwrap();

        // one second past the epoch = 1_000_000 micros, at the timestamp
        // field offset: 19 header + 2 count + (4+16) + (4+4) + (4+1) + 4
        let offset = 19 + 2 + 20 + 8 + 5 + 4;
        assert_eq!(&payload[offset..offset + 8], &1_000_000_i64.to_be_bytes());
    }

    #[test]
    fn sub_batches_respect_the_row_budget() {
        let events: Vec<_> = (0..5).map(event_at_epoch).collect();
        let mut cursor = EventRowCursor::new(events.into_iter());

        let (_, first) = encode_sub_batch(&mut cursor, Uuid::nil(), 2).unwrap();
        let (_, second) = encode_sub_batch(&mut cursor, Uuid::nil(), 2).unwrap();
        let (_, third) = encode_sub_batch(&mut cursor, Uuid::nil(), 2).unwrap();
        let (_, done) = encode_sub_batch(&mut cursor, Uuid::nil(), 2).unwrap();

        assert_eq!((first, second, third, done), (2, 2, 1, 0));
    }

    #[test]
    fn copy_column_list_matches_cursor_order() {
        for column in [
            "event_id",
            "customer_id",
            "activity_type",
            "time_stamp_utc",
            "details_json",
            "expected_row_version",
            "batch_id",
        ] {
            assert!(COPY_INTO_STAGING.contains(column));
        }
        assert!(COPY_INTO_STAGING.contains("FORMAT binary"));
    }
}
