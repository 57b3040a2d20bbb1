//! Shared reconciliation algorithm for the batch writers.
//!
//! Both batch paths converge here: candidates arrive either as staged rows
//! scoped to a batch id or as unnested parameter arrays, and flow through
//! the same four steps inside the caller's open transaction:
//!
//! 1. dedup per `event_id` into a temp pick table (greatest
//!    `time_stamp_utc` wins, last-in-batch breaks ties)
//! 2. capture version conflicts against existing rows, before any mutation
//! 3. apply guarded updates, bumping `row_version`
//! 4. insert unseen identities, `ON CONFLICT DO NOTHING` against racers
//!
//! Conflicts never abort the batch; they ride back in the summary.

use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::client::StoreClient;
use crate::error::{Result, StoreError};
use crate::event::{ReconcileSummary, RowVersion, VersionConflict};

/// Temp table holding the one surviving candidate per event id.
/// `ON COMMIT DROP` ties its lifetime to the caller's transaction.
const CREATE_PICK_TABLE: &str = "\
CREATE TEMP TABLE reconcile_pick (
    event_id             UUID PRIMARY KEY,
    customer_id          INTEGER NOT NULL,
    activity_type        TEXT NOT NULL,
    time_stamp_utc       TIMESTAMPTZ NOT NULL,
    details_json         TEXT,
    expected_row_version BIGINT
) ON COMMIT DROP";

/// Temp table capturing conflict detail before the update step mutates
/// `row_version` out from under the comparison.
const CREATE_CONFLICT_TABLE: &str = "\
CREATE TEMP TABLE reconcile_conflict (
    event_id               UUID NOT NULL,
    expected_row_version   BIGINT NOT NULL,
    current_row_version    BIGINT NOT NULL,
    current_time_stamp_utc TIMESTAMPTZ NOT NULL
) ON COMMIT DROP";

/// Dedup source: staged rows for one batch. `staging_seq` is the load
/// order, so equal timestamps resolve to the last row loaded.
pub(crate) const PICK_FROM_STAGING: &str = "\
INSERT INTO reconcile_pick
SELECT DISTINCT ON (event_id)
    event_id, customer_id, activity_type, time_stamp_utc, details_json, expected_row_version
FROM customer_activity_events_staging
WHERE batch_id = $1
ORDER BY event_id, time_stamp_utc DESC, staging_seq DESC";

/// Dedup source: six parallel arrays expanded server-side. `ordinality` is
/// the position within the submitted batch, so equal timestamps resolve to
/// the last element submitted.
pub(crate) const PICK_FROM_ARRAYS: &str = "\
INSERT INTO reconcile_pick
SELECT DISTINCT ON (event_id)
    event_id, customer_id, activity_type, time_stamp_utc, details_json, expected_row_version
FROM unnest(
        $1::uuid[], $2::integer[], $3::text[], $4::timestamptz[], $5::text[], $6::bigint[]
    ) WITH ORDINALITY
    AS candidate(event_id, customer_id, activity_type, time_stamp_utc,
                 details_json, expected_row_version, ord)
ORDER BY event_id, time_stamp_utc DESC, ord DESC";

const CAPTURE_CONFLICTS: &str = "\
INSERT INTO reconcile_conflict
SELECT p.event_id, p.expected_row_version, e.row_version, e.time_stamp_utc
FROM reconcile_pick p
JOIN customer_activity_events e USING (event_id)
WHERE p.expected_row_version IS NOT NULL
  AND p.expected_row_version <> e.row_version";

/// Guarded update: strictly newer timestamp and a matching (or absent)
/// expected version. Conflicted candidates fail the version guard and are
/// left untouched.
const APPLY_UPDATES: &str = "\
UPDATE customer_activity_events e
SET customer_id    = p.customer_id,
    activity_type  = p.activity_type,
    time_stamp_utc = p.time_stamp_utc,
    details_json   = p.details_json,
    row_version    = e.row_version + 1
FROM reconcile_pick p
WHERE e.event_id = p.event_id
  AND e.time_stamp_utc < p.time_stamp_utc
  AND (p.expected_row_version IS NULL OR p.expected_row_version = e.row_version)";

/// Insert unseen identities. Two reconciliations racing on the same new id
/// serialize on the primary key; the loser's candidate is dropped here and
/// re-evaluated as an update-or-no-op on its next submission.
const APPLY_INSERTS: &str = "\
INSERT INTO customer_activity_events
    (event_id, customer_id, activity_type, time_stamp_utc, details_json, row_version)
SELECT p.event_id, p.customer_id, p.activity_type, p.time_stamp_utc, p.details_json, 1
FROM reconcile_pick p
WHERE NOT EXISTS (
    SELECT 1 FROM customer_activity_events e WHERE e.event_id = p.event_id
)
ON CONFLICT (event_id) DO NOTHING";

const FETCH_CONFLICTS: &str = "\
SELECT event_id, expected_row_version, current_row_version, current_time_stamp_utc
FROM reconcile_conflict
ORDER BY event_id";

/// Run the shared reconciliation inside the caller's open transaction.
///
/// `pick_sql` populates the pick table from one of the two candidate
/// sources; `pick_params` are its bind parameters. The caller commits or
/// rolls back.
pub(crate) async fn run(
    client: &StoreClient,
    pick_sql: &str,
    pick_params: &[&(dyn ToSql + Sync)],
) -> Result<ReconcileSummary> {
    client.batch_execute(CREATE_PICK_TABLE).await?;
    client.batch_execute(CREATE_CONFLICT_TABLE).await?;

    let candidates = client.execute(pick_sql, pick_params).await?;
    client.execute(CAPTURE_CONFLICTS, &[]).await?;
    let rows_updated = client.execute(APPLY_UPDATES, &[]).await?;
    let rows_inserted = client.execute(APPLY_INSERTS, &[]).await?;

    let conflict_rows = client.query(FETCH_CONFLICTS, &[]).await?;
    let mut conflicts = Vec::with_capacity(conflict_rows.len());
    for row in &conflict_rows {
        let decode = |e: tokio_postgres::Error| StoreError::from_pg(e, Some(FETCH_CONFLICTS));
        conflicts.push(VersionConflict {
            event_id: row.try_get("event_id").map_err(decode)?,
            expected_row_version: RowVersion::new(
                row.try_get("expected_row_version").map_err(decode)?,
            ),
            current_row_version: RowVersion::new(
                row.try_get("current_row_version").map_err(decode)?,
            ),
            current_time_stamp_utc: row.try_get("current_time_stamp_utc").map_err(decode)?,
        });
    }

    debug!(
        candidates,
        rows_updated,
        rows_inserted,
        rows_conflicted = conflicts.len(),
        "reconciliation applied"
    );

    Ok(ReconcileSummary {
        rows_updated,
        rows_inserted,
        rows_conflicted: conflicts.len() as u64,
        conflicts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_one_candidate_per_identity() {
        for pick in [PICK_FROM_STAGING, PICK_FROM_ARRAYS] {
            assert!(pick.contains("DISTINCT ON (event_id)"));
            assert!(pick.contains("time_stamp_utc DESC"));
        }
        // tie-break: last-in-batch wins, via load order / array position
        assert!(PICK_FROM_STAGING.contains("staging_seq DESC"));
        assert!(PICK_FROM_ARRAYS.contains("ord DESC"));
    }

    #[test]
    fn update_is_guarded_by_ordering_and_version() {
        let normalized = APPLY_UPDATES.split_whitespace().collect::<Vec<_>>().join(" ");
        assert!(normalized.contains("e.time_stamp_utc < p.time_stamp_utc"));
        assert!(normalized
            .contains("p.expected_row_version IS NULL OR p.expected_row_version = e.row_version"));
        assert!(normalized.contains("row_version = e.row_version + 1"));
    }

    #[test]
    fn insert_tolerates_concurrent_duplicates() {
        assert!(APPLY_INSERTS.contains("ON CONFLICT (event_id) DO NOTHING"));
    }

    #[test]
    fn conflicts_are_captured_before_updates_change_versions() {
        assert!(CAPTURE_CONFLICTS.contains("p.expected_row_version <> e.row_version"));
        // a conflicted candidate must also fail the update guard, or the
        // captured detail would disagree with what was applied
        assert!(APPLY_UPDATES.contains("p.expected_row_version = e.row_version"));
    }

    #[test]
    fn temp_tables_die_with_the_transaction() {
        assert!(CREATE_PICK_TABLE.contains("ON COMMIT DROP"));
        assert!(CREATE_CONFLICT_TABLE.contains("ON COMMIT DROP"));
    }
}
