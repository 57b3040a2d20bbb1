//! Persisted schema: the primary event table and the bulk-load staging
//! table. All statements are idempotent so [`ensure_schema`] can run on
//! every startup.
//!
//! [`ensure_schema`]: crate::client::StoreClient::ensure_schema

/// Primary event table name
pub const EVENTS_TABLE: &str = "customer_activity_events";

/// Staging table name for the bulk path
pub const STAGING_TABLE: &str = "customer_activity_events_staging";

/// Schema bootstrap DDL.
///
/// `row_version` is maintained exclusively by the engine's own statements:
/// set to 1 on insert, incremented on every physical update. `staging_seq`
/// records load order and provides the deterministic dedup tie-break.
pub(crate) const SCHEMA_DDL: &str = "\
CREATE TABLE IF NOT EXISTS customer_activity_events (
    event_id        UUID PRIMARY KEY,
    customer_id     INTEGER NOT NULL,
    activity_type   TEXT NOT NULL,
    time_stamp_utc  TIMESTAMPTZ NOT NULL,
    details_json    TEXT,
    row_version     BIGINT NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS customer_activity_events_staging (
    staging_seq          BIGSERIAL PRIMARY KEY,
    event_id             UUID NOT NULL,
    customer_id          INTEGER NOT NULL,
    activity_type        TEXT NOT NULL,
    time_stamp_utc       TIMESTAMPTZ NOT NULL,
    details_json         TEXT,
    expected_row_version BIGINT,
    batch_id             UUID NOT NULL,
    loaded_at            TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS customer_activity_events_staging_batch_idx
    ON customer_activity_events_staging (batch_id);
";

/// Read one event row with its current version token
pub(crate) const SELECT_EVENT: &str = "\
SELECT event_id, customer_id, activity_type, time_stamp_utc, details_json, row_version
FROM customer_activity_events
WHERE event_id = $1";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_is_idempotent() {
        // every statement must survive re-running on an existing schema
        for stmt in SCHEMA_DDL.split(';').filter(|s| !s.trim().is_empty()) {
            assert!(
                stmt.contains("IF NOT EXISTS"),
                "non-idempotent DDL statement: {stmt}"
            );
        }
    }

    #[test]
    fn version_column_has_insert_default() {
        let normalized = SCHEMA_DDL.split_whitespace().collect::<Vec<_>>().join(" ");
        assert!(normalized.contains("row_version BIGINT NOT NULL DEFAULT 1"));
        assert!(normalized.contains("batch_id UUID NOT NULL"));
        assert!(normalized.contains("loaded_at TIMESTAMPTZ NOT NULL DEFAULT now()"));
    }
}
