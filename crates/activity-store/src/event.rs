//! The customer-activity-event record and the result types the writers
//! report back: stored rows, version conflicts and reconciliation summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque optimistic-concurrency token maintained by the store.
///
/// Assigned on the first insert of a row and changed on every physical write
/// since. Callers never set it directly; they obtain one from
/// [`StoredEvent`] or a [`VersionConflict`] and hand it back as
/// `expected_row_version` to demand that the row is still in the state they
/// last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowVersion(i64);

impl RowVersion {
    /// Wrap a raw version value previously read from the store
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// The raw wire value, for logging or persistence
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A customer activity event, the unit exchanged with the store.
///
/// `event_id` is the immutable upsert key: at most one row is ever persisted
/// per id, and a stored row's `time_stamp_utc` only moves forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerActivityEvent {
    /// Globally unique, immutable identity of the event
    pub event_id: Uuid,
    /// Originating customer
    pub customer_id: i32,
    /// Short categorical label ("login", "purchase", ...)
    pub activity_type: String,
    /// Occurrence time; doubles as the ordering/version guard
    pub time_stamp_utc: DateTime<Utc>,
    /// Opaque JSON payload
    #[serde(default)]
    pub details_json: Option<String>,
    /// Optimistic-concurrency token; when present, the write applies only if
    /// it matches the store's current [`RowVersion`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_row_version: Option<RowVersion>,
}

impl CustomerActivityEvent {
    /// Create an event with the required fields
    pub fn new(
        event_id: Uuid,
        customer_id: i32,
        activity_type: impl Into<String>,
        time_stamp_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            customer_id,
            activity_type: activity_type.into(),
            time_stamp_utc,
            details_json: None,
            expected_row_version: None,
        }
    }

    /// Attach a JSON details payload
    pub fn with_details(mut self, details_json: impl Into<String>) -> Self {
        self.details_json = Some(details_json.into());
        self
    }

    /// Demand that the stored row still carries this version
    pub fn with_expected_version(mut self, version: RowVersion) -> Self {
        self.expected_row_version = Some(version);
        self
    }
}

/// A persisted event row, as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    /// Event identity
    pub event_id: Uuid,
    /// Originating customer
    pub customer_id: i32,
    /// Categorical label
    pub activity_type: String,
    /// Stored occurrence time
    pub time_stamp_utc: DateTime<Utc>,
    /// Stored JSON payload
    pub details_json: Option<String>,
    /// Current store-maintained version token
    pub row_version: RowVersion,
}

/// A rejected write: the caller's expected version no longer matches the row.
///
/// Conflicts are data, not errors; a batch reports them alongside its
/// successful updates and inserts so the caller can re-read, retry or alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionConflict {
    /// Event whose write was rejected
    pub event_id: Uuid,
    /// Version the caller expected
    pub expected_row_version: RowVersion,
    /// Version the store actually holds
    pub current_row_version: RowVersion,
    /// Timestamp the store actually holds
    pub current_time_stamp_utc: DateTime<Utc>,
}

/// Outcome of one reconciliation call or batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    /// Rows whose fields were updated
    pub rows_updated: u64,
    /// Rows inserted for previously unseen event ids
    pub rows_inserted: u64,
    /// Candidates rejected by the concurrency guard
    pub rows_conflicted: u64,
    /// Detail records for every conflicted candidate
    pub conflicts: Vec<VersionConflict>,
}

impl ReconcileSummary {
    /// Whether the batch completed without any version conflicts
    pub fn is_clean(&self) -> bool {
        self.rows_conflicted == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn builder_defaults() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let event = CustomerActivityEvent::new(Uuid::new_v4(), 7, "login", ts);

        assert_eq!(event.customer_id, 7);
        assert_eq!(event.activity_type, "login");
        assert!(event.details_json.is_none());
        assert!(event.expected_row_version.is_none());
    }

    #[test]
    fn builder_attaches_optional_fields() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let event = CustomerActivityEvent::new(Uuid::new_v4(), 7, "purchase", ts)
            .with_details(r#"{"sku":"A-100"}"#)
            .with_expected_version(RowVersion::new(3));

        assert_eq!(event.details_json.as_deref(), Some(r#"{"sku":"A-100"}"#));
        assert_eq!(event.expected_row_version, Some(RowVersion::new(3)));
    }

    #[test]
    fn summary_cleanliness() {
        let mut summary = ReconcileSummary::default();
        assert!(summary.is_clean());

        summary.rows_conflicted = 1;
        assert!(!summary.is_clean());
    }

    #[test]
    fn wire_shape_is_stable() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let event = CustomerActivityEvent::new(Uuid::nil(), 7, "login", ts)
            .with_expected_version(RowVersion::new(2));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["customer_id"], 7);
        assert_eq!(json["activity_type"], "login");
        assert_eq!(json["details_json"], serde_json::Value::Null);
        // the version token serializes as its bare wire value
        assert_eq!(json["expected_row_version"], 2);

        // events without a token omit the field entirely
        let bare = CustomerActivityEvent::new(Uuid::nil(), 7, "login", ts);
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("expected_row_version").is_none());
    }

    #[test]
    fn row_version_is_comparable_not_mutable() {
        let v = RowVersion::new(42);
        assert_eq!(v.value(), 42);
        assert_eq!(v.to_string(), "42");
        assert!(RowVersion::new(41) < v);
    }
}
