//! Forward-only row cursor over an event sequence.
//!
//! [`EventRowCursor`] presents any `Iterator<Item = CustomerActivityEvent>`
//! as a minimal tabular cursor — field count, per-column accessors and a
//! single-step advance — so the bulk loader can stream rows into a COPY
//! sink without materializing the collection. Single pass, not restartable,
//! no random access: field access before the first advance, after
//! exhaustion, or with an out-of-range index is a
//! [`StoreError::Cursor`](crate::error::StoreError) programming error.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::event::CustomerActivityEvent;

/// Column count exposed by [`EventRowCursor`]
pub const EVENT_FIELD_COUNT: usize = 6;

/// A typed view of one cursor field, in wire order
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CopyField<'a> {
    /// `event_id`
    Uuid(Uuid),
    /// `customer_id`
    Int4(i32),
    /// `activity_type`
    Text(&'a str),
    /// `time_stamp_utc`
    TimestampTz(DateTime<Utc>),
    /// `details_json`
    NullableText(Option<&'a str>),
    /// `expected_row_version`
    NullableInt8(Option<i64>),
}

/// Forward-only, single-pass cursor over a sequence of events.
///
/// Column order matches the staging COPY column list:
/// `event_id, customer_id, activity_type, time_stamp_utc, details_json,
/// expected_row_version`.
pub struct EventRowCursor<I> {
    source: I,
    current: Option<CustomerActivityEvent>,
    started: bool,
    position: u64,
}

impl<I> EventRowCursor<I>
where
    I: Iterator<Item = CustomerActivityEvent>,
{
    /// Wrap an event sequence
    pub fn new(source: I) -> Self {
        Self {
            source,
            current: None,
            started: false,
            position: 0,
        }
    }

    /// Number of columns each row exposes
    pub fn field_count(&self) -> usize {
        EVENT_FIELD_COUNT
    }

    /// Rows consumed so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Step to the next row. Returns `false` once the sequence is exhausted;
    /// further calls keep returning `false`.
    pub fn advance(&mut self) -> Result<bool> {
        self.started = true;
        match self.source.next() {
            Some(event) => {
                self.current = Some(event);
                self.position += 1;
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    /// Access one field of the current row
    pub fn field(&self, index: usize) -> Result<CopyField<'_>> {
        let event = match &self.current {
            Some(event) => event,
            None if !self.started => {
                return Err(StoreError::cursor("field access before the first advance"))
            }
            None => {
                return Err(StoreError::cursor(
                    "field access after cursor exhaustion; rows cannot be re-read",
                ))
            }
        };

        match index {
            0 => Ok(CopyField::Uuid(event.event_id)),
            1 => Ok(CopyField::Int4(event.customer_id)),
            2 => Ok(CopyField::Text(&event.activity_type)),
            3 => Ok(CopyField::TimestampTz(event.time_stamp_utc)),
            4 => Ok(CopyField::NullableText(event.details_json.as_deref())),
            5 => Ok(CopyField::NullableInt8(
                event.expected_row_version.map(|v| v.value()),
            )),
            _ => Err(StoreError::cursor(format!(
                "field index {index} out of range (cursor exposes {EVENT_FIELD_COUNT} columns)"
            ))),
        }
    }
}
