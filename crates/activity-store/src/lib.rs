//! # activity-store
//!
//! Customer-activity-event upsert and reconciliation engine for PostgreSQL.
//!
//! Three write strategies converge on one correctness contract — at most one
//! persisted row per event identity, monotonically increasing event
//! timestamps, and optimistic-concurrency conflict detection — at three
//! throughput tiers:
//!
//! - **Single-row**: one transactional update-then-insert per event, for
//!   low-volume callers
//! - **Structured batch**: a whole batch shipped as array parameters and
//!   merged server-side in one transaction
//! - **Bulk staging**: unbounded streams loaded through binary COPY into a
//!   staging table, then reconciled per batch id
//!
//! Every store interaction is wrapped in a transient-fault retry policy with
//! exponential backoff and jitter; fatal faults propagate immediately, and
//! version conflicts are reported as data rather than errors.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use activity_store::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = StoreConfig::new("postgres://app@db/activity");
//! let client = StoreClient::connect(&config).await?;
//! client.ensure_schema().await?;
//!
//! let cancel = CancellationToken::new();
//! let writer = StructuredWriter::new(client.clone(), &config);
//! let summary = writer.upsert_batch(&events, &cancel).await?;
//! for conflict in &summary.conflicts {
//!     println!("stale write for {}", conflict.event_id);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod retry;
pub mod schema;
pub mod single;
pub mod staging;
pub mod structured;

mod reconcile;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::StoreClient;
    pub use crate::config::StoreConfig;
    pub use crate::cursor::{CopyField, EventRowCursor};
    pub use crate::error::{ErrorCategory, Result, StoreError};
    pub use crate::event::{
        CustomerActivityEvent, ReconcileSummary, RowVersion, StoredEvent, VersionConflict,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::single::SingleRowWriter;
    pub use crate::staging::StagingWriter;
    pub use crate::structured::StructuredWriter;
}
