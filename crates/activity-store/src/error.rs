//! Error types for activity-store
//!
//! Provides granular error classification for proper retry handling:
//! - Transient faults (connection loss, deadlock, throttling, timeouts)
//! - Fatal faults (constraint violations, schema errors, programming errors)
//! - Cancellation, which is neither success nor failure
//!
//! Concurrency conflicts are deliberately absent from this module: a stale
//! `expected_row_version` is reported as data (see
//! [`VersionConflict`](crate::event::VersionConflict)), never as an error.

use thiserror::Error;

/// Result type for activity-store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-level failures (transient)
    Connection,
    /// Statement or driver timeouts (transient)
    Timeout,
    /// Deadlock victim or serialization failure (transient)
    Deadlock,
    /// Store shut down, throttled, or out of resources (transient)
    Unavailable,
    /// Network-level I/O failures (transient)
    Io,
    /// Query execution errors (not transient)
    Query,
    /// Constraint violation (not transient)
    Constraint,
    /// Schema errors: missing tables, undefined columns (not transient)
    Schema,
    /// Configuration error (not transient)
    Configuration,
    /// Forward-only cursor misuse (programming error, not transient)
    Cursor,
    /// Caller-requested cancellation
    Cancelled,
}

impl ErrorCategory {
    /// Whether errors in this category are worth retrying
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Deadlock | Self::Unavailable | Self::Io
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Io => write!(f, "io"),
            Self::Query => write!(f, "query"),
            Self::Constraint => write!(f, "constraint"),
            Self::Schema => write!(f, "schema"),
            Self::Configuration => write!(f, "configuration"),
            Self::Cursor => write!(f, "cursor"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Main error type for activity-store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection failed or was lost
    #[error("connection error: {message}")]
    Connection {
        /// Human-readable failure description
        message: String,
        /// Underlying driver error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout {
        /// What timed out
        message: String,
    },

    /// This session lost a deadlock or serialization race
    #[error("deadlock victim")]
    Deadlock,

    /// The store refused work it should accept again later
    #[error("store unavailable ({code}): {message}")]
    Unavailable {
        /// SQLSTATE reported by the store
        code: String,
        /// Store-reported message
        message: String,
    },

    /// Network-level I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        /// Store-reported message
        message: String,
        /// Statement that failed, when known
        sql: Option<String>,
        /// Underlying driver error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Constraint violation (PK, FK, unique, check)
    #[error("constraint violation: {constraint}: {message}")]
    Constraint {
        /// Name of the violated constraint
        constraint: String,
        /// Store-reported message
        message: String,
    },

    /// Schema error (missing table, undefined column, type mismatch)
    #[error("schema error: {message}")]
    Schema {
        /// Store-reported message
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration {
        /// What was misconfigured
        message: String,
    },

    /// Forward-only cursor used in a way it cannot support
    #[error("cursor misuse: {message}")]
    Cursor {
        /// The unsupported operation
        message: String,
    },

    /// Operation aborted by caller request
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Unavailable { .. } => ErrorCategory::Unavailable,
            Self::Io(_) => ErrorCategory::Io,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Cursor { .. } => ErrorCategory::Cursor,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether this error should be retried by the retry policy
    #[inline]
    pub fn is_transient(&self) -> bool {
        self.category().is_transient()
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cursor-misuse error
    pub fn cursor(message: impl Into<String>) -> Self {
        Self::Cursor {
            message: message.into(),
        }
    }

    /// Classify a driver error into the store taxonomy.
    ///
    /// SQLSTATE-bearing errors are mapped through [`category_for_sqlstate`];
    /// errors without one (connection teardown, socket faults) fall back to
    /// the driver's closed flag and the I/O error buried in the source chain.
    pub(crate) fn from_pg(err: tokio_postgres::Error, sql: Option<&str>) -> Self {
        let db_info = err.as_db_error().map(|db| {
            (
                db.code().code().to_owned(),
                db.message().to_owned(),
                db.constraint().map(str::to_owned),
            )
        });

        if let Some((code, message, constraint)) = db_info {
            return match category_for_sqlstate(&code) {
                ErrorCategory::Deadlock => Self::Deadlock,
                ErrorCategory::Timeout => Self::Timeout { message },
                ErrorCategory::Unavailable => Self::Unavailable { code, message },
                ErrorCategory::Connection => Self::Connection {
                    message,
                    source: Some(Box::new(err)),
                },
                ErrorCategory::Constraint => Self::Constraint {
                    constraint: constraint.unwrap_or_else(|| "<unnamed>".to_owned()),
                    message,
                },
                ErrorCategory::Schema => Self::Schema { message },
                _ => Self::Query {
                    message,
                    sql: sql.map(str::to_owned),
                    source: Some(Box::new(err)),
                },
            };
        }

        match io_error_kind(&err) {
            Some(kind)
                if matches!(
                    kind,
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Self::Timeout {
                    message: err.to_string(),
                }
            }
            Some(_) => Self::Connection {
                message: err.to_string(),
                source: Some(Box::new(err)),
            },
            None if err.is_closed() => Self::Connection {
                message: "connection is closed".to_owned(),
                source: Some(Box::new(err)),
            },
            None => Self::Query {
                message: err.to_string(),
                sql: sql.map(str::to_owned),
                source: Some(Box::new(err)),
            },
        }
    }
}

/// Map a SQLSTATE code to an error category.
///
/// The transient set mirrors the documented retriable conditions: deadlock
/// victim and serialization failure (40P01, 40001), connection faults
/// (class 08), shutdown/throttling states (57P01-57P03, class 53, 55P03) and
/// cancelled/timed-out statements (57014).
pub fn category_for_sqlstate(code: &str) -> ErrorCategory {
    match code {
        "40001" | "40P01" => ErrorCategory::Deadlock,
        "57014" => ErrorCategory::Timeout,
        "57P01" | "57P02" | "57P03" | "55P03" => ErrorCategory::Unavailable,
        c if c.starts_with("08") => ErrorCategory::Connection,
        c if c.starts_with("53") => ErrorCategory::Unavailable,
        c if c.starts_with("23") => ErrorCategory::Constraint,
        c if c.starts_with("42") => ErrorCategory::Schema,
        _ => ErrorCategory::Query,
    }
}

/// Walk an error's source chain looking for an I/O error.
fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        current = e.source();
    }
    None
}
