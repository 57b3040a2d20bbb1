//! Store configuration: connection URL plus the tunables recognized by the
//! writers. Loading these from files or the environment is the caller's
//! concern; this module only names the knobs and their defaults.

use std::time::Duration;

/// Default maximum retry attempts for a store interaction
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default base backoff delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
/// Default backoff cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
/// Default rows per physical staging sub-batch
pub const DEFAULT_STAGING_BATCH_SIZE: usize = 50_000;
/// Default COPY flush threshold (bytes)
pub const DEFAULT_COPY_FLUSH_BYTES: usize = 4 * 1024 * 1024;
/// Default timeout for one staging sub-batch
pub const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(600);

/// Configuration for the store client and writers
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum attempts per store interaction (including the first)
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Cap applied to the computed backoff delay
    pub max_delay: Duration,
    /// Rows loaded per staging sub-batch transaction
    pub staging_batch_size: usize,
    /// Byte threshold at which buffered COPY data is flushed to the socket
    pub copy_flush_bytes: usize,
    /// Wall-clock bound on one staging sub-batch; elapsing classifies as a
    /// transient timeout
    pub copy_timeout: Duration,
}

impl StoreConfig {
    /// Create a configuration with defaults for everything but the URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            staging_batch_size: DEFAULT_STAGING_BATCH_SIZE,
            copy_flush_bytes: DEFAULT_COPY_FLUSH_BYTES,
            copy_timeout: DEFAULT_COPY_TIMEOUT,
        }
    }

    /// Set the retry attempt budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base backoff delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the staging sub-batch size (rows)
    pub fn with_staging_batch_size(mut self, rows: usize) -> Self {
        self.staging_batch_size = rows;
        self
    }

    /// Set the COPY flush threshold (bytes)
    pub fn with_copy_flush_bytes(mut self, bytes: usize) -> Self {
        self.copy_flush_bytes = bytes;
        self
    }

    /// Set the per-sub-batch COPY timeout
    pub fn with_copy_timeout(mut self, timeout: Duration) -> Self {
        self.copy_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::new("postgres://localhost/activity");

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(5));
        assert_eq!(config.staging_batch_size, 50_000);
        assert_eq!(config.copy_flush_bytes, 4 * 1024 * 1024);
        assert_eq!(config.copy_timeout, Duration::from_secs(600));
    }

    #[test]
    fn builder_overrides() {
        let config = StoreConfig::new("postgres://localhost/activity")
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(250))
            .with_staging_batch_size(1_000)
            .with_copy_flush_bytes(64 * 1024)
            .with_copy_timeout(Duration::from_secs(30));

        assert_eq!(config.max_retries, 2);
        assert_eq!(config.base_delay, Duration::from_millis(10));
        assert_eq!(config.max_delay, Duration::from_millis(250));
        assert_eq!(config.staging_batch_size, 1_000);
        assert_eq!(config.copy_flush_bytes, 64 * 1024);
        assert_eq!(config.copy_timeout, Duration::from_secs(30));
    }
}
