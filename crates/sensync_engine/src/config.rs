//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use std::collections::HashSet;
use std::time::Duration;

/// What happens to rows once the collector has acknowledged them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncedRowPolicy {
    /// Set `is_synced = 1` and leave the row for a later purge.
    #[default]
    Flag,
    /// Delete the rows immediately.
    Delete,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Collector URL (`ws://` or `wss://`).
    pub server_url: String,
    /// Syncable tables in sync order. Doubles as the table allow-list.
    pub tables: Vec<String>,
    /// Maximum rows per batch.
    pub branch_size: u32,
    /// Per-batch ack deadline.
    pub sync_timeout: Duration,
    /// Deadline for a connection attempt to reach OPEN.
    pub connect_timeout: Duration,
    /// Consecutive failures a table may accumulate before the run aborts.
    pub max_retries: u32,
    /// Backoff between retries of the same batch window.
    pub retry: RetryConfig,
    /// Base delay for reconnecting a dropped channel.
    pub reconnect_delay: Duration,
    /// Maximum reconnect attempts per outage.
    pub max_reconnect_attempts: u32,
    /// Post-delivery row handling.
    pub synced_rows: SyncedRowPolicy,
    /// Whether to purge flagged rows after each successful run.
    pub purge_after_sync: bool,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new<I, S>(server_url: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            server_url: server_url.into(),
            tables: tables.into_iter().map(Into::into).collect(),
            branch_size: 100,
            sync_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry: RetryConfig::default(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            synced_rows: SyncedRowPolicy::Flag,
            purge_after_sync: false,
        }
    }

    /// Sets the batch size.
    pub fn with_branch_size(mut self, size: u32) -> Self {
        self.branch_size = size;
        self
    }

    /// Sets the per-batch ack deadline.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-table retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the retry backoff configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the reconnect base delay and attempt cap.
    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Sets the post-delivery row policy.
    pub fn with_synced_rows(mut self, policy: SyncedRowPolicy) -> Self {
        self.synced_rows = policy;
        self
    }

    /// Purge flagged rows after every successful run.
    pub fn with_purge_after_sync(mut self, purge: bool) -> Self {
        self.purge_after_sync = purge;
        self
    }

    /// Delay before reconnect attempt `count` (0-indexed): `base * 2^count`.
    pub fn reconnect_delay_for(&self, count: u32) -> Duration {
        self.reconnect_delay
            .saturating_mul(2u32.saturating_pow(count))
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.tables.is_empty() {
            return Err(SyncError::Config("no tables configured".into()));
        }
        let mut seen = HashSet::new();
        for table in &self.tables {
            if !is_identifier(table) {
                return Err(SyncError::Config(format!("invalid table name: {table:?}")));
            }
            if !seen.insert(table.as_str()) {
                return Err(SyncError::Config(format!("duplicate table: {table}")));
            }
        }
        if self.branch_size == 0 {
            return Err(SyncError::Config("branch size must be positive".into()));
        }
        if self.sync_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(SyncError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// SQL identifier check used for table names.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter, making delays exact.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay after failure number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensors() -> SyncConfig {
        SyncConfig::new("ws://collector.local/sync", ["BIO_SENSOR", "ECG_SENSOR"])
    }

    #[test]
    fn sync_config_builder() {
        let config = sensors()
            .with_branch_size(50)
            .with_sync_timeout(Duration::from_secs(10))
            .with_max_retries(5)
            .with_reconnect(Duration::from_millis(250), 2)
            .with_synced_rows(SyncedRowPolicy::Delete);

        assert_eq!(config.server_url, "ws://collector.local/sync");
        assert_eq!(config.tables, vec!["BIO_SENSOR", "ECG_SENSOR"]);
        assert_eq!(config.branch_size, 50);
        assert_eq!(config.sync_timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.synced_rows, SyncedRowPolicy::Delete);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reconnect_delay_doubles() {
        let config = sensors().with_reconnect(Duration::from_millis(500), 5);
        assert_eq!(config.reconnect_delay_for(0), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay_for(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_delay_for(3), Duration::from_secs(4));
        // The multiplier saturates instead of overflowing
        assert_eq!(config.reconnect_delay_for(200), config.reconnect_delay_for(40));
    }

    #[test]
    fn validate_rejects_bad_tables() {
        let empty = SyncConfig::new("ws://x", Vec::<String>::new());
        assert!(matches!(empty.validate(), Err(SyncError::Config(_))));

        let injected = SyncConfig::new("ws://x", ["ECG; DROP TABLE x"]);
        assert!(injected.validate().is_err());

        let duplicate = SyncConfig::new("ws://x", ["a", "a"]);
        assert!(duplicate.validate().is_err());

        assert!(sensors().with_branch_size(0).validate().is_err());
        assert!(sensors().with_sync_timeout(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("ECG_SENSOR"));
        assert!(is_identifier("_t1"));
        assert!(!is_identifier("1t"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_jitter_bounds() {
        let config = RetryConfig::new(Duration::from_millis(100));
        for _ in 0..32 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
