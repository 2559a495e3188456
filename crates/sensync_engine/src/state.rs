//! Observable engine state, counters and run reports.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is opening the channel.
    Connecting,
    /// Engine is uploading batches.
    Syncing,
    /// Engine is waiting before retrying a batch.
    RetryWait,
    /// Engine is waiting to re-open a dropped channel.
    Reconnecting,
    /// The last run delivered every table.
    Synced,
    /// The last run failed.
    Error,
}

impl SyncState {
    /// Returns true while a run is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Connecting
                | SyncState::Syncing
                | SyncState::RetryWait
                | SyncState::Reconnecting
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Runs that delivered every table.
    pub runs_completed: u64,
    /// Runs that ended with an error, cancellation included.
    pub runs_failed: u64,
    /// Batches acknowledged by the collector.
    pub batches_acked: u64,
    /// Rows acknowledged by the collector.
    pub rows_delivered: u64,
    /// Failed batch attempts.
    pub retries: u64,
    /// Successful reconnects.
    pub reconnects: u64,
    /// End of the last successful run.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Outcome of one table within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableReport {
    /// Table name.
    pub table: String,
    /// Batches acknowledged.
    pub batches: u64,
    /// Rows acknowledged.
    pub rows: u64,
    /// Failed attempts.
    pub retries: u32,
    /// Rows flagged or deleted once the table drained.
    pub delivered: u64,
}

/// Result of a successful run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Per-table outcomes in sync order.
    pub tables: Vec<TableReport>,
    /// Reconnects performed during the run.
    pub reconnects: u32,
    /// Rows purged after the run, if purging is enabled.
    pub purged: u64,
    /// Wall time of the run.
    pub duration: Duration,
}

impl SyncReport {
    /// Batches acknowledged across all tables.
    pub fn batches(&self) -> u64 {
        self.tables.iter().map(|t| t.batches).sum()
    }

    /// Rows acknowledged across all tables.
    pub fn rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }

    /// The report for `table`, if the run reached it.
    pub fn table(&self, table: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == table)
    }

    pub(crate) fn table_mut(&mut self, table: &str) -> &mut TableReport {
        match self.tables.iter().position(|t| t.table == table) {
            Some(index) => &mut self.tables[index],
            None => {
                self.tables.push(TableReport {
                    table: table.to_string(),
                    ..TableReport::default()
                });
                let last = self.tables.len() - 1;
                &mut self.tables[last]
            }
        }
    }
}
