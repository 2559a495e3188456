//! Local row sources and the batch fetcher.
//!
//! A [`RowSource`] is the engine's view of the local store: it hands out
//! windows of not-yet-synced rows and applies the post-delivery policy.
//! Rows are always addressed in id order, so "the first `n` unsynced rows"
//! is a stable description of what has been delivered.

mod memory;
mod sql;

pub use memory::{FetchCall, MemoryRowSource};
pub use sql::{LocalStore, QueryResult, SqlRowSource};

use crate::config::SyncedRowPolicy;
use crate::error::{StoreError, StoreResult, SyncResult};
use async_trait::async_trait;
use sensync_protocol::Row;
use std::sync::Arc;
use tracing::debug;

/// Read and post-delivery access to locally buffered rows.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Returns up to `limit` unsynced rows of `table`, skipping the first `offset`.
    async fn fetch(&self, table: &str, offset: u64, limit: u32) -> StoreResult<Vec<Row>>;

    /// Applies `policy` to the first `count` unsynced rows. Returns rows affected.
    async fn mark_delivered(
        &self,
        table: &str,
        count: u64,
        policy: SyncedRowPolicy,
    ) -> StoreResult<u64>;

    /// Deletes rows already flagged as synced. Returns rows deleted.
    async fn purge_synced(&self, table: &str) -> StoreResult<u64>;
}

#[async_trait]
impl<T: RowSource + ?Sized> RowSource for Arc<T> {
    async fn fetch(&self, table: &str, offset: u64, limit: u32) -> StoreResult<Vec<Row>> {
        (**self).fetch(table, offset, limit).await
    }

    async fn mark_delivered(
        &self,
        table: &str,
        count: u64,
        policy: SyncedRowPolicy,
    ) -> StoreResult<u64> {
        (**self).mark_delivered(table, count, policy).await
    }

    async fn purge_synced(&self, table: &str) -> StoreResult<u64> {
        (**self).purge_synced(table).await
    }
}

/// Reads fixed-size windows from a [`RowSource`].
#[derive(Debug)]
pub struct BatchFetcher<R> {
    source: R,
    branch_size: u32,
}

impl<R: RowSource> BatchFetcher<R> {
    /// Creates a fetcher that reads at most `branch_size` rows per window.
    pub fn new(source: R, branch_size: u32) -> Self {
        Self {
            source,
            branch_size,
        }
    }

    /// Maximum rows per window.
    pub fn branch_size(&self) -> u32 {
        self.branch_size
    }

    /// The underlying row source.
    pub fn source(&self) -> &R {
        &self.source
    }

    /// Fetches the window starting at `offset`. An empty window means the
    /// table is drained.
    pub async fn fetch(&self, table: &str, offset: u64) -> SyncResult<Vec<Row>> {
        let rows = self.source.fetch(table, offset, self.branch_size).await?;
        if rows.len() > self.branch_size as usize {
            return Err(StoreError::Query(format!(
                "store returned {} rows for a window of {}",
                rows.len(),
                self.branch_size
            ))
            .into());
        }
        debug!(table, offset, rows = rows.len(), "fetched window");
        Ok(rows)
    }
}
