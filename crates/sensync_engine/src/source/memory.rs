//! In-memory row source.

use super::RowSource;
use crate::config::SyncedRowPolicy;
use crate::error::StoreResult;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sensync_protocol::Row;
use serde_json::Value;
use std::collections::HashMap;

/// A recorded `fetch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    /// Table read.
    pub table: String,
    /// Requested offset.
    pub offset: u64,
    /// Requested limit.
    pub limit: u32,
}

#[derive(Debug)]
struct StoredRow {
    id: i64,
    synced: bool,
    data: Row,
}

#[derive(Debug, Default)]
struct MemoryTable {
    next_id: i64,
    rows: Vec<StoredRow>,
}

/// An in-memory row source for testing.
///
/// Rows get an autoincrement `id` and an `is_synced` column, mirroring the
/// sensor tables of the mobile store.
#[derive(Debug, Default)]
pub struct MemoryRowSource {
    tables: RwLock<HashMap<String, MemoryTable>>,
    fetches: Mutex<Vec<FetchCall>>,
}

impl MemoryRowSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row and returns its id.
    pub fn insert(&self, table: &str, mut row: Row) -> i64 {
        let mut tables = self.tables.write();
        let table = tables.entry(table.to_string()).or_default();
        table.next_id += 1;
        let id = table.next_id;
        row.insert("id".into(), Value::from(id));
        row.insert("is_synced".into(), Value::from(0));
        table.rows.push(StoredRow {
            id,
            synced: false,
            data: row,
        });
        id
    }

    /// Appends `count` rows carrying a `value` column equal to their position.
    pub fn insert_sequence(&self, table: &str, count: usize) {
        for i in 0..count {
            let mut row = Row::new();
            row.insert("value".into(), Value::from(i));
            self.insert(table, row);
        }
    }

    /// Rows of `table` not yet flagged as synced.
    pub fn unsynced_count(&self, table: &str) -> usize {
        self.count(table, |r| !r.synced)
    }

    /// Rows of `table` flagged as synced.
    pub fn synced_count(&self, table: &str) -> usize {
        self.count(table, |r| r.synced)
    }

    /// Every row currently stored in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.count(table, |_| true)
    }

    /// Returns true if `table` holds no rows.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Every fetch made so far, in order.
    pub fn fetches(&self) -> Vec<FetchCall> {
        self.fetches.lock().clone()
    }

    /// Fetches made against one table.
    pub fn fetches_for(&self, table: &str) -> Vec<FetchCall> {
        self.fetches
            .lock()
            .iter()
            .filter(|f| f.table == table)
            .cloned()
            .collect()
    }

    fn count(&self, table: &str, pred: impl Fn(&StoredRow) -> bool) -> usize {
        self.tables
            .read()
            .get(table)
            .map_or(0, |t| t.rows.iter().filter(|r| pred(r)).count())
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    async fn fetch(&self, table: &str, offset: u64, limit: u32) -> StoreResult<Vec<Row>> {
        self.fetches.lock().push(FetchCall {
            table: table.to_string(),
            offset,
            limit,
        });

        let tables = self.tables.read();
        let Some(stored) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(stored
            .rows
            .iter()
            .filter(|r| !r.synced)
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .map(|r| r.data.clone())
            .collect())
    }

    async fn mark_delivered(
        &self,
        table: &str,
        count: u64,
        policy: SyncedRowPolicy,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.write();
        let Some(stored) = tables.get_mut(table) else {
            return Ok(0);
        };

        let delivered: Vec<i64> = stored
            .rows
            .iter()
            .filter(|r| !r.synced)
            .take(usize::try_from(count).unwrap_or(usize::MAX))
            .map(|r| r.id)
            .collect();

        match policy {
            SyncedRowPolicy::Flag => {
                for row in stored.rows.iter_mut().filter(|r| delivered.contains(&r.id)) {
                    row.synced = true;
                    row.data.insert("is_synced".into(), Value::from(1));
                }
            }
            SyncedRowPolicy::Delete => stored.rows.retain(|r| !delivered.contains(&r.id)),
        }
        Ok(delivered.len() as u64)
    }

    async fn purge_synced(&self, table: &str) -> StoreResult<u64> {
        let mut tables = self.tables.write();
        let Some(stored) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = stored.rows.len();
        stored.rows.retain(|r| !r.synced);
        Ok((before - stored.rows.len()) as u64)
    }
}
