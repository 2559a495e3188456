//! Per-table sync checkpoints.

use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Checkpoint for one syncable table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    /// Rows already delivered and acknowledged.
    pub offset: u64,
    /// Set once a fetch at `offset` came back empty.
    pub complete: bool,
    /// Consecutive failures at the current offset.
    pub retries: u32,
    /// Time of the most recent failure.
    pub last_error: Option<DateTime<Utc>>,
    /// Batch id the window at `offset` is sent under.
    pub next_batch_id: u64,
    /// Leading acknowledged rows already flagged (or deleted) in the store.
    /// They no longer show up among the unsynced rows.
    pub flagged: u64,
}

impl ProgressEntry {
    fn fresh(batch_id: u64) -> Self {
        Self {
            offset: 0,
            complete: false,
            retries: 0,
            last_error: None,
            next_batch_id: batch_id,
            flagged: 0,
        }
    }

    /// Acknowledged rows not yet flagged in the store. This is also where
    /// the next window starts among the rows the store still holds unsynced.
    pub fn unflagged(&self) -> u64 {
        self.offset - self.flagged
    }
}

/// In-memory checkpoints for every table, keyed by table name.
///
/// The offset only moves on [`advance`](Self::advance), i.e. after a batch
/// was both sent and acknowledged. Batch ids are drawn from one counter for
/// the whole store, so they never repeat across tables.
#[derive(Debug, Default)]
pub struct ProgressStore {
    entries: HashMap<String, ProgressEntry>,
    last_batch_id: u64,
}

impl ProgressStore {
    /// Creates an empty progress store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_mut(&mut self, table: &str) -> &mut ProgressEntry {
        let next_id = self.last_batch_id + 1;
        match self.entries.entry(table.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.last_batch_id = next_id;
                entry.insert(ProgressEntry::fresh(next_id))
            }
        }
    }

    /// Returns the table's entry, creating a zeroed one on first access.
    pub fn get(&mut self, table: &str) -> ProgressEntry {
        self.entry_mut(table).clone()
    }

    /// Returns the table's entry without creating it.
    pub fn peek(&self, table: &str) -> Option<&ProgressEntry> {
        self.entries.get(table)
    }

    /// Records an acknowledged batch of `rows` rows. Returns the new offset.
    pub fn advance(&mut self, table: &str, rows: u64) -> u64 {
        self.last_batch_id += 1;
        let batch_id = self.last_batch_id;
        let entry = self.entry_mut(table);
        entry.offset += rows;
        entry.retries = 0;
        entry.next_batch_id = batch_id;
        entry.offset
    }

    /// Records a failed attempt. Returns the consecutive failure count.
    pub fn record_failure(&mut self, table: &str, at: DateTime<Utc>) -> u32 {
        let entry = self.entry_mut(table);
        entry.retries += 1;
        entry.last_error = Some(at);
        entry.retries
    }

    /// Marks the table as fully drained.
    pub fn mark_complete(&mut self, table: &str) {
        self.entry_mut(table).complete = true;
    }

    /// Claims the acknowledged rows not yet flagged in the store and returns
    /// how many there are. The caller flags them, or hands them back with
    /// [`release_flagged`](Self::release_flagged) if the store refuses.
    pub fn claim_unflagged(&mut self, table: &str) -> u64 {
        let entry = self.entry_mut(table);
        let rows = entry.unflagged();
        entry.flagged = entry.offset;
        rows
    }

    /// Returns `rows` claimed rows the store failed to flag.
    pub fn release_flagged(&mut self, table: &str, rows: u64) {
        let entry = self.entry_mut(table);
        entry.flagged = entry.flagged.saturating_sub(rows);
    }

    /// Returns true if the table has been marked complete.
    pub fn is_complete(&self, table: &str) -> bool {
        self.entries.get(table).is_some_and(|e| e.complete)
    }

    /// Prepares the checkpoints for a new run.
    ///
    /// Completed tables restart from offset 0 under a fresh batch id; the
    /// others keep their offset with the failure count cleared. Returns how
    /// many tables were restarted.
    pub fn begin_run(&mut self) -> usize {
        let mut reset = 0;
        for entry in self.entries.values_mut() {
            if entry.complete {
                self.last_batch_id += 1;
                *entry = ProgressEntry::fresh(self.last_batch_id);
                reset += 1;
            } else {
                entry.retries = 0;
            }
        }
        reset
    }

    /// Forgets every entry. Batch ids keep increasing.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Forgets every entry and returns the unflagged acknowledged rows of
    /// each table that had any.
    pub fn drain_unflagged(&mut self) -> Vec<(String, u64)> {
        self.entries
            .drain()
            .filter_map(|(table, entry)| {
                let rows = entry.unflagged();
                (rows > 0).then_some((table, rows))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_access_creates_zeroed_entry() {
        let mut store = ProgressStore::new();
        assert!(store.peek("ECG_SENSOR").is_none());

        let entry = store.get("ECG_SENSOR");
        assert_eq!(entry.offset, 0);
        assert!(!entry.complete);
        assert_eq!(entry.retries, 0);
        assert!(entry.last_error.is_none());
        assert_eq!(entry.next_batch_id, 1);
        assert!(store.peek("ECG_SENSOR").is_some());
    }

    #[test]
    fn advance_moves_offset_by_rows_returned() {
        let mut store = ProgressStore::new();
        store.get("t");
        store.record_failure("t", Utc::now());

        assert_eq!(store.advance("t", 2), 2);
        assert_eq!(store.advance("t", 1), 3);

        let entry = store.get("t");
        assert_eq!(entry.offset, 3);
        assert_eq!(entry.retries, 0);
    }

    #[test]
    fn record_failure_keeps_offset_and_batch_id() {
        let mut store = ProgressStore::new();
        store.advance("t", 4);
        let before = store.get("t");

        let at = Utc::now();
        assert_eq!(store.record_failure("t", at), 1);
        assert_eq!(store.record_failure("t", at), 2);

        let after = store.get("t");
        assert_eq!(after.offset, 4);
        assert_eq!(after.retries, 2);
        assert_eq!(after.last_error, Some(at));
        assert_eq!(after.next_batch_id, before.next_batch_id);
    }

    #[test]
    fn batch_ids_are_unique_across_tables() {
        let mut store = ProgressStore::new();
        let mut ids = vec![store.get("a").next_batch_id, store.get("b").next_batch_id];
        store.advance("a", 1);
        ids.push(store.get("a").next_batch_id);
        store.advance("b", 1);
        ids.push(store.get("b").next_batch_id);

        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }

    #[test]
    fn begin_run_restarts_complete_tables_only() {
        let mut store = ProgressStore::new();
        store.advance("done", 10);
        store.mark_complete("done");
        store.advance("partial", 4);
        store.record_failure("partial", Utc::now());
        let partial_id = store.get("partial").next_batch_id;

        assert_eq!(store.begin_run(), 1);
        assert_eq!(store.get("done").offset, 0);
        assert!(!store.is_complete("done"));

        let partial = store.get("partial");
        assert_eq!(partial.offset, 4);
        assert_eq!(partial.retries, 0);
        assert_eq!(partial.next_batch_id, partial_id);
    }

    #[test]
    fn clear_keeps_batch_ids_increasing() {
        let mut store = ProgressStore::new();
        let first = store.get("t").next_batch_id;
        store.clear();
        assert!(store.peek("t").is_none());
        assert!(store.get("t").next_batch_id > first);
    }

    #[test]
    fn claimed_rows_move_the_read_window() {
        let mut store = ProgressStore::new();
        store.advance("t", 4);
        assert_eq!(store.get("t").unflagged(), 4);

        assert_eq!(store.claim_unflagged("t"), 4);
        assert_eq!(store.claim_unflagged("t"), 0);
        let entry = store.get("t");
        assert_eq!(entry.offset, 4);
        assert_eq!(entry.unflagged(), 0);

        store.advance("t", 2);
        assert_eq!(store.get("t").unflagged(), 2);
        assert_eq!(store.claim_unflagged("t"), 2);
        store.release_flagged("t", 2);
        assert_eq!(store.get("t").unflagged(), 2);
    }

    #[test]
    fn drain_unflagged_forgets_entries() {
        let mut store = ProgressStore::new();
        store.advance("a", 3);
        store.advance("b", 2);
        store.claim_unflagged("b");
        store.get("c");

        assert_eq!(store.drain_unflagged(), vec![("a".to_string(), 3)]);
        assert!(store.peek("a").is_none());
        assert!(store.peek("b").is_none());
    }

    proptest! {
        #[test]
        fn offset_is_sum_of_acknowledged_rows(batches in prop::collection::vec(0u64..500, 0..32)) {
            let mut store = ProgressStore::new();
            for rows in &batches {
                store.advance("t", *rows);
                store.record_failure("t", Utc::now());
            }
            prop_assert_eq!(store.get("t").offset, batches.iter().sum::<u64>());
        }
    }
}
