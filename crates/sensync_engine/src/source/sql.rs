//! Row source over a relational store reachable through SQL calls.

use super::RowSource;
use crate::config::{is_identifier, SyncedRowPolicy};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use sensync_protocol::Row;
use serde_json::Value;

/// Rows and row count produced by a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Result rows, if the statement produced any.
    pub rows: Vec<Row>,
    /// Rows inserted, updated or deleted.
    pub rows_affected: u64,
}

/// The local relational store as seen by the engine.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Runs a parameterized statement.
    async fn execute(&self, query: &str, params: &[Value]) -> StoreResult<QueryResult>;

    /// Runs a statement inside a transaction. Returns rows affected.
    async fn transactional(&self, statement: &str) -> StoreResult<u64>;
}

/// [`RowSource`] over tables with an integer `id` key and an `is_synced` flag.
///
/// Table names cannot be bound as parameters, so every name is checked
/// against the allow-list before it is interpolated into a statement.
pub struct SqlRowSource<S> {
    store: S,
    tables: Vec<String>,
}

impl<S: LocalStore> SqlRowSource<S> {
    /// Creates a source that only touches `tables`.
    pub fn new<I, T>(store: S, tables: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            store,
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// The wrapped store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn checked<'a>(&self, table: &'a str) -> StoreResult<&'a str> {
        if is_identifier(table) && self.tables.iter().any(|t| t == table) {
            Ok(table)
        } else {
            Err(StoreError::InvalidTable(table.to_string()))
        }
    }
}

#[async_trait]
impl<S: LocalStore> RowSource for SqlRowSource<S> {
    async fn fetch(&self, table: &str, offset: u64, limit: u32) -> StoreResult<Vec<Row>> {
        let table = self.checked(table)?;
        let query =
            format!("SELECT * FROM {table} WHERE is_synced = 0 ORDER BY id LIMIT ? OFFSET ?");
        let result = self
            .store
            .execute(&query, &[Value::from(limit), Value::from(offset)])
            .await?;
        Ok(result.rows)
    }

    async fn mark_delivered(
        &self,
        table: &str,
        count: u64,
        policy: SyncedRowPolicy,
    ) -> StoreResult<u64> {
        let table = self.checked(table)?;
        if count == 0 {
            return Ok(0);
        }
        let window =
            format!("SELECT id FROM {table} WHERE is_synced = 0 ORDER BY id LIMIT {count}");
        let statement = match policy {
            SyncedRowPolicy::Flag => {
                format!("UPDATE {table} SET is_synced = 1 WHERE id IN ({window})")
            }
            SyncedRowPolicy::Delete => format!("DELETE FROM {table} WHERE id IN ({window})"),
        };
        self.store.transactional(&statement).await
    }

    async fn purge_synced(&self, table: &str) -> StoreResult<u64> {
        let table = self.checked(table)?;
        self.store
            .transactional(&format!("DELETE FROM {table} WHERE is_synced = 1"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        statements: Mutex<Vec<(String, Vec<Value>)>>,
    }

    #[async_trait]
    impl LocalStore for RecordingStore {
        async fn execute(&self, query: &str, params: &[Value]) -> StoreResult<QueryResult> {
            self.statements
                .lock()
                .push((query.to_string(), params.to_vec()));
            Ok(QueryResult::default())
        }

        async fn transactional(&self, statement: &str) -> StoreResult<u64> {
            self.statements.lock().push((statement.to_string(), Vec::new()));
            Ok(2)
        }
    }

    fn source() -> SqlRowSource<RecordingStore> {
        SqlRowSource::new(RecordingStore::default(), ["BIO_SENSOR", "ECG_SENSOR"])
    }

    #[tokio::test]
    async fn fetch_binds_limit_and_offset() {
        let source = source();
        source.fetch("ECG_SENSOR", 40, 20).await.unwrap();

        let statements = source.store().statements.lock();
        let (query, params) = &statements[0];
        assert_eq!(
            query,
            "SELECT * FROM ECG_SENSOR WHERE is_synced = 0 ORDER BY id LIMIT ? OFFSET ?"
        );
        assert_eq!(params, &vec![Value::from(20), Value::from(40)]);
    }

    #[tokio::test]
    async fn mark_delivered_flags_leading_window() {
        let source = source();
        let affected = source
            .mark_delivered("BIO_SENSOR", 5, SyncedRowPolicy::Flag)
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let statements = source.store().statements.lock();
        assert_eq!(
            statements[0].0,
            "UPDATE BIO_SENSOR SET is_synced = 1 WHERE id IN \
             (SELECT id FROM BIO_SENSOR WHERE is_synced = 0 ORDER BY id LIMIT 5)"
        );
    }

    #[tokio::test]
    async fn mark_delivered_can_delete() {
        let source = source();
        source
            .mark_delivered("BIO_SENSOR", 1, SyncedRowPolicy::Delete)
            .await
            .unwrap();
        let statements = source.store().statements.lock();
        assert!(statements[0].0.starts_with("DELETE FROM BIO_SENSOR WHERE id IN"));
    }

    #[tokio::test]
    async fn zero_count_skips_the_store() {
        let source = source();
        let affected = source
            .mark_delivered("BIO_SENSOR", 0, SyncedRowPolicy::Flag)
            .await
            .unwrap();
        assert_eq!(affected, 0);
        assert!(source.store().statements.lock().is_empty());
    }

    #[tokio::test]
    async fn purge_deletes_flagged_rows() {
        let source = source();
        source.purge_synced("ECG_SENSOR").await.unwrap();
        let statements = source.store().statements.lock();
        assert_eq!(statements[0].0, "DELETE FROM ECG_SENSOR WHERE is_synced = 1");
    }

    #[tokio::test]
    async fn unknown_tables_never_reach_the_store() {
        let source = source();
        let err = source
            .fetch("ECG_SENSOR; DROP TABLE patients", 0, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTable(_)));

        let err = source.purge_synced("patients").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTable(_)));
        assert!(source.store().statements.lock().is_empty());
    }
}
