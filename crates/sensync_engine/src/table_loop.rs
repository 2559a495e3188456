//! Per-table upload state machine.
//!
//! ```text
//! FETCH -> SEND -> AWAIT_ACK -> ADVANCE -> FETCH ...
//!            \         \
//!             +---------+--> RETRY -> (backoff) -> FETCH
//!                                 \-> FAIL
//! FETCH (empty window) -> DONE
//! ```
//!
//! The offset moves only in ADVANCE, so every retry re-reads and re-sends
//! the same window under the same batch id.

use crate::clock::Clock;
use crate::correlator::PendingAck;
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::source::RowSource;
use crate::state::{SyncState, TableReport};
use crate::transport::Connector;
use sensync_protocol::{BatchMessage, Row};
use tracing::{debug, error, info, warn};

enum Step {
    Fetch,
    Send(Vec<Row>),
    AwaitAck { pending: PendingAck, rows: u64 },
    Advance(u64),
    Retry(SyncError),
    Done,
}

/// Drives one table until it drains or fails.
pub(crate) struct TableSyncLoop<'a, C, R, K> {
    engine: &'a SyncEngine<C, R, K>,
    token: u64,
    table: &'a str,
    report: &'a mut TableReport,
}

impl<'a, C, R, K> TableSyncLoop<'a, C, R, K>
where
    C: Connector,
    R: RowSource,
    K: Clock,
{
    pub(crate) fn new(
        engine: &'a SyncEngine<C, R, K>,
        token: u64,
        table: &'a str,
        report: &'a mut TableReport,
    ) -> Self {
        Self {
            engine,
            token,
            table,
            report,
        }
    }

    /// Runs the table to DONE. An error means FAIL (or cancellation, or a
    /// lost channel the engine has to re-open first).
    ///
    /// Whatever the outcome, rows the collector acknowledged are flagged in
    /// the store before this returns, so no later scan offers them again.
    pub(crate) async fn run(mut self) -> SyncResult<()> {
        let outcome = self.drive().await;
        if let Err(error) = &outcome {
            match self.flag_acknowledged().await {
                Ok(0) | Err(SyncError::Cancelled) => {}
                Ok(delivered) => {
                    info!(table = self.table, delivered, %error, "acknowledged rows flagged");
                }
                Err(e) => warn!(table = self.table, error = %e, "could not flag acknowledged rows"),
            }
        }
        outcome
    }

    async fn drive(&mut self) -> SyncResult<()> {
        let mut step = Step::Fetch;
        loop {
            step = match step {
                Step::Fetch => self.fetch().await?,
                Step::Send(rows) => self.send(rows).await?,
                Step::AwaitAck { pending, rows } => self.await_ack(pending, rows).await,
                Step::Advance(rows) => self.advance(rows)?,
                Step::Retry(error) => self.retry(error).await?,
                Step::Done => return Ok(()),
            };
        }
    }

    async fn fetch(&mut self) -> SyncResult<Step> {
        let session = &self.engine.session;
        let entry = session.progress(self.token, |p| p.get(self.table))?;
        if entry.complete {
            return Ok(Step::Done);
        }

        let rows = self
            .engine
            .fetcher
            .fetch(self.table, entry.unflagged())
            .await?;
        if !rows.is_empty() {
            return Ok(Step::Send(rows));
        }

        // Flag first: a complete table restarts from 0 on the next run.
        let delivered = self.flag_acknowledged().await?;
        session.progress(self.token, |p| p.mark_complete(self.table))?;
        info!(
            table = self.table,
            offset = entry.offset,
            delivered,
            policy = ?self.engine.config.synced_rows,
            "table drained"
        );
        Ok(Step::Done)
    }

    /// Flags (or deletes) the acknowledged rows still unsynced in the store.
    async fn flag_acknowledged(&mut self) -> SyncResult<u64> {
        let session = &self.engine.session;
        let rows = session.progress(self.token, |p| p.claim_unflagged(self.table))?;
        if rows == 0 {
            return Ok(0);
        }
        let result = self
            .engine
            .fetcher
            .source()
            .mark_delivered(self.table, rows, self.engine.config.synced_rows)
            .await;
        match result {
            Ok(delivered) => {
                self.report.delivered += delivered;
                Ok(delivered)
            }
            Err(e) => {
                // A cancelled run cannot hand them back; they go out again later.
                let _ = session.progress(self.token, |p| p.release_flagged(self.table, rows));
                Err(e.into())
            }
        }
    }

    async fn send(&mut self, rows: Vec<Row>) -> SyncResult<Step> {
        let entry = self
            .engine
            .session
            .progress(self.token, |p| p.get(self.table))?;
        let batch_id = entry.next_batch_id;
        let message = BatchMessage::new(
            self.table,
            batch_id,
            rows,
            entry.offset,
            self.engine.clock.now().timestamp_millis(),
        );
        let count = message.len() as u64;
        let frame = message.encode()?;

        let pending = self.engine.correlator.register(self.table, batch_id)?;
        if let Err(e) = self.engine.channel.send(frame).await {
            self.engine.correlator.cancel(batch_id);
            return Ok(Step::Retry(e));
        }
        debug!(table = self.table, batch_id, offset = entry.offset, rows = count, "batch sent");
        Ok(Step::AwaitAck {
            pending,
            rows: count,
        })
    }

    async fn await_ack(&mut self, pending: PendingAck, rows: u64) -> Step {
        let outcome = self
            .engine
            .correlator
            .wait(pending, self.engine.config.sync_timeout, &self.engine.clock)
            .await;
        match outcome {
            Ok(_) => Step::Advance(rows),
            Err(e) => Step::Retry(e),
        }
    }

    fn advance(&mut self, rows: u64) -> SyncResult<Step> {
        let offset = self
            .engine
            .session
            .progress(self.token, |p| p.advance(self.table, rows))?;
        self.report.batches += 1;
        self.report.rows += rows;
        {
            let mut stats = self.engine.stats.write();
            stats.batches_acked += 1;
            stats.rows_delivered += rows;
        }
        debug!(table = self.table, offset, rows, "batch acknowledged");
        Ok(Step::Fetch)
    }

    async fn retry(&mut self, error: SyncError) -> SyncResult<Step> {
        let session = &self.engine.session;
        session.check(self.token)?;
        if !error.is_retryable() {
            return Err(error);
        }

        let now = self.engine.clock.now();
        let (retries, offset) = session.progress(self.token, |p| {
            let retries = p.record_failure(self.table, now);
            (retries, p.get(self.table).offset)
        })?;
        self.report.retries += 1;
        self.engine.stats.write().retries += 1;

        let config = &self.engine.config;
        if retries >= config.max_retries {
            error!(table = self.table, offset, retries, error = %error, "retries exhausted");
            return Err(SyncError::ExhaustedRetries {
                table: self.table.to_string(),
                offset,
                retries,
                last_error: error.to_string(),
            });
        }

        if error.is_disconnect() || !self.engine.channel.is_open() {
            warn!(table = self.table, offset, error = %error, "channel lost mid-table");
            return Err(SyncError::ConnectionLost);
        }

        let delay = config.retry.delay_for_attempt(retries);
        warn!(
            table = self.table,
            offset,
            attempt = retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying batch"
        );
        self.engine.publish(self.token, SyncState::RetryWait);
        self.engine.pause(self.token, delay).await?;
        self.engine.publish(self.token, SyncState::Syncing);
        Ok(Step::Fetch)
    }
}
