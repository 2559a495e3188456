//! The sync engine orchestrator.

use crate::clock::{Clock, TokioClock};
use crate::config::SyncConfig;
use crate::correlator::AckCorrelator;
use crate::error::{SyncError, SyncResult};
use crate::progress::ProgressEntry;
use crate::session::SyncSession;
use crate::source::{BatchFetcher, RowSource};
use crate::state::{SyncReport, SyncState, SyncStats};
use crate::table_loop::TableSyncLoop;
use crate::transport::{ChannelState, Connector, TransportChannel};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The sync engine uploads buffered rows to a remote collector.
///
/// Tables are synced one at a time in their configured order, one batch in
/// flight at a time. At most one run is active per engine; a second
/// [`start`](Self::start) while a run is in flight fails with
/// [`SyncError::AlreadyRunning`] and changes nothing.
///
/// If the channel drops mid-run the engine re-opens it with exponential
/// backoff and resumes every incomplete table from its last acknowledged
/// offset.
pub struct SyncEngine<C, R, K = TokioClock> {
    pub(crate) config: SyncConfig,
    pub(crate) correlator: Arc<AckCorrelator>,
    pub(crate) channel: TransportChannel<C>,
    pub(crate) fetcher: BatchFetcher<R>,
    pub(crate) clock: K,
    pub(crate) session: SyncSession,
    pub(crate) stats: RwLock<SyncStats>,
    state: watch::Sender<SyncState>,
}

impl<C: Connector, R: RowSource> SyncEngine<C, R, TokioClock> {
    /// Creates a new sync engine on the tokio clock.
    pub fn new(config: SyncConfig, connector: C, source: R) -> SyncResult<Self> {
        Self::with_clock(config, connector, source, TokioClock)
    }
}

impl<C, R, K> SyncEngine<C, R, K>
where
    C: Connector,
    R: RowSource,
    K: Clock,
{
    /// Creates a new sync engine with a custom clock.
    pub fn with_clock(config: SyncConfig, connector: C, source: R, clock: K) -> SyncResult<Self> {
        config.validate()?;
        let correlator = Arc::new(AckCorrelator::new());
        let channel = TransportChannel::new(
            connector,
            config.server_url.clone(),
            config.connect_timeout,
            Arc::clone(&correlator),
        );
        let fetcher = BatchFetcher::new(source, config.branch_size);
        let (state, _) = watch::channel(SyncState::Idle);
        Ok(Self {
            config,
            correlator,
            channel,
            fetcher,
            clock,
            session: SyncSession::new(),
            stats: RwLock::new(SyncStats::default()),
            state,
        })
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The row source batches are read from.
    pub fn source(&self) -> &R {
        self.fetcher.source()
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true while a run is in flight.
    pub fn is_in_progress(&self) -> bool {
        self.session.is_running()
    }

    /// State of the underlying channel.
    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Batches currently awaiting an ack.
    pub fn pending_acks(&self) -> usize {
        self.correlator.len()
    }

    /// Checkpoints of every table seen this session, in sync order.
    pub fn progress(&self) -> Vec<(String, ProgressEntry)> {
        self.session.with_progress(|p| {
            self.config
                .tables
                .iter()
                .filter_map(|t| p.peek(t).map(|e| (t.clone(), e.clone())))
                .collect()
        })
    }

    /// Checkpoint of one table, if it has been touched this session.
    pub fn progress_for(&self, table: &str) -> Option<ProgressEntry> {
        self.session.with_progress(|p| p.peek(table).cloned())
    }

    /// Runs a full sync: every table, in order, until drained.
    ///
    /// Tables completed by an earlier run start over so rows buffered since
    /// then are picked up; tables an earlier run left incomplete resume at
    /// their saved offset. On failure the remaining tables keep their
    /// progress for the next call.
    pub async fn start(&self) -> SyncResult<SyncReport> {
        let Some(guard) = self.session.try_begin() else {
            warn!("sync already in progress");
            return Err(SyncError::AlreadyRunning);
        };
        let token = guard.token();

        let restarted = self.session.progress(token, |p| p.begin_run())?;
        info!(
            url = %self.channel.url(),
            tables = self.config.tables.len(),
            restarted,
            "sync run started"
        );

        let started = Instant::now();
        let mut report = SyncReport::default();
        let outcome = self.run(token, &mut report).await;
        report.duration = started.elapsed();
        self.finish(token, outcome, report)
    }

    async fn run(&self, token: u64, report: &mut SyncReport) -> SyncResult<()> {
        self.publish(token, SyncState::Connecting);
        if let Err(e) = self.ensure_connected(token).await {
            if !e.is_retryable() {
                return Err(e);
            }
            warn!(error = %e, "initial connect failed");
            self.reconnect(token, report).await?;
        }

        self.publish(token, SyncState::Syncing);
        let mut outcome = self.run_pending_tables(token, report).await;
        while let Err(SyncError::ConnectionLost) = outcome {
            self.reconnect(token, report).await?;
            outcome = self.resume_after_reconnect(token, report).await;
        }
        outcome?;

        if self.config.purge_after_sync {
            report.purged = self.purge_synced_rows().await?;
        }
        Ok(())
    }

    async fn ensure_connected(&self, token: u64) -> SyncResult<()> {
        self.session.check(token)?;
        self.channel.connect().await
    }

    /// Re-opens the channel with `base * 2^n` backoff.
    async fn reconnect(&self, token: u64, report: &mut SyncReport) -> SyncResult<()> {
        loop {
            let attempt = self.session.reconnect_count();
            if attempt >= self.config.max_reconnect_attempts {
                error!(attempts = attempt, "reconnect attempts exhausted");
                return Err(SyncError::ReconnectExhausted { attempts: attempt });
            }
            self.session.set_reconnect_count(attempt + 1);

            let delay = self.config.reconnect_delay_for(attempt);
            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            self.publish(token, SyncState::Reconnecting);
            self.pause(token, delay).await?;

            match self.ensure_connected(token).await {
                Ok(()) => {
                    self.session.check(token)?;
                    self.session.set_reconnect_count(0);
                    report.reconnects += 1;
                    self.stats.write().reconnects += 1;
                    info!(attempt = attempt + 1, "reconnected");
                    self.publish(token, SyncState::Syncing);
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-enters the table loops of every incomplete table after the
    /// channel came back, each from its last saved offset.
    pub(crate) async fn resume_after_reconnect(
        &self,
        token: u64,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let pending: Vec<(String, u64)> = self.session.progress(token, |p| {
            self.config
                .tables
                .iter()
                .filter(|t| !p.is_complete(t))
                .map(|t| (t.clone(), p.peek(t).map_or(0, |e| e.offset)))
                .collect()
        })?;
        info!(tables = ?pending, "resuming after reconnect");
        self.run_pending_tables(token, report).await
    }

    async fn run_pending_tables(&self, token: u64, report: &mut SyncReport) -> SyncResult<()> {
        for table in &self.config.tables {
            if self.session.progress(token, |p| p.is_complete(table))? {
                continue;
            }
            debug!(table = %table, "syncing table");
            let table_report = report.table_mut(table);
            TableSyncLoop::new(self, token, table, table_report).run().await?;
        }
        Ok(())
    }

    /// Sleeps for `delay` unless the run is cancelled first.
    pub(crate) async fn pause(&self, token: u64, delay: Duration) -> SyncResult<()> {
        let cancelled = self.session.cancelled().notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        self.session.check(token)?;

        tokio::select! {
            () = &mut cancelled => Err(SyncError::Cancelled),
            () = self.clock.sleep(delay) => self.session.check(token),
        }
    }

    fn finish(
        &self,
        token: u64,
        outcome: SyncResult<()>,
        report: SyncReport,
    ) -> SyncResult<SyncReport> {
        match outcome {
            Ok(()) => {
                {
                    let mut stats = self.stats.write();
                    stats.runs_completed += 1;
                    stats.last_sync_time = Some(self.clock.now());
                    stats.last_error = None;
                }
                self.publish(token, SyncState::Synced);
                info!(
                    batches = report.batches(),
                    rows = report.rows(),
                    reconnects = report.reconnects,
                    duration_ms = report.duration.as_millis() as u64,
                    "sync run complete"
                );
                Ok(report)
            }
            Err(e) => {
                {
                    let mut stats = self.stats.write();
                    stats.runs_failed += 1;
                    stats.last_error = Some(e.to_string());
                }
                if matches!(e, SyncError::Cancelled) {
                    info!("sync run cancelled");
                } else {
                    self.publish(token, SyncState::Error);
                    error!(error = %e, "sync run failed");
                }
                Err(e)
            }
        }
    }

    /// Publishes `state` on behalf of the run of `token`. A cancelled run
    /// no longer owns the state.
    pub(crate) fn publish(&self, token: u64, state: SyncState) {
        if self.session.is_current(token) {
            self.state.send_replace(state);
        }
    }

    /// Cancels the run in flight, if any, and resets the session.
    ///
    /// Rows the collector already acknowledged are flagged in the store
    /// first. Then the channel is closed and every pending ack is rejected, so a
    /// table loop blocked on an ack or a backoff wakes up and ends with
    /// [`SyncError::Cancelled`]. Checkpoints are dropped; the next run scans
    /// every table from offset 0 over the rows not yet flagged as synced.
    pub async fn cleanup(&self) {
        let (cancelled, unflagged) = self.session.cancel();
        for (table, rows) in unflagged {
            match self
                .fetcher
                .source()
                .mark_delivered(&table, rows, self.config.synced_rows)
                .await
            {
                Ok(delivered) => debug!(table = %table, delivered, "acknowledged rows flagged"),
                Err(e) => warn!(table = %table, rows, error = %e, "could not flag acknowledged rows"),
            }
        }
        self.channel.close().await;
        let rejected = self.correlator.reject_all(|| SyncError::Cancelled);
        self.state.send_replace(SyncState::Idle);
        info!(cancelled_run = cancelled, rejected, "sync session cleaned up");
    }

    /// Deletes rows already flagged as synced in every table.
    /// Returns rows deleted.
    pub async fn purge_synced_rows(&self) -> SyncResult<u64> {
        let mut purged = 0;
        for table in &self.config.tables {
            let deleted = self.fetcher.source().purge_synced(table).await?;
            debug!(table = %table, deleted, "purged synced rows");
            purged += deleted;
        }
        info!(purged, "synced rows purged");
        Ok(purged)
    }
}
