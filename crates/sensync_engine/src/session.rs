//! Volatile per-engine session state: the run guard and the checkpoints.

use crate::error::{SyncError, SyncResult};
use crate::progress::ProgressStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Session state shared by the engine and its table loops.
///
/// `active_run` holds the token of the run in flight, or 0. A run is
/// cancelled as soon as the token it was started with is no longer the
/// active one, which is exactly what [`SyncSession::cancel`] arranges.
#[derive(Debug, Default)]
pub(crate) struct SyncSession {
    active_run: AtomicU64,
    run_counter: AtomicU64,
    cancel_notify: Notify,
    reconnect_count: AtomicU32,
    progress: Mutex<ProgressStore>,
}

/// Clears the active run on drop, unless a newer run already replaced it.
pub(crate) struct RunGuard<'a> {
    session: &'a SyncSession,
    token: u64,
}

impl RunGuard<'_> {
    pub(crate) fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let _ = self.session.active_run.compare_exchange(
            self.token,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl SyncSession {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claims the session for a new run. `None` if a run is in flight.
    pub(crate) fn try_begin(&self) -> Option<RunGuard<'_>> {
        let token = self.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.active_run
            .compare_exchange(0, token, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.reconnect_count.store(0, Ordering::SeqCst);
        Some(RunGuard {
            session: self,
            token,
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.active_run.load(Ordering::SeqCst) != 0
    }

    pub(crate) fn is_current(&self, token: u64) -> bool {
        self.active_run.load(Ordering::SeqCst) == token
    }

    /// Fails with `Cancelled` once the run of `token` was cancelled.
    pub(crate) fn check(&self, token: u64) -> SyncResult<()> {
        if self.is_current(token) {
            Ok(())
        } else {
            Err(SyncError::Cancelled)
        }
    }

    /// Cancels the run in flight and forgets every checkpoint.
    ///
    /// Returns the cancelled run's token (or 0) and, per table, the
    /// acknowledged rows not yet flagged in the store. The token is revoked
    /// under the progress lock, so the run can no longer claim those rows
    /// itself and the caller is the only one left to flag them.
    pub(crate) fn cancel(&self) -> (u64, Vec<(String, u64)>) {
        let (token, unflagged) = {
            let mut progress = self.progress.lock();
            let token = self.active_run.swap(0, Ordering::SeqCst);
            (token, progress.drain_unflagged())
        };
        self.cancel_notify.notify_waiters();
        self.reconnect_count.store(0, Ordering::SeqCst);
        (token, unflagged)
    }

    pub(crate) fn cancelled(&self) -> &Notify {
        &self.cancel_notify
    }

    /// Runs `f` on the checkpoints on behalf of the run of `token`.
    ///
    /// The token is checked under the progress lock, so a cancelled run can
    /// never write into the store after [`cancel`](Self::cancel) cleared it.
    pub(crate) fn progress<T>(
        &self,
        token: u64,
        f: impl FnOnce(&mut ProgressStore) -> T,
    ) -> SyncResult<T> {
        let mut progress = self.progress.lock();
        self.check(token)?;
        Ok(f(&mut progress))
    }

    /// Read access to the checkpoints regardless of any run.
    pub(crate) fn with_progress<T>(&self, f: impl FnOnce(&mut ProgressStore) -> T) -> T {
        f(&mut self.progress.lock())
    }

    pub(crate) fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_reconnect_count(&self, count: u32) {
        self.reconnect_count.store(count, Ordering::SeqCst);
    }
}
