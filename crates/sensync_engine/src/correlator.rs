//! Correlation of collector acks with in-flight batches.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use sensync_protocol::AckMessage;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Outcome = SyncResult<AckMessage>;

#[derive(Debug)]
struct Waiter {
    table: String,
    tx: oneshot::Sender<Outcome>,
}

/// Await side of a registered batch, consumed by [`AckCorrelator::wait`].
#[derive(Debug)]
pub struct PendingAck {
    batch_id: u64,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingAck {
    /// The batch this handle waits on.
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }
}

/// Maps outgoing batch ids to waiting table loops.
///
/// Each entry is settled exactly once: whichever of ack arrival, deadline
/// expiry, cancellation or bulk rejection removes it from the map wins, and
/// the others become no-ops.
#[derive(Debug, Default)]
pub struct AckCorrelator {
    pending: Mutex<HashMap<u64, Waiter>>,
}

impl AckCorrelator {
    /// Creates an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an in-flight batch.
    pub fn register(&self, table: &str, batch_id: u64) -> SyncResult<PendingAck> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&batch_id) {
            return Err(SyncError::DuplicateBatch(batch_id));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(
            batch_id,
            Waiter {
                table: table.to_string(),
                tx,
            },
        );
        Ok(PendingAck { batch_id, rx })
    }

    /// Settles the batch named by an inbound ack.
    ///
    /// Acks for unknown batches (duplicate, stale or foreign) are logged and
    /// dropped. Returns true if a waiter was settled.
    pub fn resolve(&self, ack: AckMessage) -> bool {
        let waiter = {
            let mut pending = self.pending.lock();
            let Some(waiter) = pending.get(&ack.batch_id) else {
                warn!(batch_id = ack.batch_id, table = %ack.table, "dropping ack for unknown batch");
                return false;
            };
            if waiter.table != ack.table {
                warn!(
                    batch_id = ack.batch_id,
                    expected = %waiter.table,
                    got = %ack.table,
                    "dropping ack with mismatched table"
                );
                return false;
            }
            match pending.remove(&ack.batch_id) {
                Some(waiter) => waiter,
                None => return false,
            }
        };

        let outcome = if ack.success {
            Ok(ack)
        } else {
            Err(SyncError::Rejected {
                table: ack.table,
                batch_id: ack.batch_id,
                message: ack.error.unwrap_or_else(|| "unspecified error".into()),
            })
        };
        // The waiter may have gone away; nothing left to notify then.
        let _ = waiter.tx.send(outcome);
        true
    }

    /// Fails the batch with an ack timeout. Returns true if it was still pending.
    pub fn expire(&self, batch_id: u64) -> bool {
        match self.pending.lock().remove(&batch_id) {
            Some(waiter) => {
                let _ = waiter.tx.send(Err(SyncError::AckTimeout { batch_id }));
                true
            }
            None => false,
        }
    }

    /// Drops the batch without an outcome, e.g. when the send itself failed.
    pub fn cancel(&self, batch_id: u64) -> bool {
        self.pending.lock().remove(&batch_id).is_some()
    }

    /// Fails every pending batch with `reason()`. Returns how many were failed.
    pub fn reject_all(&self, reason: impl Fn() -> SyncError) -> usize {
        let drained: Vec<(u64, Waiter)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (batch_id, waiter) in drained {
            debug!(batch_id, table = %waiter.table, "rejecting pending ack");
            let _ = waiter.tx.send(Err(reason()));
        }
        count
    }

    /// Number of batches awaiting an ack.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if no batch is awaiting an ack.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Returns true if `batch_id` is awaiting an ack.
    pub fn is_pending(&self, batch_id: u64) -> bool {
        self.pending.lock().contains_key(&batch_id)
    }

    /// Waits for the batch to be settled, expiring it after `deadline`.
    pub async fn wait(
        &self,
        pending: PendingAck,
        deadline: Duration,
        clock: &dyn Clock,
    ) -> SyncResult<AckMessage> {
        let PendingAck { batch_id, mut rx } = pending;

        tokio::select! {
            biased;
            outcome = &mut rx => return outcome.unwrap_or(Err(SyncError::Cancelled)),
            () = clock.sleep(deadline) => {}
        }

        if self.expire(batch_id) {
            warn!(batch_id, ?deadline, "ack deadline passed");
            return Err(SyncError::AckTimeout { batch_id });
        }
        // Settled by someone else between the deadline and the expiry.
        rx.await.unwrap_or(Err(SyncError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TokioClock};
    use std::sync::Arc;

    #[tokio::test]
    async fn resolve_settles_waiter() {
        let correlator = AckCorrelator::new();
        let pending = correlator.register("ECG_SENSOR", 3).unwrap();
        assert!(correlator.is_pending(3));

        assert!(correlator.resolve(AckMessage::ok("ECG_SENSOR", 3)));
        let ack = correlator
            .wait(pending, Duration::from_secs(30), &ManualClock::default())
            .await
            .unwrap();
        assert_eq!(ack.batch_id, 3);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn refusal_becomes_rejected_error() {
        let correlator = AckCorrelator::new();
        let pending = correlator.register("t", 1).unwrap();
        correlator.resolve(AckMessage::failure("t", 1, "disk full"));

        let err = correlator
            .wait(pending, Duration::from_secs(30), &ManualClock::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { message, .. } if message == "disk full"));
    }

    #[test]
    fn unknown_and_duplicate_acks_are_dropped() {
        let correlator = AckCorrelator::new();
        assert!(!correlator.resolve(AckMessage::ok("t", 99)));

        let _pending = correlator.register("t", 1).unwrap();
        assert!(correlator.resolve(AckMessage::ok("t", 1)));
        assert!(!correlator.resolve(AckMessage::ok("t", 1)));
    }

    #[test]
    fn mismatched_table_leaves_entry_pending() {
        let correlator = AckCorrelator::new();
        let _pending = correlator.register("BIO_SENSOR", 4).unwrap();
        assert!(!correlator.resolve(AckMessage::ok("ECG_SENSOR", 4)));
        assert!(correlator.is_pending(4));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let correlator = AckCorrelator::new();
        let _pending = correlator.register("t", 5).unwrap();
        assert!(matches!(
            correlator.register("t", 5),
            Err(SyncError::DuplicateBatch(5))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_entry() {
        let correlator = AckCorrelator::new();
        let clock = ManualClock::default();
        let pending = correlator.register("t", 7).unwrap();

        let err = correlator
            .wait(pending, Duration::from_secs(30), &clock)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AckTimeout { batch_id: 7 }));
        assert!(!correlator.is_pending(7));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30)]);

        // A late ack is now a stale one.
        assert!(!correlator.resolve(AckMessage::ok("t", 7)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn resolve_and_expire_settle_exactly_once() {
        for batch_id in 0..200u64 {
            let correlator = Arc::new(AckCorrelator::new());
            let pending = correlator.register("t", batch_id).unwrap();

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let resolver = {
                let (correlator, barrier) = (Arc::clone(&correlator), Arc::clone(&barrier));
                tokio::spawn(async move {
                    barrier.wait().await;
                    correlator.resolve(AckMessage::ok("t", batch_id))
                })
            };
            let expirer = {
                let (correlator, barrier) = (Arc::clone(&correlator), Arc::clone(&barrier));
                tokio::spawn(async move {
                    barrier.wait().await;
                    correlator.expire(batch_id)
                })
            };

            let resolved = resolver.await.unwrap();
            let expired = expirer.await.unwrap();
            assert!(resolved ^ expired, "batch {batch_id} settled {resolved}/{expired}");

            let outcome = correlator
                .wait(pending, Duration::from_secs(1), &TokioClock)
                .await;
            assert_eq!(outcome.is_ok(), resolved);
        }
    }

    #[tokio::test]
    async fn reject_all_unblocks_every_waiter() {
        let correlator = AckCorrelator::new();
        let first = correlator.register("a", 1).unwrap();
        let second = correlator.register("b", 2).unwrap();

        assert_eq!(correlator.reject_all(|| SyncError::Cancelled), 2);
        assert!(correlator.is_empty());

        let clock = ManualClock::default();
        for pending in [first, second] {
            let err = correlator
                .wait(pending, Duration::from_secs(30), &clock)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::Cancelled));
        }
        // Both were settled before their deadline was polled.
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn cancelled_entry_reports_cancellation() {
        let correlator = AckCorrelator::new();
        let pending = correlator.register("t", 1).unwrap();
        assert!(correlator.cancel(1));
        assert!(!correlator.cancel(1));

        let err = correlator
            .wait(pending, Duration::from_secs(30), &ManualClock::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
