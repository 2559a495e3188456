//! In-process collector for tests and demos.
//!
//! [`LoopbackCollector`] plays the server side of the protocol without a
//! network: every connection made through its [`LoopbackConnector`] is served
//! by a task that decodes batches and answers according to a scriptable
//! responder.

use crate::error::{SyncError, SyncResult};
use crate::transport::{Connection, Connector, Inbound, Outbound};
use async_trait::async_trait;
use parking_lot::Mutex;
use sensync_protocol::{AckMessage, BatchMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// How the collector answers one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Apply the batch and acknowledge it.
    Ack,
    /// Refuse the batch with `success: false`.
    Reject(String),
    /// Apply the batch but never send the ack.
    LoseAck,
    /// Neither apply nor answer.
    Ignore,
    /// Drop the connection without answering.
    Disconnect,
    /// Answer with a frame that is not an ack.
    Malformed,
}

type Responder = Box<dyn FnMut(&BatchMessage) -> Reply + Send>;

struct CollectorState {
    responder: Responder,
    received: Vec<BatchMessage>,
    applied: HashMap<(String, u64), usize>,
    refuse: usize,
    attempts: usize,
    connections: usize,
}

/// An in-memory collector.
///
/// Applied batches are keyed by `(table, batch_id)`, so a re-sent batch is
/// applied once no matter how many times it arrives.
#[derive(Clone)]
pub struct LoopbackCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl LoopbackCollector {
    /// Creates a collector that acknowledges every batch.
    pub fn new() -> Self {
        Self::with_responder(|_| Reply::Ack)
    }

    /// Creates a collector that answers with `responder`.
    pub fn with_responder(responder: impl FnMut(&BatchMessage) -> Reply + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(CollectorState {
                responder: Box::new(responder),
                received: Vec::new(),
                applied: HashMap::new(),
                refuse: 0,
                attempts: 0,
                connections: 0,
            })),
        }
    }

    /// A connector dialing this collector.
    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            state: Arc::clone(&self.state),
        }
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.state.lock().refuse = count;
    }

    /// Every batch received, in arrival order, including re-sends.
    pub fn received(&self) -> Vec<BatchMessage> {
        self.state.lock().received.clone()
    }

    /// `(offset, rows)` of every batch received for `table`.
    pub fn windows(&self, table: &str) -> Vec<(u64, usize)> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|b| b.table == table)
            .map(|b| (b.offset, b.len()))
            .collect()
    }

    /// Rows of `table` applied, counting each batch id once.
    pub fn applied_rows(&self, table: &str) -> usize {
        self.state
            .lock()
            .applied
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, rows)| rows)
            .sum()
    }

    /// Connection attempts seen, refused ones included.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Connections accepted.
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }
}

impl Default for LoopbackCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Connector`] that dials a [`LoopbackCollector`].
#[derive(Clone)]
pub struct LoopbackConnector {
    state: Arc<Mutex<CollectorState>>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> SyncResult<Connection> {
        {
            let mut state = self.state.lock();
            state.attempts += 1;
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(SyncError::transport_retryable(format!(
                    "connection to {url} refused"
                )));
            }
            state.connections += 1;
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(Arc::clone(&self.state), outbound_rx, inbound_tx));
        Ok(Connection::new(outbound_tx, inbound_rx))
    }
}

async fn serve(
    state: Arc<Mutex<CollectorState>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    while let Some(frame) = outbound.recv().await {
        let text = match frame {
            Outbound::Text(text) => text,
            Outbound::Close => {
                let _ = inbound.send(Inbound::Closed(Some("client closed".into())));
                return;
            }
        };
        let batch = match BatchMessage::decode(&text) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "collector dropping undecodable frame");
                continue;
            }
        };

        let reply = {
            let mut state = state.lock();
            state.received.push(batch.clone());
            let reply = (state.responder)(&batch);
            if matches!(reply, Reply::Ack | Reply::LoseAck) {
                state
                    .applied
                    .entry((batch.table.clone(), batch.batch_id))
                    .or_insert(batch.len());
            }
            reply
        };

        let answer = match reply {
            Reply::Ack => AckMessage::ok(&batch.table, batch.batch_id).encode(),
            Reply::Reject(reason) => AckMessage::failure(&batch.table, batch.batch_id, reason).encode(),
            Reply::LoseAck | Reply::Ignore => continue,
            Reply::Malformed => Ok(format!("{{\"batch\":{}", batch.batch_id)),
            Reply::Disconnect => {
                let _ = inbound.send(Inbound::Closed(Some("collector dropped connection".into())));
                return;
            }
        };
        match answer {
            Ok(text) => {
                if inbound.send(Inbound::Text(text)).is_err() {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "collector failed to encode ack"),
        }
    }
    let _ = inbound.send(Inbound::Closed(None));
}
