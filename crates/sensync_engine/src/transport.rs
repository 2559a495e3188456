//! Transport layer: a persistent duplex connection to the collector.
//!
//! A [`Connector`] opens raw connections; [`TransportChannel`] owns at most
//! one of them at a time, tracks its lifecycle and routes inbound acks to the
//! [`AckCorrelator`].

use crate::correlator::AckCorrelator;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use sensync_protocol::AckMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Frame queued for the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text frame.
    Text(String),
    /// Close the connection.
    Close,
}

/// Event observed on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame from the collector.
    Text(String),
    /// The connection closed, with the peer's reason if any.
    Closed(Option<String>),
    /// The connection failed.
    Error(String),
}

/// Both directions of an open connection.
#[derive(Debug)]
pub struct Connection {
    /// Frames to send.
    pub outbound: mpsc::UnboundedSender<Outbound>,
    /// Events received.
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl Connection {
    /// Bundles the two halves of a connection.
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        Self { outbound, inbound }
    }
}

/// Opens connections to a collector.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (WebSocket, in-process loopback for testing, etc.).
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new connection to `url`.
    async fn connect(&self, url: &str) -> SyncResult<Connection>;
}

/// Lifecycle of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Frames can be sent.
    Open,
    /// A deliberate close is in progress.
    Closing,
    /// The connection failed; always followed by `Disconnected`.
    Error,
}

#[derive(Debug)]
struct Status {
    state: ChannelState,
    generation: u64,
}

#[derive(Debug)]
struct Shared {
    status: Mutex<Status>,
    correlator: Arc<AckCorrelator>,
}

impl Shared {
    /// Tears down the link of `generation` if it is still the current one.
    fn connection_lost(&self, generation: u64, failure: Option<String>, reason: Option<String>) {
        {
            let mut status = self.status.lock();
            if status.generation != generation {
                return;
            }
            status.state = if failure.is_some() {
                ChannelState::Error
            } else {
                ChannelState::Disconnected
            };
        }
        let rejected = self.correlator.reject_all(|| SyncError::ConnectionLost);
        if let Some(error) = &failure {
            warn!(generation, %error, rejected, "channel error");
            let mut status = self.status.lock();
            if status.generation == generation {
                status.state = ChannelState::Disconnected;
            }
        } else {
            warn!(
                generation,
                reason = reason.as_deref().unwrap_or(""),
                rejected,
                "channel closed"
            );
        }
    }
}

#[derive(Debug)]
struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

/// The engine's single connection to the collector.
///
/// The link is created lazily by [`connect`](Self::connect), nulled when the
/// peer closes or errors, and recreated on the next connect.
pub struct TransportChannel<C> {
    connector: C,
    url: String,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    link: tokio::sync::Mutex<Option<Link>>,
    closing: Notify,
}

impl<C: Connector> TransportChannel<C> {
    /// Creates a disconnected channel.
    pub fn new(
        connector: C,
        url: impl Into<String>,
        connect_timeout: Duration,
        correlator: Arc<AckCorrelator>,
    ) -> Self {
        Self {
            connector,
            url: url.into(),
            connect_timeout,
            shared: Arc::new(Shared {
                status: Mutex::new(Status {
                    state: ChannelState::Disconnected,
                    generation: 0,
                }),
                correlator,
            }),
            link: tokio::sync::Mutex::new(None),
            closing: Notify::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.status.lock().state
    }

    /// Returns true if frames can be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// The collector URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens the channel unless it is already open.
    ///
    /// Concurrent callers queue behind the attempt in flight and then observe
    /// its result instead of dialing again. A [`close`](Self::close) issued
    /// meanwhile abandons the attempt with [`SyncError::Cancelled`].
    pub async fn connect(&self) -> SyncResult<()> {
        let closed = self.closing.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();

        let mut link = tokio::select! {
            () = &mut closed => return Err(SyncError::Cancelled),
            link = self.link.lock() => link,
        };
        if link.is_some() && self.is_open() {
            return Ok(());
        }
        if let Some(stale) = link.take() {
            stale.reader.abort();
        }

        let generation = {
            let mut status = self.shared.status.lock();
            status.generation += 1;
            status.state = ChannelState::Connecting;
            status.generation
        };
        debug!(url = %self.url, generation, "connecting");

        let dial = tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.url));
        let attempt = tokio::select! {
            () = &mut closed => {
                debug!(url = %self.url, generation, "connection attempt abandoned");
                return Err(SyncError::Cancelled);
            }
            attempt = dial => attempt,
        };
        let connection = match attempt {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                self.fail_attempt(generation, &e);
                return Err(e);
            }
            Err(_) => {
                let e = SyncError::ConnectTimeout;
                self.fail_attempt(generation, &e);
                return Err(e);
            }
        };

        self.shared.status.lock().state = ChannelState::Open;
        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            generation,
            connection.inbound,
        ));
        *link = Some(Link {
            outbound: connection.outbound,
            reader,
        });
        info!(url = %self.url, generation, "channel open");
        Ok(())
    }

    fn fail_attempt(&self, generation: u64, error: &SyncError) {
        let current = {
            let mut status = self.shared.status.lock();
            let current = status.generation == generation;
            if current {
                status.state = ChannelState::Error;
            }
            current
        };
        warn!(url = %self.url, generation, %error, "connection attempt failed");
        if current {
            let mut status = self.shared.status.lock();
            if status.generation == generation {
                status.state = ChannelState::Disconnected;
            }
        }
    }

    /// Sends a text frame. Fails with `NotConnected` unless the channel is open.
    pub async fn send(&self, frame: String) -> SyncResult<()> {
        if !self.is_open() {
            return Err(SyncError::NotConnected);
        }
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) => link
                .outbound
                .send(Outbound::Text(frame))
                .map_err(|_| SyncError::NotConnected),
            None => Err(SyncError::NotConnected),
        }
    }

    /// Closes the channel. Pending acks are left for the caller to settle.
    pub async fn close(&self) {
        self.closing.notify_waiters();
        let mut link = self.link.lock().await;
        {
            // Bumping the generation keeps the reader from reporting a loss.
            let mut status = self.shared.status.lock();
            status.generation += 1;
            status.state = ChannelState::Closing;
        }
        if let Some(link) = link.take() {
            let _ = link.outbound.send(Outbound::Close);
            link.reader.abort();
        }
        self.shared.status.lock().state = ChannelState::Disconnected;
        debug!(url = %self.url, "channel closed by client");
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    let mut failure = None;
    let mut reason = None;
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Text(text) => match AckMessage::decode(&text) {
                Ok(ack) => {
                    shared.correlator.resolve(ack);
                }
                Err(e) => warn!(error = %e, "dropping malformed frame"),
            },
            Inbound::Closed(closed) => {
                reason = closed;
                break;
            }
            Inbound::Error(error) => {
                failure = Some(error);
                break;
            }
        }
    }
    shared.connection_lost(generation, failure, reason);
}
