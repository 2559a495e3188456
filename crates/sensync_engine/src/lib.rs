//! # Sensync Engine
//!
//! Offline-first bulk upload of locally buffered sensor tables.
//!
//! This crate provides:
//! - Per-table checkpoints (offset, completion, retries, batch ids)
//! - Windowed batch reads over a local row store
//! - A persistent duplex channel with reconnect and exponential backoff
//! - Ack correlation with per-batch deadlines
//! - The per-table upload state machine and the run orchestrator
//! - A WebSocket connector and an in-process loopback collector
//!
//! ## Architecture
//!
//! The engine implements an **upload-only, ack-gated** model:
//! 1. Fetch the next window of unsynced rows at the table's offset
//! 2. Send it as one batch and wait for the collector's ack
//! 3. Advance the offset only after the ack; retry the same window otherwise
//! 4. When a fetch comes back empty, flag (or delete) the delivered rows
//!
//! ## Key Invariants
//!
//! - The offset never advances speculatively
//! - Batch ids are unique for the lifetime of the engine
//! - Each pending ack is settled exactly once
//! - At most one run is in flight per engine
//! - Tables are synced strictly in their configured order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod correlator;
mod engine;
mod error;
mod loopback;
mod progress;
mod session;
mod source;
mod state;
mod table_loop;
mod transport;
mod websocket;

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{RetryConfig, SyncConfig, SyncedRowPolicy};
pub use correlator::{AckCorrelator, PendingAck};
pub use engine::SyncEngine;
pub use error::{StoreError, StoreResult, SyncError, SyncResult};
pub use loopback::{LoopbackCollector, LoopbackConnector, Reply};
pub use progress::{ProgressEntry, ProgressStore};
pub use source::{
    BatchFetcher, FetchCall, LocalStore, MemoryRowSource, QueryResult, RowSource, SqlRowSource,
};
pub use state::{SyncReport, SyncState, SyncStats, TableReport};
pub use transport::{ChannelState, Connection, Connector, Inbound, Outbound, TransportChannel};
pub use websocket::WsConnector;

pub use sensync_protocol::{AckMessage, BatchMessage, Row};
