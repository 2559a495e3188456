//! # sensync protocol
//!
//! Wire messages for uploading locally buffered table rows to a remote
//! collector over a persistent duplex connection.
//!
//! This crate provides:
//! - `BatchMessage`, the outbound unit (`type: "sync_data"`)
//! - `AckMessage`, the collector's per-batch confirmation
//! - JSON encoding/decoding for both
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{AckMessage, BatchMessage, Row, SYNC_DATA};
