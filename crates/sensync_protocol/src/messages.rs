//! Protocol messages for bulk upload.
//!
//! ```text
//! -> {"type":"sync_data","table":..,"batchId":..,"data":[..],"offset":..,"timestamp":..}
//! <- {"success":..,"table":..,"batchId":..,"error"?:..}
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// One buffered row: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The `type` tag carried by every outbound batch.
pub const SYNC_DATA: &str = "sync_data";

/// A bounded window of rows from one table, sent as a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMessage {
    /// Message type tag, always [`SYNC_DATA`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Source table.
    pub table: String,
    /// Batch id, unique for the lifetime of the sending session.
    pub batch_id: u64,
    /// Rows in id order.
    #[serde(rename = "data")]
    pub rows: Vec<Row>,
    /// Offset of the first row within the table's unsynced rows.
    pub offset: u64,
    /// Send time in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl BatchMessage {
    /// Creates a new batch message.
    pub fn new(
        table: impl Into<String>,
        batch_id: u64,
        rows: Vec<Row>,
        offset: u64,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: SYNC_DATA.to_string(),
            table: table.into(),
            batch_id,
            rows,
            offset,
            timestamp,
        }
    }

    /// Number of rows carried.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the batch carries no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|source| ProtocolError::Encode {
            what: "batch",
            source,
        })
    }

    /// Decodes from a JSON text frame.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_str(text).map_err(|source| ProtocolError::Decode {
            what: "batch",
            source,
        })?;
        if message.kind != SYNC_DATA {
            return Err(ProtocolError::UnexpectedType(message.kind));
        }
        Ok(message)
    }
}

/// The collector's confirmation for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    /// Whether the batch was durably received.
    pub success: bool,
    /// Table the batch came from.
    pub table: String,
    /// Batch being acknowledged.
    pub batch_id: u64,
    /// Error message if the collector refused the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckMessage {
    /// Creates a successful acknowledgment.
    pub fn ok(table: impl Into<String>, batch_id: u64) -> Self {
        Self {
            success: true,
            table: table.into(),
            batch_id,
            error: None,
        }
    }

    /// Creates a refusal.
    pub fn failure(table: impl Into<String>, batch_id: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            table: table.into(),
            batch_id,
            error: Some(error.into()),
        }
    }

    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|source| ProtocolError::Encode {
            what: "ack",
            source,
        })
    }

    /// Decodes from a JSON text frame.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(|source| ProtocolError::Decode {
            what: "ack",
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn row(id: i64, ecg: i64) -> Row {
        match json!({ "id": id, "ecg": ecg, "is_synced": 0 }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn batch_wire_shape() {
        let batch = BatchMessage::new("ECG_SENSOR", 7, vec![row(1, 512), row(2, 498)], 4, 1_700_000_000_000);
        let value: Value = serde_json::from_str(&batch.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "sync_data");
        assert_eq!(value["table"], "ECG_SENSOR");
        assert_eq!(value["batchId"], 7);
        assert_eq!(value["offset"], 4);
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert_eq!(value["data"].as_array().unwrap().len(), 2);
        assert_eq!(value["data"][1]["ecg"], 498);
        assert!(value.get("rows").is_none());
    }

    #[test]
    fn batch_preserves_row_order() {
        let rows: Vec<Row> = (1..=5).map(|i| row(i, i * 10)).collect();
        let batch = BatchMessage::new("BIO_SENSOR", 1, rows.clone(), 0, 0);
        let decoded = BatchMessage::decode(&batch.encode().unwrap()).unwrap();
        assert_eq!(decoded.rows, rows);
        assert_eq!(decoded.len(), 5);
    }

    #[test]
    fn batch_rejects_other_types() {
        let text = r#"{"type":"pull","table":"t","batchId":1,"data":[],"offset":0,"timestamp":0}"#;
        assert!(matches!(
            BatchMessage::decode(text),
            Err(ProtocolError::UnexpectedType(kind)) if kind == "pull"
        ));
    }

    #[test]
    fn ack_decodes_success() {
        let ack = AckMessage::decode(r#"{"success":true,"table":"ECG_SENSOR","batchId":3}"#).unwrap();
        assert_eq!(ack, AckMessage::ok("ECG_SENSOR", 3));
    }

    #[test]
    fn ack_decodes_failure_with_error() {
        let ack =
            AckMessage::decode(r#"{"success":false,"table":"t","batchId":9,"error":"disk full"}"#)
                .unwrap();
        assert!(!ack.success);
        assert_eq!(ack.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn ack_omits_absent_error() {
        let text = AckMessage::ok("t", 1).encode().unwrap();
        assert!(!text.contains("error"));
    }

    #[test]
    fn ack_missing_batch_id_is_malformed() {
        let err = AckMessage::decode(r#"{"success":true,"table":"t"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { what: "ack", .. }));
    }

    proptest! {
        #[test]
        fn ack_decode_never_panics(text in ".*") {
            let _ = AckMessage::decode(&text);
        }

        #[test]
        fn ack_ignores_unknown_fields(batch_id in any::<u64>(), extra in "[a-z]{1,8}") {
            let text = format!(
                r#"{{"success":true,"table":"t","batchId":{batch_id},"x_{extra}":1}}"#
            );
            let ack = AckMessage::decode(&text).unwrap();
            prop_assert_eq!(ack.batch_id, batch_id);
        }
    }
}
