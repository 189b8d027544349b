//! JSON wire protocol.
//!
//! Outbound (server → subscriber), one text frame per message:
//! ```text
//! INITIAL_LOAD_START  { gridId, rows, columns, totalCells, chunkSize }
//! INITIAL_LOAD_CHUNK  { gridId, chunkIndex, isLast, cells[] }   × ⌈N/C⌉
//! CELL_UPDATE         { gridId, updates[] }                     (≤ egress max)
//! PONG | SUBSCRIBE_ACK | UPDATE_ACK | ERROR  { gridId?, data }
//! ```
//!
//! Inbound from the event stream: [`GridEvent`]. Inbound from a
//! connection: [`ClientMessage`].
//!
//! Messages are encoded once into a shared [`Payload`] and fanned out
//! without re-serialization.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use viewserver_core::{Cell, CellChange, CellValue, DataType, GridError, ViewId};

/// A serialized message, shared across every recipient.
pub type Payload = Arc<str>;

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Header of a snapshot transfer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadStart<'a> {
    pub grid_id: &'a ViewId,
    pub rows: u32,
    pub columns: u32,
    pub total_cells: usize,
    pub chunk_size: usize,
}

/// One ordered slice of a snapshot transfer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadChunk<'a> {
    pub grid_id: &'a ViewId,
    pub chunk_index: usize,
    pub is_last: bool,
    pub cells: &'a [Cell],
}

/// One egress frame of applied changes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaUpdate<'a> {
    pub grid_id: &'a ViewId,
    pub updates: &'a [CellChange],
}

/// Short control reply to a connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_id: Option<String>,
    pub data: String,
}

/// Every message the server emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage<'a> {
    InitialLoadStart(LoadStart<'a>),
    InitialLoadChunk(LoadChunk<'a>),
    CellUpdate(DeltaUpdate<'a>),
    Pong(Notice),
    SubscribeAck(Notice),
    UpdateAck(Notice),
    Error(Notice),
}

impl OutboundMessage<'_> {
    pub fn notice_pong(grid_id: Option<String>) -> Self {
        Self::Pong(Notice { grid_id, data: "pong".into() })
    }

    pub fn notice_subscribed(grid_id: Option<String>) -> Self {
        Self::SubscribeAck(Notice { grid_id, data: "subscribed".into() })
    }

    pub fn notice_update_ack(grid_id: Option<String>) -> Self {
        Self::UpdateAck(Notice { grid_id, data: "acknowledged".into() })
    }

    pub fn notice_error(reason: impl Into<String>) -> Self {
        Self::Error(Notice { grid_id: None, data: reason.into() })
    }

    /// Serialize to a shareable text payload.
    pub fn encode(&self) -> Result<Payload, ProtocolError> {
        serde_json::to_string(self)
            .map(Payload::from)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Upstream events
// ───────────────────────────────────────────────────────────────────

/// Event kinds understood by the ingestion path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CellUpdate,
    GridCreated,
    GridDeleted,
    GridCleared,
    Unknown(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CELL_UPDATE" => Self::CellUpdate,
            "GRID_CREATED" => Self::GridCreated,
            "GRID_DELETED" => Self::GridDeleted,
            "GRID_CLEARED" => Self::GridCleared,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// One change as it arrives from the event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCellChange {
    pub row: u32,
    pub column: u32,
    #[serde(default)]
    pub old_value: Option<serde_json::Value>,
    pub new_value: serde_json::Value,
    pub data_type: String,
}

impl RawCellChange {
    /// Resolve the stringly-typed discriminator into a typed change.
    pub fn into_change(self) -> Result<CellChange, GridError> {
        let data_type: DataType = self.data_type.parse()?;
        let value = CellValue::from_json(data_type, &self.new_value)?;
        Ok(CellChange::new(self.row, self.column, value))
    }
}

/// A batch delivered by the event stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridEvent {
    pub event_type: String,
    #[serde(default, alias = "gridId")]
    pub view_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub changes: Option<Vec<RawCellChange>>,
}

impl GridEvent {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// The target view, if present and non-empty.
    pub fn view(&self) -> Option<ViewId> {
        self.view_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(ViewId::from)
    }
}

// ───────────────────────────────────────────────────────────────────
// Connection control messages
// ───────────────────────────────────────────────────────────────────

/// A control message sent by a connected subscriber.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub grid_id: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl ClientMessage {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn as_json(payload: &Payload) -> Value {
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_load_start_shape() {
        let id = ViewId::compose("user123", "view456");
        let msg = OutboundMessage::InitialLoadStart(LoadStart {
            grid_id: &id,
            rows: 10_000,
            columns: 100,
            total_cells: 1_000_000,
            chunk_size: 1000,
        });
        assert_eq!(
            as_json(&msg.encode().unwrap()),
            json!({
                "type": "INITIAL_LOAD_START",
                "gridId": "user123_view456",
                "rows": 10_000,
                "columns": 100,
                "totalCells": 1_000_000,
                "chunkSize": 1000
            })
        );
    }

    #[test]
    fn test_load_chunk_shape() {
        let id = ViewId::from("u_v");
        let cells = vec![Cell::new(0, 1, CellValue::String("x".into()), 5)];
        let msg = OutboundMessage::InitialLoadChunk(LoadChunk {
            grid_id: &id,
            chunk_index: 3,
            is_last: true,
            cells: &cells,
        });
        let v = as_json(&msg.encode().unwrap());
        assert_eq!(v["type"], "INITIAL_LOAD_CHUNK");
        assert_eq!(v["chunkIndex"], 3);
        assert_eq!(v["isLast"], true);
        assert_eq!(
            v["cells"][0],
            json!({"row": 0, "column": 1, "value": "x", "dataType": "string", "timestamp": 5})
        );
    }

    #[test]
    fn test_delta_update_shape() {
        let id = ViewId::from("u_v");
        let updates = vec![
            CellChange::new(1, 2, CellValue::Integer(9)),
            CellChange::new(3, 4, CellValue::Boolean(false)),
        ];
        let msg = OutboundMessage::CellUpdate(DeltaUpdate { grid_id: &id, updates: &updates });
        assert_eq!(
            as_json(&msg.encode().unwrap()),
            json!({
                "type": "CELL_UPDATE",
                "gridId": "u_v",
                "updates": [
                    {"row": 1, "column": 2, "value": 9, "dataType": "integer"},
                    {"row": 3, "column": 4, "value": false, "dataType": "boolean"}
                ]
            })
        );
    }

    #[test]
    fn test_notices() {
        let pong = OutboundMessage::notice_pong(Some("g".into())).encode().unwrap();
        assert_eq!(as_json(&pong), json!({"type": "PONG", "gridId": "g", "data": "pong"}));
        let err = OutboundMessage::notice_error("bad").encode().unwrap();
        assert_eq!(as_json(&err), json!({"type": "ERROR", "data": "bad"}));
    }

    #[test]
    fn test_grid_event_decode() {
        let raw = r#"{
            "batchId": "batch_1",
            "gridId": "user1_view1",
            "eventType": "CELL_UPDATE",
            "timestamp": 1703123456789,
            "changes": [
                {"row": 3, "column": 4, "newValue": 12.5, "dataType": "number"},
                {"row": 0, "column": 0, "oldValue": "a", "newValue": "b", "dataType": "string"}
            ]
        }"#;
        let event = GridEvent::decode(raw).unwrap();
        assert_eq!(event.kind(), EventKind::CellUpdate);
        assert_eq!(event.view(), Some(ViewId::from("user1_view1")));
        assert_eq!(event.batch_id.as_deref(), Some("batch_1"));

        let changes: Vec<CellChange> = event
            .changes
            .unwrap()
            .into_iter()
            .map(|c| c.into_change().unwrap())
            .collect();
        assert_eq!(changes[0], CellChange::new(3, 4, CellValue::Number(12.5)));
        assert_eq!(changes[1].value, CellValue::String("b".into()));
    }

    #[test]
    fn test_grid_event_missing_fields() {
        let event = GridEvent::decode(r#"{"eventType": "CELL_UPDATE", "viewId": ""}"#).unwrap();
        assert!(event.view().is_none());
        assert!(event.changes.is_none());
        assert!(GridEvent::decode("not json").is_err());
        assert!(GridEvent::decode(r#"{"viewId": "x"}"#).is_err());
    }

    #[test]
    fn test_raw_change_rejects_bad_type() {
        let raw: RawCellChange = serde_json::from_value(json!({
            "row": 0, "column": 0, "newValue": "x", "dataType": "integer"
        }))
        .unwrap();
        assert!(raw.into_change().is_err());

        let raw: RawCellChange = serde_json::from_value(json!({
            "row": 0, "column": 0, "newValue": 1, "dataType": "money"
        }))
        .unwrap();
        assert!(matches!(raw.into_change(), Err(GridError::UnknownDataType(_))));
    }

    #[test]
    fn test_event_kind_unknown() {
        assert_eq!(EventKind::parse("GRID_RENAMED"), EventKind::Unknown("GRID_RENAMED".into()));
    }

    #[test]
    fn test_client_message_decode() {
        let msg = ClientMessage::decode(r#"{"type": "PING", "gridId": "a_b"}"#).unwrap();
        assert_eq!(msg.msg_type, "PING");
        assert_eq!(msg.grid_id.as_deref(), Some("a_b"));
        assert!(msg.data.is_none());
    }
}
