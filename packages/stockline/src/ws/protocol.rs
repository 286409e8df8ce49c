//! Sync Wire Protocol
//!
//! Every frame on the `/sync` socket is one JSON [`WireMessage`]: a
//! `kind` tag, a kind-specific payload, and envelope metadata (issue
//! timestamp, origin connection, per-connection sequence number,
//! compression flag). The payload is a closed set — one typed shape per
//! kind — and decode rejects anything outside it instead of letting a
//! bad frame take the connection down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stockline_store::ChangeAction;

use super::compress;

/// Features advertised to every client in CONNECTION_INFO.
pub const SERVER_FEATURES: [&str; 3] = ["compression", "partialSync", "deltaUpdates"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    SyncRequest,
    SyncResponse,
    SyncError,
    DataChange,
    SyncComplete,
    Capabilities,
    Heartbeat,
    ConnectionInfo,
}

/// One frame on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub kind: MessageKind,
    pub payload: Value,
    pub issued_at: DateTime<Utc>,
    /// Connection that caused this message; stamped on broadcasts so a
    /// client can recognize its own mutation if it ever sees it echoed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_connection_id: Option<String>,
    /// Present on every server-sent frame, absent on client frames.
    /// Per-connection, monotonic by exactly 1, gap-detection only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    /// When true the payload slot holds a base64 lz4 block instead of
    /// plain JSON.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_compressed: bool,
}

// === Payload shapes ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Datasets to stream; absent or empty means the full default list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub dataset: String,
    pub data: Vec<Value>,
    /// Snapshot instant shared by every response of one sync operation.
    pub snapshot_at: DateTime<Utc>,
    pub count: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncComplete {
    pub snapshot_at: DateTime<Utc>,
    /// Exactly the datasets a SYNC_RESPONSE was sent for, in order.
    pub datasets: Vec<String>,
}

/// Structured error: machine code plus an optional human message.
/// Clients never see raw internal error chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SyncError {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self { error: error.into(), message: Some(message.into()) }
    }
}

/// Inbound mutation, outbound broadcast, and origin acknowledgment all
/// share this shape; `success` is present only on the ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChange {
    pub entity: String,
    pub action: ChangeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Optional features a connection declares; defaults apply until the
/// first CAPABILITIES message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub supports_compression: bool,
    pub is_electron_host: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
}

/// First frame on every connection: the assigned id, the server clock,
/// and the server-supported feature list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub server_time: DateTime<Utc>,
    pub features: Vec<String>,
}

/// Typed view of a frame's payload: one variant per message kind.
#[derive(Debug, Clone)]
pub enum Payload {
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
    SyncError(SyncError),
    DataChange(DataChange),
    SyncComplete(SyncComplete),
    Capabilities(Capabilities),
    Heartbeat(Heartbeat),
    ConnectionInfo(ConnectionInfo),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::SyncRequest(_) => MessageKind::SyncRequest,
            Self::SyncResponse(_) => MessageKind::SyncResponse,
            Self::SyncError(_) => MessageKind::SyncError,
            Self::DataChange(_) => MessageKind::DataChange,
            Self::SyncComplete(_) => MessageKind::SyncComplete,
            Self::Capabilities(_) => MessageKind::Capabilities,
            Self::Heartbeat(_) => MessageKind::Heartbeat,
            Self::ConnectionInfo(_) => MessageKind::ConnectionInfo,
        }
    }

    /// Bind a raw payload value to its declared kind.
    pub fn from_kind(kind: MessageKind, value: Value) -> Result<Self, ProtocolError> {
        let invalid = |source| ProtocolError::InvalidPayload { kind, source };
        let payload = match kind {
            MessageKind::SyncRequest => Self::SyncRequest(serde_json::from_value(value).map_err(invalid)?),
            MessageKind::SyncResponse => Self::SyncResponse(serde_json::from_value(value).map_err(invalid)?),
            MessageKind::SyncError => Self::SyncError(serde_json::from_value(value).map_err(invalid)?),
            MessageKind::DataChange => Self::DataChange(serde_json::from_value(value).map_err(invalid)?),
            MessageKind::SyncComplete => Self::SyncComplete(serde_json::from_value(value).map_err(invalid)?),
            MessageKind::Capabilities => Self::Capabilities(serde_json::from_value(value).map_err(invalid)?),
            MessageKind::Heartbeat => Self::Heartbeat(serde_json::from_value(value).map_err(invalid)?),
            MessageKind::ConnectionInfo => Self::ConnectionInfo(serde_json::from_value(value).map_err(invalid)?),
        };
        Ok(payload)
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::SyncRequest(p) => serde_json::to_value(p),
            Self::SyncResponse(p) => serde_json::to_value(p),
            Self::SyncError(p) => serde_json::to_value(p),
            Self::DataChange(p) => serde_json::to_value(p),
            Self::SyncComplete(p) => serde_json::to_value(p),
            Self::Capabilities(p) => serde_json::to_value(p),
            Self::Heartbeat(p) => serde_json::to_value(p),
            Self::ConnectionInfo(p) => serde_json::to_value(p),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),

    #[error("frame has no kind field")]
    MissingKind,

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("invalid {kind:?} payload: {source}")]
    InvalidPayload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("compressed payload must be a base64 string")]
    CompressedNotString,

    #[error("compressed payload is not valid base64: {0}")]
    BadCompressedEncoding(#[source] base64::DecodeError),

    #[error("payload decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("binary frames are not part of the sync protocol")]
    BinaryFrame,
}

impl ProtocolError {
    /// Wire error code for the SYNC_ERROR response.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) | Self::MissingKind => "malformed_frame",
            Self::UnknownKind(_) => "unknown_kind",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::CompressedNotString | Self::BadCompressedEncoding(_) | Self::Decompress(_) => {
                "bad_payload_encoding"
            }
            Self::BinaryFrame => "binary_frame",
        }
    }
}

/// Parse one text frame into its envelope.
///
/// Two-stage so an unknown kind is reported as such instead of as a
/// generic parse failure.
pub fn decode_frame(text: &str) -> Result<WireMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::MalformedFrame)?;
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingKind)?;
    if serde_json::from_value::<MessageKind>(Value::String(kind.to_string())).is_err() {
        return Err(ProtocolError::UnknownKind(kind.to_string()));
    }
    serde_json::from_value(value).map_err(ProtocolError::MalformedFrame)
}

impl WireMessage {
    /// Decode the typed payload, transparently decompressing.
    pub fn typed_payload(&self) -> Result<Payload, ProtocolError> {
        let value = if self.is_compressed {
            let blob = self.payload.as_str().ok_or(ProtocolError::CompressedNotString)?;
            let bytes = compress::decode(blob)?;
            serde_json::from_slice(&bytes).map_err(ProtocolError::MalformedFrame)?
        } else {
            self.payload.clone()
        };
        Payload::from_kind(self.kind, value)
    }
}

/// Assemble one server-sent frame.
///
/// The envelope metadata is stamped here — the per-connection writer is
/// the only caller, so sequence numbers have a single owner. The
/// compression decision is per recipient: only when the recipient
/// declared support and the serialized payload clears the threshold.
pub fn encode_server_frame(
    payload: &Payload,
    sequence_number: u64,
    origin_connection_id: Option<&str>,
    caps: &Capabilities,
    compression_threshold: usize,
) -> anyhow::Result<String> {
    let value = payload.to_value()?;
    let (value, is_compressed) = if caps.supports_compression {
        let bytes = serde_json::to_vec(&value)?;
        match compress::maybe_compress(&bytes, compression_threshold)? {
            Some(blob) => (Value::String(blob), true),
            None => (value, false),
        }
    } else {
        (value, false)
    };

    let message = WireMessage {
        kind: payload.kind(),
        payload: value,
        issued_at: Utc::now(),
        origin_connection_id: origin_connection_id.map(str::to_string),
        sequence_number: Some(sequence_number),
        is_compressed,
    };
    Ok(serde_json::to_string(&message)?)
}
