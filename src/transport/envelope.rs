//! Named event envelopes and inbound event decoding.
//!
//! On the live link an envelope travels as a socket.io event packet (see
//! [`crate::transport::socketio`]). Recordings for replay store one envelope
//! per line as `{"event": ..., "data": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite;
use tracing::trace;

use crate::core::capture::CaptureUpdate;
use crate::stream::groups::{parse_group_list, GroupInfo};
use crate::stream::types::RawFrame;

/// Transport-level error. Never fatal; the session retries.
#[derive(Debug)]
pub enum TransportError {
    WebSocket(tungstenite::Error),
    /// Packet or handshake that does not follow the socket.io protocol
    Protocol(String),
    Codec(serde_json::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::WebSocket(e) => write!(f, "Websocket error: {}", e),
            TransportError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TransportError::Codec(e) => write!(f, "Envelope codec error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        TransportError::WebSocket(e)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e)
    }
}

/// One wire message: `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Serialize to a single recording line, including the trailing newline.
    pub fn encode_line(&self) -> Result<String, TransportError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode_line(line: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Link state as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Which model-management reply an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelStatusKind {
    Metadata,
    Activation,
    Deletion,
    Package,
    Load,
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Synthesized by the session on link state changes
    Connection(ConnectionState),
    Frame(RawFrame),
    Groups(Vec<GroupInfo>),
    DynamoConfigStatus(Value),
    CaptureUpdate(CaptureUpdate),
    Model(ModelStatusKind, Value),
    Battery(Value),
    Error(Value),
}

impl InboundEvent {
    /// Decode an envelope. Unknown event names yield `Ok(None)`.
    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, TransportError> {
        let Envelope { event, data } = envelope;
        let decoded = match event.as_str() {
            "jsonData" => InboundEvent::Frame(serde_json::from_value(data)?),
            "getGroupsStatus" => InboundEvent::Groups(parse_group_list(&data)),
            "getDynamoConfigStatus" => InboundEvent::DynamoConfigStatus(data),
            "captureUpdate" => InboundEvent::CaptureUpdate(serde_json::from_value(data)?),
            "modelMetadata" => InboundEvent::Model(ModelStatusKind::Metadata, data),
            "modelActivationStatus" => InboundEvent::Model(ModelStatusKind::Activation, data),
            "modelDeletionStatus" => InboundEvent::Model(ModelStatusKind::Deletion, data),
            "modelPackageStatus" => InboundEvent::Model(ModelStatusKind::Package, data),
            "modelLoadStatus" => InboundEvent::Model(ModelStatusKind::Load, data),
            "battery" => InboundEvent::Battery(data),
            "error" => InboundEvent::Error(data),
            other => {
                trace!("Dropping unknown event {:?}", other);
                return Ok(None);
            }
        };
        Ok(Some(decoded))
    }

    /// Decode one recording line.
    pub fn from_line(line: &str) -> Result<Option<Self>, TransportError> {
        Self::from_envelope(Envelope::decode_line(line)?)
    }
}
