//! Socket.IO v5 packets over Engine.IO v4 websocket text frames.
//!
//! Only what the backend uses is handled: the default namespace, plain
//! (non-binary) events and the server-driven heartbeat. An event travels as
//! `42["name", payload]`; the server pings with `2` and expects `3`.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::transport::envelope::{Envelope, TransportError};

/// Engine.IO endpoint on the backend, websocket transport only.
pub const ENGINE_IO_PATH: &str = "/socket.io/?EIO=4&transport=websocket";

/// Join the default namespace.
pub const CONNECT_PACKET: &str = "40";
/// Leave the default namespace.
pub const DISCONNECT_PACKET: &str = "41";
/// Heartbeat reply.
pub const PONG_PACKET: &str = "3";

/// Engine.IO open packet payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default)]
    pub sid: String,
    /// Server ping period (ms)
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Grace after a missed ping (ms)
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl Handshake {
    /// Silence after which the link is considered dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace joined
    Connected,
    /// Namespace join refused, with the server's reason
    ConnectError(Value),
    /// Server left the namespace
    Disconnected,
    Event(Envelope),
    /// Acks, binary packets and upgrades; never requested by this client
    Ignored,
}

/// Decode one websocket text frame.
pub fn decode(text: &str) -> Result<Packet, TransportError> {
    let mut chars = text.chars();
    let packet = match chars.next() {
        Some('0') => Packet::Open(serde_json::from_str(chars.as_str())?),
        Some('1') => Packet::Close,
        Some('2') => Packet::Ping,
        Some('3') => Packet::Pong,
        Some('4') => decode_message(chars.as_str())?,
        Some('5') => Packet::Ignored,
        Some('6') => Packet::Noop,
        _ => return Err(TransportError::Protocol(format!("unknown packet {:?}", truncate(text)))),
    };
    Ok(packet)
}

fn decode_message(body: &str) -> Result<Packet, TransportError> {
    let mut chars = body.chars();
    let packet = match chars.next() {
        Some('0') => Packet::Connected,
        Some('1') => Packet::Disconnected,
        Some('2') => decode_event(chars.as_str())?,
        Some('4') => {
            let reason = strip_namespace(chars.as_str()).unwrap_or_default();
            Packet::ConnectError(serde_json::from_str(reason).unwrap_or(Value::Null))
        }
        Some('3' | '5' | '6') => Packet::Ignored,
        _ => {
            return Err(TransportError::Protocol(format!(
                "unknown socket.io packet {:?}",
                truncate(body)
            )))
        }
    };
    Ok(packet)
}

fn decode_event(body: &str) -> Result<Packet, TransportError> {
    let Some(body) = strip_namespace(body) else {
        return Ok(Packet::Ignored);
    };
    // Optional ack id precedes the argument array
    let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut args: Vec<Value> = serde_json::from_str(body)?;
    if args.is_empty() {
        return Err(TransportError::Protocol("event without a name".to_string()));
    }
    let Value::String(event) = args.remove(0) else {
        return Err(TransportError::Protocol("event name is not a string".to_string()));
    };
    let data = if args.is_empty() {
        Value::Null
    } else {
        args.swap_remove(0)
    };
    Ok(Packet::Event(Envelope::new(event, data)))
}

/// Payload after a default-namespace prefix; `None` for other namespaces.
fn strip_namespace(body: &str) -> Option<&str> {
    if !body.starts_with('/') {
        return Some(body);
    }
    let (namespace, rest) = body.split_once(',').unwrap_or((body, ""));
    (namespace == "/").then_some(rest)
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(32) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Encode an event packet. A null payload is sent as a bare event name.
pub fn encode_event(envelope: &Envelope) -> Result<String, TransportError> {
    let args = if envelope.data.is_null() {
        json!([envelope.event])
    } else {
        json!([envelope.event, envelope.data])
    };
    Ok(format!("42{}", serde_json::to_string(&args)?))
}
