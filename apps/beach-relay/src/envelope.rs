use axum::extract::ws::Message;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Sent by the relay to a freshly joined peer; `data` lists the ids already present.
pub const INIT: &str = "init";
/// Client join request, only valid as the first frame on the signaling endpoint.
pub const JOIN: &str = "join";
/// Sent by the relay before closing a connection whose join was refused.
pub const JOIN_ERROR: &str = "join_error";
pub const PEER_JOINED: &str = "peer_joined";
pub const PEER_LEFT: &str = "peer_left";

pub const MAX_PEER_ID_LEN: usize = 256;

/// Routing unit exchanged over the signaling endpoint.
///
/// `data` is opaque: the relay never looks inside it. `target_id` is set by
/// the sending client; `source_id` is always rewritten by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireEnvelope")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

/// Inbound shape. Older clients address peers through a bare `id` field,
/// which only counts when `target_id` is absent.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, deserialize_with = "present_value")]
    data: Option<Value>,
    #[serde(default)]
    target_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    source_id: Option<String>,
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        Self {
            kind: wire.kind,
            data: wire.data,
            target_id: wire.target_id.or(wire.id),
            source_id: wire.source_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("binary frame is not valid utf-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
    #[error("expected a join request, got `{0}`")]
    NotAJoin(String),
    #[error("peer id is empty")]
    EmptyPeerId,
    #[error("peer id exceeds {MAX_PEER_ID_LEN} bytes")]
    PeerIdTooLong,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    peer_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

// Keeps an explicit `"data": null` distinct from an absent field.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            target_id: None,
            source_id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    /// Membership announcement addressed to `peer_id`.
    pub fn init(peer_id: &str, peers: &[String]) -> Self {
        Self::new(INIT)
            .with_data(Value::from(peers.to_vec()))
            .with_target(peer_id)
    }

    pub fn join_error(reason: impl Into<String>) -> Self {
        Self::new(JOIN_ERROR).with_data(serde_json::json!({ "reason": reason.into() }))
    }

    pub fn presence(kind: &str, peer_id: &str) -> Self {
        Self::new(kind).with_source(peer_id)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    pub fn encode(&self) -> Message {
        Message::Text(self.to_json())
    }
}

pub fn decode(frame: &Message) -> Result<Envelope, DecodeError> {
    let text = frame_text(frame)?;
    Ok(serde_json::from_str(text)?)
}

/// Extracts the peer id from the first frame of a signaling connection.
///
/// Accepts `{"type":"join","peer_id":"alice"}`, a JSON string, or the bare id
/// as a text frame.
pub fn decode_join(frame: &Message) -> Result<String, DecodeError> {
    let text = frame_text(frame)?.trim();

    if text.starts_with('{') {
        let request: JoinRequest = serde_json::from_str(text)?;
        if request.kind != JOIN {
            return Err(DecodeError::NotAJoin(request.kind));
        }
        let peer_id = request
            .peer_id
            .or(request.id)
            .ok_or(DecodeError::EmptyPeerId)?;
        return validate_peer_id(&peer_id);
    }

    if text.starts_with('"') {
        let id: String = serde_json::from_str(text)?;
        return validate_peer_id(&id);
    }

    validate_peer_id(text)
}

pub fn validate_peer_id(raw: &str) -> Result<String, DecodeError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(DecodeError::EmptyPeerId);
    }
    if id.len() > MAX_PEER_ID_LEN {
        return Err(DecodeError::PeerIdTooLong);
    }
    Ok(id.to_owned())
}

fn frame_text(frame: &Message) -> Result<&str, DecodeError> {
    match frame {
        Message::Text(text) => Ok(text.as_str()),
        Message::Binary(bytes) => Ok(std::str::from_utf8(bytes)?),
        other => Err(DecodeError::UnexpectedFrame(frame_kind(other))),
    }
}

pub fn frame_kind(frame: &Message) -> &'static str {
    match frame {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
    }
}
