//! Replication Types
//!
//! Typed protocol messages, array deltas and the frame codec used on
//! direct channels.

use crate::domain::entities::{DeviceInfo, PeerId};
use crate::domain::value_objects::Envelope;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Largest frame accepted on a direct channel.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Errors decoding channel traffic.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    fn malformed(kind: &str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Add or remove a single role on the receiving peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleOperation {
    Add,
    Remove,
}

/// Payload of a `role` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCommand {
    pub operation: RoleOperation,
    pub role: String,
}

/// Payload of a `roleConfigurations` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfiguration {
    pub role: String,
    pub configurations: Vec<String>,
}

/// Decoded channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Ids of the sender's other connected peers
    Connections(Vec<PeerId>),
    /// Opaque host payload
    Data(Value),
    /// The sender's full declared role list
    Roles(Vec<String>),
    Device(DeviceInfo),
    Sync {
        id: String,
        data: Value,
        is_delta: bool,
    },
    Role(RoleCommand),
    RoleConfigurations(RoleConfiguration),
    /// First frame on a direct channel, naming the dialing peer
    Hello(PeerId),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connections(_) => "connections",
            Self::Data(_) => "data",
            Self::Roles(_) => "roles",
            Self::Device(_) => "device",
            Self::Sync { .. } => "sync",
            Self::Role(_) => "role",
            Self::RoleConfigurations(_) => "roleConfigurations",
            Self::Hello(_) => "hello",
        }
    }

    /// Interpret an envelope. Unknown `type` values yield
    /// [`ProtocolError::UnknownType`] so callers can log and drop them.
    pub fn decode(envelope: Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope.kind.as_str();
        let msg = match kind {
            "connections" => Self::Connections(
                serde_json::from_value(envelope.data).map_err(|e| ProtocolError::malformed(kind, e))?,
            ),
            "data" => Self::Data(envelope.data),
            "roles" => Self::Roles(
                serde_json::from_value(envelope.data).map_err(|e| ProtocolError::malformed(kind, e))?,
            ),
            "device" => Self::Device(
                serde_json::from_value(envelope.data).map_err(|e| ProtocolError::malformed(kind, e))?,
            ),
            "sync" => {
                let id = envelope
                    .id
                    .ok_or_else(|| ProtocolError::malformed(kind, "missing id"))?;
                Self::Sync {
                    id,
                    data: envelope.data,
                    is_delta: envelope.is_delta.unwrap_or(false),
                }
            }
            "role" => Self::Role(
                serde_json::from_value(envelope.data).map_err(|e| ProtocolError::malformed(kind, e))?,
            ),
            "roleConfigurations" => Self::RoleConfigurations(
                serde_json::from_value(envelope.data).map_err(|e| ProtocolError::malformed(kind, e))?,
            ),
            "hello" => Self::Hello(
                serde_json::from_value(envelope.data).map_err(|e| ProtocolError::malformed(kind, e))?,
            ),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(msg)
    }

    pub fn into_envelope(self) -> Envelope {
        let kind = self.kind();
        match self {
            Self::Connections(ids) => Envelope::new(kind, json!(ids)),
            Self::Data(data) => Envelope::new(kind, data),
            Self::Roles(roles) => Envelope::new(kind, json!(roles)),
            Self::Device(device) => Envelope::new(kind, json!(device)),
            Self::Sync { id, data, is_delta } => Envelope {
                kind: kind.to_string(),
                data,
                id: Some(id),
                is_delta: Some(is_delta),
            },
            Self::Role(command) => Envelope::new(kind, json!(command)),
            Self::RoleConfigurations(config) => Envelope::new(kind, json!(config)),
            Self::Hello(peer) => Envelope::new(kind, json!(peer)),
        }
    }
}

/// One positional edit: remove `removed` items at `index`, insert `added`.
#[derive(Debug, Clone, PartialEq)]
pub struct Splice {
    pub index: usize,
    pub removed: usize,
    pub added: Vec<Value>,
}

impl Splice {
    pub fn new(index: usize, removed: usize, added: Vec<Value>) -> Self {
        Self { index, removed, added }
    }

    /// Wire form `[index, removedCount, item...]`.
    pub fn to_value(&self) -> Value {
        let mut items = Vec::with_capacity(2 + self.added.len());
        items.push(json!(self.index));
        items.push(json!(self.removed));
        items.extend(self.added.iter().cloned());
        Value::Array(items)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let items = value
            .as_array()
            .ok_or_else(|| ProtocolError::malformed("sync", "splice is not an array"))?;
        let index = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::malformed("sync", "splice index is not an unsigned integer"))?;
        let removed = items
            .get(1)
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::malformed("sync", "splice count is not an unsigned integer"))?;
        Ok(Self {
            index: index as usize,
            removed: removed as usize,
            added: items[2..].to_vec(),
        })
    }

    /// Apply with array-splice semantics: index and count are clamped to the
    /// target's bounds.
    pub fn apply_to(&self, target: &mut Vec<Value>) {
        let start = self.index.min(target.len());
        let end = start.saturating_add(self.removed).min(target.len());
        target.splice(start..end, self.added.iter().cloned());
    }
}

/// Ordered list of splices describing a sequence edit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Delta(pub Vec<Splice>);

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn splices(&self) -> &[Splice] {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.0.iter().map(Splice::to_value).collect())
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let splices = value
            .as_array()
            .ok_or_else(|| ProtocolError::malformed("sync", "delta is not an array"))?;
        splices
            .iter()
            .map(Splice::from_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Replay each splice, in order, against the current contents.
    pub fn apply_to(&self, target: &mut Vec<Value>) {
        for splice in &self.0 {
            splice.apply_to(target);
        }
    }
}

// ==================== Frame Codec ====================

/// Encode an envelope as a length-prefixed JSON frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }

    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Decode a length from the first 4 bytes.
pub fn decode_length(buf: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Decode a frame body.
pub fn decode_frame(body: &[u8]) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_slice(body)?)
}
