use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::types::{GroupName, UploadId, UserId};

/// Messages a client may send, validated and normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Bind the connection to a user identity
    Login { user_id: UserId },

    /// Switch the connection into a channel (leaving the previous one)
    JoinGroup { group: GroupName },

    /// Leave the named channel, or the current one when absent
    LeaveGroup { group: Option<GroupName> },

    /// One-shot audio clip for a channel
    AudioMsg {
        to: Option<GroupName>,
        data: Vec<u8>,
    },

    /// Announce a chunked transfer of `total` parts
    AudioChunkStart { upload_id: UploadId, total: u32 },

    /// One part of a chunked transfer
    AudioChunk {
        upload_id: UploadId,
        index: u32,
        data: Vec<u8>,
        to: Option<GroupName>,
    },

    /// Application-level liveness probe
    Ping,

    /// WebRTC negotiation frame for one user. `payload` is the whole inbound
    /// object and is forwarded as-is apart from the stamped sender.
    Signal {
        kind: SignalKind,
        to: UserId,
        payload: Map<String, Value>,
    },
}

/// Peer-to-peer negotiation frames relayed between two users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    fn from_type(kind: &str) -> Option<Self> {
        match kind {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "candidate" => Some(SignalKind::Candidate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

const LOGIN: &str = "login";
const JOIN_GROUP: &str = "join_group";
const LEAVE_GROUP: &str = "leave_group";
const AUDIO_MSG: &str = "audio_msg";
const AUDIO_CHUNK_START: &str = "audio_chunk_start";
const AUDIO_CHUNK: &str = "audio_chunk";
const PING: &str = "ping";

impl ClientMessage {
    /// Decode one inbound frame. The size limit is checked before any parsing.
    pub fn decode(frame: &[u8], max_len: usize) -> Result<Self, ProtocolError> {
        if frame.len() > max_len {
            return Err(ProtocolError::TooLarge {
                size: frame.len(),
                max: max_len,
            });
        }

        let value: Value = serde_json::from_slice(frame)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(ProtocolError::MissingType);
        };
        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };

        match kind.as_str() {
            LOGIN => {
                let user_id = text(&fields, "userId")
                    .and_then(|raw| UserId::parse(&raw))
                    .ok_or_else(|| invalid(LOGIN, "userId"))?;
                Ok(ClientMessage::Login { user_id })
            }
            JOIN_GROUP => {
                let group = optional_group(&fields, "groupName")
                    .ok_or_else(|| invalid(JOIN_GROUP, "groupName"))?;
                Ok(ClientMessage::JoinGroup { group })
            }
            LEAVE_GROUP => Ok(ClientMessage::LeaveGroup {
                group: optional_group(&fields, "groupName"),
            }),
            AUDIO_MSG => {
                let data = audio(&fields).ok_or_else(|| invalid(AUDIO_MSG, "data"))?;
                let to = optional_group(&fields, "to")
                    .or_else(|| optional_group(&fields, "groupName"));
                Ok(ClientMessage::AudioMsg { to, data })
            }
            AUDIO_CHUNK_START => {
                let upload_id = upload_id(&fields).ok_or_else(|| invalid(AUDIO_CHUNK_START, "uploadId"))?;
                let total = integer(&fields, "total")
                    .filter(|total| *total >= 1)
                    .and_then(|total| u32::try_from(total).ok())
                    .ok_or_else(|| invalid(AUDIO_CHUNK_START, "total"))?;
                Ok(ClientMessage::AudioChunkStart { upload_id, total })
            }
            AUDIO_CHUNK => {
                let upload_id = upload_id(&fields).ok_or_else(|| invalid(AUDIO_CHUNK, "uploadId"))?;
                let index = integer(&fields, "index")
                    .and_then(|index| u32::try_from(index).ok())
                    .ok_or_else(|| invalid(AUDIO_CHUNK, "index"))?;
                let data = audio(&fields).ok_or_else(|| invalid(AUDIO_CHUNK, "data"))?;
                Ok(ClientMessage::AudioChunk {
                    upload_id,
                    index,
                    data,
                    to: optional_group(&fields, "to"),
                })
            }
            PING => Ok(ClientMessage::Ping),
            other => {
                let Some(signal) = SignalKind::from_type(other) else {
                    return Err(ProtocolError::UnknownType(other.to_string()));
                };
                let to = text(&fields, "to")
                    .and_then(|raw| UserId::parse(&raw))
                    .ok_or_else(|| invalid(signal.as_str(), "to"))?;
                Ok(ClientMessage::Signal {
                    kind: signal,
                    to,
                    payload: fields,
                })
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Login { .. } => LOGIN,
            ClientMessage::JoinGroup { .. } => JOIN_GROUP,
            ClientMessage::LeaveGroup { .. } => LEAVE_GROUP,
            ClientMessage::AudioMsg { .. } => AUDIO_MSG,
            ClientMessage::AudioChunkStart { .. } => AUDIO_CHUNK_START,
            ClientMessage::AudioChunk { .. } => AUDIO_CHUNK,
            ClientMessage::Ping => PING,
            ClientMessage::Signal { kind, .. } => kind.as_str(),
        }
    }
}

fn invalid(kind: &'static str, field: &'static str) -> ProtocolError {
    ProtocolError::InvalidField { kind, field }
}

/// String field; numbers are accepted and stringified.
fn text(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Integer field, given either as a JSON number or a decimal string.
fn integer(fields: &Map<String, Value>, key: &str) -> Option<i64> {
    match fields.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn optional_group(fields: &Map<String, Value>, key: &str) -> Option<GroupName> {
    text(fields, key).and_then(|raw| GroupName::parse(&raw))
}

fn upload_id(fields: &Map<String, Value>) -> Option<UploadId> {
    text(fields, "uploadId").and_then(|raw| UploadId::parse(&raw))
}

/// Base64 `data` field decoded to at least one byte. Line breaks inserted by
/// some mobile encoders are tolerated.
fn audio(fields: &Map<String, Value>) -> Option<Vec<u8>> {
    let Value::String(encoded) = fields.get("data")? else {
        return None;
    };
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    BASE64
        .decode(compact.as_bytes())
        .ok()
        .filter(|bytes| !bytes.is_empty())
}

/// Error codes reported to clients in `error{reason}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    InvalidJson,
    InvalidPayload,
    MessageTooLarge,
    UnknownType,
    NotAuthenticated,
    NoGroup,
    UnknownUpload,
    InvalidChunkIndex,
    AssemblyFailed,
    UserOffline,
}

/// Messages the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    LoginAck {
        user_id: UserId,
    },
    JoinAck {
        group_name: GroupName,
    },
    LeaveAck {
        group_name: GroupName,
    },
    ChunkStartAck {
        upload_id: UploadId,
    },
    ChunkAck {
        upload_id: UploadId,
        index: u32,
    },
    AudioAck {
        group_name: GroupName,
        recipients: usize,
    },
    AudioMsg {
        from: UserId,
        group_name: GroupName,
        /// Base64 audio payload
        data: String,
        /// Server receive time, milliseconds since the Unix epoch
        timestamp: i64,
    },
    UserJoined {
        user_id: UserId,
        group_name: GroupName,
    },
    UserLeft {
        user_id: UserId,
        group_name: GroupName,
    },
    UserStatus {
        user_id: UserId,
        is_online: bool,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        reason: ErrorReason,
    },
}

impl ServerMessage {
    /// Wrap an audio payload with sender identity and the server timestamp.
    pub fn audio(from: UserId, group_name: GroupName, payload: &[u8]) -> Self {
        ServerMessage::AudioMsg {
            from,
            group_name,
            data: BASE64.encode(payload),
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            timestamp: now_millis(),
        }
    }

    pub fn error(reason: ErrorReason) -> Self {
        ServerMessage::Error { reason }
    }

    /// Serialize to the text of one frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
