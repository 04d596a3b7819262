//! Wire-format types for the relay socket protocol.
//!
//! Outbound messages are a closed tagged enum ([`ServerMessage`]) serialized
//! as flat JSON objects with a `type` discriminator. Inbound text is parsed
//! into a [`ClientEnvelope`] and then classified into [`Inbound`]; kinds the
//! relay does not know are preserved as [`Inbound::Unknown`] rather than
//! rejected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ConnectionId, SessionId};
use crate::session::{SessionMode, SessionSnapshot, SessionState};

/// Current UTC time as RFC 3339, the timestamp format used on the wire.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Status carried by `status_change` notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Started,
    Paused,
    Resumed,
    Stopped,
}

/// Message sent from the relay to a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        connection_id: ConnectionId,
        timestamp: String,
    },
    /// Session descriptor. `fps` is the achieved rate; `rate_capped` is set
    /// when the requested rate exceeded the source's native rate.
    VideoInfo {
        session_id: SessionId,
        mode: SessionMode,
        width: u32,
        height: u32,
        total_frames: u64,
        fps: f64,
        native_fps: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        requested_fps: Option<f64>,
        rate_capped: bool,
        timestamp: String,
    },
    VideoFrame {
        session_id: SessionId,
        image_data: Value,
        frame_number: u64,
        total_frames: u64,
        width: u32,
        height: u32,
        timestamp: String,
    },
    Frame {
        session_id: SessionId,
        frame_number: u64,
        total_frames: u64,
        data: Value,
        timestamp: String,
    },
    Second {
        session_id: SessionId,
        second_number: u64,
        total_seconds: u64,
        data: Value,
        timestamp: String,
    },
    StatusChange {
        session_id: SessionId,
        status: StatusKind,
        current_frame: u64,
        timestamp: String,
    },
    Complete {
        session_id: SessionId,
        message: String,
        timestamp: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        code: String,
        message: String,
        timestamp: String,
    },
    Ack {
        command: String,
        session_id: SessionId,
        state: SessionState,
        current_frame: u64,
        timestamp: String,
    },
    SessionStatus {
        session: SessionSnapshot,
        timestamp: String,
    },
    /// Informational relay of an inbound kind the server does not understand.
    Notice {
        kind: String,
        from: ConnectionId,
        data: Value,
        timestamp: String,
    },
    Ping {
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
}

impl ServerMessage {
    /// The `type` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::VideoInfo { .. } => "video_info",
            Self::VideoFrame { .. } => "video_frame",
            Self::Frame { .. } => "frame",
            Self::Second { .. } => "second",
            Self::StatusChange { .. } => "status_change",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Ack { .. } => "ack",
            Self::SessionStatus { .. } => "session_status",
            Self::Notice { .. } => "notice",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Frame index carried by a data message, if this is one.
    pub fn frame_number(&self) -> Option<u64> {
        match self {
            Self::VideoFrame { frame_number, .. } | Self::Frame { frame_number, .. } => {
                Some(*frame_number)
            }
            Self::Second { second_number, .. } => Some(*second_number),
            _ => None,
        }
    }

    pub fn error(session_id: Option<SessionId>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            session_id,
            code: code.into(),
            message: message.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn status_change(session_id: SessionId, status: StatusKind, current_frame: u64) -> Self {
        Self::StatusChange {
            session_id,
            status,
            current_frame,
            timestamp: now_timestamp(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            timestamp: now_timestamp(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_timestamp(),
        }
    }
}

/// Parameters for starting a session, shared by the socket `play_video`
/// command and the HTTP `play` action.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub mode: Option<SessionMode>,
    #[serde(default)]
    pub video_path: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
    /// Frame count for the synthetic modes.
    #[serde(default)]
    pub total_frames: Option<u64>,
}

/// Raw client-originated envelope: `{type, data, timestamp}`.
///
/// Older clients send `{action: ...}` with the parameters at the top level;
/// both spellings are accepted.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientEnvelope {
    /// Resolve the message kind, mapping legacy actions onto kinds.
    pub fn resolved_kind(&self) -> Option<String> {
        if let Some(kind) = &self.kind {
            return Some(kind.clone());
        }
        self.action.as_deref().map(|action| {
            match action {
                "play" => "play_video",
                "pause" => "pause_video",
                "resume" => "resume_video",
                "stop" => "stop_video",
                "heartbeat" => "ping",
                other => other,
            }
            .to_string()
        })
    }

    /// The payload object: `data` when present, otherwise the top-level extras.
    pub fn payload(&self) -> Value {
        match &self.data {
            Value::Null => Value::Object(self.extra.clone()),
            other => other.clone(),
        }
    }
}

/// Reason an inbound text frame could not be classified.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message has neither `type` nor `action`")]
    MissingKind,
    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

#[derive(Debug, Default, Deserialize)]
struct SessionTarget {
    #[serde(default)]
    session_id: Option<SessionId>,
}

#[derive(Debug, Deserialize)]
struct SubscribeTarget {
    session_id: SessionId,
}

/// Classified inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Play(StartRequest),
    Pause { session_id: Option<SessionId> },
    Resume { session_id: Option<SessionId> },
    Stop { session_id: Option<SessionId> },
    Subscribe { session_id: SessionId },
    Unsubscribe,
    Status { session_id: Option<SessionId> },
    Ping,
    Pong,
    Unknown { kind: String, data: Value },
}

impl Inbound {
    /// Parse and classify one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, MalformedMessage> {
        let envelope: ClientEnvelope =
            serde_json::from_str(text).map_err(|e| MalformedMessage::InvalidJson(e.to_string()))?;
        Self::classify(&envelope)
    }

    pub fn classify(envelope: &ClientEnvelope) -> Result<Self, MalformedMessage> {
        let kind = envelope.resolved_kind().ok_or(MalformedMessage::MissingKind)?;
        let payload = envelope.payload();

        let inbound = match kind.as_str() {
            "play_video" => Self::Play(decode(&kind, payload)?),
            "pause_video" => Self::Pause {
                session_id: decode::<SessionTarget>(&kind, payload)?.session_id,
            },
            "resume_video" => Self::Resume {
                session_id: decode::<SessionTarget>(&kind, payload)?.session_id,
            },
            "stop_video" => Self::Stop {
                session_id: decode::<SessionTarget>(&kind, payload)?.session_id,
            },
            "subscribe" => Self::Subscribe {
                session_id: decode::<SubscribeTarget>(&kind, payload)?.session_id,
            },
            "unsubscribe" => Self::Unsubscribe,
            "status" => Self::Status {
                session_id: decode::<SessionTarget>(&kind, payload)?.session_id,
            },
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            _ => Self::Unknown {
                kind,
                data: payload,
            },
        };
        Ok(inbound)
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T, MalformedMessage> {
    let payload = if payload.is_null() {
        Value::Object(Map::new())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| MalformedMessage::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}
