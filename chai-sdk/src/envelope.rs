//! Wire envelope codec for the chat socket.
//!
//! Every text frame on the socket is a JSON object tagged with a `type`.
//! Inbound frames carry `type`, `isValid` and `content`; outbound frames
//! carry `type`, `token`, `timestamp` and `message`.
//!
//! [`parse`] is total: any input string yields an [`InboundEnvelope`], with
//! malformed frames downgraded to [`EnvelopeKind::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed body of the authenticate frame sent right after the socket opens.
pub const AUTHENTICATE_MESSAGE: &str = "websocket client connection request";

/// Envelope discriminator (`type` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Authenticate,
    Message,
    Info,
    Error,
    Unknown,
}

impl EnvelopeKind {
    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "authenticate" => Some(Self::Authenticate),
            "message" => Some(Self::Message),
            "info" => Some(Self::Info),
            "error" => Some(Self::Error),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// A chat message as delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub content: String,
    pub created_at: String,
    pub user_id: i64,
    pub conversation_id: i64,
}

impl ChatMessage {
    /// Identifier carried by fallback messages built from malformed payloads.
    pub const SENTINEL_ID: i64 = -1;

    /// Wrap a non-conforming payload. Always carries [`Self::SENTINEL_ID`].
    pub fn fallback(content: impl Into<String>) -> Self {
        Self {
            id: Self::SENTINEL_ID,
            content: content.into(),
            created_at: String::new(),
            user_id: Self::SENTINEL_ID,
            conversation_id: Self::SENTINEL_ID,
        }
    }

    pub fn is_authentic(&self) -> bool {
        self.id >= 0
    }
}

/// What the UI hands to `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub content: String,
    pub user_id: i64,
    pub conversation_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Chat(ChatMessage),
    Text(String),
}

/// A parsed inbound frame. Created per frame and consumed immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub kind: EnvelopeKind,
    pub payload: Payload,
    pub is_valid: bool,
}

/// What the connection should do with an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the message to the UI.
    Surface(ChatMessage),
    /// Server acknowledged the authenticate frame.
    Acknowledged,
    Info(String),
    ServerError(String),
    Unrecognized(String),
    /// Our own message echoed back.
    SelfEcho(ChatMessage),
    /// Invalid message frame or sentinel identifier.
    Rejected,
}

impl InboundEnvelope {
    fn unknown(raw: &str) -> Self {
        Self {
            kind: EnvelopeKind::Unknown,
            payload: Payload::Text(raw.to_string()),
            is_valid: false,
        }
    }

    /// Apply the dispatch policy. `local_user` is the id of the signed-in user.
    pub fn into_disposition(self, local_user: Option<i64>) -> Disposition {
        match (self.kind, self.payload) {
            (EnvelopeKind::Authenticate, _) => Disposition::Acknowledged,
            (EnvelopeKind::Info, payload) => Disposition::Info(payload_text(payload)),
            (EnvelopeKind::Error, payload) => Disposition::ServerError(payload_text(payload)),
            (EnvelopeKind::Unknown, payload) => Disposition::Unrecognized(payload_text(payload)),
            (EnvelopeKind::Message, Payload::Chat(msg)) => {
                if !self.is_valid || !msg.is_authentic() {
                    Disposition::Rejected
                } else if local_user == Some(msg.user_id) {
                    Disposition::SelfEcho(msg)
                } else {
                    Disposition::Surface(msg)
                }
            }
            (EnvelopeKind::Message, Payload::Text(_)) => Disposition::Rejected,
        }
    }
}

fn payload_text(payload: Payload) -> String {
    match payload {
        Payload::Text(s) => s,
        Payload::Chat(m) => m.content,
    }
}

/// Parse a raw text frame. Never fails.
pub fn parse(raw: &str) -> InboundEnvelope {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Frame is not JSON");
            return InboundEnvelope::unknown(raw);
        }
    };

    let Some(obj) = value.as_object() else {
        return InboundEnvelope::unknown(raw);
    };
    let present = |key: &str| obj.get(key).filter(|v| !v.is_null());
    let (Some(kind), Some(is_valid), Some(content)) =
        (present("type"), present("isValid"), present("content"))
    else {
        tracing::debug!("Frame is missing type, isValid or content");
        return InboundEnvelope::unknown(raw);
    };
    let (Some(kind), Some(is_valid)) = (
        kind.as_str().and_then(EnvelopeKind::from_wire),
        is_valid.as_bool(),
    ) else {
        return InboundEnvelope::unknown(raw);
    };

    match kind {
        EnvelopeKind::Authenticate | EnvelopeKind::Info | EnvelopeKind::Error => match content {
            Value::String(s) => InboundEnvelope {
                kind,
                payload: Payload::Text(s.clone()),
                is_valid,
            },
            other => InboundEnvelope {
                kind,
                payload: Payload::Text(other.to_string()),
                is_valid: false,
            },
        },
        EnvelopeKind::Message => match content {
            Value::String(s) => InboundEnvelope {
                kind,
                payload: Payload::Chat(ChatMessage::fallback(s.clone())),
                is_valid: false,
            },
            other => match serde_json::from_value::<ChatMessage>(other.clone()) {
                Ok(msg) => InboundEnvelope {
                    kind,
                    payload: Payload::Chat(msg),
                    is_valid,
                },
                Err(e) => {
                    tracing::debug!(error = %e, "Message payload has the wrong shape");
                    InboundEnvelope {
                        kind,
                        payload: Payload::Chat(ChatMessage::fallback(other.to_string())),
                        is_valid: false,
                    }
                }
            },
        },
        EnvelopeKind::Unknown => InboundEnvelope {
            kind,
            payload: Payload::Text(match content {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            is_valid: false,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundBody<'a> {
    Text(&'a str),
    Message(&'a OutgoingMessage),
}

/// A frame sent from the client to the server.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope<'a> {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<&'a str>,
    pub timestamp: i64,
    pub message: OutboundBody<'a>,
}

impl<'a> OutboundEnvelope<'a> {
    pub fn authenticate(token: &'a str, timestamp: i64) -> Self {
        Self {
            kind: EnvelopeKind::Authenticate,
            token: Some(token),
            timestamp,
            message: OutboundBody::Text(AUTHENTICATE_MESSAGE),
        }
    }

    pub fn message(token: &'a str, message: &'a OutgoingMessage, timestamp: i64) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            token: Some(token),
            timestamp,
            message: OutboundBody::Message(message),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
