//! Message value objects exchanged between the application, the interceptors and the transport.

use std::collections::HashMap;
use std::fmt;

/// Date and time types used for message and heartbeat timestamps.
pub use chrono::{DateTime, Utc};
use serde_json::Value;

/// The body of a [`Message`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// UTF-8 text, sent as a text frame.
    Text(String),
    /// Structured data, serialized to a text frame on the wire.
    Json(Value),
    /// Raw bytes, sent as a binary frame.
    Binary(Vec<u8>),
}

impl Payload {
    /// Returns the payload as text if it is a [`Payload::Text`].
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Whether this payload is what `text` decodes to once it arrives as a frame.
    ///
    /// Text and binary payloads compare byte for byte. A JSON payload matches when `text` parses
    /// to the same value, so a reply like `{"type":"pong"}` still matches after the transport
    /// decoded it.
    #[must_use]
    pub fn matches_text(&self, text: &str) -> bool {
        match self {
            Self::Text(own) => own == text,
            Self::Json(value) => {
                serde_json::from_str::<Value>(text).is_ok_and(|parsed| parsed == *value)
            }
            Self::Binary(bytes) => bytes.as_slice() == text.as_bytes(),
        }
    }

    /// The [`MessageType`] a message carrying this payload is tagged with by default.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Text(_) => MessageType::Text,
            Self::Json(_) => MessageType::Json,
            Self::Binary(_) => MessageType::Binary,
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Json(value) => write!(f, "{value}"),
            Self::Binary(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

/// Semantic tag describing what a [`Message`] carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
#[non_exhaustive]
pub enum MessageType {
    Text,
    Json,
    Binary,
    /// Liveness probe or its reply.
    Heartbeat,
    /// Application-defined tag.
    #[strum(to_string = "{0}")]
    Custom(String),
}

/// An immutable message crossing the client boundary.
///
/// Equality considers the payload, the creation timestamp and the type; metadata is ignored.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageType,
    pub metadata: Option<HashMap<String, Value>>,
}

impl Message {
    /// Creates a message stamped with the current time and tagged after its payload.
    pub fn new<P: Into<Payload>>(payload: P) -> Self {
        let payload = payload.into();
        let kind = payload.message_type();
        Self {
            payload,
            timestamp: Utc::now(),
            kind,
            metadata: None,
        }
    }

    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::new(Payload::Text(text.into()))
    }

    pub fn json(value: Value) -> Self {
        Self::new(Payload::Json(value))
    }

    pub fn binary(bytes: Vec<u8>) -> Self {
        Self::new(Payload::Binary(bytes))
    }

    /// A liveness probe or reply carrying a text payload.
    pub fn heartbeat<S: Into<String>>(text: S) -> Self {
        Self::text(text).with_kind(MessageType::Heartbeat)
    }

    /// Returns a copy of this message with a different type tag.
    #[must_use]
    pub fn with_kind(self, kind: MessageType) -> Self {
        Self { kind, ..self }
    }

    /// Returns a copy of this message with the given metadata attached.
    #[must_use]
    pub fn with_metadata(self, metadata: HashMap<String, Value>) -> Self {
        Self {
            metadata: Some(metadata),
            ..self
        }
    }

    /// Returns a new message carrying `payload` and the same type and metadata, stamped now.
    #[must_use]
    pub fn with_payload<P: Into<Payload>>(&self, payload: P) -> Self {
        Self {
            payload: payload.into(),
            timestamp: Utc::now(),
            kind: self.kind.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
            && self.timestamp == other.timestamp
            && self.kind == other.kind
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({}: {})", self.kind, self.payload)
    }
}
