//! Wire envelope.
//!
//! Every frame in either direction is a JSON object with a string `type`
//! discriminant, an optional `room`, and arbitrary domain fields:
//!
//! ```json
//! {"type": "chat_message", "room": "42", "message": "hi", "sender": "bob"}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Maximum number of characters of a rejected frame kept for diagnostics.
const FRAME_PREVIEW_CHARS: usize = 100;

/// Why an inbound frame was rejected.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The frame is not JSON, or is JSON without a string `type`.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A binary frame did not contain UTF-8 text.
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
}

/// One parsed message crossing the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Discriminant, serialized as `type`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Room/topic scope. Numeric room ids on the wire are kept as strings.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_room"
    )]
    pub room: Option<String>,
    /// Remaining domain fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Envelope with the given discriminant and no fields.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            room: None,
            fields: Map::new(),
        }
    }

    /// Set the room scope.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Add a domain field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Build an envelope from a JSON value, using `default_kind` when the
    /// value has no `type` field.
    ///
    /// Used for REST payloads, whose items often omit the discriminant.
    pub fn from_value(mut value: Value, default_kind: &str) -> Result<Self, EnvelopeError> {
        if let Value::Object(map) = &mut value {
            map.entry("type")
                .or_insert_with(|| Value::String(default_kind.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Whether this envelope carries the given discriminant.
    #[must_use]
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Look up a domain field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up a string domain field.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// The envelope as a flat JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 2);
        map.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(room) = &self.room {
            map.insert("room".to_string(), Value::String(room.clone()));
        }
        for (key, value) in &self.fields {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Value::Object(map)
    }

    /// Serialize to a JSON text frame.
    #[must_use]
    pub fn to_frame(&self) -> String {
        self.to_value().to_string()
    }
}

/// Leading characters of a frame, for logs.
pub(crate) fn frame_preview(text: &str) -> String {
    text.chars().take(FRAME_PREVIEW_CHARS).collect()
}

fn deserialize_room<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(room)) => Ok(Some(room)),
        Some(Value::Number(room)) => Ok(Some(room.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "room must be a string or number, got {other}"
        ))),
    }
}
