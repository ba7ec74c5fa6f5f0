//! JSON message shape shared by the live channel and the history endpoint.
//!
//! ```json
//! { "id": 42, "content": "Hola", "sender": "A", "createdAt": "2024-05-01T10:00:00Z" }
//! ```
//!
//! `id` and `createdAt` are assigned by the server and are absent on
//! messages a client publishes.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::Role;

/// Error type for wire encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The JSON payload could not be serialized or parsed.
    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One chat message as it travels over the channel or the history API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Server-assigned permanent id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Message text.
    pub content: String,
    /// Which side of the pair sent it.
    pub sender: Role,
    /// Server-assigned canonical timestamp.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "created_at_format"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl WireMessage {
    /// A client-side outgoing message (no id, no timestamp).
    #[must_use]
    pub fn outgoing(content: impl Into<String>, sender: Role) -> Self {
        Self {
            id: None,
            content: content.into(),
            sender,
            created_at: None,
        }
    }
}

/// Encodes a [`WireMessage`] as a JSON string.
///
/// # Errors
///
/// Returns [`WireError::Json`] if serialization fails.
pub fn encode(message: &WireMessage) -> Result<String, WireError> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes a single [`WireMessage`] from JSON text.
///
/// # Errors
///
/// Returns [`WireError::Json`] if the text is not a valid message.
pub fn decode(text: &str) -> Result<WireMessage, WireError> {
    Ok(serde_json::from_str(text)?)
}

/// Decodes a JSON array of messages (the history endpoint's body).
///
/// # Errors
///
/// Returns [`WireError::Json`] if the text is not an array of messages.
pub fn decode_batch(text: &str) -> Result<Vec<WireMessage>, WireError> {
    Ok(serde_json::from_str(text)?)
}

/// Timestamps are written as RFC 3339. On read, zone-less ISO-8601 values
/// (`2024-05-01T10:00:00.123`) are accepted and taken as UTC.
mod created_at_format {
    use super::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(&raw, NAIVE_FORMAT)
            .map(|naive| Some(naive.and_utc()))
            .map_err(|e| serde::de::Error::custom(format!("bad createdAt {raw:?}: {e}")))
    }
}
