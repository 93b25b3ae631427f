//! Decoded push message model.
//!
//! Every wire format (binary batch, legacy text, JSON-RPC `incoming.message`)
//! decodes into [`PushMessage`]: session bookkeeping fields plus an
//! [`EventBody`] addressed by `module_id` and `command`.
//!
//! # Body Format
//!
//! ```json
//! {
//!   "module_id": "crm",
//!   "command": "fieldUpdated",
//!   "params": { "id": 1 },
//!   "extra": { "revision_web": 19, "server_time_unix": 1700000000.5 }
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Constants
// ============================================================================

/// Module id reserved for push-server system commands.
pub const INTERNAL_MODULE: &str = "pull";

/// Module id of presence notifications.
pub const ONLINE_MODULE: &str = "online";

// ============================================================================
// SenderType
// ============================================================================

/// Origin of a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum SenderType {
    /// Origin not reported.
    #[default]
    Unknown,
    /// Another client published it.
    Client,
    /// The application backend published it.
    Backend,
}

impl From<u32> for SenderType {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Client,
            2 => Self::Backend,
            _ => Self::Unknown,
        }
    }
}

impl From<SenderType> for u32 {
    fn from(value: SenderType) -> Self {
        match value {
            SenderType::Unknown => 0,
            SenderType::Client => 1,
            SenderType::Backend => 2,
        }
    }
}

// ============================================================================
// SenderInfo
// ============================================================================

/// Sender descriptor attached to `extra.sender`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Sender type.
    #[serde(rename = "type", default)]
    pub kind: SenderType,

    /// Sender id (base64 for binary frames).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

// ============================================================================
// Extra
// ============================================================================

/// Metadata that travels next to the message params.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Extra {
    /// Server protocol revision.
    #[serde(
        default,
        deserialize_with = "lenient_u32",
        skip_serializing_if = "Option::is_none"
    )]
    pub revision_web: Option<u32>,

    /// Server clock when the message was sent (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time_unix: Option<f64>,

    /// Message age in seconds, computed on delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time_ago: Option<f64>,

    /// Who published the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderInfo>,

    /// Remaining fields, passed through untouched.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

// ============================================================================
// EventBody
// ============================================================================

/// Application payload of a push message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    /// Target module.
    pub module_id: String,

    /// Command within the module.
    pub command: String,

    /// Command parameters.
    #[serde(default)]
    pub params: Value,

    /// Delivery metadata.
    #[serde(default, deserialize_with = "null_as_default")]
    pub extra: Extra,
}

impl EventBody {
    /// Creates a body with empty extra metadata.
    #[must_use]
    pub fn new(module_id: impl Into<String>, command: impl Into<String>, params: Value) -> Self {
        Self {
            module_id: module_id.into(),
            command: command.into(),
            params,
            extra: Extra::default(),
        }
    }

    /// Returns `true` if the message came from another client.
    #[inline]
    #[must_use]
    pub fn is_from_client(&self) -> bool {
        self.extra
            .sender
            .as_ref()
            .is_some_and(|sender| sender.kind == SenderType::Client)
    }
}

// ============================================================================
// PushMessage
// ============================================================================

/// A delivered message plus session bookkeeping fields.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    /// Unique message id used for resumption and de-duplication.
    pub mid: Option<String>,
    /// Resumption tag.
    pub tag: Option<String>,
    /// Resumption time.
    pub time: Option<String>,
    /// Application payload.
    pub body: EventBody,
}

impl PushMessage {
    /// Creates a message with only an id and a body.
    #[must_use]
    pub fn new(mid: impl Into<String>, body: EventBody) -> Self {
        Self {
            mid: Some(mid.into()),
            tag: None,
            time: None,
            body,
        }
    }
}

// ============================================================================
// Serde Helpers
// ============================================================================

/// Accepts numbers and numeric strings; anything else maps to `None`.
fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_parsing() {
        let body: EventBody = serde_json::from_value(json!({
            "module_id": "crm",
            "command": "fieldUpdated",
            "params": {"id": 1},
            "extra": {"revision_web": 19, "server_time_unix": 1700000000.5, "channel_type": "private"}
        }))
        .expect("parse");

        assert_eq!(body.module_id, "crm");
        assert_eq!(body.command, "fieldUpdated");
        assert_eq!(body.params["id"], 1);
        assert_eq!(body.extra.revision_web, Some(19));
        assert_eq!(body.extra.other["channel_type"], "private");
    }

    #[test]
    fn test_revision_accepts_strings() {
        let body: EventBody = serde_json::from_value(json!({
            "module_id": "m",
            "command": "c",
            "extra": {"revision_web": "20"}
        }))
        .expect("parse");
        assert_eq!(body.extra.revision_web, Some(20));
    }

    #[test]
    fn test_missing_or_null_extra() {
        let body: EventBody =
            serde_json::from_value(json!({"module_id": "m", "command": "c", "extra": null}))
                .expect("parse");
        assert_eq!(body.extra, Extra::default());
        assert_eq!(body.params, Value::Null);
    }

    #[test]
    fn test_sender_type_numbers() {
        let sender: SenderInfo = serde_json::from_value(json!({"type": 1, "id": "AQI="})).unwrap();
        assert_eq!(sender.kind, SenderType::Client);
        assert_eq!(serde_json::to_value(sender).unwrap()["type"], 1);

        let unknown: SenderInfo = serde_json::from_value(json!({"type": 9})).unwrap();
        assert_eq!(unknown.kind, SenderType::Unknown);
    }

    #[test]
    fn test_is_from_client() {
        let mut body = EventBody::new("m", "c", Value::Null);
        assert!(!body.is_from_client());

        body.extra.sender = Some(SenderInfo {
            kind: SenderType::Client,
            id: None,
        });
        assert!(body.is_from_client());
    }
}
