//! Legacy plain-text frame codec.
//!
//! Older push-servers deliver a concatenation of delimited JSON units:
//!
//! ```text
//! #!NGINXNMS!#{"id":1,"mid":"…","tag":"…","time":"…","text":{…}}#!NGINXNME!#
//! ```
//!
//! The grammar is only partially documented, so decoding is best effort:
//! anything outside the delimiters is ignored and a unit that fails to parse
//! is logged and skipped. A frame with no units means the server has no more
//! messages for the current session pointer.

// ============================================================================
// Imports
// ============================================================================

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::message::{EventBody, PushMessage};

// ============================================================================
// Constants
// ============================================================================

/// Opening sentinel of a unit.
pub const MESSAGE_START: &str = "#!NGINXNMS!#";

/// Closing sentinel of a unit.
pub const MESSAGE_END: &str = "#!NGINXNME!#";

static UNIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)#!NGINXNMS!#(.*?)#!NGINXNME!#").expect("unit pattern is valid")
});

// ============================================================================
// Unit
// ============================================================================

#[derive(Debug, Deserialize)]
struct Unit {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    tag: Option<Value>,
    #[serde(default)]
    time: Option<Value>,
    text: EventBody,
}

fn scalar_to_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Returns `true` if the frame holds at least one unit, parsable or not.
#[inline]
#[must_use]
pub fn has_units(frame: &str) -> bool {
    UNIT_PATTERN.is_match(frame)
}

/// Splits a text frame into push messages.
///
/// Returns an empty vector when the frame holds no units or none of them
/// parse. Use [`has_units`] to tell the two apart.
#[must_use]
pub fn decode_push_messages(frame: &str) -> Vec<PushMessage> {
    UNIT_PATTERN
        .captures_iter(frame)
        .filter_map(|captures| {
            let raw = captures.get(1)?.as_str();
            match serde_json::from_str::<Unit>(raw) {
                Ok(unit) => Some(PushMessage {
                    mid: unit.mid.filter(|m| !m.is_empty()).or_else(|| scalar_to_string(unit.id)),
                    tag: scalar_to_string(unit.tag),
                    time: scalar_to_string(unit.time),
                    body: unit.text,
                }),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed text unit");
                    None
                }
            }
        })
        .collect()
}

/// Wraps a JSON unit in sentinels.
#[must_use]
pub fn encode_unit(json: &str) -> String {
    format!("{MESSAGE_START}{json}{MESSAGE_END}")
}

// ============================================================================
// Tests
// ============================================================================
