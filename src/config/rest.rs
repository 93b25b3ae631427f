//! REST collaborator.
//!
//! Backend methods are plain JSON POSTs to `<base>/<method>`. Answers are
//! either `{"result": ...}` or `{"error": "CODE", "error_description": "..."}`.
//!
//! | Method | Body | Result |
//! |--------|------|--------|
//! | `pull.config.get` | `{"CACHE": "N"}` | configuration + `serverTime` |
//! | `pull.channel.public.list` | `{"USERS": [1, 2]}` | `{"<userId>": PublicChannel}` |

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::channel::{PublicChannel, PublicIdSource};
use crate::error::{Error, Result};
use crate::identifiers::UserId;

use super::{ConfigSource, FetchedConfig};

// ============================================================================
// Constants
// ============================================================================

/// Configuration method.
pub const CONFIG_GET: &str = "pull.config.get";

/// Public channel lookup method.
pub const PUBLIC_LIST: &str = "pull.channel.public.list";

/// Backend error codes that mean the session is not authorized.
const AUTH_ERROR_CODES: [&str; 2] = ["AUTHORIZE_ERROR", "WRONG_AUTH_TYPE"];

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    error_description: Option<String>,
}

// ============================================================================
// RestApi
// ============================================================================

/// Backend client implementing [`ConfigSource`] and [`PublicIdSource`].
#[derive(Debug, Clone)]
pub struct RestApi {
    client: reqwest::Client,
    base_url: String,
}

impl RestApi {
    /// Creates a client for the backend at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Creates a client reusing a configured `reqwest` client (cookies,
    /// auth headers).
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Calls a backend method and returns its `result`.
    ///
    /// # Errors
    ///
    /// - [`Error::Auth`] on HTTP 401/403 or an authorization error code
    /// - [`Error::Connection`] for other backend errors
    /// - [`Error::Http`] / [`Error::Json`] for transport or parse failures
    #[instrument(skip(self, body))]
    pub async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let url = format!("{}/{method}", self.base_url);
        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::auth(status, text));
        }

        let envelope: Envelope = response.json().await?;
        if let Some(error) = envelope.error.filter(|e| !e.is_null()) {
            let code = match error {
                Value::String(code) => code,
                other => other.to_string(),
            };
            let description = envelope.error_description.unwrap_or_default();
            if AUTH_ERROR_CODES.contains(&code.as_str()) {
                return Err(Error::auth(status, format!("{code}: {description}")));
            }
            return Err(Error::connection(format!(
                "{method} failed: {code}: {description}"
            )));
        }

        debug!(status, "Backend call succeeded");
        envelope
            .result
            .ok_or_else(|| Error::protocol(format!("{method} returned no result")))
    }
}

#[async_trait]
impl ConfigSource for RestApi {
    async fn fetch_config(&self) -> Result<FetchedConfig> {
        let result = self.call(CONFIG_GET, json!({"CACHE": "N"})).await?;
        FetchedConfig::from_value(result)
    }
}

#[async_trait]
impl PublicIdSource for RestApi {
    async fn fetch_public_ids(
        &self,
        user_ids: &[UserId],
    ) -> Result<FxHashMap<UserId, PublicChannel>> {
        let result = self.call(PUBLIC_LIST, json!({"USERS": user_ids})).await?;
        match result {
            // an empty PHP array serializes as []
            Value::Array(items) if items.is_empty() => Ok(FxHashMap::default()),
            other => Ok(serde_json::from_value(other)?),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
