//! Push-server configuration.
//!
//! The configuration is fetched from the backend on start and restart,
//! cached in the shared store and re-validated before reuse.
//!
//! # Format
//!
//! ```json
//! {
//!   "channels": {
//!     "private": { "id": "abc", "start": "2024-01-01T00:00:00+00:00", "end": "2024-01-02T00:00:00+00:00" }
//!   },
//!   "server": {
//!     "version": 4,
//!     "websocket": "ws://push/sub/",
//!     "long_pooling": "http://push/sub/",
//!     "publish": "http://push/pub/",
//!     "websocket_enabled": true,
//!     "publish_enabled": true,
//!     "mode": "personal",
//!     "config_timestamp": 1700000000
//!   },
//!   "api": { "revision_web": 19 },
//!   "jwt": null,
//!   "exp": 0
//! }
//! ```
//!
//! The endpoint key is spelled `long_pooling` on the wire.
//!
//! # Protocol Selection
//!
//! | `server.version` | Protocol | Publishing |
//! |------------------|----------|------------|
//! | `>= 5` | JSON-RPC | yes |
//! | `4` | binary | yes |
//! | `< 4` | text | no |

// ============================================================================
// Submodules
// ============================================================================

/// REST collaborator over `reqwest`.
pub mod rest;

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::channel::{PublicChannel, Session};
use crate::error::{Error, Result};
use crate::identifiers::UserId;
use crate::transport::ConnectionType;

// ============================================================================
// Re-exports
// ============================================================================

pub use rest::RestApi;

// ============================================================================
// Constants
// ============================================================================

/// Protocol revision of this client.
pub const REVISION: u32 = 19;

/// First server version speaking JSON-RPC.
const JSON_RPC_VERSION: u32 = 5;

/// Server version speaking the binary protocol.
const BINARY_VERSION: u32 = 4;

/// Last server version without client publishing.
const NO_PUBLISH_VERSION: u32 = 3;

// ============================================================================
// Channels
// ============================================================================

/// One subscription channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel id.
    pub id: String,
    /// Channel signature, when issued separately from the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Start of validity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// End of validity.
    pub end: DateTime<Utc>,
    /// `private` or `shared`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Channels of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channels {
    /// Channel of this user only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<ChannelInfo>,
    /// Channel shared by the site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<ChannelInfo>,
}

impl Channels {
    /// Channels in subscription order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelInfo> {
        self.private.iter().chain(self.shared.iter())
    }

    /// Replaces the channel of type `kind` (`private` or `shared`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown type.
    pub fn replace(&mut self, kind: &str, channel: ChannelInfo) -> Result<()> {
        match kind {
            "private" => self.private = Some(channel),
            "shared" => self.shared = Some(channel),
            other => return Err(Error::config(format!("unknown channel type {other}"))),
        }
        Ok(())
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

/// Server deployment mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// One logical client per connection.
    #[default]
    Personal,
    /// Connections are shared; `clientId` disambiguates.
    Shared,
}

/// Negotiated frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    /// Delimited text units.
    Text,
    /// Protobuf batches.
    Binary,
    /// JSON-RPC 2.0.
    JsonRpc,
}

/// Endpoints and capabilities of the push-server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server protocol version.
    #[serde(default)]
    pub version: u32,
    /// Plain WebSocket endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<String>,
    /// TLS WebSocket endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_secure: Option<String>,
    /// Plain long-polling endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_pooling: Option<String>,
    /// TLS long-polling endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_pooling_secure: Option<String>,
    /// Plain publication endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<String>,
    /// TLS publication endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_secure: Option<String>,
    /// WebSocket allowed.
    #[serde(default)]
    pub websocket_enabled: bool,
    /// Client publishing allowed.
    #[serde(default)]
    pub publish_enabled: bool,
    /// Deployment mode.
    #[serde(default)]
    pub mode: ServerMode,
    /// Server-side configuration version.
    #[serde(default)]
    pub config_timestamp: i64,
}

impl ServerConfig {
    /// Frame format for this server version.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        if self.version >= JSON_RPC_VERSION {
            Protocol::JsonRpc
        } else if self.version == BINARY_VERSION {
            Protocol::Binary
        } else {
            Protocol::Text
        }
    }

    /// Returns `true` if this server version accepts client publishing.
    #[inline]
    #[must_use]
    pub fn is_publishing_supported(&self) -> bool {
        self.version > NO_PUBLISH_VERSION
    }

    fn endpoint(&self, connection_type: ConnectionType, secure: bool) -> Option<&str> {
        let (plain, tls) = match connection_type {
            ConnectionType::WebSocket => (&self.websocket, &self.websocket_secure),
            ConnectionType::LongPolling => (&self.long_pooling, &self.long_pooling_secure),
        };
        pick(plain, tls, secure)
    }

    fn publish_endpoint(&self, secure: bool) -> Option<&str> {
        pick(&self.publish, &self.publish_secure, secure)
    }
}

fn pick<'a>(plain: &'a Option<String>, tls: &'a Option<String>, secure: bool) -> Option<&'a str> {
    let (first, second) = if secure { (tls, plain) } else { (plain, tls) };
    first
        .as_deref()
        .filter(|s| !s.is_empty())
        .or_else(|| second.as_deref().filter(|s| !s.is_empty()))
}

/// Backend API settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Protocol revision the backend expects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_web: Option<u32>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Everything needed to connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Subscription channels.
    #[serde(default)]
    pub channels: Channels,
    /// Server endpoints.
    #[serde(default)]
    pub server: ServerConfig,
    /// Backend API settings.
    #[serde(default)]
    pub api: ApiConfig,
    /// Public channels shipped with the configuration.
    #[serde(rename = "publicChannels", default)]
    pub public_channels: FxHashMap<UserId, PublicChannel>,
    /// Client id (shared mode).
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Resumption token; replaces channel ids when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    /// Expiry (unix seconds); `0` means none.
    #[serde(default)]
    pub exp: i64,
    /// Client clock minus server clock, in seconds.
    #[serde(rename = "timeShift", default)]
    pub time_shift: i64,
}

impl Configuration {
    /// Frame format.
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.server.protocol()
    }

    /// Returns `true` if publishing is both supported and switched on.
    #[inline]
    #[must_use]
    pub fn is_publishing_enabled(&self) -> bool {
        self.server.is_publishing_supported() && self.server.publish_enabled
    }

    /// Returns `true` if the configuration may be used at `now`.
    ///
    /// Requires the server timestamp not to be older than `remembered`,
    /// a positive `exp` to be in the future, at least one channel, and
    /// every channel to end after `now`.
    #[must_use]
    pub fn is_actual(&self, remembered: i64, now: DateTime<Utc>) -> bool {
        if self.server.config_timestamp < remembered {
            return false;
        }
        if self.exp > 0 && self.exp <= now.timestamp() {
            return false;
        }
        let mut channels = self.channels.iter().peekable();
        if channels.peek().is_none() {
            return false;
        }
        channels.all(|channel| channel.end > now)
    }

    /// Like [`is_actual`](Self::is_actual), as a `Result`.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigStale`] if the configuration may not be used
    pub fn ensure_actual(&self, remembered: i64, now: DateTime<Utc>) -> Result<()> {
        if self.is_actual(remembered, now) {
            Ok(())
        } else {
            Err(Error::ConfigStale)
        }
    }

    fn channel_ids(&self) -> Vec<&str> {
        self.channels
            .iter()
            .map(|channel| channel.id.as_str())
            .filter(|id| !id.is_empty())
            .collect()
    }

    /// Subscription URL for `connection_type`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the endpoint is missing, shared mode lacks a
    ///   client id, or there is neither a JWT nor a channel
    /// - [`Error::Url`] if the endpoint is not a valid URL
    pub fn connection_path(
        &self,
        connection_type: ConnectionType,
        secure: bool,
        session: &Session,
    ) -> Result<String> {
        let endpoint = self.server.endpoint(connection_type, secure).ok_or_else(|| {
            Error::config(format!("no {connection_type} endpoint in configuration"))
        })?;
        let mut url = Url::parse(endpoint)?;

        let client_id = match self.server.mode {
            ServerMode::Shared => Some(
                self.client_id
                    .as_deref()
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| Error::config("shared mode requires a client id"))?,
            ),
            ServerMode::Personal => None,
        };
        let token = self.jwt.as_deref().filter(|jwt| !jwt.is_empty());
        let channel_ids = self.channel_ids();
        if token.is_none() && channel_ids.is_empty() {
            return Err(Error::config("no channels to subscribe to"));
        }

        {
            let mut query = url.query_pairs_mut();
            match self.protocol() {
                Protocol::JsonRpc => {
                    query.append_pair("jsonRpc", "true");
                }
                Protocol::Binary => {
                    query.append_pair("binaryMode", "true");
                }
                Protocol::Text => {}
            }
            if let Some(client_id) = client_id {
                query.append_pair("clientId", client_id);
            }
            if let Some(mid) = &session.mid {
                query.append_pair("mid", mid);
            }
            if let Some(tag) = &session.tag {
                query.append_pair("tag", tag);
            }
            if let Some(time) = &session.time {
                query.append_pair("time", time);
            }
            query.append_pair("revision", &REVISION.to_string());
            match token {
                Some(token) => {
                    query.append_pair("token", token);
                }
                None => {
                    query.append_pair("CHANNEL_ID", &channel_ids.join("/"));
                }
            }
        }

        Ok(url.into())
    }

    /// Publication URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if there is no publish endpoint or no
    /// channel, [`Error::Url`] for an invalid endpoint.
    pub fn publication_path(&self, secure: bool) -> Result<String> {
        let endpoint = self
            .server
            .publish_endpoint(secure)
            .ok_or_else(|| Error::config("no publish endpoint in configuration"))?;
        let channel_ids = self.channel_ids();
        if channel_ids.is_empty() {
            return Err(Error::config("no channels to publish from"));
        }

        let mut url = Url::parse(endpoint)?;
        url.query_pairs_mut()
            .append_pair("CHANNEL_ID", &channel_ids.join("/"));
        Ok(url.into())
    }
}

// ============================================================================
// FetchedConfig
// ============================================================================

/// Configuration as returned by the backend, with its clock.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedConfig {
    /// The configuration.
    pub config: Configuration,
    /// Backend clock at response time.
    pub server_time: Option<DateTime<Utc>>,
}

impl FetchedConfig {
    /// Parses a backend answer, splitting off `serverTime`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the answer is not a configuration.
    pub fn from_value(mut value: Value) -> Result<Self> {
        let server_time = value
            .as_object_mut()
            .and_then(|map| map.remove("serverTime"))
            .and_then(|raw| serde_json::from_value(raw).ok());
        Ok(Self {
            config: serde_json::from_value(value)?,
            server_time,
        })
    }

    /// Strips the server clock, recording the skew relative to `now`.
    #[must_use]
    pub fn into_configuration(self, now: DateTime<Utc>) -> Configuration {
        let mut config = self.config;
        if let Some(server_time) = self.server_time {
            config.time_shift = (now - server_time).num_seconds();
        }
        config
    }
}

// ============================================================================
// ConfigSource
// ============================================================================

/// Backend that issues configurations.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetches a fresh configuration.
    ///
    /// # Errors
    ///
    /// [`Error::Auth`] when the backend refuses the session; any other
    /// error is retried by the caller.
    async fn fetch_config(&self) -> Result<FetchedConfig>;
}

// ============================================================================
// Tests
// ============================================================================
