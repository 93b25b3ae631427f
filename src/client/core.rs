//! Client handle and public API.
//!
//! # Example
//!
//! ```no_run
//! use push_client::{PushClient, RestApi, Subscription, Notification};
//!
//! # async fn example() -> push_client::Result<()> {
//! let client = PushClient::builder()
//!     .user_id(42)
//!     .site_id("s1")
//!     .rest_api(RestApi::new("https://portal.example/rest"))
//!     .build()?;
//!
//! let _handle = client.subscribe(Subscription::server("crm"), |notification| {
//!     if let Notification::Message(body) = notification {
//!         println!("{} {}", body.command, body.params);
//!     }
//! });
//!
//! client.start(None).await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::channel::{ChannelResolver, PublicChannel, Session};
use crate::config::{Configuration, Protocol, REVISION};
use crate::error::{Error, Result};
use crate::identifiers::UserId;
use crate::logging::HostLog;
use crate::protocol::jsonrpc::method;
use crate::protocol::{EventBody, IncomingMessage, RequestBatch};
use crate::rpc::{DEFAULT_RPC_TIMEOUT, JsonRpc, RpcCall};
use crate::storage::SharedConfig;
use crate::transport::{ConnectionType, Connector, Frame};

use super::builder::PushClientBuilder;
use super::event_loop::Command;
use super::status::PullStatus;
use super::subscribers::{Notification, SubscriberRegistry, Subscription, SubscriptionHandle};

// ============================================================================
// Transports
// ============================================================================

/// Both connectors plus the active choice.
pub(crate) struct Transports {
    pub websocket: Arc<dyn Connector>,
    pub long_polling: Arc<dyn Connector>,
    pub active: ConnectionType,
}

impl Transports {
    pub(crate) fn get(&self, connection_type: ConnectionType) -> &Arc<dyn Connector> {
        match connection_type {
            ConnectionType::WebSocket => &self.websocket,
            ConnectionType::LongPolling => &self.long_polling,
        }
    }
}

/// Transports shared by the handle, the actor and the RPC sender.
pub(crate) type SharedTransports = Arc<RwLock<Transports>>;

// ============================================================================
// ClientShared
// ============================================================================

/// State readable without a round trip to the actor.
///
/// Only the actor writes `config`, `status` and `transports.active`.
pub(crate) struct ClientShared {
    pub user_id: UserId,
    pub site_id: String,
    pub secure: bool,
    pub config: Arc<RwLock<Option<Configuration>>>,
    pub session: Arc<Mutex<Session>>,
    pub transports: SharedTransports,
    pub status: RwLock<PullStatus>,
    pub remembered_timestamp: AtomicI64,
    pub rpc: JsonRpc,
    pub resolver: ChannelResolver,
    pub subscribers: Arc<SubscriberRegistry>,
    pub storage: SharedConfig,
    pub log: HostLog,
}

impl ClientShared {
    pub(crate) fn connector(&self, connection_type: ConnectionType) -> Arc<dyn Connector> {
        Arc::clone(self.transports.read().get(connection_type))
    }

    pub(crate) fn active_connector(&self) -> Arc<dyn Connector> {
        let transports = self.transports.read();
        Arc::clone(transports.get(transports.active))
    }

    pub(crate) fn connection_type(&self) -> ConnectionType {
        self.transports.read().active
    }

    pub(crate) fn protocol(&self) -> Option<Protocol> {
        self.config.read().as_ref().map(Configuration::protocol)
    }

    pub(crate) fn remembered_timestamp(&self) -> i64 {
        self.remembered_timestamp.load(Ordering::Relaxed)
    }
}

// ============================================================================
// PublishMessage
// ============================================================================

/// One message of a publish batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    /// Users addressed through their public channels.
    pub user_ids: Vec<UserId>,
    /// Channels addressed directly.
    pub channels: Vec<PublicChannel>,
    /// Payload.
    pub body: EventBody,
    /// Seconds until the server drops the message (0 = never).
    pub expiry: u32,
}

impl PublishMessage {
    /// Message for users.
    #[must_use]
    pub fn to_users(
        user_ids: impl Into<Vec<UserId>>,
        module_id: impl Into<String>,
        command: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            user_ids: user_ids.into(),
            channels: Vec::new(),
            body: EventBody::new(module_id, command, params),
            expiry: 0,
        }
    }

    /// Message for public channels.
    #[must_use]
    pub fn to_channels(
        channels: impl Into<Vec<PublicChannel>>,
        module_id: impl Into<String>,
        command: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            user_ids: Vec::new(),
            channels: channels.into(),
            body: EventBody::new(module_id, command, params),
            expiry: 0,
        }
    }

    /// Sets the expiry in seconds.
    #[inline]
    #[must_use]
    pub fn expiry(mut self, seconds: u32) -> Self {
        self.expiry = seconds;
        self
    }

    fn body_json(&self) -> Value {
        json!({
            "module_id": self.body.module_id,
            "command": self.body.command,
            "params": self.body.params,
        })
    }

    /// Parameters of the JSON-RPC `publish` call.
    fn rpc_params(&self) -> Value {
        let mut params = json!({
            "body": self.body_json(),
            "expiry": self.expiry,
        });
        if !self.user_ids.is_empty() {
            params["userList"] = json!(self.user_ids);
        }
        if !self.channels.is_empty() {
            let channels: Vec<String> = self
                .channels
                .iter()
                .map(|channel| format!("{}.{}", channel.public_id, channel.signature))
                .collect();
            params["channelList"] = json!(channels);
        }
        params
    }

    /// Builds the binary message, or the reason this message cannot be
    /// addressed.
    fn to_incoming(
        &self,
        resolved: &FxHashMap<UserId, PublicChannel>,
    ) -> Result<IncomingMessage> {
        let missing: Vec<UserId> = self
            .user_ids
            .iter()
            .copied()
            .filter(|user_id| !resolved.contains_key(user_id))
            .collect();
        if !missing.is_empty() {
            return Err(Error::UnresolvedReceivers { user_ids: missing });
        }

        let mut receivers = Vec::with_capacity(self.user_ids.len() + self.channels.len());
        for user_id in &self.user_ids {
            if let Some(channel) = resolved.get(user_id) {
                receivers.push(channel.to_receiver()?);
            }
        }
        for channel in &self.channels {
            receivers.push(channel.to_receiver()?);
        }

        Ok(IncomingMessage {
            receivers,
            sender: None,
            body: self.body_json().to_string(),
            expiry: self.expiry,
            kind: String::new(),
        })
    }
}

// ============================================================================
// DebugInfo
// ============================================================================

/// Snapshot of the client for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    /// User id.
    pub user_id: UserId,
    /// Site id.
    pub site_id: String,
    /// Client revision.
    pub revision: u32,
    /// Status.
    pub status: PullStatus,
    /// Active transport.
    pub connection_type: ConnectionType,
    /// Active connector connected.
    pub connected: bool,
    /// Negotiated frame format.
    pub protocol: Option<Protocol>,
    /// Server version.
    pub server_version: Option<u32>,
    /// Publishing supported and enabled.
    pub publishing_enabled: bool,
    /// Shared WebSocket-blocked flag.
    pub websocket_blocked: bool,
    /// Shared long-polling-blocked flag.
    pub long_polling_blocked: bool,
    /// Shared logging flag.
    pub logging_enabled: bool,
    /// Current subscription URL.
    pub connection_path: Option<String>,
    /// Current publication URL.
    pub publication_path: Option<String>,
    /// Remembered configuration timestamp.
    pub config_timestamp: i64,
    /// Client minus server clock, seconds.
    pub time_shift: i64,
    /// Session pointer and history.
    pub session: Session,
    /// RPC calls awaiting an answer.
    pub pending_rpc_calls: usize,
    /// Registered subscribers.
    pub subscribers: usize,
}

// ============================================================================
// PushClient
// ============================================================================

pub(crate) struct ClientInner {
    pub shared: Arc<ClientShared>,
    pub commands: mpsc::UnboundedSender<Command>,
}

/// Handle to a running push client.
///
/// Cheap to clone. The background task stops once every handle is dropped.
#[derive(Clone)]
pub struct PushClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl fmt::Debug for PushClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushClient")
            .field("user_id", &self.inner.shared.user_id)
            .field("site_id", &self.inner.shared.site_id)
            .field("status", &self.status())
            .field("connection_type", &self.connection_type())
            .finish_non_exhaustive()
    }
}

impl PushClient {
    /// Creates a client builder.
    #[inline]
    #[must_use]
    pub fn builder() -> PushClientBuilder {
        PushClientBuilder::new()
    }

    fn shared(&self) -> &ClientShared {
        &self.inner.shared
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| Error::disabled("client task has stopped"))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(make(tx))?;
        Ok(rx.await?)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts the client.
    ///
    /// Uses `config` when given and actual, else a cached actual
    /// configuration, else fetches a fresh one. Returns once connecting has
    /// begun.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if user id or site id is missing
    /// - [`Error::Disabled`] if the push server is switched off
    /// - [`Error::RevisionMismatch`] if the client disabled itself
    /// - [`Error::Auth`] if the backend refuses the session
    /// - the fetch error, if the first fetch fails (retries continue)
    pub async fn start(&self, config: Option<Configuration>) -> Result<()> {
        self.request(|reply| Command::Start { config, reply }).await?
    }

    /// Stops the client: disconnects, clears timers and fails pending RPC
    /// calls.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disabled`] if the client task has stopped.
    pub async fn stop(&self, code: u16, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.request(|reply| Command::Stop {
            code,
            reason,
            reply,
        })
        .await
    }

    /// Disconnects, refetches the configuration and connects again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disabled`] if the client task has stopped.
    pub async fn restart(&self, code: u16, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.request(|reply| Command::Restart {
            code,
            reason,
            reply,
        })
        .await
    }

    /// Disconnects and connects again after `delay` (default 1 s).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disabled`] if the client task has stopped.
    pub fn reconnect(&self, code: u16, reason: &str, delay: Option<Duration>) -> Result<()> {
        self.send_command(Command::Reconnect {
            code,
            reason: reason.to_string(),
            delay: delay.unwrap_or(super::DEFAULT_RECONNECT_DELAY),
        })
    }

    /// Closes the active connection without reconnecting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disabled`] if the client task has stopped.
    pub fn disconnect(&self, code: u16, reason: &str) -> Result<()> {
        self.send_command(Command::Disconnect {
            code,
            reason: reason.to_string(),
        })
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Registers `callback` for notifications matching `subscription`.
    pub fn subscribe<F>(&self, subscription: Subscription, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared()
            .subscribers
            .add(subscription, Arc::new(callback))
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    fn publishing_protocol(&self) -> Result<Protocol> {
        let config = self.shared().config.read();
        let config = config
            .as_ref()
            .ok_or_else(|| Error::not_connected("client is not started"))?;
        if !config.server.is_publishing_supported() {
            return Err(Error::PublishingUnsupported {
                version: config.server.version,
            });
        }
        if !config.server.publish_enabled {
            return Err(Error::PublishingDisabled);
        }
        Ok(config.protocol())
    }

    /// Publishes a message to users.
    ///
    /// # Errors
    ///
    /// - [`Error::PublishingDisabled`] / [`Error::PublishingUnsupported`]
    ///   before any network call
    /// - [`Error::UnresolvedReceivers`] if a user has no public channel
    /// - [`Error::NotConnected`] / [`Error::RpcTimeout`] on delivery failure
    pub async fn send_message(
        &self,
        user_ids: &[UserId],
        module_id: &str,
        command: &str,
        params: Value,
        expiry: u32,
    ) -> Result<()> {
        let message = PublishMessage::to_users(user_ids, module_id, command, params).expiry(expiry);
        self.send_one(message).await
    }

    /// Publishes a message to public channels.
    ///
    /// # Errors
    ///
    /// As [`PushClient::send_message`].
    pub async fn send_message_to_channels(
        &self,
        channels: &[PublicChannel],
        module_id: &str,
        command: &str,
        params: Value,
        expiry: u32,
    ) -> Result<()> {
        let message =
            PublishMessage::to_channels(channels, module_id, command, params).expiry(expiry);
        self.send_one(message).await
    }

    async fn send_one(&self, message: PublishMessage) -> Result<()> {
        match self.publishing_protocol()? {
            Protocol::JsonRpc => self
                .shared()
                .rpc
                .execute_outgoing(method::PUBLISH, message.rpc_params(), DEFAULT_RPC_TIMEOUT)
                .await
                .map(drop),
            _ => self
                .send_message_batch(vec![message])
                .await?
                .pop()
                .unwrap_or(Ok(())),
        }
    }

    /// Publishes several messages.
    ///
    /// Returns one result per message: a message whose users cannot all be
    /// addressed fails alone.
    ///
    /// # Errors
    ///
    /// Fails as a whole if publishing is unavailable or the frame cannot be
    /// sent.
    pub async fn send_message_batch(
        &self,
        messages: Vec<PublishMessage>,
    ) -> Result<Vec<Result<()>>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        if self.publishing_protocol()? == Protocol::JsonRpc {
            let calls = messages
                .iter()
                .map(|message| RpcCall::new(method::PUBLISH, message.rpc_params()))
                .collect();
            let results = join_all(
                self.shared()
                    .rpc
                    .execute_outgoing_batch(calls, DEFAULT_RPC_TIMEOUT),
            )
            .await;
            return Ok(results.into_iter().map(|result| result.map(drop)).collect());
        }

        let mut user_ids: Vec<UserId> = messages
            .iter()
            .flat_map(|message| message.user_ids.iter().copied())
            .collect();
        user_ids.sort_unstable();
        user_ids.dedup();

        let resolved = if user_ids.is_empty() {
            FxHashMap::default()
        } else {
            self.shared().resolver.resolve_public_ids(&user_ids).await
        };

        let mut results = Vec::with_capacity(messages.len());
        let mut incoming = Vec::new();
        for message in &messages {
            match message.to_incoming(&resolved) {
                Ok(encoded) => {
                    incoming.push(encoded);
                    results.push(Ok(()));
                }
                Err(e) => results.push(Err(e)),
            }
        }

        if !incoming.is_empty() {
            let count = incoming.len();
            let frame = Frame::Binary(RequestBatch::publish(incoming).encode());
            if !self.shared().active_connector().send(frame) {
                return Err(Error::not_connected("cannot publish"));
            }
            debug!(count, "Published messages");
        }

        Ok(results)
    }

    // ========================================================================
    // JSON-RPC
    // ========================================================================

    async fn call_rpc(&self, method: &str, params: Value) -> Result<Value> {
        if !self.is_json_rpc() {
            return Err(Error::unsupported(format!("{method} requires JSON-RPC")));
        }
        self.shared()
            .rpc
            .execute_outgoing(method, params, DEFAULT_RPC_TIMEOUT)
            .await
    }

    /// Round trip to the push-server.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] outside JSON-RPC mode; RPC errors otherwise.
    pub async fn ping(&self) -> Result<()> {
        self.call_rpc(method::PING, json!({})).await.map(drop)
    }

    /// Channels of this connection as reported by the server.
    ///
    /// # Errors
    ///
    /// As [`PushClient::ping`].
    pub async fn list_channels(&self) -> Result<Value> {
        self.call_rpc(method::LIST_CHANNELS, json!({})).await
    }

    /// Last-seen timestamps of `user_ids`. Unknown users are absent.
    ///
    /// # Errors
    ///
    /// As [`PushClient::ping`], or [`Error::Json`] for an unexpected answer.
    pub async fn get_users_last_seen(&self, user_ids: &[UserId]) -> Result<FxHashMap<UserId, i64>> {
        let result = self
            .call_rpc(method::GET_USERS_LAST_SEEN, json!({"userList": user_ids}))
            .await?;
        match result {
            Value::Array(items) if items.is_empty() => Ok(FxHashMap::default()),
            other => Ok(serde_json::from_value(other)?),
        }
    }

    /// Asks the server to report status changes of `user_id`.
    ///
    /// # Errors
    ///
    /// As [`PushClient::ping`].
    pub async fn subscribe_user_status_change(&self, user_id: UserId) -> Result<()> {
        self.call_rpc(method::SUBSCRIBE_STATUS_CHANGE, json!({"userId": user_id}))
            .await
            .map(drop)
    }

    /// Stops status change reports for `user_id`.
    ///
    /// # Errors
    ///
    /// As [`PushClient::ping`].
    pub async fn unsubscribe_user_status_change(&self, user_id: UserId) -> Result<()> {
        self.call_rpc(method::UNSUBSCRIBE_STATUS_CHANGE, json!({"userId": user_id}))
            .await
            .map(drop)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Subscription URL for `connection_type`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] without a usable configuration.
    pub fn get_connection_path(&self, connection_type: ConnectionType) -> Result<String> {
        let shared = self.shared();
        let config = shared.config.read();
        let config = config
            .as_ref()
            .ok_or_else(|| Error::config("no configuration loaded"))?;
        config.connection_path(connection_type, shared.secure, &shared.session.lock())
    }

    /// Publication URL.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] without a usable configuration.
    pub fn get_publication_path(&self) -> Result<String> {
        let shared = self.shared();
        let config = shared.config.read();
        config
            .as_ref()
            .ok_or_else(|| Error::config("no configuration loaded"))?
            .publication_path(shared.secure)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PullStatus {
        *self.shared().status.read()
    }

    /// Active transport.
    #[must_use]
    pub fn connection_type(&self) -> ConnectionType {
        self.shared().connection_type()
    }

    /// Returns `true` while the active connector is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared().active_connector().connected()
    }

    /// Returns `true` if publishing is supported and enabled.
    #[must_use]
    pub fn is_publishing_enabled(&self) -> bool {
        self.shared()
            .config
            .read()
            .as_ref()
            .is_some_and(Configuration::is_publishing_enabled)
    }

    /// Returns `true` in JSON-RPC mode.
    #[must_use]
    pub fn is_json_rpc(&self) -> bool {
        self.shared().protocol() == Some(Protocol::JsonRpc)
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> Option<Configuration> {
        self.shared().config.read().clone()
    }

    /// Switches host log output for every client of this user and site.
    pub fn set_logging_enabled(&self, enabled: bool) {
        self.shared().storage.set_logging_enabled(enabled);
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn debug_info(&self) -> DebugInfo {
        let shared = self.shared();
        let (protocol, server_version, time_shift) = shared
            .config
            .read()
            .as_ref()
            .map_or((None, None, 0), |config| {
                (
                    Some(config.protocol()),
                    Some(config.server.version),
                    config.time_shift,
                )
            });
        let connection_type = self.connection_type();

        DebugInfo {
            user_id: shared.user_id,
            site_id: shared.site_id.clone(),
            revision: REVISION,
            status: self.status(),
            connection_type,
            connected: self.is_connected(),
            protocol,
            server_version,
            publishing_enabled: self.is_publishing_enabled(),
            websocket_blocked: shared.storage.is_websocket_blocked(),
            long_polling_blocked: shared.storage.is_long_polling_blocked(),
            logging_enabled: shared.storage.is_logging_enabled(),
            connection_path: self.get_connection_path(connection_type).ok(),
            publication_path: self.get_publication_path().ok(),
            config_timestamp: shared.remembered_timestamp(),
            time_shift,
            session: shared.session.lock().clone(),
            pending_rpc_calls: shared.rpc.pending_count(),
            subscribers: shared.subscribers.len(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::client::testing::{Harness, binary_config, json_rpc_config, public_channel};
    use crate::protocol::binary::Request;

    #[tokio::test]
    async fn test_publishing_disabled_fails_without_network() {
        let mut config = binary_config();
        config.server.publish_enabled = false;
        let harness = Harness::new(config);
        harness.client.start(None).await.expect("start");
        harness.wait_online().await;

        let err = harness
            .client
            .send_message(&[42], "crm", "fieldUpdated", json!({"id": 1}), 0)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PublishingDisabled));
        assert_eq!(harness.public_ids.calls.load(Ordering::SeqCst), 0);
        assert!(harness.websocket().sent().is_empty());
    }

    #[tokio::test]
    async fn test_old_server_cannot_publish() {
        let mut config = binary_config();
        config.server.version = 3;
        let harness = Harness::new(config);
        harness.client.start(None).await.expect("start");

        let err = harness
            .client
            .send_message(&[42], "crm", "fieldUpdated", json!({}), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublishingUnsupported { version: 3 }));
    }

    #[tokio::test]
    async fn test_binary_publish_resolves_public_ids() {
        let harness = Harness::new(binary_config());
        harness.public_ids.insert(public_channel(42));
        harness.client.start(None).await.expect("start");
        harness.wait_online().await;

        harness
            .client
            .send_message(&[42], "crm", "fieldUpdated", json!({"id": 1}), 60)
            .await
            .expect("publish");

        let sent = harness.websocket().sent();
        assert_eq!(sent.len(), 1);
        let Frame::Binary(data) = &sent[0] else {
            panic!("expected a binary frame");
        };
        let batch = RequestBatch::decode(data).expect("decode");
        let Request::IncomingMessages(messages) = &batch.requests[0] else {
            panic!("expected incoming messages");
        };
        assert_eq!(messages[0].receivers[0].id, vec![1, 2, 3]);
        assert_eq!(messages[0].expiry, 60);
        let body: Value = serde_json::from_str(&messages[0].body).expect("json body");
        assert_eq!(body["module_id"], "crm");
        assert_eq!(body["params"]["id"], 1);
    }

    #[tokio::test]
    async fn test_unresolved_user_fails_only_its_message() {
        let harness = Harness::new(binary_config());
        harness.public_ids.insert(public_channel(1));
        harness.client.start(None).await.expect("start");
        harness.wait_online().await;

        let results = harness
            .client
            .send_message_batch(vec![
                PublishMessage::to_users(vec![1], "crm", "a", json!({})),
                PublishMessage::to_users(vec![2], "crm", "b", json!({})),
            ])
            .await
            .expect("batch");

        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(Error::UnresolvedReceivers { user_ids }) if user_ids == &vec![2]
        ));
        assert_eq!(harness.websocket().sent().len(), 1);
    }

    #[tokio::test]
    async fn test_json_rpc_publish_goes_through_rpc() {
        let harness = Harness::new(json_rpc_config());
        harness.client.start(None).await.expect("start");
        harness.wait_online().await;

        let client = harness.client.clone();
        let publish = tokio::spawn(async move {
            client
                .send_message(&[42], "crm", "fieldUpdated", json!({"id": 1}), 0)
                .await
        });

        let request = harness.websocket().wait_sent_text().await;
        let request: Value = serde_json::from_str(&request).expect("json");
        assert_eq!(request["method"], "publish");
        assert_eq!(request["params"]["userList"], json!([42]));
        assert_eq!(request["params"]["body"]["command"], "fieldUpdated");

        let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {}});
        harness.websocket().deliver(Frame::Text(reply.to_string()));
        publish.await.expect("join").expect("publish");
        assert_eq!(harness.public_ids.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rpc_helpers_require_json_rpc() {
        let harness = Harness::new(binary_config());
        harness.client.start(None).await.expect("start");
        assert!(matches!(
            harness.client.ping().await,
            Err(Error::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_connection_paths_follow_config() {
        let harness = Harness::new(binary_config());
        assert!(harness.client.get_connection_path(ConnectionType::WebSocket).is_err());
        harness.client.start(None).await.expect("start");

        let path = harness
            .client
            .get_connection_path(ConnectionType::WebSocket)
            .expect("path");
        assert!(path.contains("CHANNEL_ID=abc"));
        assert!(path.contains("binaryMode=true"));
        assert!(path.contains("revision=19"));
        assert!(!path.contains("token="));

        let publication = harness.client.get_publication_path().expect("publication");
        assert!(publication.contains("CHANNEL_ID=abc"));
    }

    #[tokio::test]
    async fn test_debug_info_snapshot() {
        let harness = Harness::new(json_rpc_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        harness.client.subscribe(Subscription::status(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        harness.client.start(None).await.expect("start");
        harness.wait_online().await;

        let info = harness.client.debug_info();
        assert_eq!(info.revision, 19);
        assert_eq!(info.status, PullStatus::Online);
        assert_eq!(info.protocol, Some(Protocol::JsonRpc));
        assert!(info.connected);
        assert_eq!(info.subscribers, 1);
        assert!(info.connection_path.is_some());
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert!(serde_json::to_value(&info).is_ok());
    }

    #[tokio::test]
    async fn test_logging_flag_is_shared() {
        let harness = Harness::new(binary_config());
        harness.client.set_logging_enabled(true);
        assert!(harness.client.debug_info().logging_enabled);
        harness.client.set_logging_enabled(false);
        assert!(!harness.client.debug_info().logging_enabled);
    }
}
