//! Builder pattern for client configuration.
//!
//! # Example
//!
//! ```no_run
//! use push_client::{PushClient, RestApi};
//!
//! # fn example() -> push_client::Result<()> {
//! let client = PushClient::builder()
//!     .user_id(42)
//!     .site_id("s1")
//!     .rest_api(RestApi::new("https://portal.example/rest"))
//!     .secure(true)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{ChannelResolver, PublicChannel, PublicIdSource, Session};
use crate::config::{ConfigSource, Configuration, RestApi};
use crate::error::{Error, Result};
use crate::identifiers::UserId;
use crate::logging::{HostLog, Logger, NoopLogger};
use crate::protocol::jsonrpc::method;
use crate::rpc::{FrameSender, JsonRpc};
use crate::storage::{KeyValueStore, MemoryStore, SharedConfig};
use crate::transport::{
    ConnectionType, ConnectorContext, ConnectorFactory, EventSink, HttpClient, PathProvider,
    ReqwestHttpClient, TransportEvent, long_polling_factory, websocket_factory,
};

use super::core::{ClientInner, ClientShared, PushClient, Transports};
use super::event_loop::{EventLoop, Inbox, LoopOptions, incoming_message_handler};
use super::status::PullStatus;
use super::subscribers::SubscriberRegistry;

// ============================================================================
// PushClientBuilder
// ============================================================================

/// Builder for a [`PushClient`].
///
/// Use [`PushClient::builder()`] to create one.
pub struct PushClientBuilder {
    user_id: UserId,
    site_id: String,
    config_source: Option<Arc<dyn ConfigSource>>,
    public_id_source: Option<Arc<dyn PublicIdSource>>,
    store: Option<Arc<dyn KeyValueStore>>,
    logger: Option<Arc<dyn Logger>>,
    http: Option<Arc<dyn HttpClient>>,
    websocket_factory: ConnectorFactory,
    long_polling_factory: ConnectorFactory,
    server_enabled: bool,
    secure: bool,
    websocket_supported: bool,
    debug: bool,
    config_timestamp: i64,
}

impl Default for PushClientBuilder {
    fn default() -> Self {
        Self {
            user_id: 0,
            site_id: String::new(),
            config_source: None,
            public_id_source: None,
            store: None,
            logger: None,
            http: None,
            websocket_factory: websocket_factory(),
            long_polling_factory: long_polling_factory(),
            server_enabled: true,
            secure: false,
            websocket_supported: true,
            debug: false,
            config_timestamp: 0,
        }
    }
}

impl fmt::Debug for PushClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushClientBuilder")
            .field("user_id", &self.user_id)
            .field("site_id", &self.site_id)
            .field("server_enabled", &self.server_enabled)
            .field("secure", &self.secure)
            .field("websocket_supported", &self.websocket_supported)
            .field("debug", &self.debug)
            .field("config_timestamp", &self.config_timestamp)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PushClientBuilder Implementation
// ============================================================================

impl PushClientBuilder {
    /// Creates a builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current user. Required.
    #[inline]
    #[must_use]
    pub fn user_id(mut self, user_id: UserId) -> Self {
        self.user_id = user_id;
        self
    }

    /// Sets the site. Required.
    #[inline]
    #[must_use]
    pub fn site_id(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = site_id.into();
        self
    }

    /// Sets the backend issuing configurations. Required.
    #[inline]
    #[must_use]
    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    /// Sets the backend resolving public channels.
    #[inline]
    #[must_use]
    pub fn public_id_source(mut self, source: Arc<dyn PublicIdSource>) -> Self {
        self.public_id_source = Some(source);
        self
    }

    /// Uses `api` for both configurations and public channels.
    #[must_use]
    pub fn rest_api(self, api: RestApi) -> Self {
        let api = Arc::new(api);
        self.config_source(Arc::clone(&api) as Arc<dyn ConfigSource>)
            .public_id_source(api)
    }

    /// Sets the key-value store shared between clients.
    ///
    /// Defaults to a private [`MemoryStore`].
    #[inline]
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the host logger.
    #[inline]
    #[must_use]
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Sets the HTTP client of the long-polling transport.
    #[inline]
    #[must_use]
    pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Replaces the WebSocket connector.
    #[inline]
    #[must_use]
    pub fn websocket_factory(mut self, factory: ConnectorFactory) -> Self {
        self.websocket_factory = factory;
        self
    }

    /// Replaces the long-polling connector.
    #[inline]
    #[must_use]
    pub fn long_polling_factory(mut self, factory: ConnectorFactory) -> Self {
        self.long_polling_factory = factory;
        self
    }

    /// When `false`, [`PushClient::start`] fails with [`Error::Disabled`].
    #[inline]
    #[must_use]
    pub fn server_enabled(mut self, enabled: bool) -> Self {
        self.server_enabled = enabled;
        self
    }

    /// Selects the secure endpoints.
    #[inline]
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// When `false`, only long polling is used.
    #[inline]
    #[must_use]
    pub fn websocket_supported(mut self, supported: bool) -> Self {
        self.websocket_supported = supported;
        self
    }

    /// Forces host logging on.
    #[inline]
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Oldest acceptable configuration timestamp.
    #[inline]
    #[must_use]
    pub fn config_timestamp(mut self, timestamp: i64) -> Self {
        self.config_timestamp = timestamp;
        self
    }

    /// Builds the client and spawns its event loop on the current runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] outside a Tokio runtime or without a config source
    /// - [`Error::Http`] if the default HTTP client cannot be created
    pub fn build(self) -> Result<PushClient> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::config("PushClient must be built inside a Tokio runtime"))?;
        let config_source = self.config_source.ok_or_else(|| {
            Error::config(
                "A configuration source is required. Use .rest_api() or .config_source() to set it.",
            )
        })?;
        let public_id_source = self
            .public_id_source
            .unwrap_or_else(|| Arc::new(NoPublicIds));
        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new()?),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let logger = self.logger.unwrap_or_else(|| Arc::new(NoopLogger));

        let config: Arc<RwLock<Option<Configuration>>> = Arc::new(RwLock::new(None));
        let session = Arc::new(Mutex::new(Session::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let context = |connection_type: ConnectionType| ConnectorContext {
            events: EventSink::new(connection_type, event_tx.clone()),
            path: connection_path(&config, &session, connection_type, self.secure),
            publish_path: publication_path(&config, self.secure),
            http: Arc::clone(&http),
        };
        let transports = Arc::new(RwLock::new(Transports {
            websocket: (self.websocket_factory)(context(ConnectionType::WebSocket)),
            long_polling: (self.long_polling_factory)(context(ConnectionType::LongPolling)),
            active: ConnectionType::WebSocket,
        }));

        let sender: FrameSender = {
            let transports = Arc::clone(&transports);
            Arc::new(move |frame| {
                let connector = {
                    let transports = transports.read();
                    Arc::clone(transports.get(transports.active))
                };
                connector.send(frame)
            })
        };
        let rpc = JsonRpc::new(sender);
        let inbox: Inbox = Arc::default();
        rpc.handle(
            method::INCOMING_MESSAGE,
            incoming_message_handler(Arc::clone(&inbox), Arc::clone(&transports)),
        );

        let storage = SharedConfig::new(store, self.user_id, &self.site_id);
        let shared = Arc::new(ClientShared {
            user_id: self.user_id,
            site_id: self.site_id,
            secure: self.secure,
            config,
            session,
            transports,
            status: RwLock::new(PullStatus::Offline),
            remembered_timestamp: AtomicI64::new(self.config_timestamp),
            rpc,
            resolver: ChannelResolver::new(public_id_source),
            subscribers: SubscriberRegistry::new(),
            log: HostLog::new(logger, self.debug, storage.clone()),
            storage,
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let options = LoopOptions {
            server_enabled: self.server_enabled,
            websocket_supported: self.websocket_supported,
        };
        let event_loop = EventLoop::new(
            Arc::clone(&shared),
            config_source,
            options,
            internal_tx,
            inbox,
        );
        runtime.spawn(event_loop.run(command_rx, event_rx, internal_rx));
        debug!(user_id = shared.user_id, site_id = %shared.site_id, "Push client built");

        Ok(PushClient {
            inner: Arc::new(ClientInner {
                shared,
                commands: command_tx,
            }),
        })
    }
}

// ============================================================================
// Path Providers
// ============================================================================

fn connection_path(
    config: &Arc<RwLock<Option<Configuration>>>,
    session: &Arc<Mutex<Session>>,
    connection_type: ConnectionType,
    secure: bool,
) -> PathProvider {
    let config = Arc::clone(config);
    let session = Arc::clone(session);
    Arc::new(move || {
        let config = config.read();
        config
            .as_ref()
            .ok_or_else(|| Error::config("no configuration loaded"))?
            .connection_path(connection_type, secure, &session.lock())
    })
}

fn publication_path(config: &Arc<RwLock<Option<Configuration>>>, secure: bool) -> PathProvider {
    let config = Arc::clone(config);
    Arc::new(move || {
        config
            .read()
            .as_ref()
            .ok_or_else(|| Error::config("no configuration loaded"))?
            .publication_path(secure)
    })
}

/// Source used when the host resolves no public channels.
struct NoPublicIds;

#[async_trait]
impl PublicIdSource for NoPublicIds {
    async fn fetch_public_ids(
        &self,
        _user_ids: &[UserId],
    ) -> Result<FxHashMap<UserId, PublicChannel>> {
        Err(Error::config("no public id source configured"))
    }
}

// ============================================================================
// Tests
// ============================================================================
