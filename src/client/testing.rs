//! In-memory collaborators for client tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::channel::{PublicChannel, PublicIdSource};
use crate::config::{ChannelInfo, Channels, ConfigSource, Configuration, FetchedConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::identifiers::UserId;
use crate::storage::{KeyValueStore, MemoryStore, SharedConfig};
use crate::transport::{
    ConnectionType, Connector, ConnectorContext, ConnectorEvent, ConnectorFactory, Frame,
};

use super::builder::PushClientBuilder;
use super::core::PushClient;
use super::status::PullStatus;
use super::subscribers::{Notification, Subscription};

// ============================================================================
// FakeConnector
// ============================================================================

/// Scriptable connector. Connects instantly unless told otherwise.
pub(crate) struct FakeConnector {
    context: ConnectorContext,
    pub auto_open: AtomicBool,
    pub fail_connect: AtomicBool,
    connecting: AtomicBool,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: Mutex<Vec<(u16, String)>>,
    sent: Mutex<Vec<Frame>>,
    paths: Mutex<Vec<String>>,
}

impl FakeConnector {
    fn new(context: ConnectorContext) -> Self {
        Self {
            context,
            auto_open: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
        }
    }

    /// Completes a pending connect.
    pub fn open(&self) {
        self.connecting.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.context.events.emit(ConnectorEvent::Open);
    }

    /// Completes a pending connect and waits until the client handled it.
    pub async fn open_handled(&self) {
        self.connecting.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.context.events.emit_tracked(ConnectorEvent::Open).await;
    }

    /// Delivers a frame from the server.
    pub fn deliver(&self, frame: Frame) {
        self.context.events.emit(ConnectorEvent::Message(frame));
    }

    /// Delivers a frame and waits until the client handled it.
    pub async fn deliver_handled(&self, frame: Frame) {
        let _ = self
            .context
            .events
            .emit_tracked(ConnectorEvent::Message(frame))
            .await;
    }

    /// Reports a last message id without data.
    pub fn report_last_message_id(&self, mid: &str) {
        self.context
            .events
            .emit(ConnectorEvent::LastMessageId(mid.to_string()));
    }

    /// Simulates the server closing the connection.
    pub fn close_remote(&self, code: u16, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.context.events.emit(ConnectorEvent::Disconnect {
            code,
            reason: reason.to_string(),
        });
    }

    /// Simulates a transport failure.
    pub fn fail(&self, message: &str) {
        self.connecting.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.context
            .events
            .emit(ConnectorEvent::Error(Error::connection(message)));
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(text.clone()),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    pub fn disconnects(&self) -> Vec<(u16, String)> {
        self.disconnects.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }

    /// Waits for the first text frame and returns it.
    pub async fn wait_sent_text(&self) -> String {
        self.wait_sent_matching(|_| true).await
    }

    /// Waits for a text frame satisfying `predicate`.
    pub async fn wait_sent_matching(&self, predicate: impl Fn(&str) -> bool) -> String {
        for _ in 0..WAIT_ROUNDS {
            if let Some(text) = self.sent_texts().into_iter().find(|text| predicate(text)) {
                return text;
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        panic!("no matching frame was sent");
    }
}

impl Connector for FakeConnector {
    fn connect(&self) {
        if self.connecting.load(Ordering::SeqCst) || self.connected.load(Ordering::SeqCst) {
            return;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        match (self.context.path)() {
            Ok(path) => self.paths.lock().push(path),
            Err(e) => {
                self.context.events.emit(ConnectorEvent::Error(e));
                return;
            }
        }

        if self.fail_connect.load(Ordering::SeqCst) {
            self.context
                .events
                .emit(ConnectorEvent::Error(Error::connection("connection refused")));
        } else if self.auto_open.load(Ordering::SeqCst) {
            self.open();
        } else {
            self.connecting.store(true, Ordering::SeqCst);
        }
    }

    fn disconnect(&self, code: u16, reason: &str) {
        self.disconnects.lock().push((code, reason.to_string()));
        self.connecting.store(false, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.context.events.emit(ConnectorEvent::Disconnect {
                code,
                reason: reason.to_string(),
            });
        }
    }

    fn send(&self, frame: Frame) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().push(frame);
        true
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_type(&self) -> ConnectionType {
        self.context.events.source()
    }
}

type Slot = Arc<Mutex<Option<Arc<FakeConnector>>>>;

fn fake_factory(slot: &Slot) -> ConnectorFactory {
    let slot = Arc::clone(slot);
    Arc::new(move |context: ConnectorContext| {
        let connector = Arc::new(FakeConnector::new(context));
        *slot.lock() = Some(Arc::clone(&connector));
        connector as Arc<dyn Connector>
    })
}

// ============================================================================
// Backends
// ============================================================================

/// Config source returning a fixed configuration.
pub(crate) struct FakeConfigSource {
    config: Mutex<Option<Configuration>>,
    pub calls: AtomicUsize,
    auth_failure: AtomicBool,
    transient_failures: AtomicUsize,
}

impl FakeConfigSource {
    pub fn new(config: Option<Configuration>) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            calls: AtomicUsize::new(0),
            auth_failure: AtomicBool::new(false),
            transient_failures: AtomicUsize::new(0),
        })
    }

    pub fn set_config(&self, config: Configuration) {
        *self.config.lock() = Some(config);
    }

    pub fn fail_auth(&self, fail: bool) {
        self.auth_failure.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for FakeConfigSource {
    async fn fetch_config(&self) -> Result<FetchedConfig> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.auth_failure.load(Ordering::SeqCst) {
            return Err(Error::auth(401, "session expired"));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::connection("backend unavailable"));
        }
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| Error::connection("no configuration"))?;
        Ok(FetchedConfig {
            config,
            server_time: None,
        })
    }
}

/// Public id lookup backed by a map.
#[derive(Default)]
pub(crate) struct FakePublicIds {
    channels: Mutex<FxHashMap<UserId, PublicChannel>>,
    pub calls: AtomicUsize,
}

impl FakePublicIds {
    pub fn insert(&self, channel: PublicChannel) {
        self.channels.lock().insert(channel.user_id, channel);
    }
}

#[async_trait]
impl PublicIdSource for FakePublicIds {
    async fn fetch_public_ids(
        &self,
        user_ids: &[UserId],
    ) -> Result<FxHashMap<UserId, PublicChannel>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let channels = self.channels.lock();
        Ok(user_ids
            .iter()
            .filter_map(|id| channels.get(id).map(|channel| (*id, channel.clone())))
            .collect())
    }
}

// ============================================================================
// Configurations
// ============================================================================

pub(crate) fn private_channel(id: &str) -> ChannelInfo {
    ChannelInfo {
        id: id.to_string(),
        signature: None,
        start: None,
        end: Utc::now() + TimeDelta::hours(12),
        kind: Some("private".to_string()),
    }
}

fn config_with_version(version: u32) -> Configuration {
    Configuration {
        channels: Channels {
            private: Some(private_channel("abc")),
            shared: None,
        },
        server: ServerConfig {
            version,
            websocket: Some("ws://push.local/sub/".to_string()),
            long_pooling: Some("http://push.local/sub/".to_string()),
            publish: Some("http://push.local/pub/".to_string()),
            websocket_enabled: true,
            publish_enabled: true,
            config_timestamp: 100,
            ..ServerConfig::default()
        },
        ..Configuration::default()
    }
}

pub(crate) fn text_config() -> Configuration {
    config_with_version(3)
}

pub(crate) fn binary_config() -> Configuration {
    config_with_version(4)
}

pub(crate) fn json_rpc_config() -> Configuration {
    config_with_version(5)
}

/// Public channel `AQID` (`[1, 2, 3]`) valid for the next hour.
pub(crate) fn public_channel(user_id: UserId) -> PublicChannel {
    let now = Utc::now();
    PublicChannel {
        user_id,
        public_id: "AQID".to_string(),
        signature: "BAU=".to_string(),
        start: now - TimeDelta::hours(1),
        end: now + TimeDelta::hours(1),
    }
}

// ============================================================================
// Harness
// ============================================================================

const WAIT_ROUNDS: usize = 200;
const WAIT_STEP: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds.
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..WAIT_ROUNDS {
        if condition() {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("condition was not met in time");
}

/// A client wired to fakes.
pub(crate) struct Harness {
    pub client: PushClient,
    pub config_source: Arc<FakeConfigSource>,
    pub public_ids: Arc<FakePublicIds>,
    pub store: Arc<MemoryStore>,
    websocket: Slot,
    long_polling: Slot,
}

impl Harness {
    pub fn new(config: Configuration) -> Self {
        Self::with(config, |builder| builder)
    }

    pub fn with(
        config: Configuration,
        customize: impl FnOnce(PushClientBuilder) -> PushClientBuilder,
    ) -> Self {
        let config_source = FakeConfigSource::new(Some(config));
        let public_ids = Arc::new(FakePublicIds::default());
        let store = Arc::new(MemoryStore::new());
        let websocket = Slot::default();
        let long_polling = Slot::default();

        let builder = PushClient::builder()
            .user_id(1)
            .site_id("s1")
            .config_source(Arc::clone(&config_source) as Arc<dyn ConfigSource>)
            .public_id_source(Arc::clone(&public_ids) as Arc<dyn PublicIdSource>)
            .store(Arc::clone(&store) as Arc<dyn KeyValueStore>)
            .websocket_factory(fake_factory(&websocket))
            .long_polling_factory(fake_factory(&long_polling));
        let client = customize(builder).build().expect("build client");

        Self {
            client,
            config_source,
            public_ids,
            store,
            websocket,
            long_polling,
        }
    }

    pub fn websocket(&self) -> Arc<FakeConnector> {
        self.websocket.lock().clone().expect("websocket connector")
    }

    pub fn long_polling(&self) -> Arc<FakeConnector> {
        self.long_polling.lock().clone().expect("long-polling connector")
    }

    /// Flags as seen by this client's user and site.
    pub fn shared_config(&self) -> SharedConfig {
        SharedConfig::new(Arc::clone(&self.store) as Arc<dyn KeyValueStore>, 1, "s1")
    }

    /// Flags as another client sharing the store sees them.
    pub fn other_tab(&self) -> SharedConfig {
        SharedConfig::new(Arc::new(self.store.fork()), 1, "s1")
    }

    /// Records every notification of `subscription`.
    pub fn record(&self, subscription: Subscription) -> Arc<Mutex<Vec<Notification>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let _handle = self.client.subscribe(subscription, move |notification| {
            sink.lock().push(notification.clone());
        });
        log
    }

    pub async fn wait_online(&self) {
        wait_for(|| self.client.status() == PullStatus::Online).await;
    }
}
