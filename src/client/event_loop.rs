//! Orchestrator actor.
//!
//! One task owns every lifecycle decision. It reacts to:
//!
//! | Source | Examples |
//! |--------|----------|
//! | [`Command`] | `start`, `stop`, `restart`, `reconnect`, `disconnect` |
//! | [`TransportEvent`] | open, frames, errors, closes of both connectors |
//! | [`Internal`] | timer firings, finished config fetches, storage signals |
//!
//! Events from the inactive connector are ignored, except a WebSocket open
//! while long-polling, which completes a restore.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::config::{ChannelInfo, ConfigSource, Configuration, Protocol, REVISION};
use crate::error::{Error, Result};
use crate::logging::LogLevel;
use crate::protocol::jsonrpc::{JSON_RPC_PING, JSON_RPC_PONG};
use crate::protocol::message::{INTERNAL_MODULE, ONLINE_MODULE};
use crate::protocol::{EventBody, PushMessage, RpcError, SenderInfo, binary, text};
use crate::transport::close_code::{
    CHANNEL_EXPIRED, CONFIG_EXPIRED, CONFIG_REPLACED, NORMAL_CLOSURE, SERVER_RESTARTED, STUCK,
    WRONG_CHANNEL_ID,
};
use crate::transport::{ConnectionType, ConnectorEvent, Frame, TransportEvent};

use super::core::{ClientShared, SharedTransports};
use super::status::{PullStatus, backoff_delay};
use super::subscribers::{Notification, SubscriptionKind};
use super::{
    CONFIG_CHECK_INTERVAL, DEFAULT_RECONNECT_DELAY, OFFLINE_STATUS_DELAY, ONLINE_MAX_AGE_SECS,
    PING_TIMEOUT, RESTORE_WEBSOCKET_TIMEOUT, SERVER_RESTART_MAX_DELAY,
};

// ============================================================================
// Messages
// ============================================================================

/// Lifecycle request from a [`PushClient`](super::PushClient) handle.
pub(crate) enum Command {
    Start {
        config: Option<Configuration>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        code: u16,
        reason: String,
        reply: oneshot::Sender<()>,
    },
    Restart {
        code: u16,
        reason: String,
        reply: oneshot::Sender<()>,
    },
    Reconnect {
        code: u16,
        reason: String,
        delay: Duration,
    },
    Disconnect {
        code: u16,
        reason: String,
    },
}

/// Signals produced by the actor's own helpers.
pub(crate) enum Internal {
    Timer { kind: TimerKind, generation: u64 },
    ConfigLoaded {
        generation: u64,
        result: Result<Configuration>,
    },
    WebSocketBlocked(bool),
}

/// Messages received through `incoming.message`, drained after each frame.
pub(crate) type Inbox = Arc<Mutex<Vec<PushMessage>>>;

// ============================================================================
// Timers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    Reconnect,
    Restart,
    RestoreWebSocket,
    ConfigCheck,
    PingWait,
    OfflineStatus,
}

/// One-shot timers keyed by kind. Rescheduling replaces the previous timer;
/// a firing whose generation no longer matches is stale and dropped.
struct Timers {
    tx: mpsc::UnboundedSender<Internal>,
    next_generation: u64,
    active: FxHashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl Timers {
    fn new(tx: mpsc::UnboundedSender<Internal>) -> Self {
        Self {
            tx,
            next_generation: 0,
            active: FxHashMap::default(),
        }
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Internal::Timer { kind, generation });
        });
        self.active.insert(kind, (generation, handle));
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.active.remove(&kind) {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }

    fn is_pending(&self, kind: TimerKind) -> bool {
        self.active.contains_key(&kind)
    }

    /// Returns `true` and forgets the timer if this firing is current.
    fn take_fired(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.active.get(&kind) {
            Some((current, _)) if *current == generation => {
                self.active.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// incoming.message
// ============================================================================

#[derive(Debug, Deserialize)]
struct IncomingRpcMessage {
    mid: String,
    body: EventBody,
    #[serde(default)]
    sender: Option<SenderInfo>,
    #[serde(default)]
    user_params: Option<Map<String, Value>>,
    #[serde(default)]
    dictionary: Option<Map<String, Value>>,
}

impl IncomingRpcMessage {
    fn into_push_message(self) -> PushMessage {
        let mut body = self.body;
        if self.sender.is_some() {
            body.extra.sender = self.sender;
        }
        for extra_params in [self.user_params, self.dictionary].into_iter().flatten() {
            if !body.params.is_object() {
                body.params = Value::Object(Map::new());
            }
            if let Value::Object(params) = &mut body.params {
                params.extend(extra_params);
            }
        }
        PushMessage::new(self.mid, body)
    }
}

/// Handler for the server-initiated `incoming.message` call.
///
/// Queues the message for the actor and acknowledges it with `mack:<mid>`
/// on the active connector.
pub(crate) fn incoming_message_handler(
    inbox: Inbox,
    transports: SharedTransports,
) -> impl Fn(Value) -> std::result::Result<Value, RpcError> + Send + Sync + 'static {
    move |params| {
        let incoming: IncomingRpcMessage = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(e.to_string()))?;
        let ack = Frame::Text(format!("mack:{}", incoming.mid));
        inbox.lock().push(incoming.into_push_message());

        let connector = {
            let transports = transports.read();
            Arc::clone(transports.get(transports.active))
        };
        if !connector.send(ack) {
            warn!("Could not acknowledge incoming message");
        }
        Ok(json!({}))
    }
}

// ============================================================================
// EventLoop
// ============================================================================

/// Switches fixed at build time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopOptions {
    pub server_enabled: bool,
    pub websocket_supported: bool,
}

pub(crate) struct EventLoop {
    shared: Arc<ClientShared>,
    source: Arc<dyn ConfigSource>,
    options: LoopOptions,
    internal_tx: mpsc::UnboundedSender<Internal>,
    timers: Timers,
    inbox: Inbox,
    watcher: Option<JoinHandle<()>>,

    started: bool,
    /// Server revision that disabled the client.
    disabled: Option<u32>,
    reconnect_attempt: u32,
    manual_disconnect: bool,
    pending_restart: Option<(u16, String)>,
    load_generation: u64,
    loading: bool,
    waiting: Vec<oneshot::Sender<Result<()>>>,
}

impl EventLoop {
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        source: Arc<dyn ConfigSource>,
        options: LoopOptions,
        internal_tx: mpsc::UnboundedSender<Internal>,
        inbox: Inbox,
    ) -> Self {
        Self {
            shared,
            source,
            options,
            timers: Timers::new(internal_tx.clone()),
            internal_tx,
            inbox,
            watcher: None,
            started: false,
            disabled: None,
            reconnect_attempt: 0,
            manual_disconnect: false,
            pending_restart: None,
            load_generation: 0,
            loading: false,
            waiting: Vec::new(),
        }
    }

    /// Runs until every client handle is dropped.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        self.watch_storage();

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All client handles dropped");
                        break;
                    }
                },

                Some(event) = events.recv() => self.handle_transport_event(event),

                Some(signal) = internal.recv() => self.handle_internal(signal),
            }
        }

        self.shutdown();
    }

    fn watch_storage(&mut self) {
        let tx = self.internal_tx.clone();
        self.watcher = Some(self.shared.storage.watch(Box::new(move |blocked| {
            let _ = tx.send(Internal::WebSocketBlocked(blocked));
        })));
    }

    fn shutdown(&mut self) {
        self.timers.cancel_all();
        for connection_type in [ConnectionType::WebSocket, ConnectionType::LongPolling] {
            self.shared
                .connector(connection_type)
                .disconnect(NORMAL_CLOSURE, "client dropped");
        }
        self.shared.rpc.fail_pending();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        debug!("Event loop terminated");
    }

    // ========================================================================
    // State Helpers
    // ========================================================================

    fn is_enabled(&self) -> bool {
        self.started && self.disabled.is_none()
    }

    fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        self.shared.log.log(level, message);
    }

    fn websocket_enabled(&self) -> bool {
        self.options.websocket_supported
            && self
                .shared
                .config
                .read()
                .as_ref()
                .is_some_and(|config| config.server.websocket_enabled)
    }

    fn websocket_allowed(&self) -> bool {
        self.websocket_enabled() && !self.shared.storage.is_websocket_blocked()
    }

    fn set_connection_type(&self, connection_type: ConnectionType) {
        let mut transports = self.shared.transports.write();
        if transports.active != connection_type {
            debug!(from = %transports.active, to = %connection_type, "Connection type changed");
            transports.active = connection_type;
        }
    }

    fn set_status(&mut self, status: PullStatus) {
        {
            let mut current = self.shared.status.write();
            if *current == status {
                return;
            }
            *current = status;
        }
        trace!(%status, "Status changed");
        self.timers.cancel(TimerKind::OfflineStatus);
        if status == PullStatus::Offline {
            self.timers
                .schedule(TimerKind::OfflineStatus, OFFLINE_STATUS_DELAY);
        } else {
            self.notify_status();
        }
    }

    fn notify_status(&self) {
        let notification = Notification::Status {
            status: *self.shared.status.read(),
            connection_type: self.shared.connection_type(),
        };
        self.shared
            .subscribers
            .emit(SubscriptionKind::Status, &notification);
    }

    /// Answers every waiting `start` with `result`.
    fn answer_waiting(&mut self, result: Result<()>) {
        let waiting = std::mem::take(&mut self.waiting);
        match result {
            Ok(()) => {
                for reply in waiting {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(error) => {
                let mut waiting = waiting.into_iter();
                let Some(first) = waiting.next() else {
                    return;
                };
                for reply in waiting {
                    let _ = reply.send(Err(duplicate_error(&error)));
                }
                let _ = first.send(Err(error));
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { config, reply } => self.start(config, reply),
            Command::Stop {
                code,
                reason,
                reply,
            } => {
                self.stop(code, &reason);
                let _ = reply.send(());
            }
            Command::Restart {
                code,
                reason,
                reply,
            } => {
                self.restart(code, &reason);
                let _ = reply.send(());
            }
            Command::Reconnect {
                code,
                reason,
                delay,
            } => self.reconnect(code, &reason, delay),
            Command::Disconnect { code, reason } => {
                self.timers.cancel(TimerKind::Reconnect);
                self.disconnect(code, &reason);
            }
        }
    }

    fn start(&mut self, config: Option<Configuration>, reply: oneshot::Sender<Result<()>>) {
        if let Some(server) = self.disabled {
            let _ = reply.send(Err(Error::revision_mismatch(server, REVISION)));
            return;
        }
        if self.shared.user_id == 0 || self.shared.site_id.is_empty() {
            let _ = reply.send(Err(Error::config("user id and site id are required")));
            return;
        }
        if !self.options.server_enabled {
            let _ = reply.send(Err(Error::disabled("push server is disabled")));
            return;
        }
        if self.started {
            if self.loading {
                self.waiting.push(reply);
            } else {
                let _ = reply.send(Ok(()));
            }
            return;
        }

        self.started = true;
        self.log(LogLevel::Info, "Starting push client");

        let now = Utc::now();
        let remembered = self.shared.remembered_timestamp();
        let actual = config
            .filter(|config| config.is_actual(remembered, now))
            .or_else(|| {
                self.shared
                    .storage
                    .load_config()
                    .filter(|config| config.is_actual(remembered, now))
            });

        match actual {
            Some(config) => {
                debug!("Starting with an actual configuration");
                match self.apply_config(config) {
                    Ok(()) => {
                        self.connect();
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        self.started = false;
                        let _ = reply.send(Err(e));
                    }
                }
            }
            None => {
                self.waiting.push(reply);
                self.load_config();
            }
        }
    }

    fn stop(&mut self, code: u16, reason: &str) {
        info!(code, reason, "Stopping push client");
        self.log(LogLevel::Info, format!("Stopping: {reason}"));

        let notify = *self.shared.status.read() != PullStatus::Offline
            || self.timers.is_pending(TimerKind::OfflineStatus);

        self.disconnect(code, reason);
        let inactive = match self.shared.connection_type() {
            ConnectionType::WebSocket => ConnectionType::LongPolling,
            ConnectionType::LongPolling => ConnectionType::WebSocket,
        };
        self.shared.connector(inactive).disconnect(code, reason);

        self.started = false;
        self.timers.cancel_all();
        self.shared.rpc.fail_pending();
        self.load_generation += 1;
        self.loading = false;
        self.pending_restart = None;
        self.answer_waiting(Err(Error::disabled("client stopped")));

        *self.shared.status.write() = PullStatus::Offline;
        if notify {
            self.notify_status();
        }
    }

    fn restart(&mut self, code: u16, reason: &str) {
        if !self.is_enabled() {
            debug!(code, reason, "Restart ignored, client is not running");
            return;
        }
        info!(code, reason, "Restarting push client");
        self.log(LogLevel::Info, format!("Restarting: {reason}"));

        self.timers.cancel(TimerKind::Restart);
        self.timers.cancel(TimerKind::Reconnect);
        self.disconnect(code, reason);
        self.shared.storage.clear_config();
        self.load_config();
    }

    fn reconnect(&mut self, code: u16, reason: &str, delay: Duration) {
        debug!(code, reason, ?delay, "Reconnecting");
        self.disconnect(code, reason);
        self.schedule_reconnect(Some(delay));
    }

    fn disconnect(&mut self, code: u16, reason: &str) {
        let connector = self.shared.active_connector();
        let was_connected = connector.connected();
        if was_connected {
            self.manual_disconnect = true;
        }
        connector.disconnect(code, reason);
        self.timers.cancel(TimerKind::PingWait);
        if !was_connected {
            self.set_status(PullStatus::Offline);
        }
    }

    fn connect(&mut self) {
        if !self.is_enabled() || self.shared.config.read().is_none() {
            return;
        }

        let connector = self.shared.active_connector();
        if connector.connected() {
            self.set_status(PullStatus::Online);
            return;
        }

        self.reconnect_attempt += 1;
        debug!(
            connection_type = %self.shared.connection_type(),
            attempt = self.reconnect_attempt,
            "Connecting"
        );
        self.set_status(PullStatus::Connecting);
        connector.connect();
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    fn load_config(&mut self) {
        self.load_generation += 1;
        self.loading = true;
        let generation = self.load_generation;
        let source = Arc::clone(&self.source);
        let tx = self.internal_tx.clone();

        debug!(generation, "Loading configuration");
        tokio::spawn(async move {
            let result = source
                .fetch_config()
                .await
                .map(|fetched| fetched.into_configuration(Utc::now()));
            let _ = tx.send(Internal::ConfigLoaded { generation, result });
        });
    }

    fn on_config_loaded(&mut self, generation: u64, result: Result<Configuration>) {
        if generation != self.load_generation || !self.is_enabled() {
            trace!(generation, "Stale configuration dropped");
            return;
        }
        self.loading = false;

        match result {
            Ok(config) => match self.apply_config(config) {
                Ok(()) => {
                    self.connect();
                    self.answer_waiting(Ok(()));
                }
                Err(e) => self.answer_waiting(Err(e)),
            },

            Err(Error::Auth { status, message }) => {
                warn!(status, %message, "Configuration refused");
                self.log(
                    LogLevel::Error,
                    format!("Authorization failed ({status}): {message}"),
                );
                self.started = false;
                self.timers.cancel_all();
                self.set_status(PullStatus::Offline);
                if self.waiting.is_empty() {
                    self.shared.subscribers.emit(
                        SubscriptionKind::Error,
                        &Notification::AuthFailed { status, message },
                    );
                } else {
                    self.answer_waiting(Err(Error::auth(status, message)));
                }
            }

            Err(e) => {
                warn!(error = %e, "Configuration fetch failed");
                self.log(LogLevel::Warn, format!("Could not load configuration: {e}"));
                self.reconnect_attempt += 1;
                self.schedule_restart(
                    NORMAL_CLOSURE,
                    "configuration fetch failed",
                    backoff_delay(self.reconnect_attempt),
                );
                self.set_status(PullStatus::Offline);
                self.answer_waiting(Err(e));
            }
        }
    }

    fn apply_config(&mut self, config: Configuration) -> Result<()> {
        if let Some(server) = config.api.revision_web
            && server > 0
            && server != REVISION
        {
            self.revision_mismatch(server);
            return Err(Error::revision_mismatch(server, REVISION));
        }

        self.shared
            .resolver
            .seed(config.public_channels.values().cloned());
        self.shared.storage.store_config(&config);
        self.shared
            .remembered_timestamp
            .store(config.server.config_timestamp, Ordering::Relaxed);
        debug!(
            version = config.server.version,
            protocol = ?config.protocol(),
            "Configuration applied"
        );
        *self.shared.config.write() = Some(config);

        let connection_type = if self.websocket_allowed() {
            ConnectionType::WebSocket
        } else {
            ConnectionType::LongPolling
        };
        self.set_connection_type(connection_type);
        self.timers
            .schedule(TimerKind::ConfigCheck, CONFIG_CHECK_INTERVAL);
        Ok(())
    }

    fn check_config(&mut self) {
        if !self.is_enabled() || self.loading {
            return;
        }
        let remembered = self.shared.remembered_timestamp();
        let checked = match self.shared.config.read().as_ref() {
            Some(config) => config.ensure_actual(remembered, Utc::now()),
            None => Err(Error::ConfigStale),
        };

        match checked {
            Ok(()) => self
                .timers
                .schedule(TimerKind::ConfigCheck, CONFIG_CHECK_INTERVAL),
            Err(e) => {
                info!(error = %e, "Restarting with a fresh configuration");
                self.restart(CONFIG_EXPIRED, "config expired");
            }
        }
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    fn schedule_reconnect(&mut self, delay: Option<Duration>) {
        if !self.is_enabled() {
            return;
        }

        let delay = match delay {
            Some(delay) => delay,
            None => {
                if self.timers.is_pending(TimerKind::Reconnect) {
                    return;
                }
                if self.reconnect_attempt > 3
                    && self.shared.connection_type() == ConnectionType::WebSocket
                    && !self.shared.storage.is_long_polling_blocked()
                {
                    warn!(
                        attempts = self.reconnect_attempt,
                        "WebSocket seems blocked, switching to long polling"
                    );
                    self.log(LogLevel::Warn, "WebSocket seems to be blocked, using long polling");
                    self.shared.storage.set_websocket_blocked(true);
                    self.set_connection_type(ConnectionType::LongPolling);
                    self.reconnect_attempt = 1;
                    Duration::from_secs(1)
                } else {
                    backoff_delay(self.reconnect_attempt)
                }
            }
        };

        debug!(?delay, attempt = self.reconnect_attempt, "Reconnect scheduled");
        self.timers.schedule(TimerKind::Reconnect, delay);
    }

    fn schedule_restart(&mut self, code: u16, reason: &str, delay: Duration) {
        debug!(code, reason, ?delay, "Restart scheduled");
        self.pending_restart = Some((code, reason.to_string()));
        self.timers.schedule(TimerKind::Restart, delay);
    }

    // ========================================================================
    // Internal Signals
    // ========================================================================

    fn handle_internal(&mut self, signal: Internal) {
        match signal {
            Internal::Timer { kind, generation } => {
                if self.timers.take_fired(kind, generation) {
                    self.on_timer(kind);
                }
            }
            Internal::ConfigLoaded { generation, result } => {
                self.on_config_loaded(generation, result);
            }
            Internal::WebSocketBlocked(blocked) => self.on_websocket_blocked(blocked),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        trace!(?kind, "Timer fired");
        match kind {
            TimerKind::Reconnect => self.connect(),
            TimerKind::Restart => {
                let (code, reason) = self
                    .pending_restart
                    .take()
                    .unwrap_or((NORMAL_CLOSURE, "restart".to_string()));
                self.restart(code, &reason);
            }
            TimerKind::RestoreWebSocket => self.try_restore_websocket(),
            TimerKind::ConfigCheck => self.check_config(),
            TimerKind::PingWait => self.on_ping_timeout(),
            TimerKind::OfflineStatus => self.notify_status(),
        }
    }

    fn on_websocket_blocked(&mut self, blocked: bool) {
        if !self.is_enabled() {
            return;
        }
        let active = self.shared.connection_type();

        if blocked
            && active == ConnectionType::WebSocket
            && !self.shared.connector(ConnectionType::WebSocket).connected()
        {
            info!("WebSocket blocked by another client, switching to long polling");
            self.timers.cancel(TimerKind::Reconnect);
            self.shared
                .connector(ConnectionType::WebSocket)
                .disconnect(NORMAL_CLOSURE, "websocket blocked");
            self.reconnect_attempt = 0;
            self.set_connection_type(ConnectionType::LongPolling);
            self.schedule_reconnect(Some(Duration::ZERO));
        } else if !blocked && active == ConnectionType::LongPolling && self.websocket_enabled() {
            info!("WebSocket unblocked by another client");
            self.timers.cancel(TimerKind::RestoreWebSocket);
            self.reconnect_attempt = 0;
            if self.shared.connector(ConnectionType::LongPolling).connected() {
                self.shared.connector(ConnectionType::WebSocket).connect();
            } else {
                self.timers.cancel(TimerKind::Reconnect);
                self.set_connection_type(ConnectionType::WebSocket);
                self.schedule_reconnect(Some(Duration::ZERO));
            }
        }
    }

    fn try_restore_websocket(&mut self) {
        if !self.is_enabled()
            || self.shared.connection_type() != ConnectionType::LongPolling
            || !self.websocket_enabled()
        {
            return;
        }
        debug!("Trying to restore WebSocket");
        self.shared.connector(ConnectionType::WebSocket).connect();
        self.timers
            .schedule(TimerKind::RestoreWebSocket, RESTORE_WEBSOCKET_TIMEOUT);
    }

    fn on_ping_timeout(&mut self) {
        if !self.is_enabled() || !self.shared.active_connector().connected() {
            return;
        }
        warn!("No pings received, reconnecting");
        self.log(LogLevel::Warn, "No pings received, reconnecting");
        self.disconnect(STUCK, "connection stuck");
        self.schedule_reconnect(None);
    }

    // ========================================================================
    // Transport Events
    // ========================================================================

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let TransportEvent {
            source,
            event,
            done,
        } = event;

        if source != self.shared.connection_type() {
            if source == ConnectionType::WebSocket && matches!(event, ConnectorEvent::Open) {
                self.complete_restore();
            } else {
                trace!(%source, "Event from inactive connector ignored");
            }
            drop(done);
            return;
        }

        match event {
            ConnectorEvent::Open => self.on_open(),
            ConnectorEvent::Message(frame) => self.handle_frame(&frame),
            ConnectorEvent::Error(e) => self.on_error(&e),
            ConnectorEvent::Disconnect { code, reason } => self.on_disconnect(code, &reason),
            ConnectorEvent::LastMessageId(mid) => {
                trace!(%mid, "Resuming from last message id");
                self.shared.session.lock().mid = Some(mid);
            }
        }
        drop(done);
    }

    /// Switches to the restored WebSocket.
    ///
    /// From the WebSocket handshake until this runs both connectors report
    /// connected. Long polling is closed here, in the same turn that handles
    /// the WebSocket `Open`.
    fn complete_restore(&mut self) {
        let websocket = self.shared.connector(ConnectionType::WebSocket);
        if !self.is_enabled() || !self.websocket_enabled() {
            websocket.disconnect(NORMAL_CLOSURE, "websocket not needed");
            return;
        }
        info!("WebSocket restored, closing long polling");
        self.set_connection_type(ConnectionType::WebSocket);
        self.shared
            .connector(ConnectionType::LongPolling)
            .disconnect(NORMAL_CLOSURE, "websocket restored");
        self.on_open();
    }

    fn on_open(&mut self) {
        let connection_type = self.shared.connection_type();
        info!(%connection_type, "Connection established");
        self.log(LogLevel::Info, format!("{connection_type} connection established"));

        self.reconnect_attempt = 0;
        self.timers.cancel(TimerKind::Reconnect);
        self.set_status(PullStatus::Online);

        match connection_type {
            ConnectionType::WebSocket => {
                self.timers.cancel(TimerKind::RestoreWebSocket);
                self.shared.storage.set_websocket_blocked(false);
                // a working socket means later failures are network trouble
                self.shared.storage.set_long_polling_blocked(true);
                let long_polling = self.shared.connector(ConnectionType::LongPolling);
                if long_polling.connected() {
                    long_polling.disconnect(NORMAL_CLOSURE, "websocket connected");
                }
            }
            ConnectionType::LongPolling => {
                if self.websocket_enabled() {
                    self.timers
                        .schedule(TimerKind::RestoreWebSocket, RESTORE_WEBSOCKET_TIMEOUT);
                }
            }
        }

        if self.shared.protocol() == Some(Protocol::JsonRpc) {
            self.timers.schedule(TimerKind::PingWait, PING_TIMEOUT * 2);
        }
    }

    fn on_error(&mut self, error: &Error) {
        warn!(error = %error, "Transport error");
        self.log(LogLevel::Warn, format!("Connection error: {error}"));
        self.set_status(PullStatus::Offline);
        self.timers.cancel(TimerKind::PingWait);
        if !self.manual_disconnect {
            self.schedule_reconnect(None);
        }
    }

    fn on_disconnect(&mut self, code: u16, reason: &str) {
        debug!(code, reason, "Connection closed");
        self.set_status(PullStatus::Offline);
        self.timers.cancel(TimerKind::PingWait);

        if std::mem::take(&mut self.manual_disconnect) {
            return;
        }
        self.log(LogLevel::Info, format!("Connection closed ({code}): {reason}"));
        if code == WRONG_CHANNEL_ID {
            self.schedule_restart(WRONG_CHANNEL_ID, "wrong channel signature", Duration::ZERO);
        } else {
            self.schedule_reconnect(None);
        }
    }

    // ========================================================================
    // Frames
    // ========================================================================

    fn handle_frame(&mut self, frame: &Frame) {
        let Some(protocol) = self.shared.protocol() else {
            return;
        };

        // (messages, payload carried nothing)
        let (messages, empty_payload) = match protocol {
            Protocol::JsonRpc => {
                let text = frame.to_text();
                if text == JSON_RPC_PING {
                    self.on_ping();
                    return;
                }
                self.shared.rpc.handle_incoming_message(&text);
                (std::mem::take(&mut *self.inbox.lock()), false)
            }
            Protocol::Binary => match binary::decode_push_messages(frame.as_bytes()) {
                Ok(messages) => {
                    let empty = messages.is_empty();
                    (messages, empty)
                }
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable binary frame");
                    return;
                }
            },
            Protocol::Text => {
                let text = frame.to_text();
                (text::decode_push_messages(&text), !text::has_units(&text))
            }
        };

        if empty_payload {
            self.shared.session.lock().reset_pointer();
            return;
        }
        if messages.is_empty() {
            debug!("Frame held no usable messages");
            return;
        }
        self.process_messages(messages);
    }

    fn on_ping(&mut self) {
        if !self
            .shared
            .active_connector()
            .send(Frame::Text(JSON_RPC_PONG.to_string()))
        {
            warn!("Could not answer ping");
        }
        self.timers.schedule(TimerKind::PingWait, PING_TIMEOUT * 2);
    }

    fn process_messages(&mut self, messages: Vec<PushMessage>) {
        let mut fresh = Vec::with_capacity(messages.len());
        {
            let mut session = self.shared.session.lock();
            for message in messages {
                session.advance(&message);
                if let Some(mid) = &message.mid
                    && !session.register(mid)
                {
                    trace!(%mid, "Duplicate message dropped");
                    continue;
                }
                session.message_count += 1;
                fresh.push(message.body);
            }
        }

        for body in fresh {
            if self.disabled.is_some() {
                break;
            }
            self.broadcast(body);
        }
    }

    fn broadcast(&mut self, mut body: EventBody) {
        body.module_id = body.module_id.to_lowercase();
        if let Some(sent) = body.extra.server_time_unix {
            let time_shift = self
                .shared
                .config
                .read()
                .as_ref()
                .map_or(0, |config| config.time_shift);
            let now = Utc::now().timestamp_millis() as f64 / 1000.0;
            body.extra.server_time_ago = Some((now - sent - time_shift as f64).max(0.0));
        }
        trace!(module_id = %body.module_id, command = %body.command, "Message received");

        let revision = body.extra.revision_web;
        if body.is_from_client() {
            self.emit_message(SubscriptionKind::Client, body);
        } else if body.module_id == INTERNAL_MODULE {
            self.handle_internal_command(&body);
        } else if body.module_id == ONLINE_MODULE {
            if body.extra.server_time_ago.unwrap_or(0.0) < ONLINE_MAX_AGE_SECS {
                self.emit_message(SubscriptionKind::Online, body);
            } else {
                trace!("Stale presence message dropped");
            }
        } else {
            self.emit_message(SubscriptionKind::Server, body);
        }

        if let Some(server) = revision
            && server > 0
            && server != REVISION
        {
            self.revision_mismatch(server);
        }
    }

    fn emit_message(&self, kind: SubscriptionKind, body: EventBody) {
        self.shared
            .subscribers
            .emit(kind, &Notification::Message(body));
    }

    fn handle_internal_command(&mut self, body: &EventBody) {
        match body.command.to_uppercase().as_str() {
            "CHANNEL_EXPIRE" => {
                if body.params["action"] == "reconnect" {
                    match self.replace_channel(&body.params) {
                        Ok(()) => {
                            self.log(LogLevel::Info, "Channel was replaced, reconnecting");
                            self.reconnect(
                                CONFIG_REPLACED,
                                "config was replaced",
                                DEFAULT_RECONNECT_DELAY,
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "Cannot replace channel in place");
                            self.restart(CHANNEL_EXPIRED, "channel expired");
                        }
                    }
                } else {
                    self.restart(CHANNEL_EXPIRED, "channel expired");
                }
            }
            "CONFIG_EXPIRE" => self.restart(CONFIG_EXPIRED, "config expired"),
            "SERVER_RESTART" => {
                let max_ms = SERVER_RESTART_MAX_DELAY.as_millis() as u64;
                let delay = Duration::from_millis(rand::rng().random_range(0..max_ms));
                self.reconnect(SERVER_RESTARTED, "server was restarted", delay);
            }
            other => debug!(command = other, "Unknown internal command"),
        }
    }

    fn replace_channel(&self, params: &Value) -> Result<()> {
        let kind = params["channel"]["type"]
            .as_str()
            .ok_or_else(|| Error::protocol("CHANNEL_EXPIRE without channel type"))?;
        let channel: ChannelInfo = serde_json::from_value(params["new_channel"].clone())?;

        let mut guard = self.shared.config.write();
        let config = guard
            .as_mut()
            .ok_or_else(|| Error::config("no configuration loaded"))?;
        config.channels.replace(kind, channel)?;
        self.shared.storage.store_config(config);
        Ok(())
    }

    fn revision_mismatch(&mut self, server: u32) {
        if self.disabled.is_some() {
            return;
        }
        warn!(server, client = REVISION, "Server revision differs, disabling client");
        self.log(
            LogLevel::Error,
            format!("Server revision {server} differs from client revision {REVISION}"),
        );

        self.disabled = Some(server);
        self.disconnect(NORMAL_CLOSURE, "check_revision");
        self.timers.cancel_all();
        self.shared.rpc.fail_pending();
        self.load_generation += 1;
        self.loading = false;
        self.answer_waiting(Err(Error::revision_mismatch(server, REVISION)));

        self.shared.subscribers.emit(
            SubscriptionKind::Revision,
            &Notification::RevisionMismatch {
                server,
                client: REVISION,
            },
        );
    }
}

/// Copies an error for a second waiter.
fn duplicate_error(error: &Error) -> Error {
    match error {
        Error::Auth { status, message } => Error::auth(*status, message.clone()),
        Error::RevisionMismatch { server, client } => Error::revision_mismatch(*server, *client),
        Error::Disabled { message } => Error::disabled(message.clone()),
        Error::Config { message } => Error::config(message.clone()),
        other => Error::connection(other.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeDelta;

    use crate::client::subscribers::Subscription;
    use crate::client::testing::{
        Harness, binary_config, json_rpc_config, text_config, wait_for,
    };
    use crate::protocol::binary::{OutgoingMessage, Response, ResponseBatch};
    use crate::transport::Connector;
    use crate::transport::close_code::MANUAL;

    type Log = Arc<Mutex<Vec<Notification>>>;

    fn unit(mid: &str, module_id: &str, command: &str, params: Value) -> Value {
        json!({
            "mid": mid,
            "text": {"module_id": module_id, "command": command, "params": params}
        })
    }

    fn text_frame(units: &[Value]) -> Frame {
        Frame::Text(
            units
                .iter()
                .map(|unit| text::encode_unit(&unit.to_string()))
                .collect(),
        )
    }

    fn commands(log: &Log) -> Vec<String> {
        log.lock()
            .iter()
            .filter_map(|notification| match notification {
                Notification::Message(body) => Some(body.command.clone()),
                _ => None,
            })
            .collect()
    }

    fn statuses(log: &Log) -> Vec<PullStatus> {
        log.lock()
            .iter()
            .filter_map(|notification| match notification {
                Notification::Status { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    async fn started(harness: &Harness) {
        harness.client.start(None).await.expect("start");
        harness.wait_online().await;
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_goes_online_over_websocket() {
        let harness = Harness::new(binary_config());
        let log = harness.record(Subscription::status());
        started(&harness).await;

        assert_eq!(harness.client.connection_type(), ConnectionType::WebSocket);
        assert_eq!(harness.config_source.calls(), 1);
        let websocket = harness.websocket();
        assert_eq!(websocket.connects(), 1);
        assert!(websocket.paths()[0].contains("CHANNEL_ID=abc"));

        wait_for(|| statuses(&log).len() == 2).await;
        assert_eq!(
            statuses(&log),
            vec![PullStatus::Connecting, PullStatus::Online]
        );
    }

    #[tokio::test]
    async fn test_actual_cached_config_skips_fetch() {
        let harness = Harness::new(binary_config());
        harness.shared_config().store_config(&binary_config());
        started(&harness).await;
        assert_eq!(harness.config_source.calls(), 0);
    }

    #[tokio::test]
    async fn test_start_with_given_config() {
        let harness = Harness::new(binary_config());
        harness
            .client
            .start(Some(json_rpc_config()))
            .await
            .expect("start");
        harness.wait_online().await;
        assert_eq!(harness.config_source.calls(), 0);
        assert!(harness.client.is_json_rpc());
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_fetch() {
        let harness = Harness::new(binary_config());
        let (first, second) = tokio::join!(harness.client.start(None), harness.client.start(None));
        first.expect("first start");
        second.expect("second start");
        assert_eq!(harness.config_source.calls(), 1);
    }

    #[tokio::test]
    async fn test_config_with_other_revision_fails_start() {
        let mut config = binary_config();
        config.api.revision_web = Some(18);
        let harness = Harness::new(config);

        let err = harness.client.start(None).await.expect_err("revision");
        assert!(matches!(
            err,
            Error::RevisionMismatch {
                server: 18,
                client: 19
            }
        ));
        assert_eq!(harness.websocket().connects(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_on_start() {
        let harness = Harness::new(binary_config());
        harness.config_source.fail_auth(true);

        let err = harness.client.start(None).await.expect_err("auth");
        assert!(matches!(err, Error::Auth { status: 401, .. }));
        assert_eq!(harness.client.status(), PullStatus::Offline);
        assert_eq!(harness.websocket().connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_config_failure_is_retried() {
        let harness = Harness::new(binary_config());
        harness.config_source.fail_next(1);

        let err = harness.client.start(None).await.expect_err("first fetch");
        assert!(err.is_connection_error());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(harness.config_source.calls(), 2);
        assert_eq!(harness.client.status(), PullStatus::Online);
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_text_messages_are_delivered_once() {
        let harness = Harness::new(text_config());
        let log = harness.record(Subscription::server("crm"));
        started(&harness).await;

        let websocket = harness.websocket();
        websocket.deliver(text_frame(&[unit("m1", "CRM", "first", json!({}))]));
        websocket.deliver(text_frame(&[
            unit("m1", "crm", "first", json!({})),
            unit("m2", "crm", "second", json!({"n": 2})),
        ]));

        wait_for(|| commands(&log).len() == 2).await;
        assert_eq!(commands(&log), vec!["first", "second"]);
        let Notification::Message(body) = &log.lock()[0] else {
            panic!("expected a message");
        };
        assert_eq!(body.module_id, "crm");

        let session = harness.client.debug_info().session;
        assert_eq!(session.mid.as_deref(), Some("m2"));
        assert_eq!(session.message_count, 2);
    }

    #[tokio::test]
    async fn test_binary_messages_are_decoded_and_deduplicated() {
        let harness = Harness::new(binary_config());
        let log = harness.record(Subscription::server("crm"));
        started(&harness).await;

        let frame = |id: u8, command: &str| {
            let message = OutgoingMessage {
                id: vec![id],
                body: json!({"module_id": "crm", "command": command, "params": {"n": id}})
                    .to_string(),
                ..OutgoingMessage::default()
            };
            let batch = ResponseBatch {
                responses: vec![Response::OutgoingMessages(vec![message])],
            };
            Frame::Binary(batch.encode())
        };

        let websocket = harness.websocket();
        websocket.deliver(frame(9, "updated"));
        websocket.deliver(frame(9, "updated"));
        websocket.deliver(frame(10, "deleted"));

        wait_for(|| commands(&log).len() == 2).await;
        assert_eq!(commands(&log), vec!["updated", "deleted"]);
    }

    #[tokio::test]
    async fn test_client_and_presence_routing() {
        let harness = Harness::new(text_config());
        let server = harness.record(Subscription::server("im"));
        let client = harness.record(Subscription::client("im"));
        let online = harness.record(Subscription::online());
        started(&harness).await;

        let now = Utc::now().timestamp() as f64;
        let from_client = json!({
            "mid": "c1",
            "text": {
                "module_id": "im",
                "command": "typing",
                "params": {},
                "extra": {"sender": {"type": 1}}
            }
        });
        let presence = |mid: &str, sent: f64| {
            json!({
                "mid": mid,
                "text": {
                    "module_id": "online",
                    "command": "userStatusChange",
                    "params": {},
                    "extra": {"server_time_unix": sent}
                }
            })
        };

        harness.websocket().deliver(text_frame(&[
            from_client,
            presence("o1", now),
            presence("o2", now - 300.0),
            unit("s1", "im", "done", json!({})),
        ]));

        wait_for(|| commands(&server).len() == 1).await;
        assert_eq!(commands(&server), vec!["done"]);
        assert_eq!(commands(&client), vec!["typing"]);
        assert_eq!(commands(&online), vec!["userStatusChange"]);
    }

    #[tokio::test]
    async fn test_empty_text_frame_resets_pointer() {
        let harness = Harness::new(text_config());
        started(&harness).await;

        let websocket = harness.websocket();
        websocket.deliver(text_frame(&[unit("m1", "crm", "first", json!({}))]));
        wait_for(|| harness.client.debug_info().session.mid.is_some()).await;

        websocket.deliver(Frame::Text(String::new()));
        wait_for(|| harness.client.debug_info().session.mid.is_none()).await;
    }

    #[tokio::test]
    async fn test_unparsable_text_units_keep_pointer() {
        let harness = Harness::new(text_config());
        started(&harness).await;

        let websocket = harness.websocket();
        websocket
            .deliver_handled(text_frame(&[unit("m1", "crm", "first", json!({}))]))
            .await;
        assert_eq!(harness.client.debug_info().session.mid.as_deref(), Some("m1"));

        websocket
            .deliver_handled(Frame::Text(text::encode_unit("{not json")))
            .await;
        assert_eq!(harness.client.debug_info().session.mid.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_long_polling_reports_last_message_id() {
        let harness = Harness::with(binary_config(), |builder| {
            builder.websocket_supported(false)
        });
        started(&harness).await;
        assert_eq!(
            harness.client.connection_type(),
            ConnectionType::LongPolling
        );
        assert_eq!(harness.websocket().connects(), 0);

        harness.long_polling().report_last_message_id("m9");
        wait_for(|| harness.client.debug_info().session.mid.as_deref() == Some("m9")).await;
    }

    // ------------------------------------------------------------------------
    // JSON-RPC
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_incoming_rpc_message_is_acknowledged_once() {
        let harness = Harness::new(json_rpc_config());
        let log = harness.record(Subscription::server("im"));
        started(&harness).await;

        let incoming = |mid: &str, command: &str| {
            let call = json!({
                "jsonrpc": "2.0",
                "method": "incoming.message",
                "params": {
                    "mid": mid,
                    "body": {"module_id": "im", "command": command, "params": {"text": "hi"}},
                    "user_params": {"chat": 7},
                    "dictionary": {"lang": "en"}
                }
            });
            Frame::Text(call.to_string())
        };

        let websocket = harness.websocket();
        websocket.deliver(incoming("m1", "message"));
        websocket.wait_sent_matching(|text| text == "mack:m1").await;
        wait_for(|| commands(&log).len() == 1).await;

        let Notification::Message(body) = log.lock()[0].clone() else {
            panic!("expected a message");
        };
        assert_eq!(body.params["text"], "hi");
        assert_eq!(body.params["chat"], 7);
        assert_eq!(body.params["lang"], "en");

        websocket.deliver(incoming("m1", "message"));
        websocket.deliver(incoming("m2", "read"));
        wait_for(|| commands(&log).len() == 2).await;
        assert_eq!(commands(&log), vec!["message", "read"]);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let harness = Harness::new(json_rpc_config());
        started(&harness).await;

        harness.websocket().deliver(Frame::Text("ping".to_string()));
        harness
            .websocket()
            .wait_sent_matching(|text| text == "pong")
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_connection_is_reconnected() {
        let harness = Harness::new(json_rpc_config());
        started(&harness).await;

        tokio::time::sleep(Duration::from_secs(21)).await;
        let websocket = harness.websocket();
        assert!(
            websocket
                .disconnects()
                .contains(&(STUCK, "connection stuck".to_string()))
        );
        assert_eq!(websocket.connects(), 2);
        assert_eq!(harness.client.status(), PullStatus::Online);
    }

    #[tokio::test]
    async fn test_stop_fails_pending_calls() {
        let harness = Harness::new(json_rpc_config());
        started(&harness).await;

        let client = harness.client.clone();
        let ping = tokio::spawn(async move { client.ping().await });
        harness
            .websocket()
            .wait_sent_matching(|text| text.contains("\"method\":\"ping\""))
            .await;

        harness.client.stop(MANUAL, "manual").await.expect("stop");
        let err = ping.await.expect("join").expect_err("failed call");
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(
            harness
                .websocket()
                .disconnects()
                .contains(&(MANUAL, "manual".to_string()))
        );
        assert_eq!(harness.client.status(), PullStatus::Offline);
    }

    // ------------------------------------------------------------------------
    // Internal Commands
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_channel_expire_replaces_channel_in_place() {
        let harness = Harness::new(text_config());
        started(&harness).await;

        let end = (Utc::now() + TimeDelta::hours(12)).to_rfc3339();
        let params = json!({
            "action": "reconnect",
            "channel": {"id": "abc", "type": "private"},
            "new_channel": {"id": "def", "end": end, "type": "private"}
        });
        harness
            .websocket()
            .deliver(text_frame(&[unit("p1", "pull", "CHANNEL_EXPIRE", params)]));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let websocket = harness.websocket();
        assert!(
            websocket
                .disconnects()
                .contains(&(CONFIG_REPLACED, "config was replaced".to_string()))
        );
        assert_eq!(websocket.connects(), 2);
        assert!(websocket.paths()[1].contains("CHANNEL_ID=def"));
        assert_eq!(harness.config_source.calls(), 1);

        let stored = harness.shared_config().load_config().expect("stored config");
        assert_eq!(stored.channels.private.expect("private").id, "def");
    }

    #[tokio::test]
    async fn test_config_expire_refetches() {
        let harness = Harness::new(text_config());
        started(&harness).await;

        harness
            .websocket()
            .deliver(text_frame(&[unit("p1", "pull", "config_expire", json!({}))]));

        wait_for(|| harness.websocket().connects() == 2).await;
        assert_eq!(harness.config_source.calls(), 2);
        assert!(
            harness
                .websocket()
                .disconnects()
                .contains(&(CONFIG_EXPIRED, "config expired".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_check_restarts_after_channel_ends() {
        let mut short_lived = text_config();
        if let Some(channel) = short_lived.channels.private.as_mut() {
            channel.end = Utc::now() + TimeDelta::milliseconds(200);
        }
        let harness = Harness::new(short_lived);
        started(&harness).await;
        harness.config_source.set_config(text_config());

        // channel ends are wall-clock times
        std::thread::sleep(Duration::from_millis(300));
        tokio::time::sleep(CONFIG_CHECK_INTERVAL + Duration::from_secs(1)).await;

        wait_for(|| harness.websocket().connects() == 2).await;
        assert_eq!(harness.config_source.calls(), 2);
        assert!(
            harness
                .websocket()
                .disconnects()
                .contains(&(CONFIG_EXPIRED, "config expired".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_restart_reconnects_within_bound() {
        let harness = Harness::new(text_config());
        started(&harness).await;

        harness
            .websocket()
            .deliver(text_frame(&[unit("p1", "pull", "SERVER_RESTART", json!({}))]));

        tokio::time::sleep(SERVER_RESTART_MAX_DELAY + Duration::from_secs(1)).await;
        let websocket = harness.websocket();
        assert!(
            websocket
                .disconnects()
                .contains(&(SERVER_RESTARTED, "server was restarted".to_string()))
        );
        assert_eq!(websocket.connects(), 2);
    }

    #[tokio::test]
    async fn test_revision_in_message_disables_client() {
        let harness = Harness::new(text_config());
        let revisions = harness.record(Subscription::revision());
        started(&harness).await;

        let message = json!({
            "mid": "r1",
            "text": {
                "module_id": "crm",
                "command": "updated",
                "params": {},
                "extra": {"revision_web": 20}
            }
        });
        harness.websocket().deliver(text_frame(&[message]));

        wait_for(|| !revisions.lock().is_empty()).await;
        assert_eq!(
            revisions.lock()[0],
            Notification::RevisionMismatch {
                server: 20,
                client: 19
            }
        );
        assert!(
            harness
                .websocket()
                .disconnects()
                .contains(&(NORMAL_CLOSURE, "check_revision".to_string()))
        );

        let err = harness.client.start(None).await.expect_err("disabled");
        assert!(matches!(err, Error::RevisionMismatch { server: 20, .. }));
    }

    // ------------------------------------------------------------------------
    // Reconnects
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_reconnects_after_backoff() {
        let harness = Harness::new(binary_config());
        let log = harness.record(Subscription::status());
        started(&harness).await;

        harness.websocket().close_remote(1006, "abnormal closure");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(harness.websocket().connects(), 2);
        assert_eq!(harness.client.status(), PullStatus::Online);
        // the short outage never surfaces as offline
        assert_eq!(
            statuses(&log),
            vec![
                PullStatus::Connecting,
                PullStatus::Online,
                PullStatus::Connecting,
                PullStatus::Online
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_is_reported_after_delay() {
        let harness = Harness::new(binary_config());
        let log = harness.record(Subscription::status());
        started(&harness).await;

        let websocket = harness.websocket();
        websocket.fail_connect.store(true, Ordering::SeqCst);
        websocket.close_remote(1006, "abnormal closure");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(statuses(&log).last(), Some(&PullStatus::Connecting));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(statuses(&log).last(), Some(&PullStatus::Offline));
    }

    #[tokio::test]
    async fn test_wrong_channel_close_refetches_config() {
        let harness = Harness::new(binary_config());
        started(&harness).await;

        harness
            .websocket()
            .close_remote(WRONG_CHANNEL_ID, "wrong channel signature");

        wait_for(|| harness.websocket().connects() == 2).await;
        assert_eq!(harness.config_source.calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_during_restart_is_published() {
        let harness = Harness::new(binary_config());
        let errors = harness.record(Subscription::error());
        started(&harness).await;

        harness.config_source.fail_auth(true);
        harness
            .client
            .restart(NORMAL_CLOSURE, "manual restart")
            .await
            .expect("restart");

        wait_for(|| !errors.lock().is_empty()).await;
        assert!(matches!(
            &errors.lock()[0],
            Notification::AuthFailed { status: 401, .. }
        ));
        assert_eq!(harness.client.status(), PullStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_does_not_reconnect() {
        let harness = Harness::new(binary_config());
        started(&harness).await;

        harness
            .client
            .disconnect(NORMAL_CLOSURE, "bye")
            .expect("disconnect");
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(harness.websocket().connects(), 1);
        assert_eq!(harness.client.status(), PullStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_uses_default_delay() {
        let harness = Harness::new(binary_config());
        started(&harness).await;

        harness
            .client
            .reconnect(CONFIG_REPLACED, "again", None)
            .expect("reconnect");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(harness.websocket().connects(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.websocket().connects(), 2);
    }

    // ------------------------------------------------------------------------
    // Transport Failover
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_repeated_websocket_failures_fall_back_to_long_polling() {
        let harness = Harness::new(binary_config());
        harness
            .websocket()
            .fail_connect
            .store(true, Ordering::SeqCst);
        harness.client.start(None).await.expect("start");

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(harness.websocket().connects(), 4);
        assert_eq!(
            harness.client.connection_type(),
            ConnectionType::LongPolling
        );
        assert_eq!(harness.client.status(), PullStatus::Online);
        assert!(harness.shared_config().is_websocket_blocked());
    }

    #[tokio::test]
    async fn test_websocket_blocked_elsewhere_switches_to_long_polling() {
        let harness = Harness::new(binary_config());
        let websocket = harness.websocket();
        websocket.auto_open.store(false, Ordering::SeqCst);
        harness.client.start(None).await.expect("start");
        wait_for(|| websocket.connects() == 1).await;

        harness.other_tab().set_websocket_blocked(true);
        harness.wait_online().await;
        assert_eq!(
            harness.client.connection_type(),
            ConnectionType::LongPolling
        );

        websocket.auto_open.store(true, Ordering::SeqCst);
        harness.other_tab().set_websocket_blocked(false);
        wait_for(|| harness.client.connection_type() == ConnectionType::WebSocket).await;
        assert!(
            harness
                .long_polling()
                .disconnects()
                .contains(&(NORMAL_CLOSURE, "websocket restored".to_string()))
        );
        assert_eq!(harness.client.status(), PullStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_websocket_is_restored_after_timeout() {
        let harness = Harness::new(binary_config());
        harness.shared_config().set_websocket_blocked(true);
        started(&harness).await;
        assert_eq!(
            harness.client.connection_type(),
            ConnectionType::LongPolling
        );

        tokio::time::sleep(RESTORE_WEBSOCKET_TIMEOUT + Duration::from_secs(1)).await;
        assert_eq!(harness.client.connection_type(), ConnectionType::WebSocket);
        assert_eq!(harness.client.status(), PullStatus::Online);
        assert!(!harness.shared_config().is_websocket_blocked());
        assert!(
            harness
                .long_polling()
                .disconnects()
                .contains(&(NORMAL_CLOSURE, "websocket restored".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_closes_long_polling_when_websocket_opens() {
        let harness = Harness::new(binary_config());
        harness.shared_config().set_websocket_blocked(true);
        started(&harness).await;

        let websocket = harness.websocket();
        let long_polling = harness.long_polling();
        websocket.auto_open.store(false, Ordering::SeqCst);

        tokio::time::sleep(RESTORE_WEBSOCKET_TIMEOUT + Duration::from_secs(1)).await;
        assert!(websocket.connects() >= 1);
        assert!(!websocket.connected());
        assert!(long_polling.connected());
        assert_eq!(
            harness.client.connection_type(),
            ConnectionType::LongPolling
        );

        websocket.open_handled().await;
        assert!(websocket.connected());
        assert!(!long_polling.connected());
        assert_eq!(harness.client.connection_type(), ConnectionType::WebSocket);
    }

    #[tokio::test]
    async fn test_dropping_client_closes_connections() {
        let harness = Harness::new(binary_config());
        started(&harness).await;

        let websocket = harness.websocket();
        drop(harness);
        wait_for(|| {
            websocket
                .disconnects()
                .contains(&(NORMAL_CLOSURE, "client dropped".to_string()))
        })
        .await;
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_stale_timer_firing_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKind::Reconnect, Duration::from_millis(1));
        let Some(Internal::Timer { generation, .. }) = rx.recv().await else {
            panic!("expected a timer");
        };
        timers.schedule(TimerKind::Reconnect, Duration::from_secs(60));

        assert!(!timers.take_fired(TimerKind::Reconnect, generation));
        assert!(timers.is_pending(TimerKind::Reconnect));
        timers.cancel_all();
        assert!(!timers.is_pending(TimerKind::Reconnect));
    }

    #[test]
    fn test_duplicate_error_keeps_kind() {
        assert!(matches!(
            duplicate_error(&Error::auth(403, "forbidden")),
            Error::Auth { status: 403, .. }
        ));
        assert!(matches!(
            duplicate_error(&Error::ConnectionClosed),
            Error::Connection { .. }
        ));
    }
}
