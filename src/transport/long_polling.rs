//! Long-polling connector.
//!
//! A spawned task issues one GET at a time against the subscription URL.
//! Publishing is a separate POST to the publication URL.
//!
//! # Poll Cycle
//!
//! | Outcome | Action |
//! |---------|--------|
//! | 5 s pass without an answer | mark connected (optimistic) |
//! | 60 s pass without an answer | abort and reissue the GET |
//! | `200` | mark connected, deliver body, poll again |
//! | `304` + sentinel `Expires` | report `Last-Message-Id`, poll again |
//! | anything else | emit `Error`, stop polling |
//!
//! The next GET is only issued after the consumer has processed the
//! previous frame, so the subscription URL reflects the latest message id.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::Error;

use super::{
    ConnectionType, Connector, ConnectorContext, ConnectorEvent, EventSink, Frame, HttpClient,
    HttpResponse, PathProvider,
};

// ============================================================================
// Constants
// ============================================================================

/// Delay after which a pending poll counts as connected.
pub const FAILURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum lifetime of one poll request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// `Expires` value the server uses to mark a "no new messages" answer.
pub const NOT_MODIFIED_SENTINEL: &str = "Thu, 01 Jan 1973 11:11:01 GMT";

/// Header carrying the id of the last stored message.
pub const LAST_MESSAGE_ID_HEADER: &str = "Last-Message-Id";

// ============================================================================
// Types
// ============================================================================

struct PollState {
    generation: u64,
    active: bool,
    connected: bool,
    task: Option<JoinHandle<()>>,
}

type SharedState = Arc<Mutex<PollState>>;

/// What to do after one poll.
enum PollOutcome {
    Again,
    Stop,
}

#[derive(Clone)]
struct PollContext {
    generation: u64,
    state: SharedState,
    events: EventSink,
    path: PathProvider,
    http: Arc<dyn HttpClient>,
}

impl PollContext {
    fn is_current(&self) -> bool {
        let state = self.state.lock();
        state.active && state.generation == self.generation
    }

    fn emit(&self, event: ConnectorEvent) {
        if self.is_current() {
            self.events.emit(event);
        }
    }

    fn set_connected(&self, connected: bool) {
        let mut state = self.state.lock();
        if state.generation != self.generation || !state.active || state.connected == connected {
            return;
        }
        state.connected = connected;
        if connected {
            self.events.emit(ConnectorEvent::Open);
        }
    }

    fn fail(&self, error: Error) {
        let mut state = self.state.lock();
        if state.generation != self.generation || !state.active {
            return;
        }
        state.active = false;
        state.connected = false;
        state.task = None;
        self.events.emit(ConnectorEvent::Error(error));
    }
}

// ============================================================================
// LongPollingConnector
// ============================================================================

/// Serialized HTTP request-cycle transport.
pub struct LongPollingConnector {
    events: EventSink,
    path: PathProvider,
    publish_path: PathProvider,
    http: Arc<dyn HttpClient>,
    state: SharedState,
}

impl LongPollingConnector {
    /// Creates an idle connector.
    #[must_use]
    pub fn new(context: ConnectorContext) -> Self {
        Self {
            events: context.events,
            path: context.path,
            publish_path: context.publish_path,
            http: context.http,
            state: Arc::new(Mutex::new(PollState {
                generation: 0,
                active: false,
                connected: false,
                task: None,
            })),
        }
    }

    async fn run(context: PollContext) {
        while context.is_current() {
            match Self::poll_once(&context).await {
                PollOutcome::Again => {}
                PollOutcome::Stop => break,
            }
        }
        trace!(generation = context.generation, "Poll loop finished");
    }

    async fn poll_once(context: &PollContext) -> PollOutcome {
        let url = match (context.path)() {
            Ok(url) => url,
            Err(e) => {
                context.fail(e);
                return PollOutcome::Stop;
            }
        };

        let request = context.http.get(&url);
        tokio::pin!(request);
        let failure = sleep(FAILURE_TIMEOUT);
        tokio::pin!(failure);
        let deadline = sleep(REQUEST_TIMEOUT);
        tokio::pin!(deadline);
        let mut failure_elapsed = false;

        let result = loop {
            tokio::select! {
                result = &mut request => break result,

                () = &mut failure, if !failure_elapsed => {
                    failure_elapsed = true;
                    context.set_connected(true);
                }

                () = &mut deadline => {
                    debug!("Poll request timed out, reissuing");
                    return PollOutcome::Again;
                }
            }
        };

        match result {
            Ok(response) => Self::handle_response(context, response).await,
            Err(e) => {
                warn!(error = %e, "Poll request failed");
                context.fail(e);
                PollOutcome::Stop
            }
        }
    }

    async fn handle_response(context: &PollContext, response: HttpResponse) -> PollOutcome {
        match response.status {
            200 => {
                context.set_connected(true);
                if response.body.is_empty() || !context.is_current() {
                    return PollOutcome::Again;
                }
                let done = context
                    .events
                    .emit_tracked(ConnectorEvent::Message(Frame::Binary(response.body.to_vec())));
                let _ = done.await;
                PollOutcome::Again
            }

            304 if response.header("Expires") == Some(NOT_MODIFIED_SENTINEL) => {
                context.set_connected(true);
                if let Some(mid) = response.header(LAST_MESSAGE_ID_HEADER)
                    && !mid.is_empty()
                    && context.is_current()
                {
                    let done = context
                        .events
                        .emit_tracked(ConnectorEvent::LastMessageId(mid.to_string()));
                    let _ = done.await;
                }
                PollOutcome::Again
            }

            status => {
                context.fail(Error::connection(format!(
                    "long polling request failed with status {status}"
                )));
                PollOutcome::Stop
            }
        }
    }
}

impl Connector for LongPollingConnector {
    fn connect(&self) {
        let mut state = self.state.lock();
        if state.active {
            debug!("Long polling connect ignored");
            return;
        }

        state.generation += 1;
        state.active = true;
        state.connected = false;

        let context = PollContext {
            generation: state.generation,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            path: Arc::clone(&self.path),
            http: Arc::clone(&self.http),
        };
        state.task = Some(tokio::spawn(Self::run(context)));
    }

    fn disconnect(&self, code: u16, reason: &str) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.active = false;
        if let Some(task) = state.task.take() {
            task.abort();
        }

        let was_connected = std::mem::replace(&mut state.connected, false);
        if was_connected {
            self.events.emit(ConnectorEvent::Disconnect {
                code,
                reason: reason.to_string(),
            });
        }
        debug!(code, reason, was_connected, "Long polling disconnected");
    }

    fn send(&self, frame: Frame) -> bool {
        if !self.state.lock().active {
            return false;
        }

        let url = match (self.publish_path)() {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "No publication path");
                return false;
            }
        };

        let http = Arc::clone(&self.http);
        let body = match frame {
            Frame::Text(text) => text.into_bytes(),
            Frame::Binary(data) => data,
        };
        tokio::spawn(async move {
            match http.post(&url, body).await {
                Ok(response) if response.status < 400 => {
                    trace!(status = response.status, "Frame published");
                }
                Ok(response) => warn!(status = response.status, "Publish request rejected"),
                Err(e) => warn!(error = %e, "Publish request failed"),
            }
        });
        true
    }

    fn connected(&self) -> bool {
        self.state.lock().connected
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::LongPolling
    }
}

impl Drop for LongPollingConnector {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.active = false;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::error::Result;
    use crate::transport::{ReqwestHttpClient, TransportEvent};

    /// Scripted client: pops GET answers in order, then hangs forever.
    #[derive(Default)]
    struct ScriptedHttp {
        answers: Mutex<VecDeque<HttpResponse>>,
        gets: AtomicUsize,
        posts: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl HttpClient for ScriptedHttp {
        async fn get(&self, _url: &str) -> Result<HttpResponse> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            let answer = self.answers.lock().pop_front();
            match answer {
                Some(response) => Ok(response),
                None => std::future::pending().await,
            }
        }

        async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse> {
            self.posts.lock().push((url.to_string(), body));
            Ok(HttpResponse::new(200, bytes::Bytes::new()))
        }
    }

    fn context_with(
        http: Arc<dyn HttpClient>,
        base: &str,
    ) -> (ConnectorContext, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = format!("{base}/sub/");
        let publish = format!("{base}/pub/");
        let context = ConnectorContext {
            events: EventSink::new(ConnectionType::LongPolling, tx),
            path: Arc::new(move || -> Result<String> { Ok(sub.clone()) }),
            publish_path: Arc::new(move || -> Result<String> { Ok(publish.clone()) }),
            http,
        };
        (context, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> ConnectorEvent {
        timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("event in time")
            .expect("stream open")
            .event
    }

    #[tokio::test]
    async fn test_poll_cycle_against_http_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub/"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sub/"))
            .respond_with(
                ResponseTemplate::new(304)
                    .insert_header("Expires", NOT_MODIFIED_SENTINEL)
                    .insert_header("Last-Message-Id", "mid-7"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sub/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let http = Arc::new(ReqwestHttpClient::new().expect("client"));
        let (context, mut rx) = context_with(http, &server.uri());
        let connector = LongPollingConnector::new(context);
        connector.connect();

        assert!(matches!(next_event(&mut rx).await, ConnectorEvent::Open));
        match next_event(&mut rx).await {
            ConnectorEvent::Message(frame) => assert_eq!(frame.as_bytes(), b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut rx).await {
            ConnectorEvent::LastMessageId(mid) => assert_eq!(mid, "mid-7"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(next_event(&mut rx).await, ConnectorEvent::Error(_)));
        assert!(!connector.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_connect_and_request_timeout() {
        let http = Arc::new(ScriptedHttp::default());
        let (context, mut rx) = context_with(Arc::clone(&http) as Arc<dyn HttpClient>, "http://push");
        let connector = LongPollingConnector::new(context);
        connector.connect();

        let started = tokio::time::Instant::now();
        assert!(matches!(next_event(&mut rx).await, ConnectorEvent::Open));
        assert!(started.elapsed() >= FAILURE_TIMEOUT);
        assert!(connector.connected());
        assert_eq!(http.gets.load(Ordering::SeqCst), 1);

        sleep(REQUEST_TIMEOUT).await;
        assert_eq!(http.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_request_in_flight() {
        let http = Arc::new(ScriptedHttp::default());
        let (context, _rx) = context_with(Arc::clone(&http) as Arc<dyn HttpClient>, "http://push");
        let connector = LongPollingConnector::new(context);

        connector.connect();
        connector.connect();
        sleep(Duration::from_secs(1)).await;

        assert_eq!(http.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_posts_to_publish_path() {
        let http = Arc::new(ScriptedHttp::default());
        let (context, _rx) = context_with(Arc::clone(&http) as Arc<dyn HttpClient>, "http://push");
        let connector = LongPollingConnector::new(context);

        assert!(!connector.send(Frame::Binary(vec![1])));

        connector.connect();
        assert!(connector.send(Frame::Binary(vec![1, 2])));
        sleep(Duration::from_millis(10)).await;

        let posts = http.posts.lock().clone();
        assert_eq!(posts, vec![("http://push/pub/".to_string(), vec![1, 2])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_reports_only_when_connected() {
        let http = Arc::new(ScriptedHttp::default());
        http.answers
            .lock()
            .push_back(HttpResponse::new(200, bytes::Bytes::new()));
        let (context, mut rx) = context_with(Arc::clone(&http) as Arc<dyn HttpClient>, "http://push");
        let connector = LongPollingConnector::new(context);

        connector.disconnect(1000, "idle");
        assert!(rx.try_recv().is_err());

        connector.connect();
        assert!(matches!(next_event(&mut rx).await, ConnectorEvent::Open));

        connector.disconnect(3004, "manual");
        match next_event(&mut rx).await {
            ConnectorEvent::Disconnect { code, reason } => {
                assert_eq!(code, 3004);
                assert_eq!(reason, "manual");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!connector.connected());
    }
}
