//! JSON-RPC correlation layer.
//!
//! [`JsonRpc`] turns method calls into text frames on the active connector
//! and matches answers back to the waiting callers by request id.
//!
//! # Correlation
//!
//! ```text
//! execute_outgoing ──► pending[id] = oneshot ──► frame ──► connector
//!                                   ▲
//! handle_incoming_message ── response{id} ──┘  (or timeout removes it)
//! ```
//!
//! A pending entry is removed exactly once: by its response, by its
//! timeout, by [`JsonRpc::fail_pending`], or when the caller drops the
//! returned future.
//!
//! Server-initiated requests are dispatched to handlers registered with
//! [`JsonRpc::handle`]; requests carrying an id are answered.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::jsonrpc::{RpcError, RpcPacket, RpcRequest, RpcResponse};
use crate::transport::Frame;

// ============================================================================
// Constants
// ============================================================================

/// Default time to wait for an answer.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Types
// ============================================================================

/// Map of request ids to waiting callers.
type CorrelationMap = FxHashMap<RequestId, oneshot::Sender<Result<Value>>>;

/// Writes a frame to whatever connector is active. Returns `false` if the
/// frame was not accepted.
pub type FrameSender = Arc<dyn Fn(Frame) -> bool + Send + Sync>;

/// Handler for a server-initiated method.
pub type RpcHandler = Arc<dyn Fn(Value) -> std::result::Result<Value, RpcError> + Send + Sync>;

/// One call of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    /// Method name.
    pub method: String,
    /// Parameters.
    pub params: Value,
}

impl RpcCall {
    /// Creates a call.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

// ============================================================================
// JsonRpc
// ============================================================================

struct Inner {
    sender: FrameSender,
    next_id: AtomicU64,
    pending: Mutex<CorrelationMap>,
    handlers: RwLock<FxHashMap<String, RpcHandler>>,
}

/// Removes its pending entry when the waiting future goes away.
struct PendingGuard {
    inner: Arc<Inner>,
    request_id: RequestId,
}

impl PendingGuard {
    fn new(inner: &Arc<Inner>, request_id: RequestId) -> Self {
        Self {
            inner: Arc::clone(inner),
            request_id,
        }
    }

    /// Removes the entry now. Returns `false` if something else already did.
    fn remove(&self) -> bool {
        self.inner.pending.lock().remove(&self.request_id).is_some()
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

/// JSON-RPC 2.0 endpoint.
///
/// Cheap to clone; clones share ids, pending calls and handlers.
#[derive(Clone)]
pub struct JsonRpc {
    inner: Arc<Inner>,
}

impl JsonRpc {
    /// Creates an endpoint writing through `sender`.
    #[must_use]
    pub fn new(sender: FrameSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                sender,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(CorrelationMap::default()),
                handlers: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    /// Registers the handler for a server-initiated method, replacing any
    /// previous one.
    pub fn handle<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> std::result::Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .insert(method.into(), Arc::new(handler));
    }

    /// Returns the number of calls waiting for an answer.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    /// Calls a remote method and waits for its result.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the connector refused the frame
    /// - [`Error::RpcTimeout`] if no answer arrives within `request_timeout`
    /// - [`Error::Rpc`] / [`Error::MethodNotFound`] for an error answer
    /// - [`Error::ConnectionClosed`] if pending calls were failed
    pub async fn execute_outgoing(
        &self,
        method: &str,
        params: Value,
        request_timeout: Duration,
    ) -> Result<Value> {
        let request_id = self.next_request_id();
        let request = RpcRequest::call(method, params, request_id);
        let json = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, tx);
        let guard = PendingGuard::new(&self.inner, request_id);

        if !(self.inner.sender)(Frame::Text(json)) {
            return Err(Error::not_connected(format!("cannot send {method}")));
        }
        trace!(%request_id, method, "RPC request sent");

        Self::wait_response(guard, rx, request_timeout).await
    }

    /// Sends several calls in one frame.
    ///
    /// Returns one future per call, in call order, each correlated by its
    /// own id. If the frame cannot be sent every future fails with
    /// [`Error::NotConnected`].
    #[must_use]
    pub fn execute_outgoing_batch(
        &self,
        calls: Vec<RpcCall>,
        request_timeout: Duration,
    ) -> Vec<BoxFuture<'static, Result<Value>>> {
        let mut requests = Vec::with_capacity(calls.len());
        let mut receivers = Vec::with_capacity(calls.len());

        {
            let mut pending = self.inner.pending.lock();
            for call in calls {
                let request_id = self.next_request_id();
                let (tx, rx) = oneshot::channel();
                pending.insert(request_id, tx);
                requests.push(RpcRequest::call(call.method, call.params, request_id));
                receivers.push((request_id, rx));
            }
        }

        let sent = match serde_json::to_string(&requests) {
            Ok(json) => (self.inner.sender)(Frame::Text(json)),
            Err(e) => {
                warn!(error = %e, "Failed to serialize RPC batch");
                false
            }
        };

        if !sent {
            let mut pending = self.inner.pending.lock();
            return receivers
                .into_iter()
                .map(|(request_id, _)| {
                    pending.remove(&request_id);
                    future::ready(Err(Error::not_connected("cannot send batch"))).boxed()
                })
                .collect();
        }
        trace!(count = receivers.len(), "RPC batch sent");

        receivers
            .into_iter()
            .map(|(request_id, rx)| {
                let guard = PendingGuard::new(&self.inner, request_id);
                Self::wait_response(guard, rx, request_timeout).boxed()
            })
            .collect()
    }

    async fn wait_response(
        guard: PendingGuard,
        mut rx: oneshot::Receiver<Result<Value>>,
        request_timeout: Duration,
    ) -> Result<Value> {
        let request_id = guard.request_id;
        match timeout(request_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let removed = guard.remove();
                if !removed && let Ok(result) = rx.try_recv() {
                    // answered in the same instant the timer fired
                    return result;
                }
                debug!(%request_id, "RPC request timed out");
                Err(Error::rpc_timeout(
                    request_id,
                    request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Fails every pending call with [`Error::ConnectionClosed`].
    pub fn fail_pending(&self) {
        let pending: Vec<_> = self.inner.pending.lock().drain().collect();
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending RPC requests");
        }
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    /// Processes one text frame from the server.
    ///
    /// Responses resolve pending calls; requests are dispatched and, when
    /// they carry an id, answered in a single frame. Malformed input is
    /// logged and dropped.
    pub fn handle_incoming_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Malformed JSON-RPC frame");
                return;
            }
        };

        match RpcPacket::classify(value) {
            RpcPacket::Batch(items) => {
                let responses: Vec<RpcResponse> = items
                    .into_iter()
                    .filter_map(|item| match RpcPacket::classify(item) {
                        RpcPacket::Request(request) => self.dispatch(request),
                        RpcPacket::Response(response) => {
                            self.resolve(response);
                            None
                        }
                        RpcPacket::Batch(_) | RpcPacket::Unknown(_) => {
                            warn!("Unknown item in JSON-RPC batch");
                            None
                        }
                    })
                    .collect();

                if !responses.is_empty() {
                    self.reply(&responses);
                }
            }

            RpcPacket::Request(request) => {
                if let Some(response) = self.dispatch(request) {
                    self.reply(&response);
                }
            }

            RpcPacket::Response(response) => self.resolve(response),

            RpcPacket::Unknown(value) => {
                warn!(%value, "Unknown JSON-RPC message");
            }
        }
    }

    fn dispatch(&self, request: RpcRequest) -> Option<RpcResponse> {
        let handler = self.inner.handlers.read().get(&request.method).cloned();

        let result = match handler {
            Some(handler) => handler(request.params),
            None => {
                warn!(method = %request.method, "No handler for JSON-RPC method");
                Err(RpcError::method_not_found())
            }
        };

        let id = request.id?;
        Some(match result {
            Ok(value) => RpcResponse::success(Some(id), value),
            Err(error) => RpcResponse::failure(Some(id), error),
        })
    }

    fn resolve(&self, response: RpcResponse) {
        let Some(request_id) = response.request_id() else {
            warn!(error = ?response.error, "JSON-RPC response without id");
            return;
        };

        let tx = self.inner.pending.lock().remove(&request_id);
        match tx {
            Some(tx) => {
                let _ = tx.send(response.into_result());
            }
            None => debug!(%request_id, "Response for unknown request"),
        }
    }

    fn reply<T: Serialize>(&self, payload: &T) {
        match serde_json::to_string(payload) {
            Ok(json) => {
                if !(self.inner.sender)(Frame::Text(json)) {
                    warn!("Could not send JSON-RPC response");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize JSON-RPC response"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
