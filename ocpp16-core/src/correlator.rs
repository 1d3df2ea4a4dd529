//! Call correlation for outbound requests
//!
//! Each connection owns one `Correlator`. Outbound calls get a fresh
//! message id and a pending entry holding a oneshot channel; the session's
//! inbound loop resolves entries as CALLRESULT/CALLERROR frames arrive,
//! matched purely by id. Responses may arrive in any order relative to the
//! order calls were issued.
//!
//! A pending entry lives until the first of: matching response, timeout,
//! caller cancellation, connection close. Late responses after that are
//! dropped with a warning, never surfaced as an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::messages::{Call, ErrorCode};
use crate::transport::TransportSink;

/// Why an outbound call did not produce a payload
#[derive(Debug, Error)]
pub enum CallFailure {
    /// The peer answered with a CALLERROR frame.
    #[error("remote error {code}: {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    /// No response arrived within the caller's deadline.
    #[error("timed out waiting for response")]
    Timeout,

    /// The connection closed while the call was pending, or was already
    /// closed when the call was issued.
    #[error("connection closed")]
    ConnectionClosed,
}

struct PendingCall {
    action: String,
    created_at: Instant,
    response_tx: oneshot::Sender<Result<Value, CallFailure>>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingCall>>>;

/// Removes the pending entry when the calling future completes or is
/// dropped. Harmless if the entry was already resolved.
struct PendingGuard {
    pending: PendingMap,
    message_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.message_id);
    }
}

/// Per-connection outbound call state
#[derive(Clone)]
pub struct Correlator {
    pending: PendingMap,
    sink: TransportSink,
}

impl Correlator {
    pub fn new(sink: TransportSink) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    /// Send a call and suspend until its response, a CALLERROR, the
    /// timeout, or connection close. Cancelling the returned future
    /// releases the pending entry.
    pub async fn send_call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallFailure> {
        let (response_tx, response_rx) = oneshot::channel();
        let message_id = self.register(action, response_tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            message_id: message_id.clone(),
        };

        let call = Call::with_id(&message_id, action, payload);
        debug!(%action, %message_id, "sending call");
        self.sink
            .send(call.encode())
            .await
            .map_err(|_| CallFailure::ConnectionClosed)?;

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without resolving; the connection is gone.
            Ok(Err(_)) => Err(CallFailure::ConnectionClosed),
            Err(_) => {
                warn!(%action, %message_id, "call timed out");
                Err(CallFailure::Timeout)
            }
        }
    }

    /// Insert a pending entry under a message id unused on this connection.
    fn register(
        &self,
        action: &str,
        response_tx: oneshot::Sender<Result<Value, CallFailure>>,
    ) -> String {
        let mut pending = self.pending.lock();
        let message_id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(
            message_id.clone(),
            PendingCall {
                action: action.to_string(),
                created_at: Instant::now(),
                response_tx,
            },
        );
        message_id
    }

    /// Action name of a pending call, if one is registered under the id.
    pub fn pending_action(&self, message_id: &str) -> Option<String> {
        self.pending
            .lock()
            .get(message_id)
            .map(|p| p.action.clone())
    }

    /// Resolve a pending call with a payload or failure. Called by the
    /// session's inbound loop. Late, duplicate, or foreign message ids are
    /// logged and discarded.
    pub fn resolve(&self, message_id: &str, outcome: Result<Value, CallFailure>) {
        match self.pending.lock().remove(message_id) {
            Some(entry) => {
                debug!(
                    action = %entry.action,
                    %message_id,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "resolving call"
                );
                if entry.response_tx.send(outcome).is_err() {
                    debug!(%message_id, "caller no longer waiting");
                }
            }
            None => {
                warn!(%message_id, "dropping response for unknown or expired call");
            }
        }
    }

    /// Resolve every pending call with `ConnectionClosed`. Used when the
    /// session leaves the Open state.
    pub fn fail_all(&self) {
        let drained: Vec<(String, PendingCall)> = self.pending.lock().drain().collect();
        for (message_id, entry) in drained {
            debug!(action = %entry.action, %message_id, "failing pending call: connection closed");
            let _ = entry.response_tx.send(Err(CallFailure::ConnectionClosed));
        }
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
