//! Connection session
//!
//! One `Session` owns one logical charge-point connection: its identity,
//! the transport sink, the correlator and dispatcher bound to it, and the
//! charge-point-scoped domain state (transactions, reservations).
//!
//! Lifecycle: Connecting -> Open -> Closing -> Closed. Entering Closing
//! resolves every pending outbound call with `ConnectionClosed`; Closed is
//! terminal and a reconnect always builds a fresh session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::correlator::{CallFailure, Correlator};
use crate::dispatch::Dispatcher;
use crate::messages::OcppMessage;
use crate::schema::SchemaRegistry;
use crate::transport::{Transport, TransportSink, TransportSource};

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Transport handshake not yet complete.
    Connecting,
    /// Normal operation.
    Open,
    /// Transport gone; pending calls being failed.
    Closing,
    /// Terminal.
    Closed,
}

/// Whether a transaction is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionStatus {
    Active,
    Stopped,
}

/// One charging transaction tracked by the Central System
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub transaction_id: i32,
    pub connector_id: i32,
    pub id_tag: String,
    pub meter_start: i32,
    pub start_timestamp: DateTime<Utc>,
    pub status: TransactionStatus,
}

/// One reservation issued to the charge point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reservation {
    pub reservation_id: i32,
    pub connector_id: i32,
    pub id_tag: String,
    pub expiry: DateTime<Utc>,
}

impl Reservation {
    /// Expiry is advisory: nothing reaps reservations eagerly, but an
    /// expired one is rejected at use-time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

/// Domain state scoped to one charge point connection
#[derive(Debug, Default)]
pub struct ChargePointState {
    transactions: HashMap<i32, Transaction>,
    reservations: HashMap<i32, Reservation>,
    // Strictly monotonic; never reuses an id after a stop.
    last_transaction_id: i32,
}

impl ChargePointState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new transaction and return its id.
    pub fn begin_transaction(
        &mut self,
        connector_id: i32,
        id_tag: impl Into<String>,
        meter_start: i32,
        start_timestamp: DateTime<Utc>,
    ) -> i32 {
        self.last_transaction_id += 1;
        let transaction_id = self.last_transaction_id;
        self.transactions.insert(
            transaction_id,
            Transaction {
                transaction_id,
                connector_id,
                id_tag: id_tag.into(),
                meter_start,
                start_timestamp,
                status: TransactionStatus::Active,
            },
        );
        transaction_id
    }

    /// Evict a transaction from the active set, marking it stopped.
    /// Returns `None` for an unknown id.
    pub fn finish_transaction(&mut self, transaction_id: i32) -> Option<Transaction> {
        self.transactions.remove(&transaction_id).map(|mut tx| {
            tx.status = TransactionStatus::Stopped;
            tx
        })
    }

    pub fn transaction(&self, transaction_id: i32) -> Option<&Transaction> {
        self.transactions.get(&transaction_id)
    }

    pub fn active_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn add_reservation(&mut self, reservation: Reservation) {
        self.reservations.insert(reservation.reservation_id, reservation);
    }

    pub fn remove_reservation(&mut self, reservation_id: i32) -> Option<Reservation> {
        self.reservations.remove(&reservation_id)
    }

    pub fn reservation(&self, reservation_id: i32) -> Option<&Reservation> {
        self.reservations.get(&reservation_id)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }
}

/// Point-in-time view of a session for status queries
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub identity: String,
    pub state: SessionState,
    pub active_transactions: usize,
    pub transactions: Vec<Transaction>,
    pub reservations: Vec<Reservation>,
}

/// One logical charge-point connection
pub struct Session {
    identity: String,
    state: Mutex<SessionState>,
    correlator: Correlator,
    dispatcher: Dispatcher,
    schema: Arc<SchemaRegistry>,
    sink: TransportSink,
    domain: Arc<RwLock<ChargePointState>>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Build a session over one endpoint of a transport link. The returned
    /// source must be fed to [`Session::run`].
    pub fn new(
        identity: impl Into<String>,
        transport: Transport,
        dispatcher: Dispatcher,
        domain: Arc<RwLock<ChargePointState>>,
    ) -> (Arc<Self>, TransportSource) {
        let Transport { sink, source } = transport;
        let schema = dispatcher.schema().clone();
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(Self {
            identity: identity.into(),
            state: Mutex::new(SessionState::Connecting),
            correlator: Correlator::new(sink.clone()),
            dispatcher,
            schema,
            sink,
            domain,
            shutdown,
        });
        (session, source)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn domain(&self) -> &Arc<RwLock<ChargePointState>> {
        &self.domain
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Issue an outbound call on this session and suspend for the answer.
    /// Calls issued while still Connecting are buffered by the transport
    /// link; a Closing or Closed session rejects immediately.
    pub async fn call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallFailure> {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return Err(CallFailure::ConnectionClosed);
        }
        self.correlator.send_call(action, payload, timeout).await
    }

    /// Drive the inbound frame loop until the transport closes or the
    /// session is closed from elsewhere (reconnect displacement).
    ///
    /// Inbound calls are handled strictly sequentially; the loop itself is
    /// the session's single logical task.
    pub async fn run(self: Arc<Self>, mut source: TransportSource) {
        let mut shutdown = self.shutdown.subscribe();
        {
            let mut state = self.state.lock();
            if *state != SessionState::Connecting {
                return;
            }
            *state = SessionState::Open;
        }
        info!(identity = %self.identity, "session open");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = source.receive() => match frame {
                    Ok(text) => self.handle_frame(&text).await,
                    Err(_) => {
                        debug!(identity = %self.identity, "transport closed");
                        break;
                    }
                },
            }
        }

        self.close();
    }

    /// Transition to Closing, fail every pending call, then settle in
    /// Closed. Idempotent; safe to call from any task.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        self.correlator.fail_all();
        let _ = self.shutdown.send(true);
        *self.state.lock() = SessionState::Closed;
        info!(identity = %self.identity, "session closed");
    }

    /// Status snapshot for operator queries. Uses the same lock as the
    /// handler path, so it never observes a half-applied mutation.
    pub async fn status(&self) -> SessionStatus {
        let domain = self.domain.read().await;
        let transactions: Vec<Transaction> = domain.active_transactions().cloned().collect();
        SessionStatus {
            identity: self.identity.clone(),
            state: self.state(),
            active_transactions: transactions.len(),
            transactions,
            reservations: domain.reservations().cloned().collect(),
        }
    }

    async fn handle_frame(&self, text: &str) {
        debug!(identity = %self.identity, frame = %text, "received frame");

        let message = match OcppMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                // A bad frame is discarded; it does not close the connection.
                warn!(identity = %self.identity, error = %e, "discarding undecodable frame");
                return;
            }
        };

        match message {
            OcppMessage::Call(call) => {
                let reply = self.dispatcher.dispatch(&call).await;
                if self.sink.send(reply.encode()).await.is_err() {
                    warn!(identity = %self.identity, "transport closed before reply could be sent");
                }
            }
            OcppMessage::CallResult(result) => {
                if let Some(action) = self.correlator.pending_action(&result.message_id) {
                    // Structural check on the result payload; advisory, the
                    // typed parse at the caller is authoritative.
                    if let Err(e) = self.schema.validate_result(&action, &result.payload) {
                        warn!(
                            identity = %self.identity,
                            %action,
                            error = %e,
                            "call result payload failed validation"
                        );
                    }
                }
                self.correlator.resolve(&result.message_id, Ok(result.payload));
            }
            OcppMessage::CallError(error) => {
                self.correlator.resolve(
                    &error.message_id,
                    Err(CallFailure::Remote {
                        code: error.error_code,
                        description: error.error_description,
                        details: error.error_details,
                    }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Call, ErrorCode};
    use serde_json::json;

    fn heartbeat_session() -> (Arc<Session>, Transport) {
        let (engine, peer) = crate::transport::link(16);
        let schema = Arc::new(SchemaRegistry::ocpp16());
        let mut dispatcher = Dispatcher::new(schema);
        dispatcher.register("Heartbeat", |_payload| async {
            Ok(json!({"currentTime": "2026-03-01T10:00:00Z"}))
        });
        let (session, source) = Session::new(
            "CP_1",
            engine,
            dispatcher,
            Arc::new(RwLock::new(ChargePointState::new())),
        );
        tokio::spawn(session.clone().run(source));
        (session, peer)
    }

    async fn expect_reply(peer: &mut Transport) -> OcppMessage {
        let frame = peer.source.receive().await.unwrap();
        OcppMessage::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn malformed_frame_discarded_session_stays_open() {
        let (session, mut peer) = heartbeat_session();

        peer.sink.send("this is not ocpp".to_string()).await.unwrap();
        peer.sink
            .send(Call::with_id("m1", "Heartbeat", json!({})).encode())
            .await
            .unwrap();

        // The bad frame was skipped; the next call is still answered.
        match expect_reply(&mut peer).await {
            OcppMessage::CallResult(r) => assert_eq!(r.message_id, "m1"),
            other => panic!("expected CallResult, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn unknown_action_answered_and_session_stays_open() {
        let (session, mut peer) = heartbeat_session();

        peer.sink
            .send(Call::with_id("m2", "NoSuchAction", json!({})).encode())
            .await
            .unwrap();

        match expect_reply(&mut peer).await {
            OcppMessage::CallError(e) => {
                assert_eq!(e.message_id, "m2");
                assert_eq!(e.error_code, ErrorCode::NotImplemented);
            }
            other => panic!("expected CallError, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn transport_loss_closes_session_and_fails_pending_calls() {
        let (session, peer) = heartbeat_session();
        tokio::task::yield_now().await;
        assert_eq!(session.state(), SessionState::Open);

        let s = session.clone();
        let pending = tokio::spawn(async move {
            s.call("Reset", json!({"type": "Soft"}), Duration::from_secs(30)).await
        });
        // Let the call register before the transport disappears.
        tokio::task::yield_now().await;

        drop(peer);
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, CallFailure::ConnectionClosed));

        // The run loop has wound the session down.
        tokio::task::yield_now().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn call_on_closed_session_is_rejected() {
        let (session, _peer) = heartbeat_session();
        tokio::task::yield_now().await;

        session.close();
        let err = session
            .call("Heartbeat", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CallFailure::ConnectionClosed));
    }

    #[test]
    fn transaction_ids_are_monotonic_across_stops() {
        let mut state = ChargePointState::new();
        let now = Utc::now();

        let first = state.begin_transaction(1, "RFID1", 0, now);
        let second = state.begin_transaction(2, "RFID2", 10, now);
        assert_eq!((first, second), (1, 2));

        // Stopping and starting again must not reuse an id.
        assert!(state.finish_transaction(first).is_some());
        let third = state.begin_transaction(1, "RFID3", 20, now);
        assert_eq!(third, 3);

        assert!(state.finish_transaction(99).is_none());
    }

    #[test]
    fn finished_transaction_is_marked_stopped_and_evicted() {
        let mut state = ChargePointState::new();
        let id = state.begin_transaction(1, "RFID1", 100, Utc::now());

        let stopped = state.finish_transaction(id).unwrap();
        assert_eq!(stopped.status, TransactionStatus::Stopped);
        assert!(state.transaction(id).is_none());
    }

    #[test]
    fn reservation_expiry_is_checked_at_use_time() {
        let mut state = ChargePointState::new();
        let now = Utc::now();
        state.add_reservation(Reservation {
            reservation_id: 7,
            connector_id: 1,
            id_tag: "RFID1".to_string(),
            expiry: now - chrono::Duration::minutes(5),
        });

        // Still present: nothing reaps eagerly.
        let reservation = state.reservation(7).unwrap();
        assert!(reservation.is_expired(now));
    }
}
