//! Central System role
//!
//! Wires the standard OCPP 1.6 Central System behavior onto a session:
//! the inbound handler set (BootNotification through FirmwareStatus-
//! Notification) operating on the session's domain state, and the
//! outbound command helpers (RemoteStartTransaction, ChangeConfiguration,
//! Reset, ReserveNow, ...) issued through the session's correlator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::correlator::CallFailure;
use crate::dispatch::{parse_request, to_response, Dispatcher};
use crate::messages::Action;
use crate::registry::SessionRegistry;
use crate::schema::SchemaRegistry;
use crate::session::{ChargePointState, Reservation, Session, SessionStatus};
use crate::transport::{Transport, TransportSource};
use crate::types::*;

/// Failure of an operator-issued command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no connected charge point with identity {0:?}")]
    UnknownChargePoint(String),

    #[error("unknown reservation {0}")]
    UnknownReservation(i32),

    #[error("reservation {0} has expired")]
    ReservationExpired(i32),

    #[error(transparent)]
    Call(#[from] CallFailure),

    #[error("malformed response payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The server-role endpoint managing charge points
pub struct CentralSystem {
    registry: Arc<SessionRegistry>,
    schema: Arc<SchemaRegistry>,
    heartbeat_interval: i32,
    call_timeout: Duration,
}

impl Default for CentralSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralSystem {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            schema: Arc::new(SchemaRegistry::ocpp16()),
            heartbeat_interval: 30,
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Interval advertised in BootNotification responses.
    pub fn with_heartbeat_interval(mut self, seconds: i32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    /// Deadline for outbound commands.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Build and register a session for a newly connected charge point.
    /// The caller spawns [`Session::run`] with the returned source.
    pub async fn attach(
        &self,
        identity: impl Into<String>,
        transport: Transport,
    ) -> (Arc<Session>, TransportSource) {
        let identity = identity.into();
        let domain = Arc::new(RwLock::new(ChargePointState::new()));

        let mut dispatcher = Dispatcher::new(self.schema.clone());
        install_handlers(
            &mut dispatcher,
            &identity,
            &domain,
            self.heartbeat_interval,
        );

        let (session, source) = Session::new(identity, transport, dispatcher, domain);
        self.registry.register(session.clone()).await;
        (session, source)
    }

    async fn session(&self, identity: &str) -> Result<Arc<Session>, CommandError> {
        self.registry
            .lookup(identity)
            .await
            .ok_or_else(|| CommandError::UnknownChargePoint(identity.to_string()))
    }

    async fn command<Req, Resp>(
        &self,
        identity: &str,
        action: Action,
        request: &Req,
    ) -> Result<Resp, CommandError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let session = self.session(identity).await?;
        let payload = serde_json::to_value(request)?;
        let result = session.call(action.as_str(), payload, self.call_timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Ask the charge point to start a charging session.
    pub async fn remote_start_transaction(
        &self,
        identity: &str,
        id_tag: impl Into<String>,
        connector_id: Option<i32>,
    ) -> Result<RemoteStartStopStatus, CommandError> {
        let response: RemoteStartTransactionResponse = self
            .command(
                identity,
                Action::RemoteStartTransaction,
                &RemoteStartTransactionRequest {
                    id_tag: id_tag.into(),
                    connector_id,
                },
            )
            .await?;
        info!(%identity, status = ?response.status, "RemoteStartTransaction answered");
        Ok(response.status)
    }

    /// Ask the charge point to stop a running transaction.
    pub async fn remote_stop_transaction(
        &self,
        identity: &str,
        transaction_id: i32,
    ) -> Result<RemoteStartStopStatus, CommandError> {
        let response: RemoteStopTransactionResponse = self
            .command(
                identity,
                Action::RemoteStopTransaction,
                &RemoteStopTransactionRequest { transaction_id },
            )
            .await?;
        info!(%identity, transaction_id, status = ?response.status, "RemoteStopTransaction answered");
        Ok(response.status)
    }

    pub async fn change_configuration(
        &self,
        identity: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<ConfigurationStatus, CommandError> {
        let request = ChangeConfigurationRequest {
            key: key.into(),
            value: value.into(),
        };
        let response: ChangeConfigurationResponse = self
            .command(identity, Action::ChangeConfiguration, &request)
            .await?;
        info!(%identity, key = %request.key, status = ?response.status, "ChangeConfiguration answered");
        Ok(response.status)
    }

    pub async fn get_configuration(
        &self,
        identity: &str,
        keys: Option<Vec<String>>,
    ) -> Result<GetConfigurationResponse, CommandError> {
        self.command(
            identity,
            Action::GetConfiguration,
            &GetConfigurationRequest { key: keys },
        )
        .await
    }

    pub async fn reset(
        &self,
        identity: &str,
        kind: ResetType,
    ) -> Result<ResetStatus, CommandError> {
        let response: ResetResponse = self
            .command(identity, Action::Reset, &ResetRequest { kind })
            .await?;
        info!(%identity, ?kind, status = ?response.status, "Reset answered");
        Ok(response.status)
    }

    pub async fn unlock_connector(
        &self,
        identity: &str,
        connector_id: i32,
    ) -> Result<UnlockStatus, CommandError> {
        let response: UnlockConnectorResponse = self
            .command(
                identity,
                Action::UnlockConnector,
                &UnlockConnectorRequest { connector_id },
            )
            .await?;
        Ok(response.status)
    }

    pub async fn change_availability(
        &self,
        identity: &str,
        connector_id: i32,
        kind: AvailabilityType,
    ) -> Result<AvailabilityStatus, CommandError> {
        let response: ChangeAvailabilityResponse = self
            .command(
                identity,
                Action::ChangeAvailability,
                &ChangeAvailabilityRequest { connector_id, kind },
            )
            .await?;
        Ok(response.status)
    }

    /// Reserve a connector. An accepted reservation is recorded in the
    /// session's domain state until cancelled or expired.
    pub async fn reserve_now(
        &self,
        identity: &str,
        connector_id: i32,
        id_tag: impl Into<String>,
        expiry: DateTime<Utc>,
        reservation_id: i32,
    ) -> Result<ReservationStatus, CommandError> {
        let id_tag = id_tag.into();
        let session = self.session(identity).await?;
        let request = ReserveNowRequest {
            connector_id,
            expiry_date: expiry,
            id_tag: id_tag.clone(),
            parent_id_tag: None,
            reservation_id,
        };
        let result = session
            .call(
                Action::ReserveNow.as_str(),
                serde_json::to_value(&request)?,
                self.call_timeout,
            )
            .await?;
        let response: ReserveNowResponse = serde_json::from_value(result)?;

        if response.status == ReservationStatus::Accepted {
            session.domain().write().await.add_reservation(Reservation {
                reservation_id,
                connector_id,
                id_tag,
                expiry,
            });
            info!(%identity, reservation_id, connector_id, "reservation recorded");
        }
        Ok(response.status)
    }

    /// Cancel a previously issued reservation. Expiry is enforced here, at
    /// use-time: the charge point is not asked to cancel a reservation
    /// that already lapsed.
    pub async fn cancel_reservation(
        &self,
        identity: &str,
        reservation_id: i32,
    ) -> Result<CancelReservationStatus, CommandError> {
        let session = self.session(identity).await?;

        {
            let domain = session.domain().read().await;
            let reservation = domain
                .reservation(reservation_id)
                .ok_or(CommandError::UnknownReservation(reservation_id))?;
            if reservation.is_expired(Utc::now()) {
                return Err(CommandError::ReservationExpired(reservation_id));
            }
        }

        let result = session
            .call(
                Action::CancelReservation.as_str(),
                serde_json::to_value(&CancelReservationRequest { reservation_id })?,
                self.call_timeout,
            )
            .await?;
        let response: CancelReservationResponse = serde_json::from_value(result)?;

        if response.status == CancelReservationStatus::Accepted {
            session.domain().write().await.remove_reservation(reservation_id);
            info!(%identity, reservation_id, "reservation cancelled");
        }
        Ok(response.status)
    }

    /// Status snapshot of one connected charge point.
    pub async fn charge_point_status(&self, identity: &str) -> Option<SessionStatus> {
        let session = self.registry.lookup(identity).await?;
        Some(session.status().await)
    }
}

/// Install the standard Central System handler set on a dispatcher.
fn install_handlers(
    dispatcher: &mut Dispatcher,
    identity: &str,
    domain: &Arc<RwLock<ChargePointState>>,
    heartbeat_interval: i32,
) {
    let id = identity.to_string();
    dispatcher.register(Action::BootNotification.as_str(), move |payload| {
        let identity = id.clone();
        async move {
            let req: BootNotificationRequest = parse_request(payload)?;
            info!(
                %identity,
                vendor = %req.charge_point_vendor,
                model = %req.charge_point_model,
                firmware = req.firmware_version.as_deref().unwrap_or("-"),
                "BootNotification received"
            );
            to_response(&BootNotificationResponse {
                current_time: Utc::now(),
                interval: heartbeat_interval,
                status: RegistrationStatus::Accepted,
            })
        }
    });

    let id = identity.to_string();
    dispatcher.register(Action::Heartbeat.as_str(), move |payload| {
        let identity = id.clone();
        async move {
            let _: HeartbeatRequest = parse_request(payload)?;
            info!(%identity, "Heartbeat received");
            to_response(&HeartbeatResponse {
                current_time: Utc::now(),
            })
        }
    });

    let id = identity.to_string();
    dispatcher.register(Action::StatusNotification.as_str(), move |payload| {
        let identity = id.clone();
        async move {
            let req: StatusNotificationRequest = parse_request(payload)?;
            info!(
                %identity,
                connector_id = req.connector_id,
                status = ?req.status,
                error_code = ?req.error_code,
                "StatusNotification received"
            );
            to_response(&StatusNotificationResponse {})
        }
    });

    let id = identity.to_string();
    dispatcher.register(Action::MeterValues.as_str(), move |payload| {
        let identity = id.clone();
        async move {
            let req: MeterValuesRequest = parse_request(payload)?;
            for meter_value in &req.meter_value {
                for sample in &meter_value.sampled_value {
                    info!(
                        %identity,
                        connector_id = req.connector_id,
                        timestamp = %meter_value.timestamp,
                        measurand = sample.measurand.as_deref().unwrap_or("Unknown"),
                        value = %sample.value,
                        unit = sample.unit.as_deref().unwrap_or(""),
                        "meter sample"
                    );
                }
            }
            to_response(&MeterValuesResponse {})
        }
    });

    let id = identity.to_string();
    let state = domain.clone();
    dispatcher.register(Action::StartTransaction.as_str(), move |payload| {
        let identity = id.clone();
        let domain = state.clone();
        async move {
            let req: StartTransactionRequest = parse_request(payload)?;
            // Allocation and insertion happen under one lock so no two
            // calls on this session can observe the same id.
            let transaction_id = domain.write().await.begin_transaction(
                req.connector_id,
                &req.id_tag,
                req.meter_start,
                req.timestamp,
            );
            info!(
                %identity,
                connector_id = req.connector_id,
                id_tag = %req.id_tag,
                meter_start = req.meter_start,
                transaction_id,
                "transaction started"
            );
            to_response(&StartTransactionResponse {
                transaction_id,
                id_tag_info: IdTagInfo::accepted(),
            })
        }
    });

    let id = identity.to_string();
    let state = domain.clone();
    dispatcher.register(Action::StopTransaction.as_str(), move |payload| {
        let identity = id.clone();
        let domain = state.clone();
        async move {
            let req: StopTransactionRequest = parse_request(payload)?;
            match domain.write().await.finish_transaction(req.transaction_id) {
                Some(tx) => {
                    info!(
                        %identity,
                        transaction_id = req.transaction_id,
                        meter_stop = req.meter_stop,
                        energy = req.meter_stop - tx.meter_start,
                        reason = ?req.reason,
                        "transaction stopped"
                    );
                }
                None => {
                    // Tolerated: the charge point may retry a stop we
                    // already processed, or reference a pre-restart id.
                    warn!(
                        %identity,
                        transaction_id = req.transaction_id,
                        "StopTransaction for unknown transaction"
                    );
                }
            }
            to_response(&StopTransactionResponse {
                id_tag_info: Some(IdTagInfo::accepted()),
            })
        }
    });

    let id = identity.to_string();
    dispatcher.register(Action::Authorize.as_str(), move |payload| {
        let identity = id.clone();
        async move {
            let req: AuthorizeRequest = parse_request(payload)?;
            // Accept every tag; a real deployment would consult a whitelist.
            info!(%identity, id_tag = %req.id_tag, "Authorize received");
            to_response(&AuthorizeResponse {
                id_tag_info: IdTagInfo::accepted(),
            })
        }
    });

    let id = identity.to_string();
    dispatcher.register(Action::DataTransfer.as_str(), move |payload| {
        let identity = id.clone();
        async move {
            let req: DataTransferRequest = parse_request(payload)?;
            info!(
                %identity,
                vendor_id = %req.vendor_id,
                message_id = req.message_id.as_deref().unwrap_or("-"),
                "DataTransfer received"
            );
            to_response(&DataTransferResponse {
                status: DataTransferStatus::Accepted,
                data: None,
            })
        }
    });

    let id = identity.to_string();
    dispatcher.register(
        Action::DiagnosticsStatusNotification.as_str(),
        move |payload| {
            let identity = id.clone();
            async move {
                let req: DiagnosticsStatusNotificationRequest = parse_request(payload)?;
                info!(%identity, status = ?req.status, "DiagnosticsStatusNotification received");
                to_response(&DiagnosticsStatusNotificationResponse {})
            }
        },
    );

    let id = identity.to_string();
    dispatcher.register(
        Action::FirmwareStatusNotification.as_str(),
        move |payload| {
            let identity = id.clone();
            async move {
                let req: FirmwareStatusNotificationRequest = parse_request(payload)?;
                info!(%identity, status = ?req.status, "FirmwareStatusNotification received");
                to_response(&FirmwareStatusNotificationResponse {})
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Call, CallResult, ErrorCode, OcppMessage};
    use crate::session::SessionState;
    use crate::transport::{self, Transport};
    use serde_json::{json, Value};

    async fn attach_over_link(cs: &CentralSystem, identity: &str) -> (Arc<Session>, Transport) {
        let (engine, peer) = transport::link(16);
        let (session, source) = cs.attach(identity, engine).await;
        tokio::spawn(session.clone().run(source));
        tokio::task::yield_now().await;
        (session, peer)
    }

    async fn roundtrip(peer: &mut Transport, message_id: &str, action: &str, payload: Value) -> OcppMessage {
        peer.sink
            .send(Call::with_id(message_id, action, payload).encode())
            .await
            .unwrap();
        let frame = peer.source.receive().await.unwrap();
        OcppMessage::decode(&frame).unwrap()
    }

    fn result_payload(message: OcppMessage) -> Value {
        match message {
            OcppMessage::CallResult(r) => r.payload,
            other => panic!("expected CallResult, got {other:?}"),
        }
    }

    /// Answers the next call the Central System issues on this link.
    async fn answer_next_call(peer: &mut Transport, payload: Value) -> Call {
        let frame = peer.source.receive().await.unwrap();
        let call = match OcppMessage::decode(&frame).unwrap() {
            OcppMessage::Call(call) => call,
            other => panic!("expected Call, got {other:?}"),
        };
        peer.sink
            .send(CallResult::new(&call.message_id, payload).encode())
            .await
            .unwrap();
        call
    }

    #[tokio::test]
    async fn boot_start_stop_scenario() {
        let cs = CentralSystem::new();
        let (session, mut peer) = attach_over_link(&cs, "CP_1").await;

        // BootNotification -> Accepted with the advertised interval.
        let boot = result_payload(
            roundtrip(
                &mut peer,
                "b1",
                "BootNotification",
                json!({"chargePointVendor": "V", "chargePointModel": "M"}),
            )
            .await,
        );
        assert_eq!(boot["status"], "Accepted");
        assert_eq!(boot["interval"], 30);

        // StartTransaction -> transaction 1 recorded.
        let start = result_payload(
            roundtrip(
                &mut peer,
                "s1",
                "StartTransaction",
                json!({
                    "connectorId": 1,
                    "idTag": "RFID1",
                    "meterStart": 100,
                    "timestamp": "2026-03-01T10:00:00Z"
                }),
            )
            .await,
        );
        assert_eq!(start["transactionId"], 1);
        assert_eq!(start["idTagInfo"]["status"], "Accepted");

        let status = session.status().await;
        assert_eq!(status.active_transactions, 1);
        assert_eq!(status.transactions[0].id_tag, "RFID1");

        // StopTransaction -> evicted, accepted.
        let stop = result_payload(
            roundtrip(
                &mut peer,
                "t1",
                "StopTransaction",
                json!({
                    "meterStop": 500,
                    "timestamp": "2026-03-01T11:00:00Z",
                    "transactionId": 1
                }),
            )
            .await,
        );
        assert_eq!(stop["idTagInfo"]["status"], "Accepted");
        assert_eq!(session.status().await.active_transactions, 0);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn sequential_transactions_get_increasing_ids() {
        let cs = CentralSystem::new();
        let (_session, mut peer) = attach_over_link(&cs, "CP_1").await;

        for expected in 1..=3 {
            let start = result_payload(
                roundtrip(
                    &mut peer,
                    &format!("s{expected}"),
                    "StartTransaction",
                    json!({
                        "connectorId": 1,
                        "idTag": "RFID1",
                        "meterStart": 0,
                        "timestamp": "2026-03-01T10:00:00Z"
                    }),
                )
                .await,
            );
            assert_eq!(start["transactionId"], expected);

            // Stop between starts; ids must still increase.
            let stop = roundtrip(
                &mut peer,
                &format!("t{expected}"),
                "StopTransaction",
                json!({
                    "meterStop": 10,
                    "timestamp": "2026-03-01T10:30:00Z",
                    "transactionId": expected
                }),
            )
            .await;
            assert!(matches!(stop, OcppMessage::CallResult(_)));
        }
    }

    #[tokio::test]
    async fn stop_of_unknown_transaction_is_tolerated() {
        let cs = CentralSystem::new();
        let (session, mut peer) = attach_over_link(&cs, "CP_1").await;

        let stop = result_payload(
            roundtrip(
                &mut peer,
                "t9",
                "StopTransaction",
                json!({
                    "meterStop": 500,
                    "timestamp": "2026-03-01T11:00:00Z",
                    "transactionId": 42
                }),
            )
            .await,
        );
        assert_eq!(stop["idTagInfo"]["status"], "Accepted");
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn heartbeat_and_authorize_answered() {
        let cs = CentralSystem::new();
        let (_session, mut peer) = attach_over_link(&cs, "CP_1").await;

        let heartbeat = result_payload(roundtrip(&mut peer, "h1", "Heartbeat", json!({})).await);
        assert!(heartbeat.get("currentTime").is_some());

        let auth = result_payload(
            roundtrip(&mut peer, "a1", "Authorize", json!({"idTag": "RFID9"})).await,
        );
        assert_eq!(auth["idTagInfo"]["status"], "Accepted");
    }

    #[tokio::test]
    async fn invalid_start_transaction_rejected_without_allocating_id() {
        let cs = CentralSystem::new();
        let (session, mut peer) = attach_over_link(&cs, "CP_1").await;

        let reply = roundtrip(
            &mut peer,
            "s1",
            "StartTransaction",
            json!({"connectorId": 1, "idTag": "RFID1"}),
        )
        .await;
        match reply {
            OcppMessage::CallError(e) => assert_eq!(e.error_code, ErrorCode::FormationViolation),
            other => panic!("expected CallError, got {other:?}"),
        }
        assert_eq!(session.status().await.active_transactions, 0);
    }

    #[tokio::test]
    async fn remote_start_command_round_trips() {
        let cs = CentralSystem::new();
        let (_session, mut peer) = attach_over_link(&cs, "CP_1").await;

        let responder = tokio::spawn(async move {
            let call = answer_next_call(&mut peer, json!({"status": "Accepted"})).await;
            assert_eq!(call.action, "RemoteStartTransaction");
            assert_eq!(call.payload["idTag"], "RFID123");
        });

        let status = cs
            .remote_start_transaction("CP_1", "RFID123", Some(1))
            .await
            .unwrap();
        assert_eq!(status, RemoteStartStopStatus::Accepted);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn command_to_unknown_charge_point_fails() {
        let cs = CentralSystem::new();
        let err = cs
            .remote_start_transaction("CP_MISSING", "RFID1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownChargePoint(_)));
    }

    #[tokio::test]
    async fn accepted_reservation_is_recorded_then_cancelled() {
        let cs = CentralSystem::new();
        let (session, mut peer) = attach_over_link(&cs, "CP_1").await;
        let expiry = Utc::now() + chrono::Duration::hours(1);

        let responder = tokio::spawn(async move {
            answer_next_call(&mut peer, json!({"status": "Accepted"})).await;
            answer_next_call(&mut peer, json!({"status": "Accepted"})).await;
        });

        let status = cs
            .reserve_now("CP_1", 1, "RFID1", expiry, 7)
            .await
            .unwrap();
        assert_eq!(status, ReservationStatus::Accepted);
        assert!(session.domain().read().await.reservation(7).is_some());

        let status = cs.cancel_reservation("CP_1", 7).await.unwrap();
        assert_eq!(status, CancelReservationStatus::Accepted);
        assert!(session.domain().read().await.reservation(7).is_none());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn expired_reservation_rejected_at_use_time() {
        let cs = CentralSystem::new();
        let (session, _peer) = attach_over_link(&cs, "CP_1").await;

        session.domain().write().await.add_reservation(Reservation {
            reservation_id: 3,
            connector_id: 1,
            id_tag: "RFID1".to_string(),
            expiry: Utc::now() - chrono::Duration::minutes(1),
        });

        let err = cs.cancel_reservation("CP_1", 3).await.unwrap_err();
        assert!(matches!(err, CommandError::ReservationExpired(3)));

        let err = cs.cancel_reservation("CP_1", 99).await.unwrap_err();
        assert!(matches!(err, CommandError::UnknownReservation(99)));
    }
}
