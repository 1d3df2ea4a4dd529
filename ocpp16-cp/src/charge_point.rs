//! Charge point simulator
//!
//! Connects to a Central System, runs the boot → status → authorize →
//! transaction → meter values flow, answers Central System commands, and
//! keeps heartbeating at the interval the Central System advertised.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        handshake::client::Request,
        http::{header, Uri},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{info, warn};

use ocpp16_core::dispatch::{parse_request, to_response, Dispatcher};
use ocpp16_core::session::ChargePointState;
use ocpp16_core::transport::{self, Transport};
use ocpp16_core::types::*;
use ocpp16_core::{Action, SchemaRegistry, Session};

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Simulator settings
#[derive(Debug, Clone)]
pub struct ChargePointConfig {
    /// Central System base URL (identity is appended)
    pub url: String,
    pub identity: String,
    pub vendor: String,
    pub model: String,
    pub connector_id: i32,
    pub call_timeout: Duration,
}

/// One simulated charge point
pub struct ChargePoint {
    config: ChargePointConfig,
    schema: Arc<SchemaRegistry>,
    /// Local configuration keys served to GetConfiguration.
    configuration: Arc<RwLock<HashMap<String, String>>>,
}

impl ChargePoint {
    pub fn new(config: ChargePointConfig) -> Self {
        let mut configuration = HashMap::new();
        configuration.insert("HeartbeatInterval".to_string(), "30".to_string());
        configuration.insert("MeterValueSampleInterval".to_string(), "60".to_string());
        configuration.insert("Url".to_string(), config.url.clone());

        Self {
            config,
            schema: Arc::new(SchemaRegistry::ocpp16()),
            configuration: Arc::new(RwLock::new(configuration)),
        }
    }

    /// Connect once and run until the connection is lost. The caller
    /// reconnects with backoff.
    pub async fn run(&self) -> Result<(), BoxError> {
        let url = format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            self.config.identity
        );
        let uri: Uri = url.parse()?;

        let request = Request::builder()
            .uri(url.as_str())
            .header(header::SEC_WEBSOCKET_PROTOCOL, OCPP_SUBPROTOCOL)
            .header(header::HOST, uri.host().unwrap_or("localhost"))
            .body(())?;

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        info!(%url, "connecting to central system");
        let (ws, response) = connect_async_with_config(request, Some(ws_config), false).await?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(OCPP_SUBPROTOCOL) {
            warn!(?accepted, "central system did not accept ocpp1.6 subprotocol");
        }

        let (engine_half, ws_half) = transport::link(64);
        let (session, source) = Session::new(
            &self.config.identity,
            engine_half,
            self.build_dispatcher(),
            Arc::new(RwLock::new(ChargePointState::new())),
        );
        let run_task = tokio::spawn(session.clone().run(source));

        let (mut ws_tx, mut ws_rx) = ws.split();
        let Transport {
            sink: to_session,
            source: mut from_session,
        } = ws_half;

        let outbound = tokio::spawn(async move {
            while let Ok(frame) = from_session.receive().await {
                if ws_tx.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
        });

        let inbound = tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if to_session.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket receive failed");
                        break;
                    }
                }
            }
        });

        let flow = self.drive_flow(&session).await;

        session.close();
        let _ = run_task.await;
        inbound.abort();
        outbound.abort();

        flow
    }

    /// The demo flow: boot, one full transaction, then heartbeats until
    /// the connection drops.
    async fn drive_flow(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        let boot: BootNotificationResponse = self
            .call(
                session,
                Action::BootNotification,
                &BootNotificationRequest {
                    charge_point_vendor: self.config.vendor.clone(),
                    charge_point_model: self.config.model.clone(),
                    charge_point_serial_number: None,
                    charge_box_serial_number: None,
                    firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    iccid: None,
                    imsi: None,
                    meter_type: None,
                    meter_serial_number: None,
                },
            )
            .await?;
        info!(status = ?boot.status, interval = boot.interval, "BootNotification answered");
        let heartbeat_interval = Duration::from_secs(boot.interval.max(1) as u64);

        self.send_status(session, ChargePointStatus::Available).await?;

        let auth: AuthorizeResponse = self
            .call(
                session,
                Action::Authorize,
                &AuthorizeRequest {
                    id_tag: "RFID123456".to_string(),
                },
            )
            .await?;
        info!(status = ?auth.id_tag_info.status, "Authorize answered");

        let start: StartTransactionResponse = self
            .call(
                session,
                Action::StartTransaction,
                &StartTransactionRequest {
                    connector_id: self.config.connector_id,
                    id_tag: "RFID123456".to_string(),
                    meter_start: 0,
                    timestamp: Utc::now(),
                    reservation_id: None,
                },
            )
            .await?;
        info!(transaction_id = start.transaction_id, "transaction started");

        self.send_status(session, ChargePointStatus::Charging).await?;

        let _: MeterValuesResponse = self
            .call(
                session,
                Action::MeterValues,
                &MeterValuesRequest {
                    connector_id: self.config.connector_id,
                    transaction_id: Some(start.transaction_id),
                    meter_value: vec![MeterValue {
                        timestamp: Utc::now(),
                        sampled_value: vec![SampledValue {
                            value: "1234.5".to_string(),
                            context: None,
                            format: None,
                            measurand: Some("Energy.Active.Import.Register".to_string()),
                            phase: None,
                            location: None,
                            unit: Some("Wh".to_string()),
                        }],
                    }],
                },
            )
            .await?;

        let _: StopTransactionResponse = self
            .call(
                session,
                Action::StopTransaction,
                &StopTransactionRequest {
                    meter_stop: 2000,
                    timestamp: Utc::now(),
                    transaction_id: start.transaction_id,
                    id_tag: Some("RFID123456".to_string()),
                    reason: Some(StopReason::Local),
                    transaction_data: None,
                },
            )
            .await?;
        info!(transaction_id = start.transaction_id, "transaction stopped");

        self.send_status(session, ChargePointStatus::Available).await?;

        let _: DataTransferResponse = self
            .call(
                session,
                Action::DataTransfer,
                &DataTransferRequest {
                    vendor_id: self.config.vendor.clone(),
                    message_id: Some("CustomMessage".to_string()),
                    data: Some("sample payload".to_string()),
                },
            )
            .await?;

        loop {
            tokio::time::sleep(heartbeat_interval).await;
            let heartbeat: HeartbeatResponse =
                self.call(session, Action::Heartbeat, &HeartbeatRequest {}).await?;
            info!(current_time = %heartbeat.current_time, "Heartbeat answered");
        }
    }

    async fn send_status(
        &self,
        session: &Arc<Session>,
        status: ChargePointStatus,
    ) -> Result<(), BoxError> {
        let _: StatusNotificationResponse = self
            .call(
                session,
                Action::StatusNotification,
                &StatusNotificationRequest {
                    connector_id: self.config.connector_id,
                    error_code: ChargePointErrorCode::NoError,
                    status,
                    info: None,
                    timestamp: Some(Utc::now()),
                    vendor_id: None,
                    vendor_error_code: None,
                },
            )
            .await?;
        info!(?status, "StatusNotification answered");
        Ok(())
    }

    async fn call<Req, Resp>(
        &self,
        session: &Arc<Session>,
        action: Action,
        request: &Req,
    ) -> Result<Resp, BoxError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let result = session
            .call(action.as_str(), payload, self.config.call_timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Handlers for Central System commands.
    fn build_dispatcher(&self) -> Dispatcher {
        let mut dispatcher = Dispatcher::new(self.schema.clone());

        dispatcher.register(Action::RemoteStartTransaction.as_str(), |payload| async move {
            let req: RemoteStartTransactionRequest = parse_request(payload)?;
            info!(id_tag = %req.id_tag, connector_id = ?req.connector_id, "RemoteStartTransaction received");
            to_response(&RemoteStartTransactionResponse {
                status: RemoteStartStopStatus::Accepted,
            })
        });

        dispatcher.register(Action::RemoteStopTransaction.as_str(), |payload| async move {
            let req: RemoteStopTransactionRequest = parse_request(payload)?;
            info!(transaction_id = req.transaction_id, "RemoteStopTransaction received");
            to_response(&RemoteStopTransactionResponse {
                status: RemoteStartStopStatus::Accepted,
            })
        });

        let store = self.configuration.clone();
        dispatcher.register(Action::ChangeConfiguration.as_str(), move |payload| {
            let configuration = store.clone();
            async move {
                let req: ChangeConfigurationRequest = parse_request(payload)?;
                let mut configuration = configuration.write().await;
                let status = if configuration.contains_key(&req.key) {
                    info!(key = %req.key, value = %req.value, "configuration changed");
                    configuration.insert(req.key, req.value);
                    ConfigurationStatus::Accepted
                } else {
                    warn!(key = %req.key, "configuration key not supported");
                    ConfigurationStatus::NotSupported
                };
                to_response(&ChangeConfigurationResponse { status })
            }
        });

        let store = self.configuration.clone();
        dispatcher.register(Action::GetConfiguration.as_str(), move |payload| {
            let configuration = store.clone();
            async move {
                let req: GetConfigurationRequest = parse_request(payload)?;
                let configuration = configuration.read().await;

                let mut known = Vec::new();
                let mut unknown = Vec::new();
                match req.key {
                    None => {
                        for (key, value) in configuration.iter() {
                            known.push(KeyValue {
                                key: key.clone(),
                                readonly: false,
                                value: Some(value.clone()),
                            });
                        }
                    }
                    Some(keys) => {
                        for key in keys {
                            match configuration.get(&key) {
                                Some(value) => known.push(KeyValue {
                                    key,
                                    readonly: false,
                                    value: Some(value.clone()),
                                }),
                                None => unknown.push(key),
                            }
                        }
                    }
                }

                to_response(&GetConfigurationResponse {
                    configuration_key: Some(known),
                    unknown_key: if unknown.is_empty() { None } else { Some(unknown) },
                })
            }
        });

        dispatcher.register(Action::Reset.as_str(), |payload| async move {
            let req: ResetRequest = parse_request(payload)?;
            info!(kind = ?req.kind, "Reset received");
            to_response(&ResetResponse {
                status: ResetStatus::Accepted,
            })
        });

        dispatcher.register(Action::UnlockConnector.as_str(), |payload| async move {
            let req: UnlockConnectorRequest = parse_request(payload)?;
            info!(connector_id = req.connector_id, "UnlockConnector received");
            to_response(&UnlockConnectorResponse {
                status: UnlockStatus::Unlocked,
            })
        });

        dispatcher.register(Action::ChangeAvailability.as_str(), |payload| async move {
            let req: ChangeAvailabilityRequest = parse_request(payload)?;
            info!(connector_id = req.connector_id, kind = ?req.kind, "ChangeAvailability received");
            to_response(&ChangeAvailabilityResponse {
                status: AvailabilityStatus::Accepted,
            })
        });

        dispatcher.register(Action::ClearCache.as_str(), |payload| async move {
            let _: ClearCacheRequest = parse_request(payload)?;
            info!("ClearCache received");
            to_response(&ClearCacheResponse {
                status: ClearCacheStatus::Accepted,
            })
        });

        dispatcher.register(Action::TriggerMessage.as_str(), |payload| async move {
            let req: TriggerMessageRequest = parse_request(payload)?;
            info!(requested = ?req.requested_message, "TriggerMessage received");
            to_response(&TriggerMessageResponse {
                status: TriggerMessageStatus::Accepted,
            })
        });

        dispatcher.register(Action::ReserveNow.as_str(), |payload| async move {
            let req: ReserveNowRequest = parse_request(payload)?;
            info!(
                reservation_id = req.reservation_id,
                connector_id = req.connector_id,
                id_tag = %req.id_tag,
                "ReserveNow received"
            );
            to_response(&ReserveNowResponse {
                status: ReservationStatus::Accepted,
            })
        });

        dispatcher.register(Action::CancelReservation.as_str(), |payload| async move {
            let req: CancelReservationRequest = parse_request(payload)?;
            info!(reservation_id = req.reservation_id, "CancelReservation received");
            to_response(&CancelReservationResponse {
                status: CancelReservationStatus::Accepted,
            })
        });

        dispatcher.register(Action::DataTransfer.as_str(), |payload| async move {
            let req: DataTransferRequest = parse_request(payload)?;
            info!(vendor_id = %req.vendor_id, "DataTransfer received");
            to_response(&DataTransferResponse {
                status: DataTransferStatus::Accepted,
                data: None,
            })
        });

        dispatcher
    }
}
