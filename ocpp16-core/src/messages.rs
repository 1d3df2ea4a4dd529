//! OCPP 1.6 JSON-RPC message framing
//!
//! OCPP uses a JSON-RPC-like framing over WebSocket text frames:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! The codec is deliberately shallow: it checks the array shape and the
//! element types, nothing else. Unknown action names decode successfully
//! here and are rejected by the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 error codes carried in CALLERROR frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // Spelling is from the OCPP 1.6 specification.
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP 1.6 action names known to this engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // CP -> Central System
    BootNotification,
    Heartbeat,
    StatusNotification,
    MeterValues,
    StartTransaction,
    StopTransaction,
    Authorize,
    DiagnosticsStatusNotification,
    FirmwareStatusNotification,

    // Central System -> CP
    RemoteStartTransaction,
    RemoteStopTransaction,
    ChangeConfiguration,
    GetConfiguration,
    Reset,
    UnlockConnector,
    ChangeAvailability,
    ReserveNow,
    CancelReservation,
    ClearCache,
    TriggerMessage,

    // Bidirectional
    DataTransfer,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::StatusNotification => "StatusNotification",
            Action::MeterValues => "MeterValues",
            Action::StartTransaction => "StartTransaction",
            Action::StopTransaction => "StopTransaction",
            Action::Authorize => "Authorize",
            Action::DiagnosticsStatusNotification => "DiagnosticsStatusNotification",
            Action::FirmwareStatusNotification => "FirmwareStatusNotification",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::ChangeConfiguration => "ChangeConfiguration",
            Action::GetConfiguration => "GetConfiguration",
            Action::Reset => "Reset",
            Action::UnlockConnector => "UnlockConnector",
            Action::ChangeAvailability => "ChangeAvailability",
            Action::ReserveNow => "ReserveNow",
            Action::CancelReservation => "CancelReservation",
            Action::ClearCache => "ClearCache",
            Action::TriggerMessage => "TriggerMessage",
            Action::DataTransfer => "DataTransfer",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors decoding a wire frame
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not one of the three array shapes.
    #[error("malformed OCPP frame")]
    Malformed,

    /// The frame shape is fine but the payload element is not a
    /// structured value (JSON object).
    #[error("payload of message {0} is not an object")]
    InvalidPayload(String),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL with a fresh message id
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        }
    }

    /// Create a CALL with a caller-chosen message id
    pub fn with_id(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Serialize to wire format: [2, messageId, action, payload]
    pub fn encode(&self) -> String {
        json!([
            MessageType::Call as i64,
            &self.message_id,
            &self.action,
            &self.payload
        ])
        .to_string()
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Serialize to wire format: [3, messageId, payload]
    pub fn encode(&self) -> String {
        json!([MessageType::CallResult as i64, &self.message_id, &self.payload]).to_string()
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
        }
    }

    /// Serialize to wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn encode(&self) -> String {
        json!([
            MessageType::CallError as i64,
            &self.message_id,
            self.error_code.to_string(),
            &self.error_description,
            &self.error_details
        ])
        .to_string()
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from a text frame
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let array: Vec<Value> = serde_json::from_str(text).map_err(|_| DecodeError::Malformed)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(DecodeError::Malformed)?;

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(DecodeError::Malformed);
                }

                let message_id = array[1]
                    .as_str()
                    .ok_or(DecodeError::Malformed)?
                    .to_string();

                let action = array[2]
                    .as_str()
                    .ok_or(DecodeError::Malformed)?
                    .to_string();

                if !array[3].is_object() {
                    return Err(DecodeError::InvalidPayload(message_id));
                }

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(DecodeError::Malformed);
                }

                let message_id = array[1]
                    .as_str()
                    .ok_or(DecodeError::Malformed)?
                    .to_string();

                if !array[2].is_object() {
                    return Err(DecodeError::InvalidPayload(message_id));
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(DecodeError::Malformed);
                }

                let message_id = array[1]
                    .as_str()
                    .ok_or(DecodeError::Malformed)?
                    .to_string();

                let error_code_str = array[2].as_str().ok_or(DecodeError::Malformed)?;
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                let error_description = array[3].as_str().unwrap_or("").to_string();

                if !array[4].is_object() {
                    return Err(DecodeError::InvalidPayload(message_id));
                }

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(DecodeError::Malformed),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to a text frame
    pub fn encode(&self) -> String {
        match self {
            OcppMessage::Call(c) => c.encode(),
            OcppMessage::CallResult(r) => r.encode(),
            OcppMessage::CallError(e) => e.encode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_round_trip() {
        let call = Call::new("Heartbeat", json!({}));
        let decoded = OcppMessage::decode(&call.encode()).unwrap();
        assert_eq!(decoded, OcppMessage::Call(call));
    }

    #[test]
    fn call_result_round_trip() {
        let result = CallResult::new("msg-1", json!({"currentTime": "2026-01-20T12:00:00Z"}));
        let decoded = OcppMessage::decode(&result.encode()).unwrap();
        assert_eq!(decoded, OcppMessage::CallResult(result));
    }

    #[test]
    fn call_error_round_trip() {
        let error = CallError::new("msg-2", ErrorCode::NotImplemented, "no such action");
        let decoded = OcppMessage::decode(&error.encode()).unwrap();
        assert_eq!(decoded, OcppMessage::CallError(error));
    }

    #[test]
    fn call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let msg = OcppMessage::decode(json).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "msg-123");
                assert_eq!(call.action, "Heartbeat");
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn unknown_action_decodes() {
        // Unknown actions are the dispatcher's problem, not the codec's.
        let json = r#"[2, "msg-9", "NoSuchAction", {"x": 1}]"#;
        let msg = OcppMessage::decode(json).unwrap();
        assert!(matches!(msg, OcppMessage::Call(c) if c.action == "NoSuchAction"));
    }

    #[test]
    fn malformed_frames_rejected() {
        for frame in [
            "not json",
            "[]",
            "[1, \"id\", {}]",
            "[2, \"id\", \"Heartbeat\"]",
            "[2, \"id\", \"Heartbeat\", {}, {}]",
            "[3, \"id\"]",
            "[4, \"id\", \"GenericError\", \"oops\"]",
            "[2, 42, \"Heartbeat\", {}]",
        ] {
            assert!(
                matches!(OcppMessage::decode(frame), Err(DecodeError::Malformed)),
                "frame should be malformed: {frame}"
            );
        }
    }

    #[test]
    fn non_object_payload_rejected() {
        let err = OcppMessage::decode(r#"[2, "msg-1", "Heartbeat", 42]"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload(id) if id == "msg-1"));

        let err = OcppMessage::decode(r#"[3, "msg-2", "done"]"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload(_)));
    }

    #[test]
    fn unknown_error_code_falls_back_to_generic() {
        let json = r#"[4, "msg-3", "WeirdCode", "desc", {}]"#;
        let msg = OcppMessage::decode(json).unwrap();
        match msg {
            OcppMessage::CallError(e) => assert_eq!(e.error_code, ErrorCode::GenericError),
            _ => panic!("Expected CallError"),
        }
    }
}
