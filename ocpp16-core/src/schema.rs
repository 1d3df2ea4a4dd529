//! Action schema registry
//!
//! Structural validation of OCPP payloads: per action, which fields must be
//! present and what coarse JSON type each one has. Field sets differ
//! between the Call direction and the CallResult direction, so the registry
//! keeps two tables. Validation stops at presence and coarse type; whether
//! a `connectorId` actually exists on the hardware is a handler's concern.
//!
//! The registry is immutable after construction. Build it once at process
//! start and share it via `Arc`.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::messages::Action;

/// Coarse JSON type of a payload field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

/// Validation failure for a known-shape payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unexpected type for field: {0}")]
    UnexpectedType(&'static str),
}

/// Field sets for one action in one direction
#[derive(Debug, Clone)]
pub struct ActionSpec {
    required: Vec<(&'static str, FieldType)>,
    optional: Vec<(&'static str, FieldType)>,
}

impl ActionSpec {
    fn new() -> Self {
        Self {
            required: Vec::new(),
            optional: Vec::new(),
        }
    }

    fn req(mut self, name: &'static str, ty: FieldType) -> Self {
        self.required.push((name, ty));
        self
    }

    fn opt(mut self, name: &'static str, ty: FieldType) -> Self {
        self.optional.push((name, ty));
        self
    }

    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        let object = payload
            .as_object()
            .ok_or(ValidationError::UnexpectedType("payload"))?;

        for (name, ty) in &self.required {
            match object.get(*name) {
                None => return Err(ValidationError::MissingField(name)),
                Some(v) if !ty.matches(v) => return Err(ValidationError::UnexpectedType(name)),
                Some(_) => {}
            }
        }

        for (name, ty) in &self.optional {
            if let Some(v) = object.get(*name) {
                if !v.is_null() && !ty.matches(v) {
                    return Err(ValidationError::UnexpectedType(name));
                }
            }
        }

        // Extra fields are tolerated, matching the permissive wire behavior
        // of deployed charge points.
        Ok(())
    }
}

/// Immutable per-action field tables for both message directions
#[derive(Debug)]
pub struct SchemaRegistry {
    calls: HashMap<&'static str, ActionSpec>,
    results: HashMap<&'static str, ActionSpec>,
}

impl SchemaRegistry {
    /// Build the OCPP 1.6 registry.
    pub fn ocpp16() -> Self {
        use FieldType::*;

        let mut calls = HashMap::new();
        let mut results = HashMap::new();

        let mut insert = |action: Action, call: ActionSpec, result: ActionSpec| {
            calls.insert(action.as_str(), call);
            results.insert(action.as_str(), result);
        };

        insert(
            Action::BootNotification,
            ActionSpec::new()
                .req("chargePointVendor", String)
                .req("chargePointModel", String)
                .opt("chargePointSerialNumber", String)
                .opt("chargeBoxSerialNumber", String)
                .opt("firmwareVersion", String)
                .opt("iccid", String)
                .opt("imsi", String)
                .opt("meterType", String)
                .opt("meterSerialNumber", String),
            ActionSpec::new()
                .req("currentTime", String)
                .req("interval", Integer)
                .req("status", String),
        );

        insert(
            Action::Heartbeat,
            ActionSpec::new(),
            ActionSpec::new().req("currentTime", String),
        );

        insert(
            Action::StatusNotification,
            ActionSpec::new()
                .req("connectorId", Integer)
                .req("errorCode", String)
                .req("status", String)
                .opt("info", String)
                .opt("timestamp", String)
                .opt("vendorId", String)
                .opt("vendorErrorCode", String),
            ActionSpec::new(),
        );

        insert(
            Action::MeterValues,
            ActionSpec::new()
                .req("connectorId", Integer)
                .req("meterValue", Array)
                .opt("transactionId", Integer),
            ActionSpec::new(),
        );

        insert(
            Action::StartTransaction,
            ActionSpec::new()
                .req("connectorId", Integer)
                .req("idTag", String)
                .req("meterStart", Integer)
                .req("timestamp", String)
                .opt("reservationId", Integer),
            ActionSpec::new()
                .req("idTagInfo", Object)
                .req("transactionId", Integer),
        );

        insert(
            Action::StopTransaction,
            ActionSpec::new()
                .req("meterStop", Integer)
                .req("timestamp", String)
                .req("transactionId", Integer)
                .opt("idTag", String)
                .opt("reason", String)
                .opt("transactionData", Array),
            ActionSpec::new().opt("idTagInfo", Object),
        );

        insert(
            Action::Authorize,
            ActionSpec::new().req("idTag", String),
            ActionSpec::new().req("idTagInfo", Object),
        );

        insert(
            Action::DataTransfer,
            ActionSpec::new()
                .req("vendorId", String)
                .opt("messageId", String)
                .opt("data", String),
            ActionSpec::new().req("status", String).opt("data", String),
        );

        insert(
            Action::DiagnosticsStatusNotification,
            ActionSpec::new().req("status", String),
            ActionSpec::new(),
        );

        insert(
            Action::FirmwareStatusNotification,
            ActionSpec::new().req("status", String),
            ActionSpec::new(),
        );

        insert(
            Action::RemoteStartTransaction,
            ActionSpec::new()
                .req("idTag", String)
                .opt("connectorId", Integer),
            ActionSpec::new().req("status", String),
        );

        insert(
            Action::RemoteStopTransaction,
            ActionSpec::new().req("transactionId", Integer),
            ActionSpec::new().req("status", String),
        );

        insert(
            Action::ChangeConfiguration,
            ActionSpec::new().req("key", String).req("value", String),
            ActionSpec::new().req("status", String),
        );

        insert(
            Action::GetConfiguration,
            ActionSpec::new().opt("key", Array),
            ActionSpec::new()
                .opt("configurationKey", Array)
                .opt("unknownKey", Array),
        );

        insert(
            Action::Reset,
            ActionSpec::new().req("type", String),
            ActionSpec::new().req("status", String),
        );

        insert(
            Action::UnlockConnector,
            ActionSpec::new().req("connectorId", Integer),
            ActionSpec::new().req("status", String),
        );

        insert(
            Action::ChangeAvailability,
            ActionSpec::new()
                .req("connectorId", Integer)
                .req("type", String),
            ActionSpec::new().req("status", String),
        );

        insert(
            Action::ReserveNow,
            ActionSpec::new()
                .req("connectorId", Integer)
                .req("expiryDate", String)
                .req("idTag", String)
                .req("reservationId", Integer)
                .opt("parentIdTag", String),
            ActionSpec::new().req("status", String),
        );

        insert(
            Action::CancelReservation,
            ActionSpec::new().req("reservationId", Integer),
            ActionSpec::new().req("status", String),
        );

        insert(
            Action::ClearCache,
            ActionSpec::new(),
            ActionSpec::new().req("status", String),
        );

        insert(
            Action::TriggerMessage,
            ActionSpec::new()
                .req("requestedMessage", String)
                .opt("connectorId", Integer),
            ActionSpec::new().req("status", String),
        );

        Self { calls, results }
    }

    /// Validate a payload received as a Call.
    pub fn validate_call(&self, action: &str, payload: &Value) -> Result<(), ValidationError> {
        match self.calls.get(action) {
            Some(spec) => spec.validate(payload),
            None => Err(ValidationError::UnknownAction(action.to_string())),
        }
    }

    /// Validate a payload received as a CallResult for the given action.
    pub fn validate_result(&self, action: &str, payload: &Value) -> Result<(), ValidationError> {
        match self.results.get(action) {
            Some(spec) => spec.validate(payload),
            None => Err(ValidationError::UnknownAction(action.to_string())),
        }
    }

    /// Whether the action is known to either table.
    pub fn knows(&self, action: &str) -> bool {
        self.calls.contains_key(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_boot_notification_passes() {
        let registry = SchemaRegistry::ocpp16();
        let payload = json!({
            "chargePointVendor": "MyVendor",
            "chargePointModel": "MyModel",
            "firmwareVersion": "1.0.0"
        });
        assert!(registry.validate_call("BootNotification", &payload).is_ok());
    }

    #[test]
    fn missing_field_reported() {
        let registry = SchemaRegistry::ocpp16();
        let payload = json!({"chargePointVendor": "MyVendor"});
        assert_eq!(
            registry.validate_call("BootNotification", &payload),
            Err(ValidationError::MissingField("chargePointModel"))
        );
    }

    #[test]
    fn wrong_type_reported() {
        let registry = SchemaRegistry::ocpp16();
        let payload = json!({
            "connectorId": "one",
            "errorCode": "NoError",
            "status": "Available"
        });
        assert_eq!(
            registry.validate_call("StatusNotification", &payload),
            Err(ValidationError::UnexpectedType("connectorId"))
        );
    }

    #[test]
    fn optional_field_type_checked_when_present() {
        let registry = SchemaRegistry::ocpp16();
        let payload = json!({
            "connectorId": 1,
            "idTag": "RFID1",
            "meterStart": 0,
            "timestamp": "2026-03-01T10:00:00Z",
            "reservationId": "nope"
        });
        assert_eq!(
            registry.validate_call("StartTransaction", &payload),
            Err(ValidationError::UnexpectedType("reservationId"))
        );
    }

    #[test]
    fn unknown_action_reported() {
        let registry = SchemaRegistry::ocpp16();
        assert_eq!(
            registry.validate_call("NoSuchAction", &json!({})),
            Err(ValidationError::UnknownAction("NoSuchAction".to_string()))
        );
    }

    #[test]
    fn extra_fields_tolerated() {
        let registry = SchemaRegistry::ocpp16();
        let payload = json!({"idTag": "RFID1", "futureField": true});
        assert!(registry.validate_call("Authorize", &payload).is_ok());
    }

    #[test]
    fn result_direction_differs_from_call_direction() {
        let registry = SchemaRegistry::ocpp16();

        // Heartbeat call is empty, its result is not.
        assert!(registry.validate_call("Heartbeat", &json!({})).is_ok());
        assert_eq!(
            registry.validate_result("Heartbeat", &json!({})),
            Err(ValidationError::MissingField("currentTime"))
        );
        assert!(registry
            .validate_result("Heartbeat", &json!({"currentTime": "2026-03-01T10:00:00Z"}))
            .is_ok());
    }

    #[test]
    fn non_object_payload_rejected() {
        let registry = SchemaRegistry::ocpp16();
        assert_eq!(
            registry.validate_call("Heartbeat", &json!([1, 2])),
            Err(ValidationError::UnexpectedType("payload"))
        );
    }
}
