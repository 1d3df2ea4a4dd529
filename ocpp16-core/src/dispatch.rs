//! Inbound call dispatch
//!
//! Routes a decoded CALL to the handler registered for its action name,
//! after structural validation against the schema registry, and wraps the
//! outcome in a CALLRESULT or CALLERROR. Handlers are async closures
//! registered once at session construction; there is no runtime scanning.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::messages::{Call, CallError, CallResult, ErrorCode, OcppMessage};
use crate::schema::{SchemaRegistry, ValidationError};

/// A handler's deliberate rejection or internal failure
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn not_supported(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }
}

/// What a handler produces: a response payload or a rejection
pub type HandlerResult = Result<Value, HandlerError>;

type Handler = Box<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Parse a validated payload into a typed request. A failure here means
/// the structural schema and the typed model disagree, which the peer
/// cannot distinguish from a constraint violation.
pub fn parse_request<T: DeserializeOwned>(payload: Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload)
        .map_err(|e| HandlerError::new(ErrorCode::PropertyConstraintViolation, e.to_string()))
}

/// Serialize a typed response payload.
pub fn to_response<T: Serialize>(response: &T) -> HandlerResult {
    serde_json::to_value(response).map_err(|e| HandlerError::internal(e.to_string()))
}

/// Action-name to handler table for one session
pub struct Dispatcher {
    schema: Arc<SchemaRegistry>,
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        Self {
            schema,
            handlers: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    /// Register the handler for an action. A later registration for the
    /// same action replaces the earlier one.
    pub fn register<F, Fut>(&mut self, action: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers
            .insert(action.into(), Box::new(move |payload| Box::pin(handler(payload))));
    }

    /// Dispatch one inbound call and produce the reply frame.
    pub async fn dispatch(&self, call: &Call) -> OcppMessage {
        let Some(handler) = self.handlers.get(&call.action) else {
            warn!(action = %call.action, "call for unimplemented action");
            return OcppMessage::CallError(CallError::new(
                &call.message_id,
                ErrorCode::NotImplemented,
                format!("action {} is not implemented", call.action),
            ));
        };

        if let Err(e) = self.schema.validate_call(&call.action, &call.payload) {
            warn!(action = %call.action, error = %e, "rejecting invalid call payload");
            let code = match e {
                ValidationError::MissingField(_) => ErrorCode::FormationViolation,
                ValidationError::UnexpectedType(_) => ErrorCode::PropertyConstraintViolation,
                ValidationError::UnknownAction(_) => ErrorCode::NotImplemented,
            };
            return OcppMessage::CallError(CallError::new(&call.message_id, code, e.to_string()));
        }

        debug!(action = %call.action, message_id = %call.message_id, "dispatching call");
        match handler(call.payload.clone()).await {
            Ok(payload) => OcppMessage::CallResult(CallResult::new(&call.message_id, payload)),
            Err(e) => {
                warn!(
                    action = %call.action,
                    code = %e.code,
                    description = %e.description,
                    "handler rejected call"
                );
                OcppMessage::CallError(CallError::new(&call.message_id, e.code, e.description))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(SchemaRegistry::ocpp16()))
    }

    #[tokio::test]
    async fn unknown_action_yields_not_implemented() {
        let d = dispatcher();
        let call = Call::new("NoSuchAction", json!({}));

        match d.dispatch(&call).await {
            OcppMessage::CallError(e) => {
                assert_eq!(e.message_id, call.message_id);
                assert_eq!(e.error_code, ErrorCode::NotImplemented);
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_field_yields_formation_violation() {
        let mut d = dispatcher();
        d.register("Authorize", |_payload| async { Ok(json!({})) });

        let call = Call::new("Authorize", json!({}));
        match d.dispatch(&call).await {
            OcppMessage::CallError(e) => {
                assert_eq!(e.error_code, ErrorCode::FormationViolation);
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_type_yields_property_constraint_violation() {
        let mut d = dispatcher();
        d.register("UnlockConnector", |_payload| async { Ok(json!({"status": "Unlocked"})) });

        let call = Call::new("UnlockConnector", json!({"connectorId": "one"}));
        match d.dispatch(&call).await {
            OcppMessage::CallError(e) => {
                assert_eq!(e.error_code, ErrorCode::PropertyConstraintViolation);
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_payload_becomes_call_result() {
        let mut d = dispatcher();
        d.register("Heartbeat", |_payload| async {
            Ok(json!({"currentTime": "2026-03-01T10:00:00Z"}))
        });

        let call = Call::new("Heartbeat", json!({}));
        match d.dispatch(&call).await {
            OcppMessage::CallResult(r) => {
                assert_eq!(r.message_id, call.message_id);
                assert_eq!(r.payload["currentTime"], "2026-03-01T10:00:00Z");
            }
            other => panic!("expected CallResult, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_rejection_keeps_its_code() {
        let mut d = dispatcher();
        d.register("ChangeConfiguration", |_payload| async {
            Err(HandlerError::not_supported("read-only key"))
        });

        let call = Call::new("ChangeConfiguration", json!({"key": "Url", "value": "x"}));
        match d.dispatch(&call).await {
            OcppMessage::CallError(e) => {
                assert_eq!(e.error_code, ErrorCode::NotSupported);
                assert_eq!(e.error_description, "read-only key");
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }
}
