//! # OCPP 1.6 Protocol Engine
//!
//! The protocol machinery shared by the Central System node and the charge
//! point simulator: JSON-RPC framing, request/response correlation, action
//! dispatch, and per-connection session state.
//!
//! ## Architecture
//!
//! ```text
//! Charge Point                        Central System
//!       │ WebSocket (ocpp1.6)               │
//!       ▼                                   ▼
//! ┌──────────────────────────────────────────────────┐
//! │                  ocpp16-core                     │
//! │                                                  │
//! │  transport ──► session ──┬──► dispatch (CALL)    │
//! │                 │        └──► correlator         │
//! │                 │             (CALLRESULT /      │
//! │              messages          CALLERROR)        │
//! │              + schema                            │
//! │                                                  │
//! │  registry: identity ──► session                  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Inbound frames flow transport → codec → dispatcher (calls) or
//! correlator (responses). Outbound calls flow correlator → codec →
//! transport, with the caller suspended until the matching response,
//! a timeout, or connection loss.
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp16_core::{transport, CentralSystem};
//!
//! #[tokio::main]
//! async fn main() {
//!     let central = CentralSystem::new();
//!
//!     // One link per accepted WebSocket; the binary pumps frames between
//!     // the peer half and the socket.
//!     let (engine_half, _peer_half) = transport::link(64);
//!     let (session, source) = central.attach("CP_1", engine_half).await;
//!     tokio::spawn(session.run(source));
//! }
//! ```

pub mod central;
pub mod correlator;
pub mod dispatch;
pub mod messages;
pub mod registry;
pub mod schema;
pub mod session;
pub mod transport;
pub mod types;

pub use central::{CentralSystem, CommandError};
pub use correlator::{CallFailure, Correlator};
pub use dispatch::{Dispatcher, HandlerError, HandlerResult};
pub use messages::{Action, Call, CallError, CallResult, DecodeError, ErrorCode, OcppMessage};
pub use registry::SessionRegistry;
pub use schema::{SchemaRegistry, ValidationError};
pub use session::{ChargePointState, Session, SessionState, SessionStatus};
pub use transport::{Transport, TransportError, TransportSink, TransportSource};
