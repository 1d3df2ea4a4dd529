//! WebSocket listener
//!
//! Everything tungstenite-specific lives here: the upgrade handshake with
//! `ocpp1.6` subprotocol negotiation, identity extraction from the URL
//! path, and the pump tasks that shuttle text frames between the socket
//! and a session's transport link.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use ocpp16_core::{transport, CentralSystem, Transport};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue},
        Message,
    },
};
use tracing::{error, info, warn};

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Accept charge point connections until the listener fails.
pub async fn serve(
    central: Arc<CentralSystem>,
    host: &str,
    port: u16,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!("Central system listening on ws://{}:{}", host, port);

    loop {
        let (stream, addr) = listener.accept().await?;
        let central = central.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(central, stream, addr).await {
                error!(%addr, error = %e, "connection handler failed");
            }
        });
    }
}

/// The charge point identity is the path segment after the final `/`.
/// An empty identity is tolerated.
fn charge_point_identity(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

async fn handle_connection(
    central: Arc<CentralSystem>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::from("/");

    let ws = accept_hdr_async(stream, |req: &Request, mut resp: Response| {
        path = req.uri().path().to_string();

        let offered = req
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if offered.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL) {
            resp.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(OCPP_SUBPROTOCOL),
            );
        } else if !offered.is_empty() {
            warn!(%offered, "client offered no ocpp1.6 subprotocol, accepting anyway");
        }

        Ok::<Response, ErrorResponse>(resp)
    })
    .await?;

    let identity = charge_point_identity(&path).to_string();
    info!(%addr, %identity, "charge point connected");

    let (engine_half, ws_half) = transport::link(64);
    let (session, source) = central.attach(&identity, engine_half).await;
    let run_task = tokio::spawn(session.clone().run(source));

    let (mut ws_tx, mut ws_rx) = ws.split();
    let Transport {
        sink: to_session,
        source: mut from_session,
    } = ws_half;

    // Session -> socket.
    let outbound = tokio::spawn(async move {
        while let Ok(frame) = from_session.receive().await {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Socket -> session. Dropping the sink on exit closes the session's
    // inbound stream and lets the run loop wind down.
    let inbound = tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if to_session.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                // Pings are answered by tungstenite itself.
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "websocket receive failed");
                    break;
                }
            }
        }
    });

    // The session lifecycle is authoritative: when its run loop ends
    // (transport loss or reconnect displacement), tear the socket down.
    let _ = run_task.await;
    central.registry().unregister(&session).await;
    inbound.abort();
    outbound.abort();
    info!(%identity, "charge point disconnected");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_last_path_segment() {
        assert_eq!(charge_point_identity("/CP_1"), "CP_1");
        assert_eq!(charge_point_identity("/steve/websocket/CS/CP_2"), "CP_2");
        assert_eq!(charge_point_identity("/CP_3/"), "CP_3");
    }

    #[test]
    fn empty_identity_tolerated() {
        assert_eq!(charge_point_identity("/"), "");
        assert_eq!(charge_point_identity(""), "");
    }
}
