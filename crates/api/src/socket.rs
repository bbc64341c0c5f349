//! Therapist WebSocket channel.
//!
//! The first frame must be `connect`. After the handshake the socket is split:
//! a writer task drains the connection's outbound queue, and the reader feeds
//! client frames to the hub. Whichever side finishes first ends the session.

use crate::rate_limit::WebSocketGuard;
use crate::routes::ErrorResponse;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use lifeline_common::{ClientMessage, ClientRole, ServerMessage, TherapistId};
use lifeline_dispatch::{BroadcastHub, Connection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let Some(guard) = WebSocketGuard::new(state.limiter.clone(), addr.ip()) else {
        warn!(ip = %addr.ip(), "Too many therapist sockets from one address");
        return ErrorResponse::new(
            StatusCode::TOO_MANY_REQUESTS,
            "TOO_MANY_CONNECTIONS",
            "Too many open connections from this address",
        )
        .into_response();
    };

    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state.hub.clone(), addr).await;
        drop(guard);
    })
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<BroadcastHub>, addr: SocketAddr) {
    let timeout = hub.config().connections.handshake_timeout();
    let therapist_id = match handshake(&mut socket, timeout).await {
        Ok(therapist_id) => therapist_id,
        Err(rejection) => {
            warn!(ip = %addr.ip(), reason = ?rejection, "Therapist handshake failed");
            if send_frame(&mut socket, &rejection).await.is_ok() {
                let _ = socket.send(Message::Close(None)).await;
            }
            return;
        }
    };

    let connection = hub.connect(therapist_id);
    let (sender, receiver) = socket.split();
    let mut writer = tokio::spawn(write_loop(connection.clone(), sender));

    tokio::select! {
        _ = read_loop(&hub, &connection, receiver) => {}
        _ = &mut writer => {}
    }

    hub.disconnect(connection.id());
    writer.abort();
}

/// Wait for a valid `connect` frame. On failure returns the error frame to
/// send before closing.
async fn handshake(socket: &mut WebSocket, timeout: Duration) -> Result<TherapistId, ServerMessage> {
    let first = tokio::time::timeout(timeout, async {
        while let Some(frame) = socket.recv().await {
            match frame {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await
    .map_err(|_| ServerMessage::error("HANDSHAKE_TIMEOUT", "no connect frame received in time"))?
    .ok_or_else(|| ServerMessage::error("HANDSHAKE_ABORTED", "socket closed before connect"))?;

    let message: ClientMessage = serde_json::from_str(first.as_str())
        .map_err(|e| ServerMessage::error("PARSE_ERROR", e.to_string()))?;

    match message {
        ClientMessage::Connect {
            therapist_id,
            auth_token,
            role,
        } => {
            if therapist_id.as_str().trim().is_empty() {
                return Err(ServerMessage::error("INVALID_THERAPIST", "therapist_id is required"));
            }
            if auth_token.trim().is_empty() {
                return Err(ServerMessage::error("UNAUTHORIZED", "auth_token is required"));
            }
            if role != ClientRole::Therapist {
                return Err(ServerMessage::error(
                    "FORBIDDEN",
                    "only therapists may receive crisis alerts",
                ));
            }
            Ok(therapist_id)
        }
        _ => Err(ServerMessage::error(
            "PROTOCOL_ERROR",
            "first frame must be connect",
        )),
    }
}

/// Sends attempted for a critical frame before the socket is given up.
const CRITICAL_SEND_ATTEMPTS: u32 = 3;
const CRITICAL_RETRY_DELAY: Duration = Duration::from_millis(100);

async fn write_loop<S>(connection: Arc<Connection>, mut sender: S)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = connection.next_outbound().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                error!(connection_id = %connection.id(), error = %e, "Failed to serialize frame");
                continue;
            }
        };

        let attempts = if frame.is_critical() {
            CRITICAL_SEND_ATTEMPTS
        } else {
            1
        };
        if let Err(e) = send_with_retry(&mut sender, json.into(), attempts).await {
            warn!(
                connection_id = %connection.id(),
                critical = frame.is_critical(),
                error = %e,
                "WebSocket send failed, closing writer"
            );
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

async fn send_with_retry<S>(sender: &mut S, text: Utf8Bytes, attempts: u32) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    let mut attempt = 1;
    loop {
        match sender.send(Message::Text(text.clone())).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => return Err(e),
            Err(_) => {
                attempt += 1;
                tokio::time::sleep(CRITICAL_RETRY_DELAY).await;
            }
        }
    }
}

async fn read_loop(hub: &BroadcastHub, connection: &Connection, mut receiver: SplitStream<WebSocket>) {
    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                connection.enqueue(ServerMessage::error("PARSE_ERROR", "binary frames are not supported"));
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(connection_id = %connection.id(), "Client sent close frame");
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %connection.id(), error = %e, "WebSocket read failed");
                return;
            }
        };

        match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(message) => hub.handle_client_message(connection.id(), message),
            Err(e) => {
                debug!(connection_id = %connection.id(), error = %e, "Unparseable client frame");
                connection.enqueue(ServerMessage::error("PARSE_ERROR", e.to_string()));
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(json.into())).await
}
