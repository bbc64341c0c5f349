//! Integration tests for the API layer.
//!
//! These tests spin up a real HTTP server on a random port so that
//! `ConnectInfo<SocketAddr>` is populated correctly by axum, and talk to the
//! therapist channel with a real WebSocket client.

use futures_util::{SinkExt, StreamExt};
use lifeline_api::{create_router, AppState, RateLimitConfig, ServerConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    base: String,
    ws_url: String,
}

async fn start_test_server() -> TestServer {
    start_test_server_with(ServerConfig::default()).await
}

/// Spin up a test server on a random port.
async fn start_test_server_with(config: ServerConfig) -> TestServer {
    let state = Arc::new(AppState::new(config).unwrap());
    let router = create_router(state, Some(vec!["*".to_string()]));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        ws_url: format!("ws://{}/api/v1/ws", addr),
    }
}

async fn get(base: &str, path: &str) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .get(format!("{}{}", base, path))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn post_json(base: &str, path: &str, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}{}", base, path))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn submit(base: &str, patient: &str, severity: u8) -> String {
    let (status, body) = post_json(
        base,
        "/api/v1/signals",
        json!({"source_user_id": patient, "severity": severity, "keywords": ["hopeless"]}),
    )
    .await;
    assert_eq!(status, 202, "unexpected body: {}", body);
    body["alert_id"].as_str().unwrap().to_string()
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next application frame, skipping server pings.
async fn next_frame(ws: &mut Ws) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["type"] != "ping" {
                return frame;
            }
        }
    }
}

async fn open_ws(server: &TestServer, therapist: &str) -> (Ws, Value) {
    let (mut ws, _) = connect_async(server.ws_url.as_str()).await.unwrap();
    send(
        &mut ws,
        json!({"type": "connect", "therapist_id": therapist, "auth_token": "token"}),
    )
    .await;
    let connected = next_frame(&mut ws).await;
    assert_eq!(connected["type"], "connected");
    (ws, connected)
}

// ============================================================================
// HTTP surface
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_test_server().await;
    let (status, body) = get(&server.base, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["alerts"]["pending"], 0);
    assert_eq!(body["live_connections"], 0);
}

#[tokio::test]
async fn test_submit_and_fetch_alert() {
    let server = start_test_server().await;
    let alert_id = submit(&server.base, "patient-1", 8).await;
    assert!(alert_id.starts_with("alert_"));

    let (status, alert) = get(&server.base, &format!("/api/v1/alerts/{}", alert_id)).await;
    assert_eq!(status, 200);
    assert_eq!(alert["status"], "pending");
    assert_eq!(alert["signal"]["source_user_id"], "patient-1");

    let (status, pending) = get(&server.base, "/api/v1/alerts").await;
    assert_eq!(status, 200);
    assert_eq!(pending.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_signal_rejected() {
    let server = start_test_server().await;
    let (status, body) = post_json(
        &server.base,
        "/api/v1/signals",
        json!({"source_user_id": "p1", "severity": 11}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "INVALID_SIGNAL");
}

#[tokio::test]
async fn test_unknown_alert_is_404() {
    let server = start_test_server().await;
    let (status, body) = get(&server.base, "/api/v1/alerts/alert_missing").await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "ALERT_NOT_FOUND");
}

#[tokio::test]
async fn test_signal_rate_limit() {
    let config = ServerConfig {
        rate_limit: RateLimitConfig {
            max_signals: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let server = start_test_server_with(config).await;
    submit(&server.base, "p1", 5).await;
    submit(&server.base, "p2", 5).await;

    let (status, body) = post_json(
        &server.base,
        "/api/v1/signals",
        json!({"source_user_id": "p3", "severity": 5}),
    )
    .await;
    assert_eq!(status, 429);
    assert_eq!(body["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn test_api_key_required_when_configured() {
    let config = ServerConfig {
        api_key: Some("s3cret".into()),
        ..Default::default()
    };
    let server = start_test_server_with(config).await;

    let (status, _) = get(&server.base, "/health").await;
    assert_eq!(status, 200);

    let (status, body) = get(&server.base, "/api/v1/alerts").await;
    assert_eq!(status, 401);
    assert_eq!(body["code"], "MISSING_API_KEY");

    let resp = reqwest::Client::new()
        .get(format!("{}/api/v1/alerts", server.base))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // The therapist socket authenticates in its own handshake.
    let (_ws, connected) = open_ws(&server, "t1").await;
    assert_eq!(connected["pending_alerts"], 0);
}

// ============================================================================
// Therapist channel
// ============================================================================

#[tokio::test]
async fn test_claim_race_over_websocket() {
    let server = start_test_server().await;
    let (mut t1, _) = open_ws(&server, "t1").await;
    let (mut t2, _) = open_ws(&server, "t2").await;

    let alert_id = submit(&server.base, "patient-1", 8).await;
    for ws in [&mut t1, &mut t2] {
        let frame = next_frame(ws).await;
        assert_eq!(frame["type"], "new_alert");
        assert_eq!(frame["alert_id"], alert_id.as_str());
        assert_eq!(frame["category"], "high");
    }

    send(&mut t2, json!({"type": "accept_alert", "alert_id": alert_id})).await;
    let granted = next_frame(&mut t2).await;
    assert_eq!(granted, json!({"type": "session_granted", "alert_id": alert_id}));

    let withdrawn = next_frame(&mut t1).await;
    assert_eq!(
        withdrawn,
        json!({"type": "alert_withdrawn", "alert_id": alert_id, "claimed_by": "t2"})
    );

    send(&mut t1, json!({"type": "accept_alert", "alert_id": alert_id})).await;
    let rejected = next_frame(&mut t1).await;
    assert_eq!(rejected["type"], "claim_rejected");
    assert_eq!(rejected["by_whom"], "t2");
    assert_eq!(rejected["reason"], "already_claimed");

    let (_, alert) = get(&server.base, &format!("/api/v1/alerts/{}", alert_id)).await;
    assert_eq!(alert["status"], "claimed");
    assert_eq!(alert["claimed_by"], "t2");
}

#[tokio::test]
async fn test_connect_replays_pending_alerts() {
    let server = start_test_server().await;
    let first = submit(&server.base, "p1", 9).await;
    let second = submit(&server.base, "p2", 4).await;

    let (mut ws, connected) = open_ws(&server, "t1").await;
    assert_eq!(connected["pending_alerts"], 2);
    assert_eq!(next_frame(&mut ws).await["alert_id"], first.as_str());
    assert_eq!(next_frame(&mut ws).await["alert_id"], second.as_str());
}

#[tokio::test]
async fn test_admin_withdraw_notifies_therapists() {
    let server = start_test_server().await;
    let (mut ws, _) = open_ws(&server, "t1").await;
    let alert_id = submit(&server.base, "p1", 6).await;
    assert_eq!(next_frame(&mut ws).await["type"], "new_alert");

    let path = format!("/api/v1/alerts/{}/withdraw", alert_id);
    let (status, alert) = post_json(&server.base, &path, json!({"reason": "false positive"})).await;
    assert_eq!(status, 200);
    assert_eq!(alert["status"], "withdrawn");
    assert_eq!(alert["withdrawal_reason"], "false positive");

    assert_eq!(
        next_frame(&mut ws).await,
        json!({"type": "alert_withdrawn", "alert_id": alert_id})
    );

    let (status, body) = post_json(&server.base, &path, json!({})).await;
    assert_eq!(status, 409);
    assert_eq!(body["code"], "ALERT_NOT_PENDING");

    send(&mut ws, json!({"type": "accept_alert", "alert_id": alert_id})).await;
    assert_eq!(next_frame(&mut ws).await["reason"], "withdrawn");
}

#[tokio::test]
async fn test_parse_error_keeps_connection_open() {
    let server = start_test_server().await;
    let (mut ws, _) = open_ws(&server, "t1").await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let error = next_frame(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "PARSE_ERROR");

    let alert_id = submit(&server.base, "p1", 7).await;
    assert_eq!(next_frame(&mut ws).await["alert_id"], alert_id.as_str());
}

#[tokio::test]
async fn test_handshake_requires_connect_first() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(server.ws_url.as_str()).await.unwrap();
    send(&mut ws, json!({"type": "heartbeat", "seq": 1})).await;

    let error = next_frame(&mut ws).await;
    assert_eq!(error["code"], "PROTOCOL_ERROR");
}

#[tokio::test]
async fn test_handshake_rejects_non_therapist_role() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(server.ws_url.as_str()).await.unwrap();
    send(
        &mut ws,
        json!({"type": "connect", "therapist_id": "u1", "auth_token": "t", "role": "patient"}),
    )
    .await;

    let error = next_frame(&mut ws).await;
    assert_eq!(error["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_disconnect_updates_presence() {
    let server = start_test_server().await;
    let (mut ws, _) = open_ws(&server, "t1").await;
    let (_, health) = get(&server.base, "/health").await;
    assert_eq!(health["online_therapists"], 1);

    ws.close(None).await.unwrap();
    // The server notices the close asynchronously.
    let mut live = health["live_connections"].as_u64().unwrap();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_, health) = get(&server.base, "/health").await;
        live = health["live_connections"].as_u64().unwrap();
        if live == 0 {
            break;
        }
    }
    assert_eq!(live, 0);
}
