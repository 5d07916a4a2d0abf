//! Sync HTTP channel — request/response bridge over the async bus.
//!
//! Port of nanobot's `channels/api.py`.
//!
//! `POST /chat` holds the HTTP response open until the turn engine's
//! matching `is_final` outbound arrives (or a hard timeout elapses),
//! turning the bus's async inbound/outbound flow into an ordinary
//! synchronous request/response for callers that can't poll a queue.
//! `POST /notify` is fire-and-forget: it publishes an inbound under a
//! caller-supplied channel/chat_id and returns immediately.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{error, info, warn};
use uuid::Uuid;

use oxibot_core::bus::queue::MessageBus;
use oxibot_core::bus::types::{InboundMessage, OutboundMessage};

use crate::base::Channel;

/// Sender identifier for turns originated via `/chat`.
const CHAT_SENDER_ID: &str = "client";
/// Sender identifier for turns originated via `/notify`.
const NOTIFY_SENDER_ID: &str = "notify";
/// Session-id fallback when a `/chat` request omits `session_id`.
const DEFAULT_SESSION_ID: &str = "default";
/// Hard timeout on `/chat` — matches the 120s bound on the turn engine side.
const CHAT_TIMEOUT: Duration = Duration::from_secs(120);

type PendingMap = Mutex<HashMap<String, oneshot::Sender<OutboundMessage>>>;

// ─────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    message: String,
    channel: String,
    chat_id: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    channel: &'static str,
    running: bool,
}

// ─────────────────────────────────────────────
// ApiChannel
// ─────────────────────────────────────────────

/// State shared across axum handlers: the bus and the map of in-flight
/// `/chat` requests awaiting their `is_final` outbound.
#[derive(Clone)]
struct ApiState {
    bus: Arc<MessageBus>,
    pending: Arc<PendingMap>,
}

/// Synchronous request/response bridge over the message bus, served via `axum`.
pub struct ApiChannel {
    host: String,
    port: u16,
    bus: Arc<MessageBus>,
    pending: Arc<PendingMap>,
    shutdown: Arc<Notify>,
}

impl ApiChannel {
    /// Create a new API channel bound to `host:port`.
    pub fn new(host: impl Into<String>, port: u16, bus: Arc<MessageBus>) -> Self {
        Self {
            host: host.into(),
            port,
            bus,
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    fn router(&self) -> Router {
        let state = ApiState {
            bus: self.bus.clone(),
            pending: self.pending.clone(),
        };

        Router::new()
            .route("/chat", post(handle_chat))
            .route("/notify", post(handle_notify))
            .route("/health", get(handle_health))
            .with_state(state)
    }
}

#[async_trait]
impl Channel for ApiChannel {
    fn name(&self) -> &str {
        "api"
    }

    async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid api channel bind address: {e}"))?;

        info!(addr = %addr, "starting api channel");

        let listener = TcpListener::bind(addr).await?;
        let app = self.router();
        let shutdown = self.shutdown.clone();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.notified().await;
                info!("api channel shutting down");
            })
            .await?;

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("stopping api channel");
        self.shutdown.notify_waiters();

        // Cancel every in-flight /chat wait — dropping the sender resolves
        // the receiver with an error, which the handler maps to 499.
        let mut pending = self.pending.lock().await;
        pending.clear();
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        // Intermediate (non-final) outbounds must not resolve a pending
        // /chat wait — only the turn's terminal reply does.
        if msg.metadata.get("is_final").map(String::as_str) != Some("true") {
            return Ok(());
        }

        let mut pending = self.pending.lock().await;
        if let Some(tx) = pending.remove(&msg.chat_id) {
            // Ignore the error: the waiter may have already timed out.
            let _ = tx.send(msg.clone());
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────

async fn handle_chat(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::to_value(ErrorResponse { error: "message must not be empty".into() }).unwrap()),
        );
    }

    let request_id = Uuid::new_v4().to_string();
    let session_id = req
        .session_id
        .clone()
        .unwrap_or_else(|| format!("api:{DEFAULT_SESSION_ID}"));

    let mut inbound = InboundMessage::new("api", CHAT_SENDER_ID, &request_id, &req.message);
    inbound.metadata.insert("session_id".to_string(), session_id.clone());

    let (tx, rx) = oneshot::channel();
    {
        let mut pending = state.pending.lock().await;
        pending.insert(request_id.clone(), tx);
    }

    if let Err(e) = state.bus.publish_inbound(inbound).await {
        state.pending.lock().await.remove(&request_id);
        error!(error = %e, "failed to publish /chat inbound");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::to_value(ErrorResponse { error: "failed to queue message".into() }).unwrap()),
        );
    }

    match tokio::time::timeout(CHAT_TIMEOUT, rx).await {
        Ok(Ok(outbound)) => (
            StatusCode::OK,
            Json(serde_json::to_value(ChatResponse { response: outbound.content, session_id }).unwrap()),
        ),
        Ok(Err(_)) => (
            StatusCode::from_u16(499).unwrap(),
            Json(serde_json::to_value(ErrorResponse { error: "request cancelled".into() }).unwrap()),
        ),
        Err(_) => {
            state.pending.lock().await.remove(&request_id);
            warn!(request_id = %request_id, "api /chat request timed out");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(serde_json::to_value(ErrorResponse { error: "timed out waiting for a response".into() }).unwrap()),
            )
        }
    }
}

async fn handle_notify(
    State(state): State<ApiState>,
    Json(req): Json<NotifyRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if req.message.trim().is_empty() || req.channel.trim().is_empty() || req.chat_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::to_value(ErrorResponse { error: "message, channel, and chat_id are required".into() }).unwrap()),
        );
    }

    let inbound = InboundMessage::new(&req.channel, NOTIFY_SENDER_ID, &req.chat_id, &req.message);
    if let Err(e) = state.bus.publish_inbound(inbound).await {
        error!(error = %e, "failed to publish /notify inbound");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::to_value(ErrorResponse { error: "failed to queue message".into() }).unwrap()),
        );
    }

    (
        StatusCode::OK,
        Json(serde_json::to_value(StatusResponse { status: "ok" }).unwrap()),
    )
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        channel: "api",
        running: true,
    })
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_channel() -> ApiChannel {
        let bus = Arc::new(MessageBus::new(32));
        ApiChannel::new("127.0.0.1", 0, bus)
    }

    #[test]
    fn test_channel_name() {
        let ch = create_test_channel();
        assert_eq!(ch.name(), "api");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let ch = create_test_channel();
        let app = ch.router();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_message() {
        let ch = create_test_channel();
        let app = ch.router();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": ""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_round_trip_via_send() {
        let bus = Arc::new(MessageBus::new(32));
        let ch = Arc::new(ApiChannel::new("127.0.0.1", 0, bus.clone()));
        let app = ch.router();

        let ch_responder = ch.clone();
        let responder = tokio::spawn(async move {
            let inbound = bus.consume_inbound().await.unwrap();
            assert_eq!(inbound.channel, "api");
            let mut reply = OutboundMessage::new("api", inbound.chat_id.clone(), "pong");
            reply.metadata.insert("is_final".to_string(), "true".to_string());
            ch_responder.send(&reply).await.unwrap();
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": "ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        responder.await.unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["response"], "pong");
    }

    #[tokio::test]
    async fn test_notify_publishes_under_given_channel() {
        let bus = Arc::new(MessageBus::new(32));
        let ch = ApiChannel::new("127.0.0.1", 0, bus.clone());
        let app = ch.router();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/notify")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": "hi", "channel": "telegram", "chat_id": "chat_9"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let received = bus.consume_inbound().await.unwrap();
        assert_eq!(received.channel, "telegram");
        assert_eq!(received.chat_id, "chat_9");
        assert_eq!(received.content, "hi");
    }

    #[tokio::test]
    async fn test_chat_defaults_session_id_to_default() {
        let bus = Arc::new(MessageBus::new(32));
        let ch = Arc::new(ApiChannel::new("127.0.0.1", 0, bus.clone()));
        let app = ch.router();

        let ch_responder = ch.clone();
        let responder = tokio::spawn(async move {
            let inbound = bus.consume_inbound().await.unwrap();
            assert_eq!(inbound.metadata.get("session_id").map(String::as_str), Some("api:default"));
            let mut reply = OutboundMessage::new("api", inbound.chat_id.clone(), "pong");
            reply.metadata.insert("is_final".to_string(), "true".to_string());
            ch_responder.send(&reply).await.unwrap();
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": "ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        responder.await.unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["session_id"], "api:default");
    }

    #[tokio::test]
    async fn test_send_ignores_non_final_outbound() {
        let bus = Arc::new(MessageBus::new(32));
        let ch = Arc::new(ApiChannel::new("127.0.0.1", 0, bus.clone()));
        let app = ch.router();

        let ch_responder = ch.clone();
        let responder = tokio::spawn(async move {
            let inbound = bus.consume_inbound().await.unwrap();

            // An intermediate, non-final outbound must not resolve the wait.
            let intermediate = OutboundMessage::new("api", inbound.chat_id.clone(), "working on it...");
            ch_responder.send(&intermediate).await.unwrap();

            tokio::time::sleep(Duration::from_millis(20)).await;

            let mut final_reply = OutboundMessage::new("api", inbound.chat_id.clone(), "done");
            final_reply.metadata.insert("is_final".to_string(), "true".to_string());
            ch_responder.send(&final_reply).await.unwrap();
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": "ping"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        responder.await.unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["response"], "done");
    }

    #[tokio::test]
    async fn test_send_to_unknown_request_id_is_noop() {
        let ch = create_test_channel();
        let mut msg = OutboundMessage::new("api", "no-such-request", "hello");
        msg.metadata.insert("is_final".to_string(), "true".to_string());
        assert!(ch.send(&msg).await.is_ok());
    }
}
