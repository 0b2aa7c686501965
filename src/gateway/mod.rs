//! Axum-based HTTP gateway for upstream event ingestion.
//!
//! - `POST /events` accepts a [`PlatformEvent`] and dispatches it
//! - `GET /health` reports component health
//! - `GET /actors/{key}` returns one actor's snapshot
//!
//! Request bodies are capped at 64KB and requests time out after 30s.

use crate::coordinator::CorrelationKey;
use crate::dispatch::{Dispatcher, PlatformEvent};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

fn hash_webhook_secret(value: &str) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)
}

/// Compare two strings without short-circuiting on the first mismatch.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let len_diff = a.len() ^ b.len();
    let max_len = a.len().max(b.len());
    let mut byte_diff = 0u8;
    for i in 0..max_len {
        let x = *a.get(i).unwrap_or(&0);
        let y = *b.get(i).unwrap_or(&0);
        byte_diff |= x ^ y;
    }
    (len_diff == 0) & (byte_diff == 0)
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// SHA-256 hash of `X-Webhook-Secret` (hex-encoded), never plaintext.
    pub webhook_secret_hash: Option<Arc<str>>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, webhook_secret: Option<&str>) -> Self {
        Self {
            dispatcher,
            webhook_secret_hash: webhook_secret
                .map(str::trim)
                .filter(|secret| !secret.is_empty())
                .map(|secret| Arc::from(hash_webhook_secret(secret))),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/events", post(handle_event))
        .route("/actors/{key}", get(handle_actor))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the HTTP gateway until the listener fails.
pub async fn run_gateway(host: &str, port: u16, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid gateway address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    let actual = listener.local_addr()?;
    tracing::info!(addr = %actual, "Gateway listening");

    crate::health::mark_component_ok("gateway");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health, always public
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "active_actors": state.dispatcher.coordinator().active_actors(),
        "runtime": crate::health::snapshot_json(),
    });
    Json(body)
}

/// POST /events: dispatch one upstream live/offline event
async fn handle_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PlatformEvent>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    // ── Webhook secret auth (optional) ──
    if let Some(ref secret_hash) = state.webhook_secret_hash {
        let header_hash = headers
            .get("X-Webhook-Secret")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(hash_webhook_secret);
        match header_hash {
            Some(val) if constant_time_eq(&val, secret_hash.as_ref()) => {}
            _ => {
                tracing::warn!("Events: rejected request, invalid or missing X-Webhook-Secret");
                let err = serde_json::json!({"error": "Unauthorized: invalid or missing X-Webhook-Secret header"});
                return (StatusCode::UNAUTHORIZED, Json(err));
            }
        }
    }

    // ── Parse body ──
    let Json(event) = match body {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Events JSON parse error: {e}");
            let err = serde_json::json!({
                "error": "Invalid JSON body. Expected: {\"platform\": \"twitch|kick\", \"channel_name\": \"...\", \"status\": \"live|offline\"}"
            });
            return (StatusCode::BAD_REQUEST, Json(err));
        }
    };

    if event.channel_name.trim().is_empty() {
        let err = serde_json::json!({"error": "channel_name must not be empty"});
        return (StatusCode::BAD_REQUEST, Json(err));
    }

    match state.dispatcher.ingest(event).await {
        Ok(deliveries) => {
            let body = serde_json::json!({
                "status": "ok",
                "deliveries": deliveries,
            });
            (StatusCode::OK, Json(body))
        }
        Err(e) => {
            tracing::error!("Event dispatch failed: {e:#}");
            let err = serde_json::json!({"error": "Failed to resolve subscriptions for event"});
            (StatusCode::INTERNAL_SERVER_ERROR, Json(err))
        }
    }
}

/// GET /actors/{key}: one actor's snapshot
async fn handle_actor(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
) -> impl IntoResponse {
    let key = match CorrelationKey::parse(&raw_key) {
        Ok(key) => key,
        Err(e) => {
            let err = serde_json::json!({"error": e.to_string()});
            return (StatusCode::BAD_REQUEST, Json(err));
        }
    };
    let snapshot = state.dispatcher.coordinator().snapshot(&key).await;
    let body = serde_json::json!({
        "key": key,
        "idle": snapshot.is_idle(),
        "snapshot": snapshot,
    });
    (StatusCode::OK, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{MessageTransport, TransportError};
    use crate::compose::{NotificationComposer, RenderedBody};
    use crate::config::ComposerConfig;
    use crate::coordinator::{
        Coordinator, CoordinatorDeps, CoordinatorSettings, Platform, SqliteSnapshotStore,
        StreamMetadata, StreamStatus, Subscription,
    };
    use crate::store::{state_db_path, SqliteMessageRecordStore, SqliteSubscriptionStore};
    use crate::timers::SqliteTimerService;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use axum::response::Response;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingTransport {
        sends: AtomicUsize,
    }

    #[async_trait]
    impl MessageTransport for CountingTransport {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send(&self, _: &str, _: &RenderedBody) -> Result<String, TransportError> {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(format!("m-{n}"))
        }

        async fn update(
            &self,
            _: &str,
            message_id: &str,
            _: &RenderedBody,
        ) -> Result<String, TransportError> {
            Ok(message_id.to_string())
        }
    }

    fn state(tmp: &TempDir, secret: Option<&str>) -> (AppState, Arc<CountingTransport>) {
        let db = state_db_path(tmp.path());
        let subscriptions = Arc::new(SqliteSubscriptionStore::new(&db));
        subscriptions
            .upsert_subscription(&Subscription {
                id: "s1".into(),
                platform: Platform::Twitch,
                channel_name: "streamer".into(),
                guild_id: "g".into(),
                destination: "chan".into(),
                live_template: None,
                offline_template: None,
                disabled: false,
            })
            .unwrap();

        let transport = Arc::new(CountingTransport::default());
        let coordinator = Arc::new(Coordinator::new(
            CoordinatorDeps {
                records: Arc::new(SqliteMessageRecordStore::new(&db)),
                snapshots: Arc::new(SqliteSnapshotStore::new(&db)),
                subscriptions: subscriptions.clone(),
                timers: Arc::new(SqliteTimerService::new(&db)),
                transport: transport.clone(),
                composer: NotificationComposer::new(&ComposerConfig::default()),
            },
            CoordinatorSettings::default(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(coordinator, subscriptions));
        (AppState::new(dispatcher, secret), transport)
    }

    fn live_event() -> PlatformEvent {
        PlatformEvent {
            platform: Platform::Twitch,
            channel_name: "Streamer".into(),
            status: StreamStatus::Live,
            metadata: StreamMetadata {
                display_name: "Streamer".into(),
                title: "hello".into(),
                ..StreamMetadata::default()
            },
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn security_body_limit_is_64kb() {
        assert_eq!(MAX_BODY_SIZE, 65_536);
    }

    #[test]
    fn security_timeout_is_30_seconds() {
        assert_eq!(REQUEST_TIMEOUT_SECS, 30);
    }

    #[test]
    fn constant_time_eq_matches_only_identical_strings() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn blank_secret_disables_auth() {
        let tmp = TempDir::new().unwrap();
        let (state, _) = state(&tmp, Some("   "));
        assert!(state.webhook_secret_hash.is_none());
    }

    #[tokio::test]
    async fn event_is_dispatched_and_sent() {
        let tmp = TempDir::new().unwrap();
        let (state, transport) = state(&tmp, None);

        let response = handle_event(State(state), HeaderMap::new(), Ok(Json(live_event())))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["deliveries"][0]["key"], "streamer@chan");
        assert_eq!(body["deliveries"][0]["outcome"]["outcome"], "sent");
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn webhook_secret_rejects_missing_or_wrong_header() {
        let tmp = TempDir::new().unwrap();
        let (state, transport) = state(&tmp, Some("s3cret"));

        let response = handle_event(State(state.clone()), HeaderMap::new(), Ok(Json(live_event())))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert("X-Webhook-Secret", HeaderValue::from_static("nope"));
        let response = handle_event(State(state), headers, Ok(Json(live_event())))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(transport.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn webhook_secret_accepts_valid_header() {
        let tmp = TempDir::new().unwrap();
        let (state, transport) = state(&tmp, Some("s3cret"));

        let mut headers = HeaderMap::new();
        headers.insert("X-Webhook-Secret", HeaderValue::from_static("s3cret"));
        let response = handle_event(State(state), headers, Ok(Json(live_event())))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_channel_name_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (state, _) = state(&tmp, None);
        let mut event = live_event();
        event.channel_name = " ".into();

        let response = handle_event(State(state), HeaderMap::new(), Ok(Json(event)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn actor_endpoint_reports_snapshot() {
        let tmp = TempDir::new().unwrap();
        let (state, _) = state(&tmp, None);

        let _ = handle_event(State(state.clone()), HeaderMap::new(), Ok(Json(live_event()))).await;

        let response = handle_actor(State(state.clone()), Path("streamer@chan".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["snapshot"]["twitch_live"], true);
        assert_eq!(body["idle"], false);

        let response = handle_actor(State(state), Path("no-separator".into()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let tmp = TempDir::new().unwrap();
        let (state, _) = state(&tmp, None);
        let response = handle_health(State(state)).await.into_response();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }
}
