// Broadcast bot — process entry point. Loads the engine config, opens the
// persistent stores, wires the AI/transport collaborators, and stands up two
// background jobs: the Queue Dispatcher's heartbeat and an inbound webhook
// listener that feeds the Router. Grounded on the teacher's
// `engine/webhook.rs` inbound-bridge shape (bearer-token auth, JSON
// request/response, one spawned task per request) rewired onto axum, and on
// `engine/whatsapp/bridge.rs`'s startup sequence (load config → open store →
// reconcile → spawn heartbeat).

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use broadcast_core::{
    AiClient, BroadcastDb, Dispatcher, EngineConfig, EngineError, EngineResult, GroupRegistry,
    HttpTransport, InboundEvent, MediaCache, Router, Transport,
};
use clap::Parser;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// `recent(u32::MAX)` is the cheapest way to get "every persisted broadcast"
/// out of an API that was only ever asked for "the last N" (spec §4.4);
/// adding a dedicated all-rows query for one startup call wasn't worth it.
const RECONCILE_SCAN_LIMIT: u32 = u32::MAX;

#[derive(Parser, Debug)]
#[command(name = "broadcast-bot", about = "Promotional broadcast workstation daemon")]
struct Args {
    /// Path to the engine's TOML config file.
    #[arg(long, env = "BROADCAST_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Base URL of the messaging bridge the transport posts to.
    #[arg(long, env = "BRIDGE_URL")]
    bridge_url: String,

    /// Bearer token the transport presents to the messaging bridge.
    #[arg(long, env = "BRIDGE_API_KEY")]
    bridge_api_key: String,

    /// Address the inbound webhook listener binds to.
    #[arg(long, env = "WEBHOOK_BIND", default_value = "127.0.0.1")]
    webhook_bind: String,

    /// Port the inbound webhook listener binds to.
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 8091)]
    webhook_port: u16,

    /// Bearer token the messaging bridge must present on its webhook calls.
    #[arg(long, env = "WEBHOOK_TOKEN")]
    webhook_token: String,
}

struct AppState {
    router: Arc<Router>,
    webhook_token: String,
}

/// One inbound event as the messaging bridge posts it. `media_url` present
/// means a Media event, absent means Text — same disjoint shape as
/// `InboundEvent` itself (spec §6.2).
#[derive(Debug, Deserialize)]
struct WebhookPayload {
    chat_id: String,
    sender_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    media_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run().await {
        error!("[main] fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> EngineResult<()> {
    let args = Args::parse();

    let config = Arc::new(EngineConfig::load(&args.config)?);
    info!("[main] loaded config from {:?}", args.config);

    let db = Arc::new(BroadcastDb::open(&config.database_path)?);
    let media = Arc::new(MediaCache::open(config.media_dir.clone())?);
    reconcile_media(&db, &media)?;
    let swept = db.sweep_expired_states()?;
    if swept > 0 {
        info!("[main] swept {swept} expired conversation state(s) at startup");
    }

    let ai = Arc::new(AiClient::new(config.ai_processor_url.clone()));
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(args.bridge_url.clone(), args.bridge_api_key.clone()));
    let groups = Arc::new(GroupRegistry::new(&config));

    let dispatcher = Dispatcher::new(db.clone(), media.clone(), transport.clone(), config.clone(), groups.clone());
    let dispatcher_task = tokio::spawn(dispatcher.clone().run());

    let router = Router::new(db, media, ai, transport, dispatcher.clone(), config, groups);

    let state = Arc::new(AppState { router, webhook_token: args.webhook_token });
    let app = axum::Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.webhook_bind, args.webhook_port)
        .parse()
        .map_err(|e| EngineError::Config(format!("invalid webhook bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| EngineError::Config(format!("binding webhook listener on {addr}: {e}")))?;
    info!("[main] webhook listener on http://{addr}");

    let shutdown_dispatcher = dispatcher.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("[main] shutdown signal received");
        shutdown_dispatcher.shutdown();
    });

    if let Err(e) = server.await {
        error!("[main] webhook server error: {e}");
    }
    dispatcher_task.abort();
    Ok(())
}

/// Re-register every file a persisted broadcast still references, then let
/// the Media Cache unlink anything orphaned past the grace period (spec
/// §4.2, §7 "Startup inconsistency").
fn reconcile_media(db: &BroadcastDb, media: &MediaCache) -> EngineResult<()> {
    let records = db.recent(RECONCILE_SCAN_LIMIT)?;
    let persisted_paths: HashSet<PathBuf> = records.into_iter().flat_map(|r| r.media_paths).collect();
    media.reconcile(&persisted_paths)
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> impl IntoResponse {
    if !authorized(&headers, &state.webhook_token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(WebhookAck { ok: false, error: Some("missing or invalid bearer token".into()) }),
        );
    }

    let event = match (payload.media_url, payload.text) {
        (Some(media_url), _) => InboundEvent::Media {
            chat_id: payload.chat_id,
            sender_id: payload.sender_id,
            caption: payload.caption,
            media_url,
        },
        (None, Some(text)) => InboundEvent::Text { chat_id: payload.chat_id, sender_id: payload.sender_id, text },
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookAck { ok: false, error: Some("payload carries neither text nor media_url".into()) }),
            );
        }
    };

    let router = state.router.clone();
    tokio::spawn(async move { router.handle_event(event).await });
    (StatusCode::ACCEPTED, Json(WebhookAck { ok: true, error: None }))
}

fn authorized(headers: &HeaderMap, expected: &str) -> bool {
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")).unwrap_or(value);
    token == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_prefix_is_stripped_before_comparing() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(authorized(&headers, "secret"));
    }

    #[test]
    fn missing_header_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(!authorized(&headers, "secret"));
    }

    #[test]
    fn wrong_token_is_unauthorized() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(!authorized(&headers, "secret"));
    }
}
