use std::{collections::HashMap, env, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::dispatcher::Dispatcher;
use crate::gateway::GraphTransport;
use crate::media::IMAGE_PREFIX;
use crate::store::{PgStore, SessionStore};
use crate::types::{normalize_phone, parse_agent_pools, BotConfig};

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub store: SessionStore,
    pub config: BotConfig,
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_default();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "bakery_bot".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn resolve_config() -> BotConfig {
    BotConfig {
        wa_token: env::var("WA_TOKEN").unwrap_or_default(),
        phone_id: env::var("PHONE_ID").unwrap_or_default(),
        verify_token: env::var("VERIFY_TOKEN").unwrap_or_else(|_| "BOT".to_string()),
        app_secret: env::var("APP_SECRET").unwrap_or_default(),
        owner_phone: env::var("OWNER_PHONE")
            .map(|p| normalize_phone(&p))
            .unwrap_or_default(),
        agent_pools: parse_agent_pools(&env::var("AGENT_NUMBERS").unwrap_or_default()),
    }
}

/// Verify the `X-Hub-Signature-256` header against the raw body. An unset
/// secret disables the check, matching how the transport behaves before a
/// secret is configured.
fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Reduce one webhook message object to the utterance the dispatcher sees:
/// plain text, the interactive reply's title or id, or an `IMAGE:` marker.
fn inbound_utterance(message: &Value) -> Option<String> {
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();

    match msg_type.as_str() {
        "text" => Some(
            message
                .get("text")
                .and_then(|v| v.get("body"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string(),
        ),
        "interactive" => {
            let interactive = message.get("interactive")?;
            let text = interactive
                .get("list_reply")
                .and_then(|r| {
                    r.get("title")
                        .and_then(Value::as_str)
                        .or_else(|| r.get("id").and_then(Value::as_str))
                })
                .or_else(|| {
                    interactive.get("button_reply").and_then(|r| {
                        r.get("id")
                            .and_then(Value::as_str)
                            .or_else(|| r.get("title").and_then(Value::as_str))
                    })
                })
                .unwrap_or("");
            Some(text.trim().to_string())
        }
        "button" => Some(
            message
                .get("button")
                .and_then(|v| v.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string(),
        ),
        "image" => {
            let media_id = message
                .get("image")
                .and_then(|v| v.get("id"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();
            if media_id.is_empty() {
                Some(String::new())
            } else {
                Some(format!("{IMAGE_PREFIX}{media_id}"))
            }
        }
        _ => Some(String::new()),
    }
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == "subscribe"
        && !challenge.is_empty()
        && verify_token == state.config.verify_token
    {
        return (StatusCode::OK, challenge).into_response();
    }
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_signature(&state.config.app_secret, signature_header, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    if payload.get("object").and_then(Value::as_str) != Some("whatsapp_business_account") {
        return (StatusCode::OK, Json(json!({ "status": "ignored" }))).into_response();
    }

    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut processed = 0usize;
    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for change in changes {
            if change.get("field").and_then(Value::as_str) != Some("messages") {
                continue;
            }
            let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for message in messages {
                let from = message.get("from").and_then(Value::as_str).unwrap_or("");
                let sender = normalize_phone(from);
                if sender.is_empty() {
                    continue;
                }
                let Some(utterance) = inbound_utterance(&message) else {
                    continue;
                };
                state
                    .store
                    .append_log(
                        &sender,
                        "in",
                        message.get("type").and_then(Value::as_str).unwrap_or("raw"),
                        message.clone(),
                    )
                    .await;
                processed += 1;

                // Each message is its own unit of work; a slow turn must not
                // hold up the webhook ack.
                let state = state.clone();
                tokio::spawn(async move {
                    state.dispatcher.handle_inbound(&sender, &utterance).await;
                });
            }
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "status": "success", "processed": processed })),
    )
        .into_response()
}

/// Serve a stored media blob (design images, payment proofs) for auditing.
async fn serve_media(
    Path((kind, key)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if !matches!(kind.as_str(), "design" | "payment") {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown media kind" })),
        )
            .into_response();
    }
    match state.store.get_media(&kind, &key).await {
        Ok(Some((bytes, meta))) => {
            let mut response = axum::response::Response::new(axum::body::Body::from(bytes));
            *response.status_mut() = StatusCode::OK;
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("private, max-age=300"),
            );
            if let Ok(v) = HeaderValue::from_str(&meta.content_type) {
                response.headers_mut().insert(header::CONTENT_TYPE, v);
            }
            response.into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "media not found" })),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(kind, key, error = %err, "media read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage failure" })),
            )
                .into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .route("/media/{kind}/{key}", get(serve_media))
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5000);
    let config = resolve_config();

    let database_url = resolve_database_url();
    let pg = PgStore::connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");
    let store = SessionStore::new(Arc::new(pg));

    let transport = Arc::new(GraphTransport::new(&config.phone_id, &config.wa_token));
    let dispatcher = Dispatcher::new(store.clone(), transport, config.clone());

    let state = Arc::new(AppState {
        dispatcher,
        store,
        config,
    });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(%addr, "bakery bot listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
