use std::convert::Infallible;

use axum::Router;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use bytes::Bytes;
use parley_agents::events::EventSink;
use parley_agents::pipeline::{ChatRequest, IncomingMessage};
use parley_common::{Attachment, Error, Identity, MessageRole};
use parley_db::{Vote, VoteKind};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::state::AppState;

/// Build the application router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Per-IP rate limit from config (default: 1 req/sec, burst 60).
    let rl = &state.config.gateway.rate_limit;
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(rl.per_second)
        .burst_size(rl.burst_size)
        .finish()
        .expect("governor config should be valid");
    let governor_limiter = governor_conf.limiter().clone();
    let governor_layer = GovernorLayer::new(governor_conf);

    // Clean up rate-limiter state for inactive IPs.
    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(60);
        loop {
            tokio::time::sleep(interval).await;
            governor_limiter.retain_recent();
        }
    });

    Router::new()
        .route("/health", get(health))
        .route("/chat", axum::routing::post(post_chat).delete(delete_chat))
        .route("/vote", get(get_votes).patch(patch_vote))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .layer(governor_layer)
}

async fn health() -> &'static str {
    "ok"
}

// ----------------------------------------------------------------------
// Auth + error envelopes

/// Resolve `Authorization: Bearer <token>` against the session table.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let Some(token) = token else {
        return Err((StatusCode::UNAUTHORIZED, "Missing bearer token").into_response());
    };

    match state.store.resolve_session(token) {
        Ok(Some(identity)) => Ok(identity),
        Ok(None) => Err((StatusCode::UNAUTHORIZED, "Invalid session token").into_response()),
        Err(e) => Err(internal_error(e)),
    }
}

fn validation_error(details: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": "invalid_request",
            "details": details.into(),
        })),
    )
        .into_response()
}

fn internal_error(e: Error) -> Response {
    error!("request failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
}

/// Pre-stream pipeline failures map onto HTTP statuses. Unexpected errors
/// are 500, not the original surface's 404 catch-all.
fn pipeline_error(e: Error) -> Response {
    match e {
        Error::InvalidRequest(details) => validation_error(details),
        Error::Auth(message) => (StatusCode::UNAUTHORIZED, message).into_response(),
        Error::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")).into_response(),
        other => internal_error(other),
    }
}

// ----------------------------------------------------------------------
// POST /chat

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    id: String,
    messages: Vec<WireMessage>,
    selected_chat_model: String,
    supports_tools: bool,
    #[serde(default)]
    selected_tools: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Option<String>,
    role: String,
    content: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

async fn post_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Response {
    // Schema problems answer 400 even when the session is also bad.
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return validation_error(rejection.body_text()),
    };

    if body.id.trim().is_empty() {
        return validation_error("id must not be empty");
    }

    let mut messages = Vec::with_capacity(body.messages.len());
    for wire in body.messages {
        let Some(role) = MessageRole::parse(&wire.role) else {
            return validation_error(format!("unknown message role '{}'", wire.role));
        };
        messages.push(IncomingMessage {
            id: wire.id,
            role,
            text: wire.content,
            attachments: wire.attachments,
        });
    }

    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let request = ChatRequest {
        conversation_id: body.id,
        messages,
        selected_model: body.selected_chat_model,
        supports_tools: body.supports_tools,
        selected_tools: body.selected_tools,
    };

    let prepared = match state.pipeline.prepare(request, &identity).await {
        Ok(prepared) => prepared,
        Err(e) => return pipeline_error(e),
    };

    // From here the response is committed: the turn runs to completion in
    // its own task and every outcome arrives as a stream event.
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let outcome = prepared.stream(EventSink::new(tx)).await;
        if outcome.cancelled {
            debug!(
                "chat turn for conversation {} cancelled by client",
                outcome.conversation_id
            );
        }
    });

    let lines = ReceiverStream::new(rx).map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Ok::<_, Infallible>(Bytes::from(line))
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

// ----------------------------------------------------------------------
// DELETE /chat

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    id: Option<String>,
}

async fn delete_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DeleteQuery>,
) -> Response {
    let Some(id) = query.id.filter(|v| !v.trim().is_empty()) else {
        return (StatusCode::NOT_FOUND, "Chat id is required").into_response();
    };

    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match state.store.get_conversation(&id) {
        Ok(Some(conversation)) if conversation.owner_id != identity.user_id => {
            (StatusCode::UNAUTHORIZED, "Chat belongs to another user").into_response()
        }
        Ok(Some(_)) => match state.store.delete_conversation(&id) {
            Ok(_) => (StatusCode::OK, "Chat deleted").into_response(),
            Err(e) => internal_error(e),
        },
        Ok(None) => (StatusCode::NOT_FOUND, "Chat not found").into_response(),
        Err(e) => internal_error(e),
    }
}

// ----------------------------------------------------------------------
// GET /vote + PATCH /vote

#[derive(Debug, Deserialize)]
struct VoteQuery {
    #[serde(rename = "chatId")]
    chat_id: Option<String>,
}

async fn get_votes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<VoteQuery>,
) -> Response {
    let Some(chat_id) = query.chat_id.filter(|v| !v.trim().is_empty()) else {
        return validation_error("chatId is required");
    };

    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match state.store.get_conversation(&chat_id) {
        Ok(Some(conversation)) if conversation.owner_id != identity.user_id => {
            (StatusCode::UNAUTHORIZED, "Chat belongs to another user").into_response()
        }
        Ok(Some(_)) => match state.store.list_votes(&chat_id) {
            Ok(votes) => {
                let body: Vec<_> = votes
                    .iter()
                    .map(|v| {
                        serde_json::json!({
                            "chatId": v.conversation_id,
                            "messageId": v.message_id,
                            "isUpvoted": v.kind == VoteKind::Up,
                        })
                    })
                    .collect();
                Json(body).into_response()
            }
            Err(e) => internal_error(e),
        },
        Ok(None) => (StatusCode::NOT_FOUND, "Chat not found").into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteBody {
    chat_id: String,
    message_id: String,
    #[serde(rename = "type")]
    kind: String,
}

async fn patch_vote(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<VoteBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return validation_error(rejection.body_text()),
    };

    if body.chat_id.trim().is_empty() || body.message_id.trim().is_empty() {
        return validation_error("chatId and messageId are required");
    }
    let Some(kind) = VoteKind::parse(&body.kind) else {
        return validation_error(format!("vote type must be 'up' or 'down', got '{}'", body.kind));
    };

    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match state.store.get_conversation(&body.chat_id) {
        Ok(Some(conversation)) if conversation.owner_id != identity.user_id => {
            return (StatusCode::UNAUTHORIZED, "Chat belongs to another user").into_response();
        }
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, "Chat not found").into_response(),
        Err(e) => return internal_error(e),
    }

    match state.store.get_message(&body.message_id) {
        Ok(Some(message)) if message.conversation_id == body.chat_id => {}
        Ok(_) => return (StatusCode::NOT_FOUND, "Message not found").into_response(),
        Err(e) => return internal_error(e),
    }

    let vote = Vote {
        conversation_id: body.chat_id,
        message_id: body.message_id,
        kind,
    };
    match state.store.upsert_vote(&vote) {
        Ok(()) => (StatusCode::OK, "Message voted").into_response(),
        Err(e) => internal_error(e),
    }
}
