//! Axum route handlers for the push endpoint and the status RPC.

use crate::auth::PushAuthenticator;
use crate::push;
use crate::relay::{PushOutcome, Relay};
use crate::store::WatchStore;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use gmail_relay_types::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::timeout::TimeoutLayer;

pub struct AppState {
    pub relay: Relay,
    pub authenticator: PushAuthenticator,
    pub store: Arc<WatchStore>,
    pub max_body_bytes: usize,
    pub start_time: Instant,
}

/// JSON body of every non-echo push response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReply {
    pub ok: bool,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushReply {
    fn failed(outcome: &str, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            outcome: outcome.to_string(),
            history_id: None,
            messages: None,
            delivery: None,
            error: Some(error.into()),
        }
    }
}

pub fn build_router(state: Arc<AppState>, push_path: &str, request_timeout: Duration) -> Router {
    Router::new()
        .route(push_path, post(push))
        .route("/rpc/status", get(status))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
}

// POST <push path>
pub async fn push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    body: Body,
) -> Response {
    if let Err(e) = state.authenticator.authorize(&headers, &uri).await {
        log::warn!("[GMAIL_RELAY] Rejected push: {}", e);
        return (
            StatusCode::UNAUTHORIZED,
            Json(PushReply::failed("unauthorized", e.to_string())),
        )
            .into_response();
    }

    let decoded = match push::read_body(body, state.max_body_bytes).await {
        Ok(bytes) => push::decode_push(&bytes),
        Err(e) => Err(e),
    };
    let (payload, message_id) = match decoded {
        Ok(decoded) => decoded,
        Err(e) => {
            log::warn!("[GMAIL_RELAY] Malformed push: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(PushReply::failed("malformed", e.to_string())),
            )
                .into_response();
        }
    };

    log::debug!(
        "[GMAIL_RELAY] Push for {} historyId {} (messageId {})",
        payload.email_address,
        payload.history_id,
        message_id.as_deref().unwrap_or("-")
    );

    match state.relay.handle_push(&payload).await {
        Ok(PushOutcome::Echo(hook_payload)) => (StatusCode::OK, Json(hook_payload)).into_response(),
        Ok(outcome) => {
            let code = outcome.status_code();
            let mut reply = PushReply {
                ok: code.is_success(),
                outcome: outcome.label().to_string(),
                history_id: Some(payload.history_id.clone()),
                messages: None,
                delivery: None,
                error: None,
            };
            match outcome {
                PushOutcome::Delivered { messages, outcome, .. } => {
                    reply.messages = Some(messages);
                    reply.delivery = Some(outcome.status);
                    reply.error = outcome.note;
                }
                PushOutcome::HookRejected { outcome } => {
                    reply.delivery = Some(outcome.status);
                    reply.error = outcome.note;
                }
                _ => {}
            }
            (code, Json(reply)).into_response()
        }
        Err(e) => {
            log::error!(
                "[GMAIL_RELAY] Failed to process historyId {}: {}",
                payload.history_id,
                e
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PushReply::failed("error", e.to_string())),
            )
                .into_response()
        }
    }
}

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> (StatusCode, Json<RpcResponse<WatchStatus>>) {
    if let Err(e) = state.authenticator.authorize(&headers, &uri).await {
        return (StatusCode::UNAUTHORIZED, Json(RpcResponse::err(e.to_string())));
    }

    match state.store.get() {
        Some(watch) => {
            let mut status = WatchStatus::from_state(&watch, chrono::Utc::now().timestamp_millis());
            status.uptime_secs = Some(state.start_time.elapsed().as_secs());
            (StatusCode::OK, Json(RpcResponse::ok(status)))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err(format!(
                "No watch state for {}",
                state.store.account()
            ))),
        ),
    }
}
