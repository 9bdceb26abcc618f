#![forbid(unsafe_code)]

// HTTP API — authentication, cleanup endpoints, health and metrics.

use crate::cleaner::Cleaner;
use crate::config::Config;
use crate::ids::RoomId;
use crate::metrics::ServiceMetrics;
use crate::queue::Queues;
use crate::rules::{BridgeBot, Caller};
use crate::synapse::CallerClient;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub cleaner: Cleaner,
    pub queues: Queues,
    pub metrics: ServiceMetrics,
    pub cancel: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/_matrix/client/unstable/sh.sweepserv/clean_all",
            post(clean_all_handler),
        )
        .route(
            "/_matrix/client/unstable/sh.sweepserv/queue",
            post(queue_handler),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Request failures rendered as Matrix-style error bodies.
#[derive(Debug)]
pub enum RequestError {
    MissingToken,
    UnknownToken,
    NotJson,
    BadJson(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let (status, errcode, message) = match self {
            Self::MissingToken => (
                StatusCode::UNAUTHORIZED,
                "M_MISSING_TOKEN",
                "Missing access token".to_string(),
            ),
            Self::UnknownToken => (
                StatusCode::UNAUTHORIZED,
                "M_UNKNOWN_TOKEN",
                "Invalid access token".to_string(),
            ),
            Self::NotJson => (
                StatusCode::BAD_REQUEST,
                "M_NOT_JSON",
                "Request body is not JSON".to_string(),
            ),
            Self::BadJson(message) => (StatusCode::BAD_REQUEST, "M_BAD_JSON", message),
            Self::Forbidden(message) => (StatusCode::FORBIDDEN, "M_FORBIDDEN", message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN", message),
        };
        (
            status,
            Json(serde_json::json!({ "errcode": errcode, "error": message })),
        )
            .into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, RequestError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
        .ok_or(RequestError::MissingToken)
}

/// Resolve the caller's token to an identity and run the caller rule on it.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Caller, RequestError> {
    let token = bearer_token(headers)?;
    let client = CallerClient::new(
        state.http.clone(),
        &state.config.synapse_url,
        token.to_string(),
    )
    .map_err(|e| RequestError::Internal(e.to_string()))?;
    let user_id = client.whoami().await.map_err(|e| {
        if e.is_unknown_token() {
            RequestError::UnknownToken
        } else {
            warn!("Failed to resolve access token: {}", e);
            RequestError::Internal("Failed to verify access token".to_string())
        }
    })?;
    let bot = BridgeBot::parse(&user_id).map_err(|e| {
        debug!("Rejecting request from {}: {}", user_id, e);
        RequestError::Forbidden(e.to_string())
    })?;
    Ok(Caller { client, bot })
}

fn client_ip(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    if state.config.trust_forward_headers {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
        {
            return forwarded.trim().to_string();
        }
    }
    addr.to_string()
}

/// Clean every room the calling bridge owns. The response tally counts
/// queued/skipped/failed rooms; deletion itself happens asynchronously.
async fn clean_all_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(e) => return e.into_response(),
    };
    info!(
        "Received clean_all request from {} ({})",
        caller.bot.user_id,
        client_ip(&state, &headers, addr)
    );
    state.metrics.inc_cleanups_requested();
    match state.cleaner.clean_all(&caller, &state.cancel).await {
        Ok(outcome) => {
            let status = if outcome.error.is_some() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            (status, Json(outcome.tally)).into_response()
        }
        Err(e) => {
            warn!("Failed to clean rooms of {}: {}", caller.bot.user_id, e);
            RequestError::Internal("Failed to list rooms".to_string()).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueueRequest {
    #[serde(default)]
    room_ids: Vec<RoomId>,
}

/// Queue an explicit list of rooms for cleanup. Rooms are admitted
/// independently; the response reports each room's fate.
async fn queue_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<QueueRequest>, JsonRejection>,
) -> Response {
    let caller = match authenticate(&state, &headers).await {
        Ok(caller) => caller,
        Err(e) => return e.into_response(),
    };
    let Json(request) = match body {
        Ok(body) => body,
        Err(JsonRejection::MissingJsonContentType(_)) => {
            return RequestError::NotJson.into_response()
        }
        Err(e) => return RequestError::BadJson(e.body_text()).into_response(),
    };
    info!(
        "Received request to queue {} rooms from {} ({})",
        request.room_ids.len(),
        caller.bot.user_id,
        client_ip(&state, &headers, addr)
    );
    let requested = request.room_ids.len();
    let report = state.cleaner.queue_rooms(&caller, request.room_ids).await;
    let status = if !report.queued.is_empty() || requested == 0 {
        StatusCode::ACCEPTED
    } else if report.failed.is_empty() {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(report)).into_response()
}

/// Health check handler — returns current queue depths.
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let depths = state.queues.depths().await;
    Json(serde_json::json!({
        "status": "ok",
        "leave_queue": depths.leave,
        "delete_queue": depths.delete,
        "error_queue": depths.error,
    }))
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    // Check bearer token if METRICS_TOKEN is configured
    if let Ok(expected) = std::env::var("METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {}", expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    let body = state.metrics.render_prometheus();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            bearer_token(&headers),
            Err(RequestError::MissingToken)
        ));
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "secret");
        headers.insert(header::AUTHORIZATION, "Basic secret".parse().unwrap());
        assert!(matches!(
            bearer_token(&headers),
            Err(RequestError::MissingToken)
        ));
        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(matches!(
            bearer_token(&headers),
            Err(RequestError::MissingToken)
        ));
    }

    #[test]
    fn test_request_error_bodies() {
        let resp = RequestError::UnknownToken.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = RequestError::Forbidden("nope".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
