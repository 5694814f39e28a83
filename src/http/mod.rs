//! HTTP surface: REST routes, SSE streams, CORS, and bearer auth.

mod handlers;
mod sse;

pub use sse::origin_host;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::warn;

use crate::bus::EventBus;
use crate::config::Config;
use crate::error::StoreError;
use crate::store::Store;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub config: Arc<Config>,
}

impl AppState {
    /// Create new application state
    pub fn new(store: Arc<dyn Store>, bus: EventBus, config: Arc<Config>) -> Self {
        Self { store, bus, config }
    }
}

/// Build the broker router with CORS and optional bearer auth applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    // REST handlers get a soft deadline; the SSE streams are long-lived and
    // only end on disconnect or shutdown.
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/sessions/:id",
            get(handlers::get_session).patch(handlers::update_session),
        )
        .route("/sessions/:id/annotations", post(handlers::create_annotation))
        .route("/sessions/:id/pending", get(handlers::session_pending))
        .route(
            "/annotations/:id",
            get(handlers::get_annotation)
                .patch(handlers::patch_annotation)
                .delete(handlers::delete_annotation),
        )
        .route("/annotations/:id/thread", post(handlers::add_thread_message))
        .route("/pending", get(handlers::all_pending))
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    let streams = Router::new()
        .route("/sessions/:id/events", get(sse::session_events))
        .route("/events", get(sse::domain_events));

    api.merge(streams)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(cors)
        .layer(middleware::from_fn(preflight_status))
        .with_state(state)
}

/// CORS preflight responses go out as 204 No Content.
async fn preflight_status(request: Request, next: Next) -> Response {
    let is_preflight = request.method() == Method::OPTIONS
        && request
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);

    let mut response = next.run(request).await;
    if is_preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

/// Bearer credential check. Accepts the key as an `Authorization: Bearer`
/// header or an `api_key` query parameter; `/health` stays open for probes.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(request).await;
    };

    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let header_ok = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", expected))
        .unwrap_or(false);

    let query_ok = request
        .uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .any(|(key, value)| key == "api_key" && value == expected)
        })
        .unwrap_or(false);

    if header_ok || query_ok {
        next.run(request).await
    } else {
        ApiError::Unauthorized.into_response()
    }
}

/// Wire-level error for the HTTP surface.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed body, missing field, illegal transition, bad enum value.
    Validation(String),
    /// Referenced entity does not exist.
    NotFound { kind: &'static str, id: String },
    /// Missing or wrong bearer credential.
    Unauthorized,
    /// Everything the client cannot fix.
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ApiError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation { message } => ApiError::Validation(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound { kind, id } => {
                (StatusCode::NOT_FOUND, format!("{} not found: {}", kind, id))
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Internal(message) => {
                warn!(error = %message, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
