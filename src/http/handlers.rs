use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ApiError, AppState};
use crate::store::{
    Annotation, AnnotationPatch, EventType, NewAnnotation, Role, SessionStatus,
};

/// Parse a JSON request body, mapping failures to 400 responses.
fn parse_json<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::validation("request body is required"));
    }
    serde_json::from_slice(bytes).map_err(|e| ApiError::validation(e.to_string()))
}

fn to_payload<T: Serialize>(entity: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(entity).map_err(ApiError::internal)
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.store.list_sessions().await?;
    Ok(Json(sessions))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    url: Option<String>,
    project_id: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: CreateSessionBody = parse_json(&body)?;
    let url = body
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::validation("url is required"))?;

    let session = state.store.create_session(&url, body.project_id).await?;
    state
        .bus
        .publish(EventType::SessionCreated, &session.id, to_payload(&session)?)
        .await?;

    debug!(session_id = %session.id, url = %session.url, "Session created");
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .store
        .get_session_detail(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("session", &id))?;
    Ok(Json(detail))
}

#[derive(Debug, Deserialize)]
struct UpdateSessionBody {
    status: Option<SessionStatus>,
}

pub async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: UpdateSessionBody = parse_json(&body)?;
    let status = body
        .status
        .ok_or_else(|| ApiError::validation("status is required"))?;

    let session = state
        .store
        .update_session_status(&id, status)
        .await?
        .ok_or_else(|| ApiError::not_found("session", &id))?;

    let event_type = match status {
        SessionStatus::Closed => EventType::SessionClosed,
        SessionStatus::Active => EventType::SessionUpdated,
    };
    state
        .bus
        .publish(event_type, &session.id, to_payload(&session)?)
        .await?;

    Ok(Json(session))
}

pub async fn create_annotation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let new: NewAnnotation = parse_json(&body)?;
    for (value, field) in [
        (&new.comment, "comment"),
        (&new.element, "element"),
        (&new.element_path, "elementPath"),
    ] {
        if value.trim().is_empty() {
            return Err(ApiError::validation(format!("{} is required", field)));
        }
    }

    let annotation = state
        .store
        .add_annotation(&session_id, new)
        .await?
        .ok_or_else(|| ApiError::not_found("session", &session_id))?;

    state
        .bus
        .publish(
            EventType::AnnotationCreated,
            &annotation.session_id,
            to_payload(&annotation)?,
        )
        .await?;

    debug!(annotation_id = %annotation.id, session_id = %session_id, "Annotation created");
    Ok((StatusCode::CREATED, Json(annotation)))
}

/// Shape of `/pending` style responses.
#[derive(Debug, Serialize)]
struct PendingResponse {
    count: usize,
    annotations: Vec<Annotation>,
}

pub async fn session_pending(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let annotations = state.store.pending_annotations(Some(&id)).await?;
    Ok(Json(PendingResponse {
        count: annotations.len(),
        annotations,
    }))
}

pub async fn all_pending(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let annotations = state.store.pending_annotations(None).await?;
    Ok(Json(PendingResponse {
        count: annotations.len(),
        annotations,
    }))
}

pub async fn get_annotation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let annotation = state
        .store
        .get_annotation(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("annotation", &id))?;
    Ok(Json(annotation))
}

pub async fn patch_annotation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let patch: AnnotationPatch = parse_json(&body)?;

    let annotation = state
        .store
        .update_annotation(&id, patch)
        .await?
        .ok_or_else(|| ApiError::not_found("annotation", &id))?;

    state
        .bus
        .publish(
            EventType::AnnotationUpdated,
            &annotation.session_id,
            to_payload(&annotation)?,
        )
        .await?;

    Ok(Json(annotation))
}

pub async fn delete_annotation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .store
        .delete_annotation(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("annotation", &id))?;

    state
        .bus
        .publish(
            EventType::AnnotationDeleted,
            &snapshot.session_id,
            to_payload(&snapshot)?,
        )
        .await?;

    debug!(annotation_id = %id, "Annotation deleted");
    Ok(Json(serde_json::json!({
        "deleted": true,
        "annotationId": id,
    })))
}

#[derive(Debug, Deserialize)]
struct ThreadBody {
    role: Option<Role>,
    content: Option<String>,
}

pub async fn add_thread_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: ThreadBody = parse_json(&body)?;
    let role = body
        .role
        .ok_or_else(|| ApiError::validation("role is required"))?;
    let content = body
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::validation("content is required"))?;

    let annotation = state
        .store
        .add_thread_message(&id, role, &content)
        .await?
        .ok_or_else(|| ApiError::not_found("annotation", &id))?;

    state
        .bus
        .publish(
            EventType::ThreadMessage,
            &annotation.session_id,
            to_payload(&annotation)?,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(annotation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::Config;
    use crate::store::{MemoryStore, Store};
    use axum::response::Response;
    use std::sync::Arc;

    async fn test_state() -> AppState {
        use crate::config::{
            EventConfig, LogFormat, LoggingConfig, ServerConfig, StoreBacking, StoreConfig,
            WebhookConfig,
        };

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store.clone()).await.unwrap();
        let config = Arc::new(Config {
            server: ServerConfig {
                port: 0,
                base_url: None,
            },
            store: StoreConfig {
                backing: StoreBacking::Memory,
                path: std::env::temp_dir().join("agentation-test.db"),
                max_connections: 1,
            },
            events: EventConfig {
                retention_days: 7,
                sweep_interval_secs: 3600,
            },
            webhooks: WebhookConfig {
                urls: Vec::new(),
                timeout_ms: 5000,
                max_retries: 3,
                retry_delay_ms: 1000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            api_key: None,
        });
        AppState::new(store, bus, config)
    }

    fn expect_error<T>(result: Result<T, ApiError>) -> ApiError {
        match result {
            Err(err) => err,
            Ok(_) => panic!("expected an error response"),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn bytes(value: serde_json::Value) -> Bytes {
        Bytes::from(serde_json::to_vec(&value).unwrap())
    }

    #[tokio::test]
    async fn test_create_session_requires_url() {
        let state = test_state().await;
        let response = expect_error(create_session(State(state), bytes(serde_json::json!({}))).await)
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "url is required");
    }

    #[tokio::test]
    async fn test_create_and_list_sessions() {
        let state = test_state().await;
        let response = create_session(
            State(state.clone()),
            bytes(serde_json::json!({"url": "http://localhost:3000/x"})),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["status"], "active");
        assert!(created["id"].is_string());

        let response = list_sessions(State(state)).await.unwrap().into_response();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["url"], "http://localhost:3000/x");
    }

    #[tokio::test]
    async fn test_annotation_lifecycle_events_are_published() {
        let state = test_state().await;
        let session = state
            .store
            .create_session("http://localhost:3000", None)
            .await
            .unwrap();

        let mut sub = state.bus.subscribe_session(&session.id);

        let response = create_annotation(
            State(state.clone()),
            Path(session.id.clone()),
            bytes(serde_json::json!({
                "comment": "fix me",
                "element": "button",
                "elementPath": "body>button"
            })),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let annotation = body_json(response).await;
        assert_eq!(annotation["status"], "pending");

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::AnnotationCreated);
        assert_eq!(event.payload["comment"], "fix me");
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let state = test_state().await;
        let session = state
            .store
            .create_session("http://localhost:3000", None)
            .await
            .unwrap();
        let annotation = state
            .store
            .add_annotation(
                &session.id,
                serde_json::from_value(serde_json::json!({
                    "comment": "fix me",
                    "element": "button",
                    "elementPath": "body>button"
                }))
                .unwrap(),
            )
            .await
            .unwrap()
            .unwrap();

        let response = expect_error(
            patch_annotation(
                State(state),
                Path(annotation.id),
                bytes(serde_json::json!({"status": "resolved"})),
            )
            .await,
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_at_transport_level() {
        let state = test_state().await;
        let session = state
            .store
            .create_session("http://localhost:3000", None)
            .await
            .unwrap();
        let annotation = state
            .store
            .add_annotation(
                &session.id,
                serde_json::from_value(serde_json::json!({
                    "comment": "x",
                    "element": "p",
                    "elementPath": "body>p"
                }))
                .unwrap(),
            )
            .await
            .unwrap()
            .unwrap();

        let response = delete_annotation(State(state.clone()), Path(annotation.id.clone()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["deleted"], true);
        assert_eq!(body["annotationId"], annotation.id.as_str());

        let response = expect_error(delete_annotation(State(state), Path(annotation.id)).await)
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pending_empty_session_shape() {
        let state = test_state().await;
        let session = state
            .store
            .create_session("http://localhost:3000", None)
            .await
            .unwrap();

        let response = session_pending(State(state), Path(session.id))
            .await
            .unwrap()
            .into_response();
        let body = body_json(response).await;
        assert_eq!(body["count"], 0);
        assert_eq!(body["annotations"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_thread_requires_role_and_content() {
        let state = test_state().await;
        let response = expect_error(
            add_thread_message(
                State(state),
                Path("a-1".to_string()),
                bytes(serde_json::json!({"content": "hello"})),
            )
            .await,
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_close_session_emits_session_closed() {
        let state = test_state().await;
        let session = state
            .store
            .create_session("http://localhost:3000", None)
            .await
            .unwrap();
        let mut sub = state.bus.subscribe_session(&session.id);

        let response = update_session(
            State(state),
            Path(session.id.clone()),
            bytes(serde_json::json!({"status": "closed"})),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::SessionClosed);
        assert_eq!(event.payload["status"], "closed");
    }
}
