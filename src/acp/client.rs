use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// HTTP client for the broker surface the dispatcher targets.
///
/// The dispatcher holds no store state of its own; every tool call goes
/// through this client so the store stays the single source of truth.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    /// Create a client for the given base URL.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// The base URL this client targets.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> ClientResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "Calling broker surface");

        let mut builder = self.client.request(method, &url);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await.map_err(ClientError::Http)?;
        let status = response.status();

        if !status.is_success() {
            let message = error_reason(status, response.text().await.unwrap_or_default());
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            })
    }

    /// GET `/sessions`.
    pub async fn list_sessions(&self) -> ClientResult<Value> {
        self.request(Method::GET, "/sessions", None).await
    }

    /// GET `/sessions/:id`.
    pub async fn get_session(&self, session_id: &str) -> ClientResult<Value> {
        self.request(Method::GET, &format!("/sessions/{}", session_id), None)
            .await
    }

    /// GET `/sessions/:id/pending` or `/pending` across all sessions.
    pub async fn pending(&self, session_id: Option<&str>) -> ClientResult<Value> {
        let path = match session_id {
            Some(id) => format!("/sessions/{}/pending", id),
            None => "/pending".to_string(),
        };
        self.request(Method::GET, &path, None).await
    }

    /// GET `/annotations/:id`.
    pub async fn get_annotation(&self, annotation_id: &str) -> ClientResult<Value> {
        self.request(Method::GET, &format!("/annotations/{}", annotation_id), None)
            .await
    }

    /// PATCH `/annotations/:id`.
    pub async fn patch_annotation(
        &self,
        annotation_id: &str,
        patch: Value,
    ) -> ClientResult<Value> {
        self.request(
            Method::PATCH,
            &format!("/annotations/{}", annotation_id),
            Some(patch),
        )
        .await
    }

    /// POST `/annotations/:id/thread`.
    pub async fn post_thread(
        &self,
        annotation_id: &str,
        role: &str,
        content: &str,
    ) -> ClientResult<Value> {
        self.request(
            Method::POST,
            &format!("/annotations/{}/thread", annotation_id),
            Some(serde_json::json!({ "role": role, "content": content })),
        )
        .await
    }
}

/// Pull the `error` reason out of a failure body, falling back to the raw
/// text or the status line.
fn error_reason(status: StatusCode, body: String) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        if let Some(reason) = value.get("error").and_then(|e| e.as_str()) {
            return reason.to_string();
        }
    }
    if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    }
}
