use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::info;

use super::ApiClient;
use crate::error::{AcpError, AcpResult};
use crate::store::AnnotationStatus;

/// How often `watch_annotations` polls the pending endpoint.
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default `watch_annotations` timeout in seconds.
const WATCH_DEFAULT_TIMEOUT_SECS: f64 = 60.0;

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    client: &ApiClient,
    tool_name: &str,
    arguments: Option<Value>,
) -> AcpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        "list_sessions" => client.list_sessions().await.map_err(Into::into),
        "get_session" => handle_get_session(client, arguments).await,
        "get_pending" => handle_get_pending(client, arguments).await,
        "get_all_pending" => client.pending(None).await.map_err(Into::into),
        "acknowledge" => handle_acknowledge(client, arguments).await,
        "resolve" => handle_resolve(client, arguments).await,
        "dismiss" => handle_dismiss(client, arguments).await,
        "reply" => handle_reply(client, arguments).await,
        "watch_annotations" => handle_watch(client, arguments).await,
        _ => Err(AcpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(
    tool_name: &str,
    arguments: Option<Value>,
) -> AcpResult<T> {
    let arguments = arguments.unwrap_or(Value::Object(Default::default()));
    serde_json::from_value(arguments).map_err(|e| AcpError::InvalidParameters {
        tool_name: tool_name.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotationParams {
    annotation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveParams {
    annotation_id: String,
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DismissParams {
    annotation_id: String,
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyParams {
    annotation_id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WatchParams {
    timeout: Option<f64>,
}

async fn handle_get_session(client: &ApiClient, arguments: Option<Value>) -> AcpResult<Value> {
    let params: SessionParams = parse_params("get_session", arguments)?;
    client.get_session(&params.session_id).await.map_err(Into::into)
}

async fn handle_get_pending(client: &ApiClient, arguments: Option<Value>) -> AcpResult<Value> {
    let params: SessionParams = parse_params("get_pending", arguments)?;
    client
        .pending(Some(&params.session_id))
        .await
        .map_err(Into::into)
}

async fn handle_acknowledge(client: &ApiClient, arguments: Option<Value>) -> AcpResult<Value> {
    let params: AnnotationParams = parse_params("acknowledge", arguments)?;
    client
        .patch_annotation(
            &params.annotation_id,
            serde_json::json!({ "status": "acknowledged" }),
        )
        .await
        .map_err(Into::into)
}

async fn handle_resolve(client: &ApiClient, arguments: Option<Value>) -> AcpResult<Value> {
    let params: ResolveParams = parse_params("resolve", arguments)?;

    let mut annotation = transition(client, &params.annotation_id, AnnotationStatus::Resolved).await?;

    if let Some(summary) = params.summary.filter(|s| !s.trim().is_empty()) {
        annotation = client
            .post_thread(
                &params.annotation_id,
                "agent",
                &format!("Resolved: {}", summary),
            )
            .await?;
    }

    Ok(annotation)
}

async fn handle_dismiss(client: &ApiClient, arguments: Option<Value>) -> AcpResult<Value> {
    let params: DismissParams = parse_params("dismiss", arguments)?;
    if params.reason.trim().is_empty() {
        return Err(AcpError::InvalidParameters {
            tool_name: "dismiss".to_string(),
            message: "reason must not be empty".to_string(),
        });
    }

    transition(client, &params.annotation_id, AnnotationStatus::Dismissed).await?;

    let annotation = client
        .post_thread(
            &params.annotation_id,
            "agent",
            &format!("Dismissed: {}", params.reason),
        )
        .await?;

    Ok(annotation)
}

async fn handle_reply(client: &ApiClient, arguments: Option<Value>) -> AcpResult<Value> {
    let params: ReplyParams = parse_params("reply", arguments)?;
    client
        .post_thread(&params.annotation_id, "agent", &params.message)
        .await
        .map_err(Into::into)
}

async fn handle_watch(client: &ApiClient, arguments: Option<Value>) -> AcpResult<Value> {
    let params: WatchParams = parse_params("watch_annotations", arguments)?;
    let timeout_secs = params
        .timeout
        .filter(|t| t.is_finite() && *t > 0.0)
        .unwrap_or(WATCH_DEFAULT_TIMEOUT_SECS);
    let deadline = Instant::now() + Duration::from_secs_f64(timeout_secs);

    loop {
        let batch = client.pending(None).await?;
        let count = batch.get("count").and_then(|c| c.as_u64()).unwrap_or(0);
        if count > 0 || Instant::now() + WATCH_POLL_INTERVAL > deadline {
            return Ok(batch);
        }
        tokio::time::sleep(WATCH_POLL_INTERVAL).await;
    }
}

/// Drive an annotation to the target status along the shortest legal path
/// through the transition lattice, stamping the agent as resolver on the
/// final step.
async fn transition(
    client: &ApiClient,
    annotation_id: &str,
    target: AnnotationStatus,
) -> AcpResult<Value> {
    let current = client.get_annotation(annotation_id).await?;
    let status: AnnotationStatus = current
        .get("status")
        .and_then(|s| s.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AcpError::ExecutionFailed {
            message: format!("annotation {} has no readable status", annotation_id),
        })?;

    let steps = lattice_path(status, target);
    let mut annotation = current;
    for (index, step) in steps.iter().enumerate() {
        let body = if index + 1 == steps.len() {
            serde_json::json!({ "status": step, "resolvedBy": "agent" })
        } else {
            serde_json::json!({ "status": step })
        };
        annotation = client.patch_annotation(annotation_id, body).await?;
    }

    Ok(annotation)
}

/// The statuses to pass through (current excluded, target included) to
/// legally reach `target` from `from`.
fn lattice_path(from: AnnotationStatus, to: AnnotationStatus) -> Vec<AnnotationStatus> {
    use AnnotationStatus::*;
    match (from, to) {
        (Pending, Resolved) => vec![Acknowledged, Resolved],
        (Acknowledged, Resolved) | (Resolved, Resolved) => vec![Resolved],
        (Dismissed, Resolved) => vec![Pending, Acknowledged, Resolved],
        (Resolved, Dismissed) => vec![Pending, Dismissed],
        (_, Dismissed) => vec![Dismissed],
        (Pending, Acknowledged) | (Acknowledged, Acknowledged) => vec![Acknowledged],
        (_, target) => vec![target],
    }
}
