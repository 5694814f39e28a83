//! Tool dispatch tests against a live broker surface.

mod common;

use agentation::acp::{handle_tool_call, ApiClient};
use agentation::error::AcpError;
use common::spawn_broker;
use serde_json::{json, Value};

async fn seeded_annotation(base_url: &str) -> (String, String) {
    let client = reqwest::Client::new();
    let session: Value = client
        .post(format!("{}/sessions", base_url))
        .json(&json!({"url": "http://localhost:3000/x"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = session["id"].as_str().unwrap().to_string();

    let annotation: Value = client
        .post(format!("{}/sessions/{}/annotations", base_url, session_id))
        .json(&json!({"comment": "fix me", "element": "button", "elementPath": "body>button"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    (session_id, annotation["id"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn test_list_sessions_and_get_session() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();
    let (session_id, _annotation_id) = seeded_annotation(&broker.base_url).await;

    let sessions = handle_tool_call(&api, "list_sessions", None).await.unwrap();
    assert_eq!(sessions.as_array().unwrap().len(), 1);
    assert_eq!(sessions[0]["id"], session_id.as_str());

    let detail = handle_tool_call(
        &api,
        "get_session",
        Some(json!({"sessionId": session_id})),
    )
    .await
    .unwrap();
    assert_eq!(detail["annotations"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_tool_and_missing_params() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();

    let err = handle_tool_call(&api, "make_coffee", None).await.unwrap_err();
    assert!(matches!(err, AcpError::UnknownTool { .. }));
    assert!(err.to_string().contains("make_coffee"));

    let err = handle_tool_call(&api, "get_session", None).await.unwrap_err();
    assert!(matches!(err, AcpError::InvalidParameters { .. }));
}

#[tokio::test]
async fn test_not_found_surfaces_readable_message() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();

    let err = handle_tool_call(
        &api,
        "acknowledge",
        Some(json!({"annotationId": "missing"})),
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "annotation not found: missing");
}

#[tokio::test]
async fn test_acknowledge_then_pending_counts() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();
    let (session_id, annotation_id) = seeded_annotation(&broker.base_url).await;

    let pending = handle_tool_call(
        &api,
        "get_pending",
        Some(json!({"sessionId": session_id})),
    )
    .await
    .unwrap();
    assert_eq!(pending["count"], 1);

    let acknowledged = handle_tool_call(
        &api,
        "acknowledge",
        Some(json!({"annotationId": annotation_id})),
    )
    .await
    .unwrap();
    assert_eq!(acknowledged["status"], "acknowledged");

    let pending = handle_tool_call(&api, "get_all_pending", None).await.unwrap();
    assert_eq!(pending["count"], 0);
}

#[tokio::test]
async fn test_resolve_with_summary_from_pending() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();
    let (_session_id, annotation_id) = seeded_annotation(&broker.base_url).await;

    // Pending -> resolved walks through acknowledged under the hood
    let resolved = handle_tool_call(
        &api,
        "resolve",
        Some(json!({"annotationId": annotation_id, "summary": "fixed padding"})),
    )
    .await
    .unwrap();
    assert_eq!(resolved["status"], "resolved");
    assert_eq!(resolved["resolvedBy"], "agent");

    let fetched: Value = reqwest::get(format!(
        "{}/annotations/{}",
        broker.base_url, annotation_id
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(fetched["status"], "resolved");
    let thread = fetched["thread"].as_array().unwrap();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0]["role"], "agent");
    assert!(thread[0]["content"]
        .as_str()
        .unwrap()
        .starts_with("Resolved: fixed padding"));
}

#[tokio::test]
async fn test_dismiss_from_resolved_walks_lattice() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();
    let (_session_id, annotation_id) = seeded_annotation(&broker.base_url).await;

    handle_tool_call(&api, "resolve", Some(json!({"annotationId": annotation_id})))
        .await
        .unwrap();

    let dismissed = handle_tool_call(
        &api,
        "dismiss",
        Some(json!({"annotationId": annotation_id, "reason": "stale design"})),
    )
    .await
    .unwrap();
    assert_eq!(dismissed["status"], "dismissed");
    assert_eq!(dismissed["resolvedBy"], "agent");

    let thread = dismissed["thread"].as_array().unwrap();
    assert!(thread
        .last()
        .unwrap()["content"]
        .as_str()
        .unwrap()
        .starts_with("Dismissed: stale design"));
}

#[tokio::test]
async fn test_dismiss_requires_reason() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();

    let err = handle_tool_call(&api, "dismiss", Some(json!({"annotationId": "a-1"})))
        .await
        .unwrap_err();
    assert!(matches!(err, AcpError::InvalidParameters { .. }));

    let err = handle_tool_call(
        &api,
        "dismiss",
        Some(json!({"annotationId": "a-1", "reason": "  "})),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AcpError::InvalidParameters { .. }));
}

#[tokio::test]
async fn test_reply_appends_agent_message() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();
    let (_session_id, annotation_id) = seeded_annotation(&broker.base_url).await;

    let annotation = handle_tool_call(
        &api,
        "reply",
        Some(json!({"annotationId": annotation_id, "message": "looking into it"})),
    )
    .await
    .unwrap();
    let thread = annotation["thread"].as_array().unwrap();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0]["role"], "agent");
    assert_eq!(thread[0]["content"], "looking into it");
}

#[tokio::test]
async fn test_watch_annotations_times_out_empty() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();

    let batch = handle_tool_call(&api, "watch_annotations", Some(json!({"timeout": 0.5})))
        .await
        .unwrap();
    assert_eq!(batch["count"], 0);
    assert_eq!(batch["annotations"], json!([]));
}

#[tokio::test]
async fn test_watch_annotations_returns_new_batch() {
    let broker = spawn_broker(None).await;
    let api = ApiClient::new(&broker.base_url, None).unwrap();

    let watcher = tokio::spawn({
        let api = api.clone();
        async move {
            handle_tool_call(&api, "watch_annotations", Some(json!({"timeout": 10})))
                .await
                .unwrap()
        }
    });

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    seeded_annotation(&broker.base_url).await;

    let batch = watcher.await.unwrap();
    assert_eq!(batch["count"], 1);
    assert_eq!(batch["annotations"][0]["comment"], "fix me");
}
