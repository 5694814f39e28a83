use serde::Serialize;
use serde_json::Value;

/// Tool definition
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// The fixed tool catalog the dispatcher exposes.
pub fn catalog() -> Vec<Tool> {
    vec![
        list_sessions_tool(),
        get_session_tool(),
        get_pending_tool(),
        get_all_pending_tool(),
        acknowledge_tool(),
        resolve_tool(),
        dismiss_tool(),
        reply_tool(),
        watch_annotations_tool(),
    ]
}

fn list_sessions_tool() -> Tool {
    Tool {
        name: "list_sessions".to_string(),
        description: "List all annotation sessions with their id, url, status, and creation time.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }),
    }
}

fn get_session_tool() -> Tool {
    Tool {
        name: "get_session".to_string(),
        description: "Get one session in detail, annotations included.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "sessionId": {
                    "type": "string",
                    "description": "The session ID"
                }
            },
            "required": ["sessionId"],
            "additionalProperties": false
        }),
    }
}

fn get_pending_tool() -> Tool {
    Tool {
        name: "get_pending".to_string(),
        description: "Get pending annotations for a session.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "sessionId": {
                    "type": "string",
                    "description": "The session ID"
                }
            },
            "required": ["sessionId"],
            "additionalProperties": false
        }),
    }
}

fn get_all_pending_tool() -> Tool {
    Tool {
        name: "get_all_pending".to_string(),
        description: "Get pending annotations across all sessions.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }),
    }
}

fn acknowledge_tool() -> Tool {
    Tool {
        name: "acknowledge".to_string(),
        description: "Mark a pending annotation as acknowledged, signalling work has started.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "annotationId": {
                    "type": "string",
                    "description": "The annotation ID"
                }
            },
            "required": ["annotationId"],
            "additionalProperties": false
        }),
    }
}

fn resolve_tool() -> Tool {
    Tool {
        name: "resolve".to_string(),
        description: "Mark an annotation as resolved by the agent. An optional summary is appended to the thread as \"Resolved: <summary>\".".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "annotationId": {
                    "type": "string",
                    "description": "The annotation ID"
                },
                "summary": {
                    "type": "string",
                    "description": "Optional summary of what was done"
                }
            },
            "required": ["annotationId"],
            "additionalProperties": false
        }),
    }
}

fn dismiss_tool() -> Tool {
    Tool {
        name: "dismiss".to_string(),
        description: "Dismiss an annotation with a reason. The reason is appended to the thread as \"Dismissed: <reason>\".".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "annotationId": {
                    "type": "string",
                    "description": "The annotation ID"
                },
                "reason": {
                    "type": "string",
                    "description": "Why the annotation will not be acted on"
                }
            },
            "required": ["annotationId", "reason"],
            "additionalProperties": false
        }),
    }
}

fn reply_tool() -> Tool {
    Tool {
        name: "reply".to_string(),
        description: "Append an agent reply to an annotation's thread.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "annotationId": {
                    "type": "string",
                    "description": "The annotation ID"
                },
                "message": {
                    "type": "string",
                    "description": "The reply content"
                }
            },
            "required": ["annotationId", "message"],
            "additionalProperties": false
        }),
    }
}

fn watch_annotations_tool() -> Tool {
    Tool {
        name: "watch_annotations".to_string(),
        description: "Block until new pending annotations appear in any session, then return the batch. Returns an empty batch on timeout.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "timeout": {
                    "type": "number",
                    "minimum": 1,
                    "description": "Seconds to wait before giving up (default: 60)"
                }
            },
            "additionalProperties": false
        }),
    }
}
