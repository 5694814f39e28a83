#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;

use agentation::bus::EventBus;
use agentation::config::{
    Config, EventConfig, LogFormat, LoggingConfig, ServerConfig, StoreBacking, StoreConfig,
    WebhookConfig,
};
use agentation::http::{self, AppState};
use agentation::store::{MemoryStore, Store};

/// A broker running on an ephemeral loopback port.
pub struct Broker {
    pub base_url: String,
    pub state: AppState,
}

fn test_config(api_key: Option<String>) -> Config {
    Config {
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
        api_key,
    }
}

/// Spawn a broker over a fresh in-memory store on an ephemeral port.
pub async fn spawn_broker(api_key: Option<String>) -> Broker {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let bus = EventBus::new(store.clone()).await.unwrap();
    let state = AppState::new(store, bus, Arc::new(test_config(api_key)));

    let app = http::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Broker {
        base_url: format!("http://{}", addr),
        state,
    }
}

/// One parsed SSE frame.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: String,
    pub id: u64,
    pub data: Value,
}

/// Read `count` event frames from an open SSE response, ignoring comment
/// lines. Panics after ten seconds without enough frames.
pub async fn read_sse_frames(response: reqwest::Response, count: usize) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut buffer = String::new();
    let mut stream = response.bytes_stream();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while frames.len() < count {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("timed out waiting for SSE frames")
            .expect("SSE stream ended early")
            .expect("SSE stream errored");
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(boundary) = buffer.find("\n\n") {
            let raw = buffer[..boundary].to_string();
            buffer.drain(..boundary + 2);
            if let Some(frame) = parse_frame(&raw) {
                frames.push(frame);
            }
        }
    }

    frames
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut id = None;
    let mut data = None;

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            id = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data = serde_json::from_str(rest.trim()).ok();
        }
    }

    Some(SseFrame {
        event: event?,
        id: id?,
        data: data?,
    })
}
