use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Broker configuration loaded from environment variables.
///
/// Built once at startup by the supervisor (CLI flags override individual
/// fields there) and passed down by explicit dependency.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub events: EventConfig,
    pub webhooks: WebhookConfig,
    pub logging: LoggingConfig,
    /// Shared bearer credential. When set, every HTTP request must present
    /// it.
    pub api_key: Option<String>,
}

/// HTTP surface configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Base URL the ACP dispatcher targets. Defaults to the co-hosted
    /// loopback port when unset.
    pub base_url: Option<String>,
}

impl ServerConfig {
    /// The URL the ACP dispatcher should call.
    pub fn dispatch_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.port))
    }
}

/// Store backing selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBacking {
    /// Durable single-file SQLite store.
    Sqlite,
    /// Process-memory only.
    Memory,
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backing: StoreBacking,
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Event log retention configuration
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub retention_days: i64,
    pub sweep_interval_secs: u64,
}

/// Outbound webhook configuration
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub urls: Vec<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl WebhookConfig {
    /// Whether any webhook target is configured.
    pub fn enabled(&self) -> bool {
        !self.urls.is_empty()
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            port: 4747,
            base_url: None,
        };

        let backing = match env::var("AGENTATION_STORE")
            .unwrap_or_else(|_| "sqlite".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StoreBacking::Memory,
            "sqlite" => StoreBacking::Sqlite,
            other => {
                return Err(AppError::Config {
                    message: format!("AGENTATION_STORE must be sqlite or memory, got {}", other),
                })
            }
        };

        let store = StoreConfig {
            backing,
            path: env::var("AGENTATION_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_store_path()),
            max_connections: env::var("AGENTATION_STORE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        let events = EventConfig {
            retention_days: env::var("AGENTATION_EVENT_RETENTION_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(7),
            sweep_interval_secs: 3600,
        };

        let mut urls: Vec<String> = Vec::new();
        if let Ok(url) = env::var("AGENTATION_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                urls.push(url.trim().to_string());
            }
        }
        if let Ok(list) = env::var("AGENTATION_WEBHOOKS") {
            urls.extend(
                list.split(',')
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty()),
            );
        }
        urls.dedup();

        let webhooks = WebhookConfig {
            urls,
            timeout_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 1000,
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let api_key = env::var("AGENTATION_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        Ok(Config {
            server,
            store,
            events,
            webhooks,
            logging,
            api_key,
        })
    }
}

/// Default location of the durable store file.
pub fn default_store_path() -> PathBuf {
    home_dir().join(".agentation").join("store.db")
}

fn home_dir() -> PathBuf {
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home);
    }
    if let Ok(home) = env::var("USERPROFILE") {
        return PathBuf::from(home);
    }
    PathBuf::from(".")
}
