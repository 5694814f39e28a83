//! Environment-variable configuration tests.
//!
//! Env mutation is process-global, so everything runs in a single test to
//! avoid cross-test interference.

use std::env;

use agentation::config::{Config, StoreBacking};

fn clear_agentation_env() {
    for key in [
        "AGENTATION_STORE",
        "AGENTATION_STORE_PATH",
        "AGENTATION_STORE_MAX_CONNECTIONS",
        "AGENTATION_EVENT_RETENTION_DAYS",
        "AGENTATION_WEBHOOK_URL",
        "AGENTATION_WEBHOOKS",
        "AGENTATION_API_KEY",
    ] {
        env::remove_var(key);
    }
}

#[test]
fn test_config_from_env() {
    clear_agentation_env();

    // Defaults
    let config = Config::from_env().unwrap();
    assert_eq!(config.server.port, 4747);
    assert_eq!(config.store.backing, StoreBacking::Sqlite);
    assert!(config.store.path.ends_with(".agentation/store.db"));
    assert_eq!(config.events.retention_days, 7);
    assert!(!config.webhooks.enabled());
    assert!(config.api_key.is_none());
    assert_eq!(config.server.dispatch_url(), "http://127.0.0.1:4747");

    // Memory backing
    env::set_var("AGENTATION_STORE", "memory");
    let config = Config::from_env().unwrap();
    assert_eq!(config.store.backing, StoreBacking::Memory);

    // Unknown backing is a configuration error
    env::set_var("AGENTATION_STORE", "postgres");
    assert!(Config::from_env().is_err());
    env::remove_var("AGENTATION_STORE");

    // Retention override
    env::set_var("AGENTATION_EVENT_RETENTION_DAYS", "30");
    let config = Config::from_env().unwrap();
    assert_eq!(config.events.retention_days, 30);

    // Garbage retention falls back to the default
    env::set_var("AGENTATION_EVENT_RETENTION_DAYS", "soon");
    let config = Config::from_env().unwrap();
    assert_eq!(config.events.retention_days, 7);
    env::remove_var("AGENTATION_EVENT_RETENTION_DAYS");

    // Single webhook URL plus comma-separated list
    env::set_var("AGENTATION_WEBHOOK_URL", "http://localhost:9000/hook");
    env::set_var(
        "AGENTATION_WEBHOOKS",
        "http://localhost:9001/a, http://localhost:9002/b,",
    );
    let config = Config::from_env().unwrap();
    assert!(config.webhooks.enabled());
    assert_eq!(
        config.webhooks.urls,
        vec![
            "http://localhost:9000/hook",
            "http://localhost:9001/a",
            "http://localhost:9002/b",
        ]
    );
    assert_eq!(config.webhooks.timeout_ms, 5000);
    assert_eq!(config.webhooks.max_retries, 3);
    env::remove_var("AGENTATION_WEBHOOK_URL");
    env::remove_var("AGENTATION_WEBHOOKS");

    // Bearer credential
    env::set_var("AGENTATION_API_KEY", "secret");
    let config = Config::from_env().unwrap();
    assert_eq!(config.api_key.as_deref(), Some("secret"));
    env::set_var("AGENTATION_API_KEY", "");
    let config = Config::from_env().unwrap();
    assert!(config.api_key.is_none());

    clear_agentation_env();
}
