use std::net::SocketAddr;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agentation::acp::{AcpServer, ApiClient};
use agentation::bus::{spawn_retention_sweeper, EventBus};
use agentation::config::{Config, StoreBacking};
use agentation::http::{self, AppState};
use agentation::store::{MemoryStore, SqliteStore, Store};
use agentation::webhook::WebhookDispatcher;

#[derive(Parser)]
#[command(name = "agentation", version, about = "Local annotation broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker
    Server {
        /// HTTP port to bind (default: 4747)
        #[arg(long)]
        port: Option<u16>,
        /// Run only the ACP dispatcher, targeting --http-url
        #[arg(long)]
        mcp_only: bool,
        /// Run only the HTTP surface, without the ACP dispatcher
        #[arg(long)]
        http_only: bool,
        /// Broker surface base URL for the dispatcher (default: the
        /// co-hosted loopback port)
        #[arg(long)]
        http_url: Option<String>,
        /// Shared bearer credential
        #[arg(long)]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let Some(Command::Server {
        port,
        mcp_only,
        http_only,
        http_url,
        api_key,
    }) = cli.command
    else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(http_url) = http_url {
        config.server.base_url = Some(http_url);
    }
    if let Some(api_key) = api_key {
        config.api_key = Some(api_key);
    }

    init_logging(&config);

    if mcp_only && http_only {
        eprintln!("--mcp-only and --http-only are mutually exclusive");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Agentation broker starting"
    );

    if mcp_only {
        return run_dispatcher_only(&config).await;
    }

    // Select the store backing
    let store: Arc<dyn Store> = match config.store.backing {
        StoreBacking::Sqlite => match SqliteStore::new(&config.store).await {
            Ok(s) => {
                info!(path = %config.store.path.display(), "Store opened");
                Arc::new(s)
            }
            Err(e) => {
                error!(error = %e, "Failed to open store");
                return Err(e.into());
            }
        },
        StoreBacking::Memory => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let bus = EventBus::new(store.clone()).await?;
    let sweeper = spawn_retention_sweeper(
        store.clone(),
        config.events.retention_days,
        config.events.sweep_interval_secs,
    );

    let webhook_worker = if config.webhooks.enabled() {
        let dispatcher = WebhookDispatcher::new(config.webhooks.clone())
            .map_err(|e| anyhow::anyhow!("Failed to build webhook client: {}", e))?;
        Some(dispatcher.spawn(&bus))
    } else {
        None
    };

    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind port");
            return Err(e.into());
        }
    };

    let state = AppState::new(store.clone(), bus.clone(), Arc::new(config.clone()));
    let app = http::router(state);

    info!(addr = %addr, "HTTP surface listening");

    // On ctrl-c the bus closes every live SSE subscription, so their
    // streams end cleanly and graceful shutdown can complete.
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(bus.clone()));

    if http_only {
        if let Err(err) = server.await {
            error!(error = %err, "Server error");
        }
    } else {
        let client = ApiClient::new(config.server.dispatch_url(), config.api_key.clone())
            .map_err(|e| anyhow::anyhow!("Failed to build dispatcher client: {}", e))?;
        let dispatcher = AcpServer::new(client);

        tokio::select! {
            result = server => {
                if let Err(err) = result {
                    error!(error = %err, "Server error");
                }
            }
            result = dispatcher.run() => {
                // The agent closed stdin; take the broker down with it.
                if let Err(err) = result {
                    error!(error = %err, "Dispatcher error");
                }
            }
        }
    }

    bus.shutdown();
    sweeper.abort();
    if let Some(worker) = webhook_worker {
        worker.abort();
    }
    store.close().await;

    info!("Broker shutdown complete");
    Ok(())
}

async fn shutdown_signal(bus: EventBus) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");
    bus.shutdown();
}

async fn run_dispatcher_only(config: &Config) -> anyhow::Result<()> {
    let client = ApiClient::new(config.server.dispatch_url(), config.api_key.clone())
        .map_err(|e| anyhow::anyhow!("Failed to build dispatcher client: {}", e))?;
    let dispatcher = AcpServer::new(client);

    tokio::select! {
        result = dispatcher.run() => {
            if let Err(err) = result {
                error!(error = %err, "Dispatcher error");
                return Err(err.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    Ok(())
}

/// Initialize tracing/logging. Stderr only: stdout belongs to the ACP
/// transport.
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        agentation::config::LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        agentation::config::LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
