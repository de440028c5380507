use std::sync::Arc;
use tracing::{error, info};

use hermes::{bus::EventBus, config::Config, server::JournalServer, store::Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the subscriber so it can carry RUST_LOG
    let dotenv = dotenvy::dotenv();

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = dotenv {
        // Not fatal, the environment may already be set
        info!("No .env file found or failed to load: {}", e);
    }

    info!("Hermes journal service starting...");

    let config = Config::from_env()?;
    let photos = config.photo_resolver();
    match photos.base_url() {
        Some(base) => info!("Resolving relative photo paths against {}", base),
        None => info!("No API base URL configured, relative photo paths will be dropped"),
    }

    let bus = Arc::new(EventBus::new());

    info!("Initializing store at {}", config.db_path.display());
    let store = Store::new(&config.db_path).await?;
    store.init().await?;

    let app = JournalServer::new(store, bus, photos).router();

    info!("Starting HTTP server on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
