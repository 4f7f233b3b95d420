use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use plotshare_server::api::router;
use plotshare_server::config::{Config, StorageBackend};
use plotshare_server::repository::{InMemoryRepository, SpaceRepository, SqliteRepository};
use plotshare_server::{AppState, PlotShareService};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration from environment variables")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    info!(
        "Starting plotshare server {}",
        plotshare_server::get_service_version()
    );

    let repository: Arc<dyn SpaceRepository> = match config.storage_backend {
        StorageBackend::Sqlite => {
            let db_path = config.database_path();
            info!("Using state database: {}", db_path.display());
            Arc::new(
                SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?,
            )
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; all requests and messages are lost on restart");
            Arc::new(InMemoryRepository::new())
        }
    };

    if config.api_auth_token.is_none() {
        warn!("API_AUTH_TOKEN is not set; relying on the gateway alone for access control");
    }

    let app_state = Arc::new(AppState {
        service: PlotShareService::new(repository, config.channel_capacity),
        api_auth_token: config.api_auth_token.clone(),
    });

    let app = router(app_state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
