//! berth API server.
//!
//! Thin HTTP adapter over the admission contract. Scheduling itself
//! happens in the separate `berth-worker` process.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use berth::api;
use berth::config::Config;
use berth::queue::{JobQueue, RedisJobQueue, RedisJobQueueConfig};
use berth::state::AppState;
use berth::store::{PgStore, PgStoreConfig, Store};

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting berth API server");

    let config = Config::from_env()?;
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let store = match PgStore::connect(&PgStoreConfig {
        database_url: config.database_url.clone(),
        ..Default::default()
    })
    .await
    {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = store.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let queue = RedisJobQueue::connect(&RedisJobQueueConfig {
        url: config.redis_url.clone(),
        ..Default::default()
    })
    .await?;

    let state = AppState::new(
        Arc::new(store) as Arc<dyn Store>,
        Arc::new(queue) as Arc<dyn JobQueue>,
    );
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API server shut down cleanly");
    Ok(())
}
