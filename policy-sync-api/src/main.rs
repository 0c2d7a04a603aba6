//! Policy Sync - Main Application Entry Point
//!
//! Serves the sync API, or runs a single reconciliation when
//! `MANIFEST_PATH` is set.

use anyhow::Context;
use policy_sync_api::{AppState, SyncConfig, SyncResponse};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,policy_sync=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env().context("invalid configuration")?;

    tracing::info!("Initializing InMemory policy service...");
    let app_state = Arc::new(AppState::new(config.clone()));

    if let Some(path) = &config.manifest_path {
        tracing::info!("Running one-shot sync of {:?}", path);
        let report = app_state
            .engine
            .run_file(path, &config.fullname_prefix)
            .await
            .with_context(|| format!("sync of {} failed", path.display()))?;

        println!("{}", serde_json::to_string_pretty(&SyncResponse::from(report))?);
        return Ok(());
    }

    tracing::info!("Starting Policy Sync server on {}", config.bind_address());

    let app = policy_sync_api::create_router(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
