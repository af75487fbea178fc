//! Storefront Incentives - pricing and referral settlement service

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use storefront_incentives::api::{self, AppState};
use storefront_incentives::catalog_store::PgCatalogStore;
use storefront_incentives::config::AppConfig;
use storefront_incentives::journal::{spawn_writer, Journal, StateStore};
use storefront_incentives::notifications::{spawn_dispatcher, Notifier};
use storefront_incentives::services::IncentiveCore;
use storefront_incentives::state_store::PgStateStore;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();

    let config = AppConfig::from_env()?;
    let database_url = config.database_url.as_deref().context("DATABASE_URL must be set")?;
    let db = PgPoolOptions::new().max_connections(10).connect(database_url).await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    let store = PgCatalogStore::new(db.clone());
    let catalog = store.load().await?;
    let state_store = Arc::new(PgStateStore::new(db));
    let persisted = state_store.load().await?;

    let nats = match config.nats_url.as_deref() {
        Some(url) => match async_nats::connect(url).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("NATS unavailable at {}, events will only be logged: {}", url, e);
                None
            }
        },
        None => None,
    };
    let (notifier, outbox) = Notifier::channel();
    let dispatcher = spawn_dispatcher(outbox, nats, config.nats_subject_prefix.clone());

    let (journal, commits) = Journal::channel();
    let writer = spawn_writer(commits, state_store);

    let core = Arc::new(IncentiveCore::with_journal(catalog, notifier, journal, &config.default_currency));
    core.restore(persisted)?;
    let app = api::router(AppState { core, catalog_store: Some(store) })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.bind_addr();
    tracing::info!("Storefront incentives listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(&addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router held the last journal handle; the writer exits once the queue drains.
    if tokio::time::timeout(Duration::from_secs(30), writer).await.is_err() {
        tracing::error!("journal writer did not drain within 30s, unwritten commits are lost");
    }
    dispatcher.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining");
}
