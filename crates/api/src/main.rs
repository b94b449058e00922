//! Herald binary entrypoint.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::create_pool;
use herald_engine::store::PgFeedStore;
use herald_engine::supervisor::PollerSupervisor;

use herald_server::registry::ConnectionRegistry;
use herald_server::routes::create_router;
use herald_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_server=info,herald_engine=info,tower_http=info")
        }))
        .json()
        .init();

    tracing::info!("Herald starting...");

    // Invalid feed configuration is fatal here, before any poller runs
    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let shutdown = CancellationToken::new();
    let registry =
        Arc::new(ConnectionRegistry::new().with_confirm_timeout(config.delivery_timeout()));
    let store = Arc::new(PgFeedStore::new(pool.clone()));

    let pollers = PollerSupervisor::new(store, registry.clone())
        .with_parent_token(&shutdown)
        .start(config.feeds.clone())?;
    tracing::info!(feeds = ?pollers.feeds(), "Polling feeds");

    let state = AppState::new(
        pool,
        registry.clone(),
        pollers.status_board(),
        config.clone(),
        shutdown.clone(),
    );

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener =
        tokio::net::TcpListener::bind((config.server_host.as_str(), config.server_port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "Herald listening");

    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    // Run until Ctrl+C, or until the server dies on its own
    let early_exit = tokio::select! {
        result = &mut server => Some(result),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            None
        }
    };

    shutdown.cancel();
    registry.clear();

    let report = pollers.stop(config.shutdown_timeout()).await;

    let server_result = match early_exit {
        Some(result) => result,
        None => server.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server exited with error"),
        Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
    }

    if !report.is_clean() {
        anyhow::bail!(
            "feed pollers did not stop cleanly (timed out: {:?}, failed: {:?})",
            report.timed_out,
            report.failed
        );
    }

    tracing::info!("Herald stopped.");
    Ok(())
}
