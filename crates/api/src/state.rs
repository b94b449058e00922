//! Shared application state for the Axum server.

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_engine::supervisor::FeedStatusBoard;

use crate::registry::ConnectionRegistry;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub registry: Arc<ConnectionRegistry>,
    pub feeds: FeedStatusBoard,
    pub config: AppConfig,
    /// Cancelled when the process begins shutting down; open sockets close.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        registry: Arc<ConnectionRegistry>,
        feeds: FeedStatusBoard,
        config: AppConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            registry,
            feeds,
            config,
            shutdown,
        }
    }
}
