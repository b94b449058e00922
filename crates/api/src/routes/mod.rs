pub mod feeds;
pub mod health;
pub mod ws;

use axum::Router;

use crate::state::AppState;

/// Build the complete router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(feeds::router())
        .merge(ws::router())
        .with_state(state)
}
