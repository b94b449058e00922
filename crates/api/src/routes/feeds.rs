//! Feed poller status.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_common::types::PollerStatus;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/feeds", get(list_feeds))
        .route("/feeds/{name}", get(get_feed))
}

async fn list_feeds(State(state): State<AppState>) -> Json<Vec<PollerStatus>> {
    Json(state.feeds.snapshot())
}

async fn get_feed(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<PollerStatus>, AppError> {
    state
        .feeds
        .get(&name)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Feed '{}' not found", name)))
}
