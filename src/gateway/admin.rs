//! Operational endpoints for inspecting and resetting budgets.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use std::sync::Arc;

use crate::ratelimit::{BucketRegistry, RegistryStats};

pub const RATE_LIMITS_PATH: &str = "/admin/rate-limits";

/// Admin routes, bound to `registry`.
pub fn routes(registry: Arc<BucketRegistry>) -> Router {
    Router::new()
        .route(RATE_LIMITS_PATH, get(stats).delete(reset_all))
        .route("/admin/rate-limits/:key", delete(reset_key))
        .with_state(registry)
}

async fn stats(State(registry): State<Arc<BucketRegistry>>) -> Json<RegistryStats> {
    Json(registry.stats())
}

async fn reset_key(
    State(registry): State<Arc<BucketRegistry>>,
    Path(key): Path<String>,
) -> StatusCode {
    if registry.reset_key(&key) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn reset_all(State(registry): State<Arc<BucketRegistry>>) -> StatusCode {
    registry.reset_all();
    StatusCode::NO_CONTENT
}
