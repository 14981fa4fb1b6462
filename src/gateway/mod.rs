//! HTTP adapter: puts the admission check in front of an axum application.
//!
//! The public [`router`] carries client traffic. Operator endpoints live on
//! [`admin_router`], which is bound to its own listener.

mod admin;
mod key;
mod middleware;
mod server;

pub use admin::RATE_LIMITS_PATH;
pub use key::{AuthenticatedSubject, KeyResolver};
pub use middleware::{rate_limit, RateLimitExceededBody, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
pub use server::GatewayServer;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::ratelimit::{BucketRegistry, RouteTable};

/// Shared state for the admission middleware.
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub registry: Arc<BucketRegistry>,
    pub routes: Arc<RouteTable>,
    pub keys: KeyResolver,
}

impl GatewayState {
    pub fn new(registry: Arc<BucketRegistry>, routes: Arc<RouteTable>, keys: KeyResolver) -> Self {
        Self {
            registry,
            routes,
            keys,
        }
    }
}

/// Wrap `upstream` with the rate-limit layer.
///
/// Admin endpoints are not part of this router. Serve [`admin_router`] on a
/// separate, private listener.
pub fn router(state: GatewayState, upstream: Router) -> Router {
    upstream
        .layer(axum::middleware::from_fn_with_state(state, rate_limit))
        .layer(TraceLayer::new_for_http())
}

/// Stats and reset endpoints for operators.
pub fn admin_router(registry: Arc<BucketRegistry>) -> Router {
    admin::routes(registry).layer(TraceLayer::new_for_http())
}
