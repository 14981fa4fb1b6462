//! Admission middleware.

use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, warn};

use super::GatewayState;
use crate::ratelimit::AdmissionResult;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
const RATE_LIMIT_MESSAGE: &str = "Request limit exceeded";
const JSON_UTF8: &str = "application/json; charset=UTF-8";

/// Body of a 429 response. Field order is part of the wire contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitExceededBody {
    pub success: bool,
    pub code: &'static str,
    pub message: &'static str,
    pub limit: u32,
    pub retry_after: u64,
    pub timestamp: i64,
}

impl RateLimitExceededBody {
    fn new(result: &AdmissionResult) -> Self {
        Self {
            success: false,
            code: RATE_LIMIT_EXCEEDED,
            message: RATE_LIMIT_MESSAGE,
            limit: result.capacity(),
            retry_after: result.retry_after_seconds(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Charge the request against its key's budget.
///
/// Admitted requests are forwarded and get the informational headers on the
/// way back. Denied requests never reach the inner service.
pub async fn rate_limit(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    let key = state.keys.resolve(&request);
    let policy = state.routes.policy_for(request.uri().path());

    let result = state.registry.check_limit(&key, &policy);

    if !result.allowed() {
        warn!(
            key = %key,
            path = %request.uri().path(),
            retry_after = result.retry_after_seconds(),
            "Rate limit exceeded"
        );
        return too_many_requests(&result);
    }

    debug!(key = %key, remaining = result.remaining_tokens(), "Request admitted");

    let mut response = next.run(request).await;
    set_limit_headers(response.headers_mut(), &result);
    response
}

fn set_limit_headers(headers: &mut HeaderMap, result: &AdmissionResult) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.capacity()));
    headers.insert(
        X_RATELIMIT_REMAINING,
        HeaderValue::from(result.remaining_tokens()),
    );
}

fn too_many_requests(result: &AdmissionResult) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(RateLimitExceededBody::new(result)),
    )
        .into_response();

    let headers = response.headers_mut();
    set_limit_headers(headers, result);
    headers.insert(RETRY_AFTER, HeaderValue::from(result.retry_after_seconds()));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_UTF8));
    response
}
