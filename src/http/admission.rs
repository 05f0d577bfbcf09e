//! Admission middleware: per-request rate limit enforcement for axum.
//!
//! Thin orchestration over policy resolution and the limiter, but the
//! ordering matters: malformed requests are rejected before any limiter
//! work, store failures surface as server errors rather than 429s, and the
//! informational headers are computed once and applied to the response the
//! inner stack actually commits.

use std::sync::Arc;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::request::Parts;
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use tracing::{debug, error, warn};

use crate::ratelimit::Decision;

use super::policy::{PolicySource, RouteInfo, RuntimePolicy};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_WINDOW_SECONDS: HeaderName =
    HeaderName::from_static("x-ratelimit-window-seconds");
pub const X_RATELIMIT_RESET_SECONDS: HeaderName =
    HeaderName::from_static("x-ratelimit-reset-seconds");

/// The four informational values derivable from every [`Decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub window_secs: u64,
    pub reset_secs: u64,
}

impl RateLimitHeaders {
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            window_secs: decision.window.as_secs(),
            reset_secs: decision.window_reset_in.as_secs(),
        }
    }

    /// Write the headers into `headers`, replacing any stale values.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_WINDOW_SECONDS, HeaderValue::from(self.window_secs));
        headers.insert(X_RATELIMIT_RESET_SECONDS, HeaderValue::from(self.reset_secs));
    }
}

/// Extracts route information from request metadata.
///
/// Injected because pattern extraction depends on the router in use; the
/// default reads axum's [`MatchedPath`].
pub type RouteInfoFn = Arc<dyn Fn(&Parts) -> RouteInfo + Send + Sync>;

/// Route info from axum's [`MatchedPath`] extension.
///
/// `MatchedPath` is only present once routing has happened, so mount the
/// middleware with [`Router::route_layer`](axum::Router::route_layer), not
/// `Router::layer`.
pub fn matched_path_route_info(parts: &Parts) -> RouteInfo {
    RouteInfo {
        pattern: parts
            .extensions
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_default(),
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
    }
}

/// Shared state for [`rate_limit_middleware`].
pub struct Admission {
    policy: RuntimePolicy,
    route_info: RouteInfoFn,
}

impl Admission {
    pub fn new(policy: RuntimePolicy) -> Self {
        Self {
            policy,
            route_info: Arc::new(matched_path_route_info),
        }
    }

    /// Replace the route info extractor, e.g. for a non-axum router in front.
    pub fn with_route_info(mut self, route_info: RouteInfoFn) -> Self {
        self.route_info = route_info;
        self
    }
}

/// The admission decision for one request.
///
/// Mount with `axum::middleware::from_fn_with_state(admission, rate_limit_middleware)`
/// via `Router::route_layer`.
pub async fn rate_limit_middleware(
    State(admission): State<Arc<Admission>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let route = (admission.route_info)(&parts);

    // A request without a resolvable method is malformed, not rate-limited.
    if route.method.is_empty() {
        error!(path = %route.path, "no method resolvable for request");
        return problem_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed", None);
    }

    let Some((policy, source)) = admission.policy.find(&route) else {
        if admission.policy.allow_if_no_match {
            return next.run(Request::from_parts(parts, body)).await;
        }
        warn!(path = %route.path, pattern = %route.pattern, "no rate limit policy found");
        return problem_response(StatusCode::TOO_MANY_REQUESTS, "too many requests", None);
    };

    if source != PolicySource::Explicit {
        debug!(path = %route.path, policy_source = ?source, "using default rate limit policy");
    }

    let Some(extractor) = policy.key_extractor.as_ref() else {
        if admission.policy.allow_if_no_identifier {
            return next.run(Request::from_parts(parts, body)).await;
        }
        warn!(path = %route.path, "policy has no key extractor");
        return problem_response(StatusCode::TOO_MANY_REQUESTS, "too many requests", None);
    };

    let key = match extractor(&parts) {
        Some(key) if !key.is_empty() => key,
        _ => {
            if admission.policy.allow_if_no_identifier {
                return next.run(Request::from_parts(parts, body)).await;
            }
            warn!(path = %route.path, "no identifier extracted for rate limiting");
            return problem_response(StatusCode::TOO_MANY_REQUESTS, "too many requests", None);
        }
    };

    let decision = match policy.limiter.allow(&key).await {
        Ok(decision) => decision,
        Err(err) => {
            // The store being unreachable is not a rate limit decision; the
            // system cannot make an informed one, so this is a server error.
            error!(path = %route.path, error = %err, "rate limit decision failed");
            return problem_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
                None,
            );
        }
    };

    let headers = RateLimitHeaders::from_decision(&decision);

    if !decision.allowed {
        debug!(path = %route.path, key = %key, "rate limited");
        return problem_response(
            StatusCode::TOO_MANY_REQUESTS,
            "too many requests",
            Some((headers, decision.retry_after.as_secs())),
        );
    }

    // Two-phase emission: let the inner stack commit its response first,
    // then apply the headers to whatever actually goes out, so error layers
    // rewriting the response cannot bake in stale values.
    let mut response = next.run(Request::from_parts(parts, body)).await;
    headers.apply(response.headers_mut());
    response
}

/// RFC 7807 problem response.
fn problem_response(
    status: StatusCode,
    detail: &str,
    rate_limit: Option<(RateLimitHeaders, u64)>,
) -> Response {
    let body = serde_json::json!({
        "title": status.canonical_reason().unwrap_or("error"),
        "status": status.as_u16(),
        "detail": detail,
    });

    let mut response = (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        body.to_string(),
    )
        .into_response();

    if let Some((headers, retry_after_secs)) = rate_limit {
        headers.apply(response.headers_mut());
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    }

    response
}
