//! HTTP admission control.
//!
//! [`policy`] compiles an [`AdmissionConfig`](crate::config::AdmissionConfig)
//! into per-route limiters, [`admission`] enforces them as axum middleware.

mod admission;
mod policy;

pub use admission::{
    matched_path_route_info, rate_limit_middleware, Admission, RateLimitHeaders, RouteInfoFn,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET_SECONDS,
    X_RATELIMIT_WINDOW_SECONDS,
};
pub use policy::{
    default_key_strategies, remote_ip_key, KeyExtractor, KeyStrategies, Policy, PolicySource,
    RouteInfo, RuntimePolicy, REMOTE_IP_STRATEGY,
};
