//! Policy resolution: mapping an inbound route and method to a rate limit
//! policy with three-tier precedence.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ConnectInfo;
use http::request::Parts;

use crate::config::{AdmissionConfig, EndpointRule};
use crate::error::{Error, Result};
use crate::ratelimit::{Key, LimiterFactory, RateLimiter};

/// Extracts a rate-limit subject identifier from request metadata.
///
/// Pure with respect to the request; returns `None` when no identifier can be
/// derived.
pub type KeyExtractor = Arc<dyn Fn(&Parts) -> Option<Key> + Send + Sync>;

/// Named registry of key strategies, resolved at policy-compile time.
pub type KeyStrategies = HashMap<String, KeyExtractor>;

/// Framework-agnostic route information for policy lookup.
#[derive(Debug, Clone, Default)]
pub struct RouteInfo {
    /// Route pattern as registered with the router; empty when the request
    /// matched no route.
    pub pattern: String,
    pub method: String,
    pub path: String,
}

/// An immutable pairing of a rate limiter and a key extractor.
#[derive(Clone)]
pub struct Policy {
    pub limiter: Arc<dyn RateLimiter>,
    pub key_extractor: Option<KeyExtractor>,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("has_key_extractor", &self.key_extractor.is_some())
            .finish_non_exhaustive()
    }
}

/// Which precedence tier a lookup resolved through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySource {
    Explicit,
    DefaultMethod,
    Default,
}

/// Compiled rate limit policies.
///
/// Built once at startup from [`AdmissionConfig`]; read-only afterwards, so
/// concurrent lookups need no synchronization.
pub struct RuntimePolicy {
    policies: HashMap<String, HashMap<String, Policy>>,
    default_by_method: HashMap<String, Policy>,
    default_policy: Option<Policy>,

    /// Continue to the next stage when no policy matches the route.
    pub allow_if_no_match: bool,
    /// Continue to the next stage when no identifier can be extracted.
    pub allow_if_no_identifier: bool,
}

impl std::fmt::Debug for RuntimePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePolicy")
            .field("patterns", &self.policies.len())
            .field("default_methods", &self.default_by_method.len())
            .field("has_default", &self.default_policy.is_some())
            .field("allow_if_no_match", &self.allow_if_no_match)
            .field("allow_if_no_identifier", &self.allow_if_no_identifier)
            .finish()
    }
}

fn normalize_method(method: &str) -> String {
    method.to_uppercase()
}

impl RuntimePolicy {
    /// Compile `config` into a runtime policy.
    ///
    /// Fails on duplicate `(pattern, method)` entries, unknown key strategy
    /// names, and zero-length windows; all of these are startup errors, never
    /// runtime conditions.
    pub fn build(
        factory: &LimiterFactory,
        config: &AdmissionConfig,
        strategies: &KeyStrategies,
    ) -> Result<Self> {
        let mut runtime = Self {
            policies: HashMap::new(),
            default_by_method: HashMap::new(),
            default_policy: None,
            allow_if_no_match: config.allow_if_no_match,
            allow_if_no_identifier: config.allow_if_no_identifier,
        };

        // A default needs enough information to actually enforce a limit:
        // both a window and a key strategy. Anything less is treated as no
        // default at all rather than zero-value behavior.
        if let Some(default) = &config.default_policy {
            if default.window_secs > 0 && !default.key_strategy.is_empty() {
                let extractor = strategies
                    .get(&default.key_strategy)
                    .cloned()
                    .ok_or_else(|| Error::UnknownKeyStrategy(default.key_strategy.clone()))?;
                let policy = Policy {
                    limiter: factory(default.limit, default.window()),
                    key_extractor: Some(extractor),
                };

                if default.method.is_empty() {
                    runtime.default_policy = Some(policy);
                } else {
                    runtime
                        .default_by_method
                        .insert(normalize_method(&default.method), policy);
                }
            }
        }

        for route in &config.routes {
            let methods = runtime.policies.entry(route.pattern.clone()).or_default();

            for rule in &route.rules {
                let method = normalize_method(&rule.method);
                if methods.contains_key(&method) {
                    return Err(Error::DuplicateRule {
                        pattern: route.pattern.clone(),
                        method,
                    });
                }

                methods.insert(method, compile_rule(factory, strategies, route, rule)?);
            }
        }

        Ok(runtime)
    }

    /// Resolve the policy for a route with three-tier precedence: explicit
    /// `(pattern, method)`, then default-by-method, then catch-all default.
    ///
    /// `None` means no policy is configured at any tier; that is distinct
    /// from "found but not applicable" and callers handle it explicitly.
    pub fn find(&self, route: &RouteInfo) -> Option<(&Policy, PolicySource)> {
        if let Some(methods) = self.policies.get(&route.pattern) {
            if let Some(policy) = methods.get(&normalize_method(&route.method)) {
                return Some((policy, PolicySource::Explicit));
            }
        }

        if !route.method.is_empty() {
            if let Some(policy) = self.default_by_method.get(&normalize_method(&route.method)) {
                return Some((policy, PolicySource::DefaultMethod));
            }
        }

        self.default_policy
            .as_ref()
            .map(|policy| (policy, PolicySource::Default))
    }
}

fn compile_rule(
    factory: &LimiterFactory,
    strategies: &KeyStrategies,
    route: &crate::config::RouteRule,
    rule: &EndpointRule,
) -> Result<Policy> {
    if rule.window_secs == 0 {
        return Err(Error::ZeroWindow {
            pattern: route.pattern.clone(),
            method: normalize_method(&rule.method),
        });
    }

    let key_extractor = if rule.key_strategy.is_empty() {
        None
    } else {
        Some(
            strategies
                .get(&rule.key_strategy)
                .cloned()
                .ok_or_else(|| Error::UnknownKeyStrategy(rule.key_strategy.clone()))?,
        )
    };

    Ok(Policy {
        limiter: factory(rule.limit, rule.window()),
        key_extractor,
    })
}

/// Strategy name for [`remote_ip_key`].
pub const REMOTE_IP_STRATEGY: &str = "remote_ip";

/// The key strategies shipped with this crate.
pub fn default_key_strategies() -> KeyStrategies {
    let mut strategies: KeyStrategies = HashMap::new();
    strategies.insert(REMOTE_IP_STRATEGY.to_string(), Arc::new(remote_ip_key));
    strategies
}

/// Derive a key from the client address: the last `X-Forwarded-For` entry,
/// falling back to the connection's peer address.
pub fn remote_ip_key(parts: &Parts) -> Option<Key> {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next_back())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    if let Some(ip) = forwarded {
        return Some(Key::new(ip));
    }

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| Key::new(addr.ip().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteRule;
    use crate::ratelimit::{Decision, StoreError};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Limiter that remembers its `(limit, window)` so tests can tell which
    /// rule a lookup resolved to.
    struct MarkerLimiter {
        limit: u64,
        window: Duration,
    }

    #[async_trait]
    impl RateLimiter for MarkerLimiter {
        // Spelled out because the file-level `error::Result` alias is in
        // scope here and would shadow the trait's two-argument form.
        async fn allow(&self, _key: &Key) -> std::result::Result<Decision, StoreError> {
            Ok(Decision {
                allowed: true,
                remaining: self.limit,
                limit: self.limit,
                window: self.window,
                window_reset_in: self.window,
                retry_after: Duration::ZERO,
            })
        }
    }

    fn marker_factory() -> LimiterFactory {
        Arc::new(|limit, window| Arc::new(MarkerLimiter { limit, window }))
    }

    fn header_strategy(name: &str) -> KeyStrategies {
        let mut strategies: KeyStrategies = HashMap::new();
        strategies.insert(
            name.to_string(),
            Arc::new(|parts: &Parts| {
                parts
                    .headers
                    .get("x-client")
                    .and_then(|v| v.to_str().ok())
                    .map(Key::new)
            }),
        );
        strategies
    }

    fn rule(method: &str, limit: u64, strategy: &str) -> EndpointRule {
        EndpointRule {
            method: method.to_string(),
            limit,
            window_secs: 60,
            key_strategy: strategy.to_string(),
        }
    }

    fn route(pattern: &str, rules: Vec<EndpointRule>) -> RouteRule {
        RouteRule {
            pattern: pattern.to_string(),
            rules,
        }
    }

    fn info(pattern: &str, method: &str) -> RouteInfo {
        RouteInfo {
            pattern: pattern.to_string(),
            method: method.to_string(),
            path: pattern.to_string(),
        }
    }

    async fn resolved_limit(policy: &Policy) -> u64 {
        policy.limiter.allow(&Key::from("k")).await.unwrap().limit
    }

    #[tokio::test]
    async fn three_tier_precedence() {
        let config = AdmissionConfig {
            routes: vec![route("/profiles/{id}", vec![rule("GET", 1, "client")])],
            default_policy: Some(EndpointRule {
                method: "GET".to_string(),
                limit: 2,
                window_secs: 60,
                key_strategy: "client".to_string(),
            }),
            ..Default::default()
        };
        let mut runtime =
            RuntimePolicy::build(&marker_factory(), &config, &header_strategy("client")).unwrap();

        // Add a catch-all default on top of the method default.
        let catch_all_config = AdmissionConfig {
            default_policy: Some(EndpointRule {
                method: String::new(),
                limit: 3,
                window_secs: 60,
                key_strategy: "client".to_string(),
            }),
            ..Default::default()
        };
        let catch_all =
            RuntimePolicy::build(&marker_factory(), &catch_all_config, &header_strategy("client"))
                .unwrap();
        runtime.default_policy = catch_all.default_policy;

        // Explicit beats default-by-method.
        let (policy, source) = runtime.find(&info("/profiles/{id}", "GET")).unwrap();
        assert_eq!(source, PolicySource::Explicit);
        assert_eq!(resolved_limit(policy).await, 1);

        // Default-by-method for other patterns with a GET default.
        let (policy, source) = runtime.find(&info("/other", "GET")).unwrap();
        assert_eq!(source, PolicySource::DefaultMethod);
        assert_eq!(resolved_limit(policy).await, 2);

        // Catch-all for methods without a method default.
        let (policy, source) = runtime.find(&info("/other", "POST")).unwrap();
        assert_eq!(source, PolicySource::Default);
        assert_eq!(resolved_limit(policy).await, 3);
    }

    #[tokio::test]
    async fn no_match_when_nothing_configured() {
        let runtime = RuntimePolicy::build(
            &marker_factory(),
            &AdmissionConfig::default(),
            &KeyStrategies::new(),
        )
        .unwrap();

        assert!(runtime.find(&info("/anything", "GET")).is_none());
    }

    #[tokio::test]
    async fn duplicate_rule_is_rejected_at_build() {
        let config = AdmissionConfig {
            routes: vec![route(
                "/profiles/{id}",
                vec![rule("GET", 1, "client"), rule("get", 2, "client")],
            )],
            ..Default::default()
        };

        let err = RuntimePolicy::build(&marker_factory(), &config, &header_strategy("client"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRule { .. }));
    }

    #[tokio::test]
    async fn unknown_key_strategy_is_rejected_at_build() {
        let config = AdmissionConfig {
            routes: vec![route("/profiles/{id}", vec![rule("GET", 1, "nope")])],
            ..Default::default()
        };

        let err = RuntimePolicy::build(&marker_factory(), &config, &header_strategy("client"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKeyStrategy(_)));
    }

    #[tokio::test]
    async fn zero_window_is_rejected_at_build() {
        let config = AdmissionConfig {
            routes: vec![route(
                "/profiles/{id}",
                vec![EndpointRule {
                    method: "GET".to_string(),
                    limit: 1,
                    window_secs: 0,
                    key_strategy: "client".to_string(),
                }],
            )],
            ..Default::default()
        };

        let err = RuntimePolicy::build(&marker_factory(), &config, &header_strategy("client"))
            .unwrap_err();
        assert!(matches!(err, Error::ZeroWindow { .. }));
    }

    #[tokio::test]
    async fn partially_specified_default_is_treated_as_absent() {
        // Window but no key strategy.
        let config = AdmissionConfig {
            default_policy: Some(EndpointRule {
                method: String::new(),
                limit: 5,
                window_secs: 60,
                key_strategy: String::new(),
            }),
            ..Default::default()
        };
        let runtime =
            RuntimePolicy::build(&marker_factory(), &config, &KeyStrategies::new()).unwrap();
        assert!(runtime.find(&info("/x", "GET")).is_none());

        // Key strategy but no window.
        let config = AdmissionConfig {
            default_policy: Some(EndpointRule {
                method: String::new(),
                limit: 5,
                window_secs: 0,
                key_strategy: "client".to_string(),
            }),
            ..Default::default()
        };
        let runtime =
            RuntimePolicy::build(&marker_factory(), &config, &header_strategy("client")).unwrap();
        assert!(runtime.find(&info("/x", "GET")).is_none());
    }

    #[tokio::test]
    async fn method_matching_is_case_insensitive() {
        let config = AdmissionConfig {
            routes: vec![route("/things", vec![rule("get", 7, "client")])],
            ..Default::default()
        };
        let runtime =
            RuntimePolicy::build(&marker_factory(), &config, &header_strategy("client")).unwrap();

        let (policy, source) = runtime.find(&info("/things", "GeT")).unwrap();
        assert_eq!(source, PolicySource::Explicit);
        assert_eq!(resolved_limit(policy).await, 7);
    }

    #[tokio::test]
    async fn empty_key_strategy_compiles_to_no_extractor() {
        let config = AdmissionConfig {
            routes: vec![route("/things", vec![rule("GET", 7, "")])],
            ..Default::default()
        };
        let runtime =
            RuntimePolicy::build(&marker_factory(), &config, &KeyStrategies::new()).unwrap();

        let (policy, _) = runtime.find(&info("/things", "GET")).unwrap();
        assert!(policy.key_extractor.is_none());
    }

    #[tokio::test]
    async fn debug_output_stays_summary_level() {
        let config = AdmissionConfig {
            routes: vec![route("/things", vec![rule("GET", 7, "client")])],
            ..Default::default()
        };
        let runtime =
            RuntimePolicy::build(&marker_factory(), &config, &header_strategy("client")).unwrap();

        let rendered = format!("{runtime:?}");
        assert!(rendered.contains("patterns: 1"));
        assert!(rendered.contains("has_default: false"));

        let (policy, _) = runtime.find(&info("/things", "GET")).unwrap();
        assert!(format!("{policy:?}").contains("has_key_extractor: true"));
    }

    #[test]
    fn remote_ip_prefers_last_forwarded_for_entry() {
        let request = http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", "203.0.113.9, 198.51.100.2")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();

        assert_eq!(remote_ip_key(&parts), Some(Key::from("198.51.100.2")));
    }

    #[test]
    fn remote_ip_falls_back_to_peer_address() {
        let mut request = http::Request::builder().uri("/").body(()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("192.0.2.1:4444".parse().unwrap()));
        let (parts, _) = request.into_parts();

        assert_eq!(remote_ip_key(&parts), Some(Key::from("192.0.2.1")));
    }

    #[test]
    fn remote_ip_missing_everywhere_is_none() {
        let (parts, _) = http::Request::builder().uri("/").body(()).unwrap().into_parts();
        assert_eq!(remote_ip_key(&parts), None);
    }
}
