//! Configuration surface for the admission layer.
//!
//! Loaded once at startup and compiled into a
//! [`RuntimePolicy`](crate::http::RuntimePolicy); nothing here is consulted
//! per request. Lock configuration is per-call
//! ([`LockConfiguration`](crate::locking::LockConfiguration)) and not part of
//! this file-loaded surface.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Rate limit rules for an HTTP service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Per-route rules; each route pattern carries one rule per method.
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    /// Fallback rule when no explicit `(pattern, method)` rule matches.
    ///
    /// If it names a method it becomes a default for that method only;
    /// otherwise it is the catch-all default. Considered configured only when
    /// it has both a non-zero window and a key strategy; a partially
    /// specified default is treated as absent.
    #[serde(default)]
    pub default_policy: Option<EndpointRule>,

    /// Let requests through when no policy matches (fail-open). Default is
    /// fail-closed.
    #[serde(default)]
    pub allow_if_no_match: bool,

    /// Let requests through when no identifier can be extracted.
    #[serde(default)]
    pub allow_if_no_identifier: bool,
}

/// Rules for one route pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    /// Route pattern as registered with the router (e.g. `/profiles/{id}`).
    pub pattern: String,
    #[serde(default)]
    pub rules: Vec<EndpointRule>,
}

/// A `(method, limit, window, key strategy)` rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointRule {
    #[serde(default)]
    pub method: String,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub window_secs: u64,
    /// Name of a registered key strategy. Empty means the policy carries no
    /// key extractor, which the middleware handles per its
    /// `allow_if_no_identifier` setting.
    #[serde(default)]
    pub key_strategy: String,
}

fn default_limit() -> u64 {
    10_000
}

impl EndpointRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl AdmissionConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }
}
