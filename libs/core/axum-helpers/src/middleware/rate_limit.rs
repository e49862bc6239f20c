//! Layered request rate limiting
//!
//! Scopes are checked in order `global → ip → user → tenant`. The first scope
//! that denies answers 429; later scopes are not counted. A limiter that errors
//! (store unreachable) lets the request through.
//!
//! ```ignore
//! let limits = RateLimitState::new(store, &RateLimitConfig::from_env()?)?;
//! let api = Router::new()
//!     .route("/events/{stream}", post(publish))
//!     .layer(middleware::from_fn_with_state(limits, rate_limit_middleware));
//! ```

use crate::client_ip::client_ip;
use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use core_config::{ConfigError, FromEnv, env_bool_or, env_or_default, env_parse_or};
use resilience::{CounterStore, RateLimitError, RateLimitStrategy, RateLimiter, parse_duration};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use strum::Display;
use tracing::{error, warn};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_WINDOW: HeaderName = HeaderName::from_static("x-ratelimit-window");

/// Limit for one scope. `window` is a duration string such as `"1m"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeLimit {
    pub enabled: bool,
    pub limit: u64,
    pub window: String,
}

impl ScopeLimit {
    pub fn new(limit: u64, window: impl Into<String>) -> Self {
        Self {
            enabled: true,
            limit,
            window: window.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn from_env_prefixed(prefix: &str, default: ScopeLimit) -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: env_bool_or(&format!("{prefix}_ENABLED"), default.enabled)?,
            limit: env_parse_or(&format!("{prefix}_LIMIT"), default.limit)?,
            window: env_or_default(&format!("{prefix}_WINDOW"), &default.window),
        })
    }
}

impl Default for ScopeLimit {
    fn default() -> Self {
        Self::new(1000, "1m")
    }
}

/// Rate limits per scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub strategy: RateLimitStrategy,
    pub global: ScopeLimit,
    pub per_ip: ScopeLimit,
    pub per_user: ScopeLimit,
    pub per_tenant: ScopeLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::FixedWindow,
            global: ScopeLimit::new(1000, "1m"),
            per_ip: ScopeLimit::new(100, "1m"),
            per_user: ScopeLimit::new(1000, "1m"),
            per_tenant: ScopeLimit::new(5000, "1m"),
        }
    }
}

impl FromEnv for RateLimitConfig {
    /// - RATE_LIMIT_STRATEGY: `fixed_window` (default) or `token_bucket`
    /// - RATE_LIMIT_{GLOBAL,IP,USER,TENANT}_{ENABLED,LIMIT,WINDOW}
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let strategy_raw = env_or_default("RATE_LIMIT_STRATEGY", defaults.strategy.as_ref());
        let strategy =
            RateLimitStrategy::from_str(strategy_raw.trim()).map_err(|_| ConfigError::ParseError {
                key: "RATE_LIMIT_STRATEGY".to_string(),
                details: format!("unknown strategy '{strategy_raw}'"),
            })?;

        Ok(Self {
            strategy,
            global: ScopeLimit::from_env_prefixed("RATE_LIMIT_GLOBAL", defaults.global)?,
            per_ip: ScopeLimit::from_env_prefixed("RATE_LIMIT_IP", defaults.per_ip)?,
            per_user: ScopeLimit::from_env_prefixed("RATE_LIMIT_USER", defaults.per_user)?,
            per_tenant: ScopeLimit::from_env_prefixed("RATE_LIMIT_TENANT", defaults.per_tenant)?,
        })
    }
}

/// Caller identity resolved by an upstream auth layer.
///
/// Insert it as a request extension; absent fields skip their scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
enum Scope {
    Global,
    Ip,
    User,
    Tenant,
}

struct ScopeLimiter {
    scope: Scope,
    limit: u64,
    window: String,
    retry_after_secs: u64,
    limiter: Arc<dyn RateLimiter>,
    limit_header: HeaderValue,
    window_header: HeaderValue,
}

impl ScopeLimiter {
    fn build(
        scope: Scope,
        config: &ScopeLimit,
        strategy: RateLimitStrategy,
        store: &Arc<dyn CounterStore>,
    ) -> Result<Self, RateLimitError> {
        let window = parse_duration(&config.window)?;
        let limiter = strategy.build(store.clone(), config.limit, window)?;
        let window_header = HeaderValue::from_str(&config.window).map_err(|_| {
            RateLimitError::config(format!("{scope} window '{}' is not a valid header", config.window))
        })?;

        Ok(Self {
            scope,
            limit: config.limit,
            window: config.window.clone(),
            retry_after_secs: window.as_secs().max(1),
            limiter,
            limit_header: HeaderValue::from(config.limit),
            window_header,
        })
    }

    fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, self.limit_header.clone());
        headers.insert(X_RATELIMIT_WINDOW, self.window_header.clone());
    }

    fn deny(&self) -> Response {
        let body = json!({
            "error": "Rate limit exceeded",
            "message": format!("Too many requests. Limit: {} per {}", self.limit, self.window),
            "retry_after": self.retry_after_secs,
        });

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        self.apply_headers(headers);
        headers.insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        response
    }
}

/// Shared state for [`rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimitState {
    scopes: Arc<Vec<ScopeLimiter>>,
}

impl std::fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.scopes
                    .iter()
                    .map(|s| format!("{}: {} per {}", s.scope, s.limit, s.window)),
            )
            .finish()
    }
}

impl RateLimitState {
    /// Build one limiter per enabled scope.
    ///
    /// Windows and limits are validated here so a bad configuration fails at
    /// startup instead of on the first request.
    pub fn new(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let candidates = [
            (Scope::Global, &config.global),
            (Scope::Ip, &config.per_ip),
            (Scope::User, &config.per_user),
            (Scope::Tenant, &config.per_tenant),
        ];

        let scopes = candidates
            .into_iter()
            .filter(|(_, limit)| limit.enabled)
            .map(|(scope, limit)| ScopeLimiter::build(scope, limit, config.strategy, &store))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            scopes: Arc::new(scopes),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

/// Axum middleware enforcing [`RateLimitState`]; use with
/// `axum::middleware::from_fn_with_state`.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let identity = request
        .extensions()
        .get::<RequestIdentity>()
        .cloned()
        .unwrap_or_default();
    let ip = client_ip(&request);

    let mut last_checked = None;
    for scope in state.scopes.iter() {
        let subject = match scope.scope {
            Scope::Global => Some("global"),
            Scope::Ip => ip.as_deref(),
            Scope::User => identity.user_id.as_deref(),
            Scope::Tenant => identity.tenant_id.as_deref(),
        };
        let Some(subject) = subject.filter(|s| !s.is_empty()) else {
            continue;
        };

        match scope.limiter.allow(&format!("{}:{subject}", scope.scope)).await {
            Ok(true) => last_checked = Some(scope),
            Ok(false) => {
                warn!(
                    scope = %scope.scope,
                    key = %subject,
                    limit = scope.limit,
                    window = %scope.window,
                    "Rate limit exceeded"
                );
                return scope.deny();
            }
            Err(e) => {
                error!(scope = %scope.scope, key = %subject, error = %e, "Rate limit check failed, allowing request");
            }
        }
    }

    let mut response = next.run(request).await;
    if let Some(scope) = last_checked {
        scope.apply_headers(response.headers_mut());
    }
    response
}
