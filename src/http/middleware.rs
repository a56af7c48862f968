//! Tower middleware enforcing one operation class on the routes it wraps.
//!
//! Every response that went through a decision carries `X-RateLimit-Limit`,
//! `X-RateLimit-Remaining` and `X-RateLimit-Reset` (epoch seconds). Rejected
//! requests get a 429 with a JSON body and `Retry-After`.
//!
//! The middleware fails open: a decision that errors or does not finish within
//! the configured timeout lets the request through without headers. The same
//! timeout bounds identity resolution, which falls back to an anonymous caller.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::RETRY_AFTER;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::{error, warn};

use crate::audit::{ViolationRecord, ViolationReporter};
use crate::config::Environment;
use crate::error::{GatekeeperError, Result};
use crate::metrics::{ADMITTED_TOTAL, DECISION_SECONDS, DENIED_TOTAL, FAIL_OPEN_TOTAL};
use crate::ratelimit::{Admission, AdmissionEngine, Verdict};

pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
pub const POLICY_NOT_FOUND: &str = "POLICY_NOT_FOUND";

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// The authenticated principal of a request, inserted as an extension by an
/// upstream auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Resolves the authenticated user id of a request, if any.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, request: &Parts) -> Result<Option<String>>;
}

/// Reads [`AuthenticatedUser`] from the request extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionIdentity;

#[async_trait]
impl IdentityResolver for ExtensionIdentity {
    async fn resolve(&self, request: &Parts) -> Result<Option<String>> {
        Ok(request
            .extensions
            .get::<AuthenticatedUser>()
            .map(|AuthenticatedUser(id)| id.clone()))
    }
}

/// Shared state of every rate limit layer in a router.
#[derive(Clone)]
pub struct RateLimitState {
    engine: Arc<AdmissionEngine>,
    reporter: ViolationReporter,
    resolver: Arc<dyn IdentityResolver>,
    timeout: Duration,
    environment: Environment,
}

enum Decision {
    Admitted(Admission),
    Denied(Admission),
    PolicyMissing(String),
    FailOpen,
}

impl RateLimitState {
    pub fn new(engine: Arc<AdmissionEngine>, reporter: ViolationReporter) -> Self {
        Self {
            engine,
            reporter,
            resolver: Arc::new(ExtensionIdentity),
            timeout: Duration::from_millis(50),
            environment: Environment::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// A layer enforcing `class` on whatever it wraps.
    pub fn layer(&self, class: &str) -> RateLimitLayer {
        RateLimitLayer {
            state: self.clone(),
            class: Arc::from(class),
        }
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    async fn resolve_user(&self, parts: &Parts) -> Option<String> {
        let outcome = tokio::time::timeout(self.timeout, self.resolver.resolve(parts))
            .await
            .unwrap_or_else(|_| Err(GatekeeperError::Timeout(self.timeout)));

        match outcome {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!(error = %e, "Identity resolution failed, treating caller as anonymous");
                None
            }
        }
    }

    async fn decide(&self, parts: &Parts, class: &str) -> Decision {
        let user_id = self.resolve_user(parts).await;

        let timer = DECISION_SECONDS.start_timer();
        let outcome =
            tokio::time::timeout(self.timeout, self.engine.decide(parts, class, user_id.as_deref()))
                .await
                .unwrap_or_else(|_| Err(GatekeeperError::Timeout(self.timeout)));
        timer.observe_duration();

        match outcome {
            Ok(admission) if admission.allowed() => {
                ADMITTED_TOTAL.inc();
                Decision::Admitted(admission)
            }
            Ok(admission) => {
                DENIED_TOTAL.inc();
                Decision::Denied(admission)
            }
            Err(GatekeeperError::UnknownPolicy(class)) => {
                if self.environment.is_development() {
                    error!(class = %class, "No rate limit policy registered");
                    return Decision::PolicyMissing(class);
                }
                error!(
                    class = %class,
                    "No rate limit policy registered, admitting request without a limit"
                );
                FAIL_OPEN_TOTAL.inc();
                Decision::FailOpen
            }
            Err(e) if e.is_configuration() => {
                error!(class = %class, error = %e, "Rate limit misconfigured, admitting request");
                FAIL_OPEN_TOTAL.inc();
                Decision::FailOpen
            }
            Err(e) => {
                warn!(
                    class = %class,
                    error = %e,
                    transient = e.is_transient(),
                    "Rate limit decision failed, admitting request"
                );
                FAIL_OPEN_TOTAL.inc();
                Decision::FailOpen
            }
        }
    }

    fn reject(&self, parts: &Parts, admission: Admission) -> Response {
        let origin = self.engine.identifier().identify_parts(parts, None);
        let record =
            ViolationRecord::from_parts(admission.client, admission.class.as_str(), parts, &origin);
        // Reporting runs in the background; the handle is not awaited.
        drop(self.reporter.report(record));

        rejection_response(&admission.verdict, &admission.policy.message)
    }
}

fn apply_quota_headers(headers: &mut HeaderMap, verdict: &Verdict) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(verdict.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(verdict.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(verdict.reset_at.timestamp()));
}

fn rejection_response(verdict: &Verdict, message: &str) -> Response {
    let retry_after = verdict.retry_after_secs(Utc::now());
    let body = serde_json::json!({
        "success": false,
        "error": {
            "code": RATE_LIMIT_EXCEEDED,
            "message": message,
            "retryAfter": retry_after,
        }
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    apply_quota_headers(headers, verdict);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn policy_not_found_response(class: &str) -> Response {
    let body = serde_json::json!({
        "success": false,
        "error": {
            "code": POLICY_NOT_FOUND,
            "message": format!("No rate limit policy registered for class '{}'", class),
        }
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/// A [`tower::Layer`] producing [`RateLimitService`]s for one operation class.
#[derive(Clone)]
pub struct RateLimitLayer {
    state: RateLimitState,
    class: Arc<str>,
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
            class: self.class.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: RateLimitState,
    class: Arc<str>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Use the instance that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let state = self.state.clone();
        let class = self.class.clone();

        Box::pin(async move {
            let (parts, body) = request.into_parts();

            match state.decide(&parts, &class).await {
                Decision::Admitted(admission) => {
                    let mut response = inner.call(Request::from_parts(parts, body)).await?;
                    apply_quota_headers(response.headers_mut(), &admission.verdict);
                    Ok(response)
                }
                Decision::Denied(admission) => Ok(state.reject(&parts, admission)),
                Decision::PolicyMissing(class) => Ok(policy_not_found_response(&class)),
                Decision::FailOpen => inner.call(Request::from_parts(parts, body)).await,
            }
        })
    }
}
