//! Per-request gate: identify, check, and translate into a response contract.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::StatusCode;
use serde::Serialize;
use tracing::debug;

use super::identify::{ClientIp, Identify, RequestInfo};
use crate::error::Result;
use crate::ratelimit::{Decision, LimitConfig, RateLimiter};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Predicate that exempts a request from limiting entirely.
pub type SkipPredicate = dyn Fn(&RequestInfo<'_>) -> bool + Send + Sync;

/// The standard rate limit response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    /// `-1` when the store could not be consulted
    pub remaining: i64,
    /// Window reset in Unix seconds
    pub reset: u64,
}

impl RateLimitHeaders {
    fn from_decision(config: &LimitConfig, decision: &Decision) -> Self {
        Self {
            limit: config.max_requests,
            remaining: decision.remaining,
            reset: decision.reset_at_unix_secs(),
        }
    }

    /// Write `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset));
    }
}

/// Why and for how long a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub retry_after_seconds: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody {
    error: &'static str,
    message: String,
    retry_after_seconds: u64,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = RejectionBody {
            error: "too_many_requests",
            message: format!(
                "Too many requests. Please try again in {} seconds.",
                self.retry_after_seconds
            ),
            retry_after_seconds: self.retry_after_seconds,
        };

        let mut response = (self.status, Json(body)).into_response();
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(self.retry_after_seconds));
        response
    }
}

/// What the HTTP layer should do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    pub proceed: bool,
    /// Absent when the request was skipped
    pub headers: Option<RateLimitHeaders>,
    /// Present only when `proceed` is false
    pub rejection: Option<Rejection>,
}

impl GateResult {
    fn skipped() -> Self {
        Self {
            proceed: true,
            headers: None,
            rejection: None,
        }
    }

    /// The full 429 response for a rejected request, headers included.
    pub fn rejection_response(&self) -> Option<Response> {
        let mut response = self.rejection?.into_response();
        if let Some(headers) = self.headers {
            headers.apply(response.headers_mut());
        }
        Some(response)
    }
}

/// Boundary glue between the HTTP layer and the `RateLimiter`.
#[derive(Clone)]
pub struct RequestGate {
    limiter: RateLimiter,
    identifier: Arc<dyn Identify>,
}

impl RequestGate {
    /// Create a gate that identifies callers by client address.
    pub fn new(limiter: RateLimiter) -> Self {
        Self::with_identifier(limiter, ClientIp::new())
    }

    /// Create a gate with a custom identification strategy.
    pub fn with_identifier(limiter: RateLimiter, identifier: impl Identify + 'static) -> Self {
        Self {
            limiter,
            identifier: Arc::new(identifier),
        }
    }

    /// Get the rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The identifier `request` is counted against.
    pub fn identify(&self, request: &RequestInfo<'_>) -> String {
        self.identifier.identify(request)
    }

    /// Gate one request against `endpoint`.
    ///
    /// A skipped request proceeds without consuming quota or computing
    /// headers. A rejection is reported in the result, not as an error.
    pub async fn guard(
        &self,
        request: &RequestInfo<'_>,
        endpoint: &str,
        config: &LimitConfig,
        skip: Option<&SkipPredicate>,
    ) -> Result<GateResult> {
        if skip.is_some_and(|skip| skip(request)) {
            debug!(endpoint = %endpoint, "Rate limiting skipped");
            return Ok(GateResult::skipped());
        }

        let identifier = self.identify(request);
        let decision = self.limiter.check(&identifier, endpoint, config).await?;
        let headers = RateLimitHeaders::from_decision(config, &decision);

        let rejection = (!decision.allowed).then(|| Rejection {
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after_seconds: decision.retry_after_seconds.unwrap_or(0),
        });

        Ok(GateResult {
            proceed: decision.allowed,
            headers: Some(headers),
            rejection,
        })
    }
}
