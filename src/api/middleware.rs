//! Axum middleware that gates a route through a `RequestGate`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use tracing::error;

use crate::error::{RateLimitError, Result};
use crate::gate::{RequestGate, RequestInfo, SkipPredicate};
use crate::ratelimit::{EndpointLimits, LimitConfig};

/// Everything the middleware needs to gate one route.
#[derive(Clone)]
pub struct EndpointGuard {
    gate: RequestGate,
    endpoint: Arc<str>,
    config: LimitConfig,
    skip: Option<Arc<SkipPredicate>>,
}

impl EndpointGuard {
    /// Guard `endpoint` with an explicit limit.
    pub fn new(gate: RequestGate, endpoint: &str, config: LimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            gate,
            endpoint: Arc::from(endpoint),
            config,
            skip: None,
        })
    }

    /// Guard `endpoint` with the limit configured for it in `limits`.
    ///
    /// Fails when there is no limit for the endpoint and no default, so a
    /// misconfigured route is caught when the router is built.
    pub fn from_limits(gate: RequestGate, limits: &EndpointLimits, endpoint: &str) -> Result<Self> {
        let config = limits.find(endpoint).copied().ok_or_else(|| {
            RateLimitError::InvalidConfiguration(format!(
                "no limit configured for endpoint '{}'",
                endpoint
            ))
        })?;
        Self::new(gate, endpoint, config)
    }

    /// Exempt requests matching `skip` from limiting.
    pub fn skip_when<F>(mut self, skip: F) -> Self
    where
        F: Fn(&RequestInfo<'_>) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }
}

/// Reject over-limit requests with 429 and decorate the rest with
/// rate limit headers.
///
/// Use with `axum::middleware::from_fn_with_state(guard, rate_limit)`.
pub async fn rate_limit(
    State(guard): State<EndpointGuard>,
    request: Request,
    next: Next,
) -> Response {
    let result = {
        let info = RequestInfo::from_request(&request);
        guard
            .gate
            .guard(&info, &guard.endpoint, &guard.config, guard.skip.as_deref())
            .await
    };

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            error!(endpoint = %guard.endpoint, error = %e, "Rate limit check failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Some(rejection) = result.rejection_response() {
        return rejection;
    }

    let mut response = next.run(request).await;
    if let Some(headers) = result.headers {
        headers.apply(response.headers_mut());
    }
    response
}
