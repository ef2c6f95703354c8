//! Decision API for callers that are not in-process.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{FromRequest, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn, Span};

use crate::error::Result;
use crate::gate::{ClientIp, Identify, RateLimitHeaders, RequestInfo};
use crate::ratelimit::{Decision, EndpointLimits, LimitConfig, RateLimiter};

/// Shared state for the decision API.
#[derive(Clone)]
pub struct ServiceState {
    limiter: RateLimiter,
    limits: Arc<RwLock<EndpointLimits>>,
    identifier: Arc<dyn Identify>,
}

impl ServiceState {
    pub fn new(limiter: RateLimiter, limits: EndpointLimits) -> Self {
        Self {
            limiter,
            limits: Arc::new(RwLock::new(limits)),
            identifier: Arc::new(ClientIp::new()),
        }
    }

    /// Identify callers that omit `identifier` with `identifier` instead of
    /// the default client address strategy.
    pub fn with_identifier(mut self, identifier: impl Identify + 'static) -> Self {
        self.identifier = Arc::new(identifier);
        self
    }

    /// Replace the endpoint limits. In-flight windows keep their records;
    /// the new limit applies from the next check. Invalid limits are
    /// rejected and the current ones stay in place.
    pub fn set_limits(&self, limits: EndpointLimits) -> Result<()> {
        limits.validate()?;
        *self.limits.write() = limits;
        Ok(())
    }

    /// Get the current endpoint limits.
    pub fn limits(&self) -> EndpointLimits {
        self.limits.read().clone()
    }

    fn find_limit(&self, endpoint: &str) -> Option<LimitConfig> {
        self.limits.read().find(endpoint).copied()
    }
}

/// Body of `POST /v1/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Defaults to the identity of the calling request, e.g. the client
    /// address a forwarding proxy passes along
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    pub endpoint: String,
}

/// Response of `POST /v1/check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub limit: u64,
    #[serde(flatten)]
    pub decision: Decision,
}

/// An API error rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

/// Build the service router.
pub fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/limits", get(list_limits))
        .route("/v1/check", post(check))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn list_limits(State(state): State<ServiceState>) -> Json<BTreeMap<String, LimitConfig>> {
    let current = state.limits();
    let mut limits: BTreeMap<String, LimitConfig> = current
        .endpoints
        .into_iter()
        .collect();
    if let Some(default) = current.default {
        limits.insert("*".to_string(), default);
    }
    Json(limits)
}

/// Decide whether `identifier` may call `endpoint`, consuming quota.
///
/// Over-limit is a normal 200 response with `allowed: false`; the caller
/// decides how to turn the request away.
#[instrument(skip_all, fields(endpoint = tracing::field::Empty))]
async fn check(
    State(state): State<ServiceState>,
    request: Request,
) -> std::result::Result<Response, ApiError> {
    let caller = state.identifier.identify(&RequestInfo::from_request(&request));
    let Json(request) = Json::<CheckRequest>::from_request(request, &())
        .await
        .map_err(|e| ApiError::invalid_argument(e.body_text()))?;
    let identifier = request.identifier.unwrap_or(caller);

    Span::current().record("endpoint", request.endpoint.as_str());
    debug!(identifier = %identifier, "Processing rate limit check");

    if identifier.is_empty() {
        warn!("Received rate limit check with empty identifier");
        return Err(ApiError::invalid_argument("identifier is required"));
    }
    if request.endpoint.is_empty() {
        warn!("Received rate limit check with empty endpoint");
        return Err(ApiError::invalid_argument("endpoint is required"));
    }

    let config = state.find_limit(&request.endpoint).ok_or_else(|| {
        ApiError::not_found(format!("no limit configured for endpoint '{}'", request.endpoint))
    })?;

    let decision = state
        .limiter
        .check(&identifier, &request.endpoint, &config)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    info!(
        endpoint = %request.endpoint,
        allowed = decision.allowed,
        remaining = decision.remaining,
        "Rate limit decision made"
    );

    let headers = RateLimitHeaders {
        limit: config.max_requests,
        remaining: decision.remaining,
        reset: decision.reset_at_unix_secs(),
    };
    let mut response = Json(CheckResponse {
        limit: config.max_requests,
        decision,
    })
    .into_response();
    headers.apply(response.headers_mut());

    Ok(response)
}
