//! Core fixed-window rate limiter.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::record::{WindowKey, WindowRecord};
use super::store::WindowStore;
use crate::error::{RateLimitError, Result};

/// `Decision::remaining` value meaning the quota could not be determined.
pub const REMAINING_UNKNOWN: i64 = -1;

/// Named window lengths for building limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeWindow {
    /// Length of this window in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        match self {
            TimeWindow::Second => 1_000,
            TimeWindow::Minute => 60_000,
            TimeWindow::Hour => 3_600_000,
            TimeWindow::Day => 86_400_000,
        }
    }
}

/// The limit applied to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Maximum requests admitted per window; zero rejects everything
    pub max_requests: u64,
    /// Window length in milliseconds
    pub window_duration_ms: u64,
}

impl LimitConfig {
    /// Create a limit of `max_requests` per `window_duration_ms`.
    pub fn new(max_requests: u64, window_duration_ms: u64) -> Self {
        Self {
            max_requests,
            window_duration_ms,
        }
    }

    /// Create a limit of `max_requests` per named window.
    pub fn per(max_requests: u64, window: TimeWindow) -> Self {
        Self::new(max_requests, window.duration_ms())
    }

    /// Reject limits that can never be enforced.
    pub fn validate(&self) -> Result<()> {
        if self.window_duration_ms == 0 {
            return Err(RateLimitError::InvalidConfiguration(
                "window_duration_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// The outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the window, or `REMAINING_UNKNOWN`
    pub remaining: i64,
    /// When the window resets (ms since epoch)
    #[serde(rename = "resetAt")]
    pub reset_at_ms: u64,
    /// Seconds to wait before retrying; only set on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl Decision {
    fn allowed(remaining: u64, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: i64::try_from(remaining).unwrap_or(i64::MAX),
            reset_at_ms,
            retry_after_seconds: None,
        }
    }

    fn rejected(reset_at_ms: u64, now_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at_ms,
            retry_after_seconds: Some(ceil_seconds(reset_at_ms.saturating_sub(now_ms))),
        }
    }

    fn unknown(reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: REMAINING_UNKNOWN,
            reset_at_ms,
            retry_after_seconds: None,
        }
    }

    /// The reset time in Unix seconds, rounded up.
    pub fn reset_at_unix_secs(&self) -> u64 {
        ceil_seconds(self.reset_at_ms)
    }
}

fn ceil_seconds(ms: u64) -> u64 {
    ms.div_ceil(1_000)
}

/// The fixed-window decision for one request.
///
/// Returns the record to persist (`None` leaves the store untouched) and the
/// decision to report. Runs inside the store transaction.
fn decide(
    key: &WindowKey,
    current: Option<&WindowRecord>,
    now_ms: u64,
    config: &LimitConfig,
) -> (Option<WindowRecord>, Decision) {
    let window = config.window_duration_ms;

    match current {
        Some(record) if !record.is_expired(now_ms, window) => {
            let reset_at = record.reset_at_ms(window);

            if record.count >= config.max_requests {
                let touched = WindowRecord {
                    last_request_at_ms: now_ms,
                    ..record.clone()
                };
                (Some(touched), Decision::rejected(reset_at, now_ms))
            } else {
                let count = record.count + 1;
                let next = WindowRecord {
                    count,
                    last_request_at_ms: now_ms,
                    ..record.clone()
                };
                (
                    Some(next),
                    Decision::allowed(config.max_requests - count, reset_at),
                )
            }
        }
        _ => {
            let reset_at = now_ms.saturating_add(window);

            // A fresh window holds an implicit count of zero, which already
            // meets a zero limit.
            if config.max_requests == 0 {
                (None, Decision::rejected(reset_at, now_ms))
            } else {
                (
                    Some(WindowRecord::fresh(key, now_ms)),
                    Decision::allowed(config.max_requests - 1, reset_at),
                )
            }
        }
    }
}

/// Fixed-window rate limiter over a shared `WindowStore`.
///
/// Holds no per-request state; one instance can serve every request, or a
/// new one can be built per request.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter using wall-clock time.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit time source.
    pub fn with_clock(store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    /// Decide whether `identifier` may call `endpoint` under `config`.
    ///
    /// A rejection is an ordinary `Ok` decision. If the store fails for any
    /// reason the request is admitted with `remaining == REMAINING_UNKNOWN`:
    /// a store outage must not take the site down with it. Only an invalid
    /// `config` produces an error.
    pub async fn check(
        &self,
        identifier: &str,
        endpoint: &str,
        config: &LimitConfig,
    ) -> Result<Decision> {
        config.validate()?;

        let key = WindowKey::new(identifier, endpoint);
        trace!(key = %key, limit = config.max_requests, "Checking rate limit");

        let clock = &self.clock;
        let mut decision = None;
        let result = self
            .store
            .read_and_update(&key, &mut |current| {
                let (next, outcome) = decide(&key, current, clock.now_ms(), config);
                decision = Some(outcome);
                next
            })
            .await;

        match (result, decision) {
            (Ok(record), Some(decision)) => {
                if !decision.allowed {
                    debug!(
                        key = %key,
                        count = record.map(|r| r.count).unwrap_or(0),
                        limit = config.max_requests,
                        retry_after = ?decision.retry_after_seconds,
                        "Rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            (Ok(_), None) => {
                warn!(key = %key, "Store returned without running the update, failing open");
                Ok(self.fail_open(config))
            }
            (Err(err @ RateLimitError::InvalidConfiguration(_)), _) => Err(err),
            (Err(err), _) => {
                warn!(key = %key, error = %err, "Window store unavailable, failing open");
                Ok(self.fail_open(config))
            }
        }
    }

    fn fail_open(&self, config: &LimitConfig) -> Decision {
        Decision::unknown(self.clock.now_ms().saturating_add(config.window_duration_ms))
    }
}
