//! Request gate: the boundary between HTTP handling and the rate limiter.

mod guard;
mod identify;

pub use guard::{
    GateResult, RateLimitHeaders, Rejection, RequestGate, SkipPredicate, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use identify::{ClientIp, Identify, RequestInfo, DEFAULT_CLIENT_IP_HEADERS, UNKNOWN_IDENTIFIER};
