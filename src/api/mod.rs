//! HTTP API: route middleware and the decision service.

mod middleware;
mod server;
mod service;

pub use middleware::{rate_limit, EndpointGuard};
pub use server::HttpServer;
pub use service::{router, ApiError, CheckRequest, CheckResponse, ServiceState};
