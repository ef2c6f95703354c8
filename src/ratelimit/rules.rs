//! Per-endpoint limit table.
//!
//! The limiter itself is stateless with respect to configuration; callers
//! look up the limit for an endpoint here and pass it in.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::limiter::{LimitConfig, TimeWindow};
use crate::error::{RateLimitError, Result};

/// Limits keyed by endpoint name, with an optional fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointLimits {
    /// Limit for endpoints without an entry of their own
    #[serde(default)]
    pub default: Option<LimitConfig>,
    /// Map of endpoint name to limit
    #[serde(default)]
    pub endpoints: HashMap<String, LimitConfig>,
}

impl EndpointLimits {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits for the public Carib endpoints.
    pub fn carib_presets() -> Self {
        Self::new()
            .with_endpoint("chat", LimitConfig::per(20, TimeWindow::Minute))
            .with_endpoint("inquiry", LimitConfig::per(5, TimeWindow::Hour))
            .with_endpoint("subscribe", LimitConfig::per(3, TimeWindow::Hour))
            .with_endpoint("admin", LimitConfig::per(100, TimeWindow::Minute))
    }

    /// Add or replace the limit for an endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>, limit: LimitConfig) -> Self {
        self.endpoints.insert(endpoint.into(), limit);
        self
    }

    /// Set the fallback limit.
    pub fn with_default(mut self, limit: LimitConfig) -> Self {
        self.default = Some(limit);
        self
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading endpoint limits");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string. The result is validated.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let limits: EndpointLimits = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse endpoint limits: {}", e)))?;
        limits.validate()?;
        Ok(limits)
    }

    /// Check every entry once, so bad limits fail at startup rather than
    /// on the request path.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref limit) = self.default {
            limit.validate().map_err(|e| scoped("default", e))?;
        }
        for (endpoint, limit) in &self.endpoints {
            limit
                .validate()
                .map_err(|e| scoped(&format!("endpoint '{}'", endpoint), e))?;
        }
        Ok(())
    }

    /// The limit for `endpoint`, falling back to the default.
    pub fn find(&self, endpoint: &str) -> Option<&LimitConfig> {
        self.endpoints.get(endpoint).or(self.default.as_ref())
    }
}

fn scoped(scope: &str, err: RateLimitError) -> RateLimitError {
    match err {
        RateLimitError::InvalidConfiguration(reason) => {
            RateLimitError::InvalidConfiguration(format!("{}: {}", scope, reason))
        }
        other => other,
    }
}
