//! Configuration management for the Carib rate limiter.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};

use crate::error::{RateLimitError, Result};
use crate::gate::{ClientIp, DEFAULT_CLIENT_IP_HEADERS};
use crate::ratelimit::{
    Clock, EndpointLimits, MemoryVersionedBackend, MemoryWindowStore, OptimisticWindowStore,
    RetryPolicy, SweepConfig, WindowStore,
};

/// Prefix for environment overrides, e.g. `CARIB__SERVER__HTTP_ADDR`.
const ENV_PREFIX: &str = "CARIB";

/// Main configuration for the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaribConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Stale record sweeping
    #[serde(default)]
    pub sweep: SweepConfig,

    /// Per-endpoint limits
    #[serde(default = "EndpointLimits::carib_presets")]
    pub limits: EndpointLimits,

    /// Optional YAML file of endpoint limits, replacing `limits`
    #[serde(default)]
    pub limits_path: Option<String>,

    /// Re-read `limits_path` this often, in seconds
    #[serde(default)]
    pub limits_reload_interval_secs: Option<u64>,
}

impl Default for CaribConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            sweep: SweepConfig::default(),
            limits: EndpointLimits::carib_presets(),
            limits_path: None,
            limits_reload_interval_secs: None,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Forwarded-address headers trusted for caller identification, in order
    #[serde(default = "default_client_ip_headers")]
    pub client_ip_headers: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            client_ip_headers: default_client_ip_headers(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_client_ip_headers() -> Vec<String> {
    DEFAULT_CLIENT_IP_HEADERS.iter().map(|h| h.to_string()).collect()
}

impl ServerConfig {
    /// The caller identification strategy these settings describe.
    pub fn client_ip(&self) -> Result<ClientIp> {
        ClientIp::with_headers(&self.client_ip_headers)
    }
}

/// Which window store implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Per-key locked in-process map
    #[default]
    Memory,
    /// Compare-and-swap transactions with retry
    Optimistic,
}

/// Window store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Retry policy for the optimistic backend
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl StoreConfig {
    /// Construct the configured store.
    pub fn build(&self, clock: Arc<dyn Clock>) -> Arc<dyn WindowStore> {
        match self.backend {
            StoreBackend::Memory => Arc::new(MemoryWindowStore::new(clock)),
            StoreBackend::Optimistic => Arc::new(OptimisticWindowStore::with_retry(
                MemoryVersionedBackend::new(),
                clock,
                self.retry.clone(),
            )),
        }
    }
}

impl CaribConfig {
    /// Load configuration from an optional YAML file plus `CARIB__*`
    /// environment overrides, then resolve and validate endpoint limits.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        }
        let config: CaribConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.resolve()
    }

    /// Parse configuration from a YAML string, then resolve and validate.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: CaribConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(e.to_string()))?;
        config.resolve()
    }

    fn resolve(mut self) -> Result<Self> {
        if let Some(ref path) = self.limits_path {
            self.limits = EndpointLimits::from_file(path)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings that would fail on the request path.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        self.server.client_ip()?;
        if self.sweep.batch_limit == 0 {
            return Err(RateLimitError::Config(
                "sweep.batch_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimitConfig, ManualClock};

    #[test]
    fn test_defaults() {
        let config = CaribConfig::from_yaml("{}").unwrap();

        assert_eq!(config.server.http_addr, default_http_addr());
        assert_eq!(config.server.client_ip_headers.len(), 3);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.retry.max_attempts, 5);
        assert!(config.sweep.enabled);
        assert_eq!(config.limits, EndpointLimits::carib_presets());
    }

    #[test]
    fn test_default_matches_empty_yaml() {
        let parsed = CaribConfig::from_yaml("{}").unwrap();
        let default = CaribConfig::default();

        assert_eq!(parsed.limits, default.limits);
        assert_eq!(parsed.server.http_addr, default.server.http_addr);
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
  client_ip_headers: ["cf-connecting-ip"]
store:
  backend: optimistic
  retry:
    max_attempts: 8
sweep:
  interval_secs: 600
  max_age_ms: 7200000
limits:
  default:
    max_requests: 60
    window_duration_ms: 60000
  endpoints:
    chat:
      max_requests: 5
      window_duration_ms: 60000
"#;
        let config = CaribConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.store.backend, StoreBackend::Optimistic);
        assert_eq!(config.store.retry.max_attempts, 8);
        assert_eq!(config.store.retry.base_backoff_ms, 10);
        assert_eq!(config.sweep.interval_secs, 600);
        assert_eq!(config.sweep.batch_limit, 500);
        assert_eq!(config.limits.find("chat"), Some(&LimitConfig::new(5, 60_000)));
        assert_eq!(config.limits.find("other"), Some(&LimitConfig::new(60, 60_000)));
    }

    #[test]
    fn test_invalid_limit_fails_load() {
        let yaml = r#"
limits:
  endpoints:
    chat:
      max_requests: 5
      window_duration_ms: 0
"#;
        assert!(matches!(
            CaribConfig::from_yaml(yaml),
            Err(RateLimitError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_invalid_header_fails_load() {
        let yaml = r#"
server:
  client_ip_headers: ["not a header"]
"#;
        assert!(CaribConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_missing_limits_file_fails_load() {
        let yaml = r#"
limits_path: /nonexistent/carib-limits.yaml
"#;
        assert!(matches!(
            CaribConfig::from_yaml(yaml),
            Err(RateLimitError::Io(_))
        ));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = CaribConfig::load(None).unwrap();
        assert!(config.limits.find("chat").is_some());
    }

    #[test]
    fn test_sample_config_parses() {
        let config = CaribConfig::from_yaml(include_str!("../config/carib.yaml")).unwrap();

        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.limits, EndpointLimits::carib_presets());
    }

    #[tokio::test]
    async fn test_store_backends_build() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));

        for backend in [StoreBackend::Memory, StoreBackend::Optimistic] {
            let store = StoreConfig {
                backend,
                retry: RetryPolicy::default(),
            }
            .build(clock.clone());
            assert_eq!(store.record_count().await.unwrap(), 0);
        }
    }
}
