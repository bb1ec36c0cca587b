//! Resilience configuration and the process-wide registry built from it.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use mender_types::{MenderError, Result};

use crate::breaker::{BreakerConfig, BreakerOverrides, CircuitBreakerRegistry};
use crate::limiter::{RateLimitConfig, RateLimiterRegistry};

/// JSON-loadable settings for breakers and limiters.
///
/// ```json
/// {
///   "breaker": { "failure_threshold": 3, "reset_timeout": "30s" },
///   "services": {
///     "search": { "breaker": { "failure_threshold": 5 },
///                 "rate_limit": { "requests_per_minute": 30, "strategy": "queue" } }
///   }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub breaker: Option<BreakerOverrides>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl ResilienceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|e| MenderError::Config(format!("invalid resilience config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(MenderError::Config("breaker.failure_threshold must be > 0".into()));
        }
        if self.breaker.half_open_requests == 0 {
            return Err(MenderError::Config("breaker.half_open_requests must be > 0".into()));
        }
        for (name, service) in &self.services {
            if let Some(overrides) = &service.breaker {
                if overrides.failure_threshold == Some(0) {
                    return Err(MenderError::Config(format!(
                        "services.{name}.breaker.failure_threshold must be > 0"
                    )));
                }
                if overrides.half_open_requests == Some(0) {
                    return Err(MenderError::Config(format!(
                        "services.{name}.breaker.half_open_requests must be > 0"
                    )));
                }
            }
            if let Some(limit) = &service.rate_limit {
                if limit.requests_per_minute == 0 {
                    return Err(MenderError::Config(format!(
                        "services.{name}.rate_limit.requests_per_minute must be > 0"
                    )));
                }
                if limit.requests_per_day == Some(0) {
                    return Err(MenderError::Config(format!(
                        "services.{name}.rate_limit.requests_per_day must be > 0"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Breakers and limiters shared by every call site in the process.
///
/// Build once with [`Resilience::from_config`] and pass around by `Arc`;
/// tests construct their own isolated instances.
#[derive(Default)]
pub struct Resilience {
    pub breakers: std::sync::Arc<CircuitBreakerRegistry>,
    pub limiter: RateLimiterRegistry,
}

impl Resilience {
    pub fn from_config(config: &ResilienceConfig) -> Result<Self> {
        let breakers = CircuitBreakerRegistry::new(config.breaker.clone());
        let limiter = RateLimiterRegistry::new();
        for (name, service) in &config.services {
            if let Some(overrides) = &service.breaker {
                breakers.configure(name, overrides.clone());
            }
            if let Some(limit) = &service.rate_limit {
                limiter.configure(name, limit.clone())?;
            }
        }
        tracing::debug!(services = config.services.len(), "Resilience registry configured");
        Ok(Self {
            breakers: std::sync::Arc::new(breakers),
            limiter,
        })
    }

    /// Rate-limit, then circuit-break, a call to `service`.
    pub async fn call<T, F, Fut>(&self, service: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.limiter.acquire(service).await?;
        self.breakers.with_circuit_breaker(service, f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::LimitStrategy;
    use std::time::Duration;

    const SAMPLE: &str = r#"{
        "breaker": { "failure_threshold": 4, "reset_timeout": "10s" },
        "services": {
            "search": {
                "breaker": { "failure_threshold": 1 },
                "rate_limit": { "requests_per_minute": 1, "strategy": "fail" }
            },
            "mail": { "rate_limit": { "requests_per_minute": 20, "requests_per_day": 500 } }
        }
    }"#;

    #[test]
    fn parses_sample_config() {
        let config = ResilienceConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.breaker.failure_threshold, 4);
        assert_eq!(config.breaker.reset_timeout, Duration::from_secs(10));
        assert_eq!(config.breaker.half_open_requests, 1);

        let mail = config.services["mail"].rate_limit.clone().unwrap();
        assert_eq!(mail.requests_per_day, Some(500));
        assert_eq!(mail.strategy, LimitStrategy::Queue);
    }

    #[test]
    fn empty_object_uses_defaults() {
        let config = ResilienceConfig::from_json("{}").unwrap();
        assert_eq!(config, ResilienceConfig::default());
    }

    #[test]
    fn rejects_zero_rate() {
        let err = ResilienceConfig::from_json(
            r#"{"services": {"x": {"rate_limit": {"requests_per_minute": 0}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, MenderError::Config(_)));
    }

    #[test]
    fn rejects_zero_half_open_requests() {
        let err = ResilienceConfig::from_json(
            r#"{"breaker": {"failure_threshold": 1, "reset_timeout": 0, "half_open_requests": 0}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, MenderError::Config(_)));

        let err = ResilienceConfig::from_json(
            r#"{"services": {"x": {"breaker": {"half_open_requests": 0}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, MenderError::Config(m) if m.contains("services.x")));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ResilienceConfig::load(&path).unwrap();
        assert!(config.services.contains_key("search"));
    }

    #[tokio::test(start_paused = true)]
    async fn registry_applies_service_settings() {
        let config = ResilienceConfig::from_json(SAMPLE).unwrap();
        let resilience = Resilience::from_config(&config).unwrap();

        let first: Result<()> = resilience
            .call("search", || async { Err(MenderError::Other("down".into())) })
            .await;
        assert!(first.is_err());
        assert!(resilience.breakers.is_open("search"));

        let limited: Result<()> = resilience.call("search", || async { Ok(()) }).await;
        assert!(matches!(limited, Err(MenderError::RateLimitExceeded { .. })));
    }
}
