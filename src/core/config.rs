//! # Configuration Module
//!
//! Configuration structures for the registry, the load balancer and the daemon,
//! plus the loading pipeline: parse YAML/JSON with serde, apply environment
//! variable overrides, then validate.
//!
//! Durations are written in human-readable form (`"5s"`, `"250ms"`) through
//! `humantime-serde`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{RouterError, RouterResult};
use crate::core::types::{Metadata, ServiceRegistration};
use crate::observability::config::{LogFormat, ObservabilityConfig};

/// Complete configuration for the router daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Registry timing (grace period, freshness, timers)
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Load balancer resilience settings
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    /// Logging and metrics
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Statically declared services registered at startup
    #[serde(default)]
    pub services: Vec<StaticServiceConfig>,
}

impl RouterConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> RouterResult<Self> {
        let content = tokio::fs::read_to_string(path).await
            .map_err(|e| RouterError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: RouterConfig = serde_yaml::from_str(&content)
            .map_err(|e| RouterError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> RouterResult<Self> {
        let content = tokio::fs::read_to_string(path).await
            .map_err(|e| RouterError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: RouterConfig = serde_json::from_str(&content)
            .map_err(|e| RouterError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern `ROUTER_<SECTION>_<FIELD>`,
    /// for example `ROUTER_LB_RETRY_ATTEMPTS=2`.
    pub fn apply_env_overrides(&mut self) -> RouterResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> RouterResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(strategy) = lookup("ROUTER_LB_STRATEGY") {
            self.load_balancer.strategy = strategy.parse()?;
        }

        if let Some(timeout) = lookup("ROUTER_LB_TIMEOUT") {
            self.load_balancer.timeout = parse_duration_var("ROUTER_LB_TIMEOUT", &timeout)?;
        }

        if let Some(attempts) = lookup("ROUTER_LB_RETRY_ATTEMPTS") {
            self.load_balancer.retry_attempts = attempts.parse()
                .map_err(|e| RouterError::config(format!("Invalid ROUTER_LB_RETRY_ATTEMPTS: {}", e)))?;
        }

        if let Some(threshold) = lookup("ROUTER_LB_CIRCUIT_BREAKER_THRESHOLD") {
            self.load_balancer.circuit_breaker_threshold = threshold.parse()
                .map_err(|e| RouterError::config(format!("Invalid ROUTER_LB_CIRCUIT_BREAKER_THRESHOLD: {}", e)))?;
        }

        if let Some(timeout) = lookup("ROUTER_LB_CIRCUIT_BREAKER_TIMEOUT") {
            self.load_balancer.circuit_breaker_timeout =
                parse_duration_var("ROUTER_LB_CIRCUIT_BREAKER_TIMEOUT", &timeout)?;
        }

        if let Some(interval) = lookup("ROUTER_HEALTH_CHECK_INTERVAL") {
            self.registry.health_check_interval = parse_duration_var("ROUTER_HEALTH_CHECK_INTERVAL", &interval)?;
        }

        if let Some(interval) = lookup("ROUTER_CLEANUP_INTERVAL") {
            self.registry.cleanup_interval = parse_duration_var("ROUTER_CLEANUP_INTERVAL", &interval)?;
        }

        if let Some(level) = lookup("ROUTER_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Some(format) = lookup("ROUTER_LOG_FORMAT") {
            self.observability.logging.format = format.parse()?;
        }

        Ok(())
    }

    /// Configuration validation collecting every problem into one error
    pub fn validate(&self) -> RouterResult<()> {
        let mut errors = Vec::new();

        errors.extend(self.registry.problems());
        errors.extend(self.load_balancer.problems());

        for (index, service) in self.services.iter().enumerate() {
            if service.name.trim().is_empty() {
                errors.push(format!("services[{}].name cannot be empty", index));
            }
            if service.instances.is_empty() {
                errors.push(format!("service '{}' must declare at least one instance", service.name));
            }
            for instance in &service.instances {
                if instance.host.is_empty() {
                    errors.push(format!("service '{}' has an instance with an empty host", service.name));
                }
                if instance.port == 0 {
                    errors.push(format!("service '{}' has an instance with port 0", service.name));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RouterError::config(errors.join("; ")))
        }
    }
}

fn parse_duration_var(key: &str, value: &str) -> RouterResult<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| RouterError::config(format!("Invalid {}: {}", key, e)))
}

/// Registry timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Delay before a `starting` instance becomes `healthy`
    #[serde(with = "humantime_serde")]
    pub startup_grace_period: Duration,

    /// Maximum heartbeat age for an instance to be routable
    #[serde(with = "humantime_serde")]
    pub heartbeat_freshness: Duration,

    /// Period of the health check timer
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Period of the inactivity cleanup timer
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Heartbeat age after which cleanup purges an instance
    #[serde(with = "humantime_serde")]
    pub max_inactive_age: Duration,

    /// How often owned instances send heartbeats
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Capacity of the registry event channel
    pub event_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            startup_grace_period: Duration::from_secs(5),
            heartbeat_freshness: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            max_inactive_age: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            event_buffer: 1024,
        }
    }
}

impl RegistryConfig {
    fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.heartbeat_freshness.is_zero() {
            errors.push("registry.heartbeat_freshness must be greater than 0".to_string());
        }
        if self.max_inactive_age < self.heartbeat_freshness {
            errors.push("registry.max_inactive_age must not be shorter than heartbeat_freshness".to_string());
        }
        if self.health_check_interval.is_zero() {
            errors.push("registry.health_check_interval must be greater than 0".to_string());
        }
        if self.cleanup_interval.is_zero() {
            errors.push("registry.cleanup_interval must be greater than 0".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            errors.push("registry.heartbeat_interval must be greater than 0".to_string());
        }
        if self.event_buffer == 0 {
            errors.push("registry.event_buffer must be greater than 0".to_string());
        }
        errors
    }
}

/// Instance selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    /// Uniform random pick among healthy instances
    Random,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round-robin",
            StrategyKind::LeastConnections => "least-connections",
            StrategyKind::WeightedRoundRobin => "weighted-round-robin",
            StrategyKind::Random => "random",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(StrategyKind::RoundRobin),
            "least-connections" => Ok(StrategyKind::LeastConnections),
            "weighted-round-robin" => Ok(StrategyKind::WeightedRoundRobin),
            "random" => Ok(StrategyKind::Random),
            other => Err(RouterError::config(format!("Unknown load balancing strategy: {}", other))),
        }
    }
}

/// Load balancer configuration, immutable after construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: StrategyKind,

    /// Per-attempt request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Retries after the first attempt
    pub retry_attempts: u32,

    /// Consecutive failures that open the breaker
    pub circuit_breaker_threshold: u32,

    /// Cooldown before a half-open probe is admitted
    #[serde(with = "humantime_serde")]
    pub circuit_breaker_timeout: Duration,

    /// Backoff before retry `n` is `retry_base_delay * 2^n`
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RoundRobin,
            timeout: Duration::from_secs(5),
            retry_attempts: 3,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl LoadBalancerConfig {
    /// Backoff to wait after failed attempt `attempt` (0-indexed)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_base_delay.saturating_mul(factor)
    }

    /// Worst-case time `send_request` can take before returning control
    pub fn worst_case_latency(&self) -> Duration {
        let attempts = self.retry_attempts.saturating_add(1);
        let mut total = self.timeout.saturating_mul(attempts);
        for attempt in 0..self.retry_attempts {
            total = total.saturating_add(self.backoff_for(attempt));
        }
        total
    }

    fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.timeout.is_zero() {
            errors.push("load_balancer.timeout must be greater than 0".to_string());
        }
        if self.circuit_breaker_threshold == 0 {
            errors.push("load_balancer.circuit_breaker_threshold must be at least 1".to_string());
        }
        if self.retry_base_delay.is_zero() && self.retry_attempts > 0 {
            errors.push("load_balancer.retry_base_delay must be greater than 0 when retries are enabled".to_string());
        }
        errors
    }
}

/// A statically declared logical service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticServiceConfig {
    pub name: String,

    #[serde(default)]
    pub instances: Vec<StaticInstanceConfig>,

    /// Optional periodic health check for the whole service
    #[serde(default)]
    pub health_check: Option<HealthCheckDefinition>,
}

impl StaticServiceConfig {
    /// Registration requests for every declared instance
    pub fn registrations(&self) -> Vec<ServiceRegistration> {
        self.instances
            .iter()
            .map(|instance| ServiceRegistration {
                name: self.name.clone(),
                host: instance.host.clone(),
                port: instance.port,
                metadata: instance.metadata.clone(),
            })
            .collect()
    }
}

/// A statically declared instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticInstanceConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Health check declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheckDefinition {
    /// HTTP GET, healthy on an expected status (any 2xx when none listed)
    Http {
        url: String,
        #[serde(default = "default_check_timeout", with = "humantime_serde")]
        timeout: Duration,
        #[serde(default)]
        expected_status_codes: Vec<u16>,
    },
    /// TCP connect
    Tcp {
        address: String,
        #[serde(default = "default_check_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(5)
}
