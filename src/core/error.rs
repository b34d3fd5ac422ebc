//! # Error Handling Module
//!
//! This module defines every error the registry and load balancer can surface, using the
//! `thiserror` crate for the `Display`/`Error` boilerplate.
//!
//! ## Error Taxonomy
//!
//! - `NoHealthyInstance` and `CircuitOpen` surface immediately, retrying would not help
//! - `Transport`, `Timeout` and `UpstreamStatus` are per-attempt failures that are retried
//!   internally and only surface once every attempt is exhausted
//! - Unknown name/id pairs on registry operations are *not* errors: those operations
//!   return `false` because they are routine races (an instance shutting down while a
//!   heartbeat is in flight)
//!
//! ## Rust Error Handling Concepts
//!
//! - `Result<T, E>` instead of exceptions, `?` for propagation
//! - Enum variants with named fields carry the context needed for logging
//! - `From` implementations let `?` convert library errors automatically

use thiserror::Error;

/// Main result type used throughout the router
pub type RouterResult<T> = Result<T, RouterError>;

/// Error types for the service registry and load balancer
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display`
/// with the specified message.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RouterError {
    /// The registry has zero eligible instances for the service
    #[error("No healthy instances available for service {service}")]
    NoHealthyInstance { service: String },

    /// The circuit breaker for the service is tripped
    #[error("Circuit breaker is open for service {service}")]
    CircuitOpen { service: String },

    /// Network level failure talking to an instance
    #[error("Transport failure for service {service}: {message}")]
    Transport { service: String, message: String },

    /// A single attempt exceeded the configured request timeout
    #[error("Request to service {service} timed out after {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },

    /// The instance answered with a non-2xx status
    #[error("Service {service} responded with status {status}")]
    UpstreamStatus { service: String, status: u16 },

    /// A health check predicate failed to produce a verdict
    #[error("Health check failed for service {service}: {message}")]
    HealthCheck { service: String, message: String },

    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// I/O errors (file operations, sockets, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors raised outside of a routed request
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl RouterError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a no-healthy-instance error
    pub fn no_healthy_instance<S: Into<String>>(service: S) -> Self {
        Self::NoHealthyInstance {
            service: service.into(),
        }
    }

    /// Create a circuit-open error
    pub fn circuit_open<S: Into<String>>(service: S) -> Self {
        Self::CircuitOpen {
            service: service.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::Transport {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Create a health check error
    pub fn health_check<S: Into<String>, M: Into<String>>(service: S, message: M) -> Self {
        Self::HealthCheck {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Check if this error is a per-attempt failure that the retry loop handles
    ///
    /// Breaker and selection failures are not retryable: the state that produced
    /// them will not change within a backoff window.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Timeout { .. }
                | Self::UpstreamStatus { .. }
                | Self::HttpClient { .. }
                | Self::Io { .. }
        )
    }

    /// Get a string representation of the error type for logs and metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NoHealthyInstance { .. } => "no_healthy_instance",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Transport { .. } => "transport_error",
            Self::Timeout { .. } => "timeout",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::HealthCheck { .. } => "health_check_error",
            Self::Configuration { .. } => "configuration_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }
}

impl From<std::io::Error> for RouterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for RouterError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for RouterError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid port: {}", port)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::RouterError::config(format!($($arg)*))
    };
}
