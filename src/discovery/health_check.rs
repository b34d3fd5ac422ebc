//! # Health Check Probes
//!
//! Service-level health predicates run by `ServiceRegistry::run_health_checks`.
//! A check yields `Ok(true)` / `Ok(false)` for a definite verdict; an `Err` is
//! treated by the registry as "unhealthy" for every instance of the service.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::core::config::HealthCheckDefinition;
use crate::core::error::{RouterError, RouterResult};

/// Health check probe trait, one implementation per kind of service
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform the health check
    async fn check(&self) -> RouterResult<bool>;

    /// Probe type name for logging
    fn check_type(&self) -> &'static str;
}

/// HTTP GET probe
///
/// Healthy when the response status is one of `expected_status_codes`, or any
/// 2xx when that list is empty. Connection errors and timeouts are errors.
pub struct HttpHealthCheck {
    client: HttpClient,
    url: String,
    timeout: Duration,
    expected_status_codes: Vec<u16>,
}

impl HttpHealthCheck {
    /// Create a new HTTP probe with a 5 second timeout
    pub fn new(url: impl Into<String>) -> RouterResult<Self> {
        let client = HttpClient::builder()
            .build()
            .map_err(|e| RouterError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            timeout: Duration::from_secs(5),
            expected_status_codes: Vec::new(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expected_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.expected_status_codes = codes;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self) -> RouterResult<bool> {
        let response = match timeout(self.timeout, self.client.get(&self.url).send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(RouterError::HttpClient {
                    message: format!("GET {} failed: {}", self.url, e),
                })
            }
            Err(_) => {
                return Err(RouterError::HttpClient {
                    message: format!("GET {} timed out after {:?}", self.url, self.timeout),
                })
            }
        };

        let status = response.status();
        let healthy = if self.expected_status_codes.is_empty() {
            status.is_success()
        } else {
            self.expected_status_codes.contains(&status.as_u16())
        };

        debug!(url = %self.url, status = status.as_u16(), healthy, "HTTP health check completed");
        Ok(healthy)
    }

    fn check_type(&self) -> &'static str {
        "http"
    }
}

/// TCP connect probe
///
/// Healthy when a connection is established within the timeout. A refused or
/// timed-out connection is a definite `false`, not an error.
pub struct TcpHealthCheck {
    address: String,
    timeout: Duration,
}

impl TcpHealthCheck {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthCheck for TcpHealthCheck {
    async fn check(&self) -> RouterResult<bool> {
        let healthy = matches!(
            timeout(self.timeout, TcpStream::connect(&self.address)).await,
            Ok(Ok(_))
        );
        debug!(address = %self.address, healthy, "TCP health check completed");
        Ok(healthy)
    }

    fn check_type(&self) -> &'static str {
        "tcp"
    }
}

/// Build a probe from its configuration
pub fn create_health_check(definition: &HealthCheckDefinition) -> RouterResult<Arc<dyn HealthCheck>> {
    match definition {
        HealthCheckDefinition::Http { url, timeout, expected_status_codes } => {
            let check = HttpHealthCheck::new(url.clone())?
                .with_timeout(*timeout)
                .with_expected_status_codes(expected_status_codes.clone());
            Ok(Arc::new(check))
        }
        HealthCheckDefinition::Tcp { address, timeout } => {
            Ok(Arc::new(TcpHealthCheck::new(address.clone()).with_timeout(*timeout)))
        }
    }
}
