//! # Core Types Module
//!
//! Foundational data structures shared by the registry and the load balancer:
//! service instances and their health, aggregate health views, and the
//! transport-neutral request/response pair used by `LoadBalancer::send_request`.
//!
//! ## Ownership
//!
//! `ServiceInstance` values are owned by the `ServiceRegistry`. Every read API hands
//! out clones (snapshots), so the load balancer can never mutate registry state
//! directly.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::error::RouterResult;

/// Opaque key/value bag attached to an instance at registration
pub type Metadata = HashMap<String, serde_json::Value>;

/// Health status of a single service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Registered, still inside its startup grace period
    Starting,
    /// Ready to receive traffic
    Healthy,
    /// Out of rotation until a heartbeat or a passing health check
    Unhealthy,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Healthy => write!(f, "healthy"),
            InstanceStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Aggregate status of a logical service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    /// Some, but not all, instances are unhealthy
    Degraded,
    /// Every instance is unhealthy
    Unhealthy,
}

impl OverallStatus {
    /// Aggregate instance statuses into a service-level status
    ///
    /// Only `unhealthy` instances count against the service; `starting`
    /// instances are neither healthy nor unhealthy for this purpose.
    pub fn aggregate<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a InstanceStatus>,
    {
        let mut total = 0usize;
        let mut unhealthy = 0usize;
        for status in statuses {
            total += 1;
            if *status == InstanceStatus::Unhealthy {
                unhealthy += 1;
            }
        }

        if unhealthy > 0 && unhealthy == total {
            OverallStatus::Unhealthy
        } else if unhealthy > 0 {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::Healthy => write!(f, "healthy"),
            OverallStatus::Degraded => write!(f, "degraded"),
            OverallStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Registration request for a new instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One running process of a logical service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInstance {
    /// Unique per registration
    pub id: String,

    /// Logical service group
    pub name: String,

    pub host: String,

    pub port: u16,

    pub status: InstanceStatus,

    /// Metadata set at registration
    pub metadata: Metadata,

    /// Wall-clock registration time, for dashboards
    pub registered_at: DateTime<Utc>,

    /// Wall-clock time of the last liveness confirmation, for dashboards
    pub last_heartbeat_at: DateTime<Utc>,

    /// Monotonic registration instant (skip serialization for Instant)
    #[serde(skip)]
    pub registered: Instant,

    /// Monotonic last liveness confirmation
    #[serde(skip)]
    pub last_heartbeat: Instant,
}

impl ServiceInstance {
    /// Create a new instance in `starting` state with a fresh heartbeat
    ///
    /// Ids are `<name>-<uuid v4>`, unique regardless of clock behaviour.
    pub fn new(registration: ServiceRegistration) -> Self {
        let now = Instant::now();
        let wall = Utc::now();
        Self {
            id: format!("{}-{}", registration.name, Uuid::new_v4()),
            name: registration.name,
            host: registration.host,
            port: registration.port,
            status: InstanceStatus::Starting,
            metadata: registration.metadata,
            registered_at: wall,
            last_heartbeat_at: wall,
            registered: now,
            last_heartbeat: now,
        }
    }

    /// Base URL requests to this instance are sent to
    pub fn base_url(&self) -> String {
        // IPv6 literals need brackets in a URL authority
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    /// Check if instance is marked healthy
    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }

    /// Age of the last heartbeat relative to `now`
    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    /// Whether the last heartbeat falls inside the freshness window
    pub fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        self.heartbeat_age(now) < window
    }

    /// Eligible for routing: healthy and fresh
    pub fn is_routable(&self, now: Instant, window: Duration) -> bool {
        self.is_healthy() && self.is_fresh(now, window)
    }

    /// Load balancing weight from the `weight` metadata entry (default 1, minimum 1)
    pub fn weight(&self) -> u32 {
        self.metadata
            .get("weight")
            .and_then(|value| value.as_u64())
            .map(|weight| weight.clamp(1, u32::MAX as u64) as u32)
            .unwrap_or(1)
    }

    /// Record a heartbeat at `now`
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_heartbeat = now;
        self.last_heartbeat_at = Utc::now();
    }
}

/// Aggregate health view of one logical service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub instances: Vec<ServiceInstance>,
    pub overall_status: OverallStatus,
}

/// Request routed through the load balancer
///
/// The target host and port are filled in by the balancer; callers only
/// describe the method, path, headers and body.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,

    /// Path including any query string, e.g. `/api/invoices?page=2`
    pub path: String,

    pub headers: HeaderMap,

    pub body: Option<Bytes>,
}

impl UpstreamRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type
    pub fn with_json<T: Serialize>(mut self, value: &T) -> RouterResult<Self> {
        let body = serde_json::to_vec(value)?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(body));
        Ok(self)
    }

    /// Absolute URL for this request against `base_url`
    pub fn url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if self.path.is_empty() {
            base.to_string()
        } else if self.path.starts_with('/') {
            format!("{}{}", base, self.path)
        } else {
            format!("{}/{}", base, self.path)
        }
    }
}

/// Response returned by the selected instance
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Empty-bodied response with the given status
    pub fn with_status(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> RouterResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
