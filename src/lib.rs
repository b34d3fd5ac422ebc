//! # Service Router Library
//!
//! Service registry and client-side load balancer for routing internal requests
//! among horizontally scaled instances of named backend services.
//!
//! - `discovery` tracks instance liveness through registration, heartbeats,
//!   periodic health checks and inactivity cleanup
//! - `load_balancing` picks a healthy instance per request, retries with
//!   exponential backoff and keeps a circuit breaker per service
//!
//! ```no_run
//! use std::sync::Arc;
//! use service_router::{LoadBalancer, LoadBalancerConfig, ServiceRegistration, ServiceRegistry, UpstreamRequest};
//!
//! # async fn run() -> service_router::RouterResult<()> {
//! let registry = Arc::new(ServiceRegistry::with_defaults());
//! let id = registry.register_service(ServiceRegistration::new("pricing-svc", "10.0.0.5", 8080));
//! registry.update_heartbeat("pricing-svc", &id);
//!
//! let balancer = LoadBalancer::with_http(Arc::clone(&registry), LoadBalancerConfig::default())?;
//! let response = balancer.send_request("pricing-svc", &UpstreamRequest::get("/quote")).await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

/// Error types, configuration, shared data structures and the circuit breaker
pub mod core;

/// Instance registry, health checks and heartbeats
pub mod discovery;

/// Instance selection, retries and outbound transport
pub mod load_balancing;

/// Logging and metrics setup
pub mod observability;

pub use core::circuit_breaker::{CircuitState, ServiceStats, ServiceStatsSnapshot};
pub use core::config::{LoadBalancerConfig, RegistryConfig, RouterConfig, StrategyKind};
pub use core::error::{RouterError, RouterResult};
pub use core::types::{
    InstanceStatus, OverallStatus, ServiceHealth, ServiceInstance, ServiceRegistration, UpstreamRequest,
    UpstreamResponse,
};
pub use discovery::{spawn_heartbeat, HealthCheck, HeartbeatHandle, RegistryEvent, ServiceRegistry};
pub use load_balancing::{LoadBalancer, Transport};
