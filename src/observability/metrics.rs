//! # Metrics
//!
//! Metric names recorded by the registry and load balancer through the `metrics`
//! facade, and installation of the Prometheus exporter. Without an installed
//! recorder the macros are no-ops, which keeps the library usable in tests.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tracing::info;

use crate::core::error::{RouterError, RouterResult};
use crate::observability::config::MetricsConfig;

pub const REQUESTS_TOTAL: &str = "router_requests_total";
pub const REQUEST_FAILURES_TOTAL: &str = "router_request_failures_total";
pub const REQUEST_RETRIES_TOTAL: &str = "router_request_retries_total";
pub const REQUEST_DURATION_SECONDS: &str = "router_request_duration_seconds";
pub const CIRCUIT_REJECTIONS_TOTAL: &str = "router_circuit_rejections_total";
pub const CIRCUIT_OPENED_TOTAL: &str = "router_circuit_opened_total";
pub const NO_HEALTHY_INSTANCE_TOTAL: &str = "router_no_healthy_instance_total";
pub const ACTIVE_CONNECTIONS: &str = "router_active_connections";

pub const INSTANCES_REGISTERED_TOTAL: &str = "registry_instances_registered_total";
pub const INSTANCES_PURGED_TOTAL: &str = "registry_instances_purged_total";
pub const HEALTH_CHECK_FAILURES_TOTAL: &str = "registry_health_check_failures_total";

/// Install the Prometheus recorder and its scrape listener
///
/// Returns `Ok(false)` when disabled. Must be called from inside a tokio runtime.
pub fn install_prometheus(config: &MetricsConfig) -> RouterResult<bool> {
    if !config.prometheus_enabled {
        return Ok(false);
    }

    let addr: SocketAddr = config.listen_address.parse().map_err(|e| {
        RouterError::config(format!("Invalid metrics listen address '{}': {}", config.listen_address, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION_SECONDS.to_string()),
            &config.latency_buckets,
        )
        .map_err(|e| RouterError::config(format!("Failed to set histogram buckets: {}", e)))?
        .install()
        .map_err(|e| RouterError::config(format!("Failed to install Prometheus exporter: {}", e)))?;

    info!(address = %addr, "Prometheus exporter listening");
    Ok(true)
}
