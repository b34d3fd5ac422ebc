//! # Load Balancer
//!
//! Routes a request for a logical service to one healthy instance, retries
//! failed attempts with exponential backoff and keeps a circuit breaker per
//! service name.
//!
//! ## Request flow
//!
//! 1. Ask the service's breaker for admission; an open breaker fails fast
//! 2. Take the healthy, fresh candidates from the registry and let the
//!    configured strategy pick one
//! 3. Count the request as in flight (released by a drop guard on every path)
//! 4. Attempt up to `retry_attempts + 1` times, each bounded by `timeout`,
//!    sleeping `retry_base_delay * 2^attempt` between attempts
//! 5. Report the final outcome to the breaker
//!
//! The whole request goes to the instance chosen in step 2. Transport errors,
//! timeouts and non-2xx responses all count as failures.
//!
//! ## Locking
//!
//! Stats live in a `DashMap` of `Arc<Mutex<ServiceStats>>`. The mutex is only
//! held for the bookkeeping itself and never across an `.await`.

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::core::circuit_breaker::{Admission, CircuitState, ServiceStats, ServiceStatsSnapshot};
use crate::core::config::LoadBalancerConfig;
use crate::core::error::{RouterError, RouterResult};
use crate::core::types::{ServiceInstance, UpstreamRequest, UpstreamResponse};
use crate::discovery::service_registry::ServiceRegistry;
use crate::load_balancing::strategies::{create_strategy, BalancingStrategy, ConnectionTracker};
use crate::load_balancing::transport::{HttpTransport, Transport};
use crate::observability::metrics::{
    ACTIVE_CONNECTIONS, CIRCUIT_OPENED_TOTAL, CIRCUIT_REJECTIONS_TOTAL, NO_HEALTHY_INSTANCE_TOTAL,
    REQUESTS_TOTAL, REQUEST_DURATION_SECONDS, REQUEST_FAILURES_TOTAL, REQUEST_RETRIES_TOTAL,
};

type SharedStats = Arc<Mutex<ServiceStats>>;

/// Strategy-aware load balancer with retries and per-service circuit breakers
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    config: LoadBalancerConfig,
    transport: Arc<dyn Transport>,
    strategy: Box<dyn BalancingStrategy>,
    /// In-flight requests per instance id, shared with least-connections
    connections: Arc<ConnectionTracker>,
    stats: DashMap<String, SharedStats>,
}

impl LoadBalancer {
    /// Create a balancer that sends requests through `transport`
    pub fn new(registry: Arc<ServiceRegistry>, config: LoadBalancerConfig, transport: Arc<dyn Transport>) -> Self {
        let connections = Arc::new(ConnectionTracker::new());
        let strategy = create_strategy(config.strategy, Arc::clone(&connections));

        info!(
            strategy = strategy.name(),
            timeout_ms = config.timeout.as_millis() as u64,
            retry_attempts = config.retry_attempts,
            circuit_breaker_threshold = config.circuit_breaker_threshold,
            "Load balancer created"
        );

        Self {
            registry,
            config,
            transport,
            strategy,
            connections,
            stats: DashMap::new(),
        }
    }

    /// Create a balancer that speaks HTTP to the selected instances
    pub fn with_http(registry: Arc<ServiceRegistry>, config: LoadBalancerConfig) -> RouterResult<Self> {
        let transport = Arc::new(HttpTransport::new()?);
        Ok(Self::new(registry, config, transport))
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Pick an instance for `service_name` without sending anything
    ///
    /// Ignores the circuit breaker.
    pub fn select_instance(&self, service_name: &str) -> RouterResult<ServiceInstance> {
        let candidates = self.registry.get_healthy_instances(service_name);
        self.strategy
            .select(service_name, &candidates)
            .cloned()
            .ok_or_else(|| RouterError::no_healthy_instance(service_name))
    }

    /// Send `request` to a healthy instance of `service_name`
    pub async fn send_request(&self, service_name: &str, request: &UpstreamRequest) -> RouterResult<UpstreamResponse> {
        let stats = match self.existing_stats(service_name) {
            Some(stats) => stats,
            // No record means a closed breaker; only start one for services that resolve
            None if self.registry.get_healthy_instances(service_name).is_empty() => {
                return Err(self.no_healthy_instance(service_name));
            }
            None => self.stats_for(service_name),
        };
        let cooldown = self.config.circuit_breaker_timeout;

        let admission = stats.lock().admit(Instant::now(), cooldown);
        if admission == Admission::Rejected {
            counter!(CIRCUIT_REJECTIONS_TOTAL, "service" => service_name.to_string()).increment(1);
            debug!(service = %service_name, "Circuit breaker rejected request");
            return Err(RouterError::circuit_open(service_name));
        }
        let mut probe = ProbeGuard::new(&stats, admission);

        let instance = match self.select_instance(service_name) {
            Ok(instance) => instance,
            Err(_) => return Err(self.no_healthy_instance(service_name)),
        };

        if admission == Admission::Probe {
            info!(service = %service_name, instance_id = %instance.id, "Circuit breaker half-open, sending probe");
        }

        let _in_flight = InFlightGuard::acquire(
            Arc::clone(&stats),
            Arc::clone(&self.connections),
            service_name,
            &instance.id,
        );

        let started = Instant::now();
        let result = self.execute_with_retry(service_name, &instance, request).await;
        histogram!(REQUEST_DURATION_SECONDS, "service" => service_name.to_string())
            .record(started.elapsed().as_secs_f64());

        probe.disarm();
        match &result {
            Ok(response) => {
                let was_open = stats.lock().record_success();
                if was_open {
                    info!(service = %service_name, "Circuit breaker closed");
                }
                counter!(REQUESTS_TOTAL, "service" => service_name.to_string(), "outcome" => "success").increment(1);
                debug!(
                    service = %service_name,
                    instance_id = %instance.id,
                    status = response.status.as_u16(),
                    "Request succeeded"
                );
            }
            Err(e) => {
                let (opened, failures) = {
                    let mut stats = stats.lock();
                    let opened = stats.record_failure(Instant::now(), self.config.circuit_breaker_threshold);
                    (opened, stats.failures)
                };
                counter!(REQUESTS_TOTAL, "service" => service_name.to_string(), "outcome" => "failure").increment(1);
                counter!(
                    REQUEST_FAILURES_TOTAL,
                    "service" => service_name.to_string(),
                    "error_type" => e.error_type()
                )
                .increment(1);
                if opened {
                    counter!(CIRCUIT_OPENED_TOTAL, "service" => service_name.to_string()).increment(1);
                    warn!(service = %service_name, failures, "Circuit breaker opened");
                } else {
                    warn!(service = %service_name, failures, error = %e, "Request failed");
                }
            }
        }

        result
    }

    /// Attempt the request against `instance` until it succeeds or attempts run out
    async fn execute_with_retry(
        &self,
        service_name: &str,
        instance: &ServiceInstance,
        request: &UpstreamRequest,
    ) -> RouterResult<UpstreamResponse> {
        let base_url = instance.base_url();
        let max_attempts = self.config.retry_attempts.saturating_add(1);
        let mut attempt = 0;

        loop {
            let error = match self.attempt(service_name, &base_url, request).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if attempt + 1 >= max_attempts {
                return Err(error);
            }

            let delay = self.config.backoff_for(attempt);
            counter!(REQUEST_RETRIES_TOTAL, "service" => service_name.to_string()).increment(1);
            debug!(
                service = %service_name,
                instance_id = %instance.id,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, service_name: &str, base_url: &str, request: &UpstreamRequest) -> RouterResult<UpstreamResponse> {
        let response = match timeout(self.config.timeout, self.transport.send(base_url, request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(RouterError::transport(service_name, e.to_string())),
            Err(_) => {
                return Err(RouterError::Timeout {
                    service: service_name.to_string(),
                    timeout_ms: self.config.timeout.as_millis() as u64,
                })
            }
        };

        if response.is_success() {
            Ok(response)
        } else {
            Err(RouterError::UpstreamStatus {
                service: service_name.to_string(),
                status: response.status.as_u16(),
            })
        }
    }

    /// Snapshot of one service's stats, if it has ever been called
    pub fn get_service_stats(&self, service_name: &str) -> Option<ServiceStatsSnapshot> {
        let stats = self.existing_stats(service_name)?;
        let snapshot = stats.lock().snapshot(Instant::now(), self.config.circuit_breaker_timeout);
        Some(snapshot)
    }

    /// Snapshots of every service that has been called
    pub fn get_all_stats(&self) -> HashMap<String, ServiceStatsSnapshot> {
        let now = Instant::now();
        let cooldown = self.config.circuit_breaker_timeout;
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().snapshot(now, cooldown)))
            .collect()
    }

    /// Current breaker state; `Closed` for services never called
    pub fn circuit_state(&self, service_name: &str) -> CircuitState {
        self.stats
            .get(service_name)
            .map(|entry| entry.value().lock().state(Instant::now(), self.config.circuit_breaker_timeout))
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether `send_request` would currently fail fast
    pub fn is_circuit_breaker_open(&self, service_name: &str) -> bool {
        self.circuit_state(service_name) == CircuitState::Open
    }

    /// Close the breaker of one service and forget its failures
    pub fn reset_circuit(&self, service_name: &str) -> bool {
        match self.stats.get(service_name) {
            Some(entry) => {
                entry.value().lock().force_close();
                info!(service = %service_name, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }

    /// In-flight requests routed to one instance
    pub fn instance_connections(&self, instance_id: &str) -> usize {
        self.connections.get(instance_id)
    }

    /// Forget all stats and rotation state
    ///
    /// Requests in flight keep their own handle to the old stats and skip the
    /// connection release of a cleared tracker generation.
    pub fn reset_all_stats(&self) {
        self.stats.clear();
        self.connections.clear();
        self.strategy.reset();
        info!("Reset all load balancer statistics");
    }

    fn no_healthy_instance(&self, service_name: &str) -> RouterError {
        counter!(NO_HEALTHY_INSTANCE_TOTAL, "service" => service_name.to_string()).increment(1);
        warn!(service = %service_name, "No healthy instance available");
        RouterError::no_healthy_instance(service_name)
    }

    fn existing_stats(&self, service_name: &str) -> Option<SharedStats> {
        self.stats.get(service_name).map(|entry| Arc::clone(entry.value()))
    }

    fn stats_for(&self, service_name: &str) -> SharedStats {
        if let Some(stats) = self.existing_stats(service_name) {
            return stats;
        }
        Arc::clone(
            self.stats
                .entry(service_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ServiceStats::new())))
                .value(),
        )
    }
}

/// Frees the half-open probe slot if the probe ends without an outcome
///
/// Covers a probe whose future is dropped, e.g. by a caller-side timeout.
struct ProbeGuard {
    stats: Option<SharedStats>,
}

impl ProbeGuard {
    fn new(stats: &SharedStats, admission: Admission) -> Self {
        Self {
            stats: (admission == Admission::Probe).then(|| Arc::clone(stats)),
        }
    }

    /// Called once the outcome is about to be recorded
    fn disarm(&mut self) {
        self.stats = None;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Some(stats) = self.stats.take() {
            stats.lock().abandon_probe();
            debug!("Half-open probe abandoned");
        }
    }
}

/// Marks a request as in flight for its service and instance until dropped
struct InFlightGuard {
    stats: SharedStats,
    connections: Arc<ConnectionTracker>,
    generation: u64,
    service_name: String,
    instance_id: String,
}

impl InFlightGuard {
    fn acquire(stats: SharedStats, connections: Arc<ConnectionTracker>, service_name: &str, instance_id: &str) -> Self {
        let active = {
            let mut stats = stats.lock();
            stats.connections += 1;
            stats.connections
        };
        connections.increment(instance_id);
        let generation = connections.generation();
        gauge!(ACTIVE_CONNECTIONS, "service" => service_name.to_string()).set(active as f64);

        Self {
            stats,
            connections,
            generation,
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let active = {
            let mut stats = self.stats.lock();
            stats.connections = stats.connections.saturating_sub(1);
            stats.connections
        };
        self.connections.release(&self.instance_id, self.generation);
        gauge!(ACTIVE_CONNECTIONS, "service" => self.service_name.clone()).set(active as f64);
    }
}
