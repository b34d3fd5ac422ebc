//! # Service Registry
//!
//! Source of truth for which instances of each logical service exist and whether
//! each one is currently usable.
//!
//! ## Concurrency
//!
//! Instances are grouped per service name into a bucket guarded by its own
//! mutex. The `DashMap` is only used to find the bucket; the `Arc` is cloned out
//! and the map guard dropped before the bucket is locked, so heartbeats, health
//! checks and reads against different services never contend. Bucket locks are
//! synchronous and never held across an `.await`.
//!
//! ## Lifecycle of an instance
//!
//! - `register_service` creates it in `starting` with a fresh heartbeat
//! - after the startup grace period it is promoted to `healthy`; the promotion is
//!   applied lazily whenever the bucket is locked, so no task is spawned per
//!   registration
//! - heartbeats and health checks move it between `healthy` and `unhealthy`
//! - `unregister_service` or inactivity cleanup removes it

use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::config::RegistryConfig;
use crate::core::error::RouterResult;
use crate::core::types::{
    InstanceStatus, OverallStatus, ServiceHealth, ServiceInstance, ServiceRegistration,
};
use crate::discovery::health_check::HealthCheck;
use crate::observability::metrics::{
    HEALTH_CHECK_FAILURES_TOTAL, INSTANCES_PURGED_TOTAL, INSTANCES_REGISTERED_TOTAL,
};

/// Registry change events
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RegistryEvent {
    /// A new instance was registered
    Registered { service: String, instance_id: String },
    /// An instance was explicitly unregistered
    Unregistered { service: String, instance_id: String },
    /// An instance changed status
    StatusChanged {
        service: String,
        instance_id: String,
        old_status: InstanceStatus,
        new_status: InstanceStatus,
    },
    /// An instance was removed by inactivity cleanup
    Purged { service: String, instance_id: String },
}

/// Type alias for registry event receiver
pub type RegistryEventReceiver = broadcast::Receiver<RegistryEvent>;

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub starting_instances: usize,
}

type InstanceBucket = Arc<Mutex<Vec<ServiceInstance>>>;

/// Thread-safe registry of service instances with per-service locking
pub struct ServiceRegistry {
    /// Instance lists indexed by service name
    services: DashMap<String, InstanceBucket>,
    /// One health predicate per service name
    health_checks: DashMap<String, Arc<dyn HealthCheck>>,
    config: RegistryConfig,
    events: broadcast::Sender<RegistryEvent>,
    health_check_task: Mutex<Option<JoinHandle<()>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRegistry {
    /// Create a new registry with the given timing configuration
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));

        Self {
            services: DashMap::new(),
            health_checks: DashMap::new(),
            config,
            events,
            health_check_task: Mutex::new(None),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Create a registry with default timings
    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a new instance and return its id
    ///
    /// The instance starts in `starting` and becomes `healthy` once the startup
    /// grace period elapses, unless it is unregistered or marked unhealthy first.
    pub fn register_service(&self, registration: ServiceRegistration) -> String {
        let instance = ServiceInstance::new(registration);
        let service = instance.name.clone();
        let instance_id = instance.id.clone();

        // Push while the map entry is held so a concurrent reader never sees a
        // bucket without the new instance once this call returns.
        {
            let entry = self.services.entry(service.clone()).or_default();
            entry.lock().push(instance);
        }

        counter!(INSTANCES_REGISTERED_TOTAL, "service" => service.clone()).increment(1);
        info!(service = %service, instance_id = %instance_id, "Registered service instance");
        self.emit(RegistryEvent::Registered { service, instance_id: instance_id.clone() });

        instance_id
    }

    /// Remove an instance; false if the name/id pair is unknown
    pub fn unregister_service(&self, service_name: &str, instance_id: &str) -> bool {
        let removed = self.with_bucket(service_name, |instances, _| {
            match instances.iter().position(|instance| instance.id == instance_id) {
                Some(index) => {
                    instances.remove(index);
                    true
                }
                None => false,
            }
        });

        if removed == Some(true) {
            info!(service = %service_name, instance_id = %instance_id, "Unregistered service instance");
            self.emit(RegistryEvent::Unregistered {
                service: service_name.to_string(),
                instance_id: instance_id.to_string(),
            });
            true
        } else {
            debug!(service = %service_name, instance_id = %instance_id, "Unregister for unknown instance");
            false
        }
    }

    /// Record a heartbeat; false if the name/id pair is unknown
    ///
    /// A heartbeat is evidence of liveness: an `unhealthy` or still `starting`
    /// instance is moved to `healthy`.
    pub fn update_heartbeat(&self, service_name: &str, instance_id: &str) -> bool {
        let updated = self.with_bucket(service_name, |instances, now| {
            let instance = instances.iter_mut().find(|instance| instance.id == instance_id)?;
            instance.touch(now);
            let old_status = instance.status;
            if old_status != InstanceStatus::Healthy {
                instance.status = InstanceStatus::Healthy;
                Some(Some(old_status))
            } else {
                Some(None)
            }
        });

        match updated.flatten() {
            Some(Some(old_status)) => {
                info!(
                    service = %service_name,
                    instance_id = %instance_id,
                    old_status = %old_status,
                    "Heartbeat restored instance to healthy"
                );
                self.emit(RegistryEvent::StatusChanged {
                    service: service_name.to_string(),
                    instance_id: instance_id.to_string(),
                    old_status,
                    new_status: InstanceStatus::Healthy,
                });
                true
            }
            Some(None) => true,
            None => {
                debug!(service = %service_name, instance_id = %instance_id, "Heartbeat for unknown instance");
                false
            }
        }
    }

    /// Pick one routable instance uniformly at random
    ///
    /// Routable means `healthy` with a heartbeat inside the freshness window, so an
    /// instance that crashed while healthy drops out once it stops heartbeating.
    pub fn get_healthy_service(&self, service_name: &str) -> Option<ServiceInstance> {
        let mut healthy = self.get_healthy_instances(service_name);
        if healthy.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..healthy.len());
        Some(healthy.swap_remove(index))
    }

    /// All routable instances of a service, in registration order
    pub fn get_healthy_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        let freshness = self.config.heartbeat_freshness;
        self.with_bucket(service_name, |instances, now| {
            instances
                .iter()
                .filter(|instance| instance.is_routable(now, freshness))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// All known instances regardless of health
    pub fn get_all_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.with_bucket(service_name, |instances, _| instances.clone())
            .unwrap_or_default()
    }

    /// Look up a single instance
    pub fn get_instance(&self, service_name: &str, instance_id: &str) -> Option<ServiceInstance> {
        self.with_bucket(service_name, |instances, _| {
            instances.iter().find(|instance| instance.id == instance_id).cloned()
        })
        .flatten()
    }

    /// Aggregate health of every service with at least one instance, sorted by name
    pub fn get_health_status(&self) -> Vec<ServiceHealth> {
        let mut report: Vec<ServiceHealth> = self
            .buckets()
            .into_iter()
            .filter_map(|(service_name, bucket)| {
                let instances = self.lock_bucket(&service_name, &bucket, |instances, _| instances.clone());
                if instances.is_empty() {
                    return None;
                }
                let overall_status = OverallStatus::aggregate(instances.iter().map(|i| &i.status));
                Some(ServiceHealth {
                    service_name,
                    instances,
                    overall_status,
                })
            })
            .collect();

        report.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        report
    }

    /// Force an instance out of rotation; false if the name/id pair is unknown
    pub fn mark_unhealthy(&self, service_name: &str, instance_id: &str) -> bool {
        let changed = self.with_bucket(service_name, |instances, _| {
            let instance = instances.iter_mut().find(|instance| instance.id == instance_id)?;
            let old_status = instance.status;
            instance.status = InstanceStatus::Unhealthy;
            Some(old_status)
        });

        match changed.flatten() {
            Some(old_status) => {
                warn!(service = %service_name, instance_id = %instance_id, "Marked service instance as unhealthy");
                if old_status != InstanceStatus::Unhealthy {
                    self.emit(RegistryEvent::StatusChanged {
                        service: service_name.to_string(),
                        instance_id: instance_id.to_string(),
                        old_status,
                        new_status: InstanceStatus::Unhealthy,
                    });
                }
                true
            }
            None => false,
        }
    }

    /// Associate a health predicate with a service, replacing any previous one
    pub fn add_health_check(&self, service_name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        let service_name = service_name.into();
        debug!(service = %service_name, check_type = check.check_type(), "Added health check");
        self.health_checks.insert(service_name, check);
    }

    /// Remove the health predicate of a service
    pub fn remove_health_check(&self, service_name: &str) -> bool {
        self.health_checks.remove(service_name).is_some()
    }

    /// Run every registered health check once and apply the verdicts
    ///
    /// Checks for different services run concurrently. Errors are logged and
    /// treated as unhealthy; they never propagate to the caller.
    pub async fn run_health_checks(&self) {
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .health_checks
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let results = join_all(checks.into_iter().map(|(service_name, check)| async move {
            let verdict = check.check().await;
            (service_name, verdict)
        }))
        .await;

        for (service_name, verdict) in results {
            self.apply_health_verdict(&service_name, verdict);
        }
    }

    fn apply_health_verdict(&self, service_name: &str, verdict: RouterResult<bool>) {
        let changes = match verdict {
            Ok(true) => self.set_statuses(service_name, |status| {
                (status != InstanceStatus::Healthy).then_some(InstanceStatus::Healthy)
            }),
            Ok(false) => self.set_statuses(service_name, |status| {
                (status == InstanceStatus::Healthy).then_some(InstanceStatus::Unhealthy)
            }),
            Err(e) => {
                error!(service = %service_name, error = %e, "Health check failed");
                counter!(HEALTH_CHECK_FAILURES_TOTAL, "service" => service_name.to_string()).increment(1);
                self.set_statuses(service_name, |status| {
                    (status != InstanceStatus::Unhealthy).then_some(InstanceStatus::Unhealthy)
                })
            }
        };

        for (instance_id, old_status, new_status) in changes {
            if new_status == InstanceStatus::Healthy {
                info!(service = %service_name, instance_id = %instance_id, "Service instance is now healthy");
            } else {
                warn!(service = %service_name, instance_id = %instance_id, "Service instance is now unhealthy");
            }
            self.emit(RegistryEvent::StatusChanged {
                service: service_name.to_string(),
                instance_id,
                old_status,
                new_status,
            });
        }
    }

    /// Apply `transition` to every instance of a service, returning the changes
    fn set_statuses<F>(&self, service_name: &str, transition: F) -> Vec<(String, InstanceStatus, InstanceStatus)>
    where
        F: Fn(InstanceStatus) -> Option<InstanceStatus>,
    {
        self.with_bucket(service_name, |instances, _| {
            instances
                .iter_mut()
                .filter_map(|instance| {
                    let new_status = transition(instance.status)?;
                    let old_status = std::mem::replace(&mut instance.status, new_status);
                    Some((instance.id.clone(), old_status, new_status))
                })
                .collect()
        })
        .unwrap_or_default()
    }

    /// Run health checks every `interval` until stopped
    ///
    /// Starting again replaces the running timer, so at most one is ever active.
    /// The first run happens one full interval after the call.
    pub fn start_health_checks(self: &Arc<Self>, interval: Duration) {
        let registry = Arc::downgrade(self);
        let handle = spawn_ticker(registry, interval, |registry| async move {
            registry.run_health_checks().await;
        });

        if let Some(previous) = self.health_check_task.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_ms = interval.as_millis() as u64, "Started periodic health checks");
    }

    /// Stop the health check timer; returns false if none was running
    pub fn stop_health_checks(&self) -> bool {
        match self.health_check_task.lock().take() {
            Some(handle) => {
                handle.abort();
                info!("Stopped periodic health checks");
                true
            }
            None => false,
        }
    }

    pub fn health_checks_running(&self) -> bool {
        self.health_check_task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Purge instances whose last heartbeat is at least `max_age` old
    ///
    /// Status is ignored: this is the safety net against leaked registrations.
    /// Returns the number of purged instances.
    pub fn cleanup_inactive_services(&self, max_age: Duration) -> usize {
        let mut purged_total = 0;

        for (service_name, bucket) in self.buckets() {
            let purged = self.lock_bucket(&service_name, &bucket, |instances, now| {
                let mut purged = Vec::new();
                instances.retain(|instance| {
                    let keep = instance.heartbeat_age(now) < max_age;
                    if !keep {
                        purged.push(instance.id.clone());
                    }
                    keep
                });
                purged
            });

            if purged.is_empty() {
                continue;
            }

            info!(service = %service_name, purged = purged.len(), "Cleaned up inactive instances");
            counter!(INSTANCES_PURGED_TOTAL, "service" => service_name.clone()).increment(purged.len() as u64);
            purged_total += purged.len();

            for instance_id in purged {
                self.emit(RegistryEvent::Purged {
                    service: service_name.clone(),
                    instance_id,
                });
            }
        }

        purged_total
    }

    /// Run inactivity cleanup every `interval` until stopped
    ///
    /// Idempotent in the same way as `start_health_checks`.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration, max_age: Duration) {
        let registry = Arc::downgrade(self);
        let handle = spawn_ticker(registry, interval, move |registry| async move {
            registry.cleanup_inactive_services(max_age);
        });

        if let Some(previous) = self.cleanup_task.lock().replace(handle) {
            previous.abort();
        }
        info!(
            interval_ms = interval.as_millis() as u64,
            max_age_ms = max_age.as_millis() as u64,
            "Started periodic cleanup"
        );
    }

    /// Stop the cleanup timer; returns false if none was running
    pub fn stop_cleanup(&self) -> bool {
        match self.cleanup_task.lock().take() {
            Some(handle) => {
                handle.abort();
                info!("Stopped periodic cleanup");
                true
            }
            None => false,
        }
    }

    pub fn cleanup_running(&self) -> bool {
        self.cleanup_task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop every background timer
    pub fn shutdown(&self) {
        self.stop_health_checks();
        self.stop_cleanup();
    }

    /// Subscribe to registry change events
    pub fn subscribe(&self) -> RegistryEventReceiver {
        self.events.subscribe()
    }

    /// Names of services with at least one instance, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets()
            .into_iter()
            .filter(|(_, bucket)| !bucket.lock().is_empty())
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    /// Get registry statistics
    pub fn get_stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();

        for (service_name, bucket) in self.buckets() {
            let counts = self.lock_bucket(&service_name, &bucket, |instances, _| {
                instances.iter().fold((0, 0, 0), |(healthy, unhealthy, starting), instance| {
                    match instance.status {
                        InstanceStatus::Healthy => (healthy + 1, unhealthy, starting),
                        InstanceStatus::Unhealthy => (healthy, unhealthy + 1, starting),
                        InstanceStatus::Starting => (healthy, unhealthy, starting + 1),
                    }
                })
            });

            let (healthy, unhealthy, starting) = counts;
            let total = healthy + unhealthy + starting;
            if total == 0 {
                continue;
            }
            stats.total_services += 1;
            stats.total_instances += total;
            stats.healthy_instances += healthy;
            stats.unhealthy_instances += unhealthy;
            stats.starting_instances += starting;
        }

        stats
    }

    /// Snapshot of (name, bucket) pairs without holding map guards afterwards
    fn buckets(&self) -> Vec<(String, InstanceBucket)> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Lock the bucket of `service_name`, if it exists, and run `f` on it
    fn with_bucket<R, F>(&self, service_name: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Vec<ServiceInstance>, Instant) -> R,
    {
        let bucket = self.services.get(service_name).map(|entry| Arc::clone(entry.value()))?;
        Some(self.lock_bucket(service_name, &bucket, f))
    }

    /// Lock a bucket, apply pending grace-period promotions, then run `f`
    fn lock_bucket<R, F>(&self, service_name: &str, bucket: &InstanceBucket, f: F) -> R
    where
        F: FnOnce(&mut Vec<ServiceInstance>, Instant) -> R,
    {
        let now = Instant::now();
        let mut instances = bucket.lock();
        self.promote_started(service_name, &mut instances, now);
        f(&mut instances, now)
    }

    fn promote_started(&self, service_name: &str, instances: &mut [ServiceInstance], now: Instant) {
        let grace = self.config.startup_grace_period;
        for instance in instances.iter_mut() {
            if instance.status == InstanceStatus::Starting
                && now.saturating_duration_since(instance.registered) >= grace
            {
                instance.status = InstanceStatus::Healthy;
                debug!(service = %service_name, instance_id = %instance.id, "Startup grace period elapsed");
                self.emit(RegistryEvent::StatusChanged {
                    service: service_name.to_string(),
                    instance_id: instance.id.clone(),
                    old_status: InstanceStatus::Starting,
                    new_status: InstanceStatus::Healthy,
                });
            }
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is the normal case.
        let _ = self.events.send(event);
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.health_check_task.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.cleanup_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Spawn a repeating task that ends once the registry is dropped
fn spawn_ticker<F, Fut>(registry: Weak<ServiceRegistry>, period: Duration, job: F) -> JoinHandle<()>
where
    F: Fn(Arc<ServiceRegistry>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            job(registry).await;
        }
    })
}
