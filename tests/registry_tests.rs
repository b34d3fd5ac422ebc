//! # Service Registry Integration Tests
//!
//! Lifecycle, freshness, health check and cleanup behaviour of the registry.
//! Timing-sensitive tests run on a paused clock, so sleeps complete instantly
//! and in deadline order.

use async_trait::async_trait;
use parking_lot::Mutex;
use service_router::core::config::RegistryConfig;
use service_router::{
    spawn_heartbeat, HealthCheck, InstanceStatus, OverallStatus, RegistryEvent, RouterError, RouterResult,
    ServiceRegistration, ServiceRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{advance, sleep};

/// Health check returning a scripted verdict and counting invocations
struct ScriptedCheck {
    calls: AtomicUsize,
    verdict: Mutex<RouterResult<bool>>,
}

impl ScriptedCheck {
    fn new(verdict: RouterResult<bool>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            verdict: Mutex::new(verdict),
        })
    }

    fn set(&self, verdict: RouterResult<bool>) {
        *self.verdict.lock() = verdict;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for ScriptedCheck {
    async fn check(&self) -> RouterResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict.lock().clone()
    }

    fn check_type(&self) -> &'static str {
        "scripted"
    }
}

fn registration(name: &str, port: u16) -> ServiceRegistration {
    ServiceRegistration::new(name, "10.0.0.1", port)
}

fn status_of(registry: &ServiceRegistry, service: &str, id: &str) -> InstanceStatus {
    registry.get_instance(service, id).map(|instance| instance.status).unwrap()
}

/// A healthy instance stops being routable once its heartbeat is older than
/// the freshness window, even though its status still reads healthy
#[tokio::test(start_paused = true)]
async fn test_stale_heartbeat_excludes_healthy_instance() {
    let registry = ServiceRegistry::with_defaults();
    let id = registry.register_service(registration("pricing-svc", 8080));
    assert!(registry.update_heartbeat("pricing-svc", &id));

    let selected = registry.get_healthy_service("pricing-svc").unwrap();
    assert_eq!(selected.id, id);

    advance(Duration::from_secs(31)).await;

    assert!(registry.get_healthy_service("pricing-svc").is_none());
    assert_eq!(status_of(&registry, "pricing-svc", &id), InstanceStatus::Healthy);

    assert!(registry.update_heartbeat("pricing-svc", &id));
    assert!(registry.get_healthy_service("pricing-svc").is_some());
}

/// Newly registered instances are not routable until the grace period passes
#[tokio::test(start_paused = true)]
async fn test_startup_grace_period() {
    let registry = ServiceRegistry::with_defaults();
    let id = registry.register_service(registration("pricing-svc", 8080));

    assert_eq!(status_of(&registry, "pricing-svc", &id), InstanceStatus::Starting);
    assert!(registry.get_healthy_service("pricing-svc").is_none());

    advance(Duration::from_millis(4_999)).await;
    assert!(registry.get_healthy_service("pricing-svc").is_none());

    advance(Duration::from_millis(1)).await;
    assert_eq!(registry.get_healthy_service("pricing-svc").unwrap().id, id);
    assert_eq!(status_of(&registry, "pricing-svc", &id), InstanceStatus::Healthy);
}

/// Grace period promotion only applies to instances still starting
#[tokio::test(start_paused = true)]
async fn test_grace_period_does_not_override_unhealthy() {
    let registry = ServiceRegistry::with_defaults();
    let id = registry.register_service(registration("pricing-svc", 8080));
    assert!(registry.mark_unhealthy("pricing-svc", &id));

    advance(Duration::from_secs(6)).await;
    assert_eq!(status_of(&registry, "pricing-svc", &id), InstanceStatus::Unhealthy);
    assert!(registry.get_healthy_service("pricing-svc").is_none());
}

/// Unregistered instances are never returned again
#[tokio::test(start_paused = true)]
async fn test_unregister_removes_instance() {
    let registry = ServiceRegistry::with_defaults();
    let first = registry.register_service(registration("pricing-svc", 8080));
    let second = registry.register_service(registration("pricing-svc", 8081));
    registry.update_heartbeat("pricing-svc", &first);
    registry.update_heartbeat("pricing-svc", &second);

    assert!(registry.unregister_service("pricing-svc", &first));
    assert!(!registry.unregister_service("pricing-svc", &first));
    assert!(!registry.update_heartbeat("pricing-svc", &first));

    for _ in 0..20 {
        assert_eq!(registry.get_healthy_service("pricing-svc").unwrap().id, second);
    }
}

/// Only the remaining healthy instance is returned, and none once it fails too
#[tokio::test(start_paused = true)]
async fn test_selection_skips_unhealthy_instances() {
    let registry = ServiceRegistry::with_defaults();
    let ids: Vec<String> = (0..3)
        .map(|i| registry.register_service(registration("pricing-svc", 8080 + i)))
        .collect();

    advance(Duration::from_secs(5)).await;
    assert_eq!(registry.get_healthy_instances("pricing-svc").len(), 3);

    assert!(registry.mark_unhealthy("pricing-svc", &ids[0]));
    assert!(registry.mark_unhealthy("pricing-svc", &ids[1]));
    for _ in 0..50 {
        assert_eq!(registry.get_healthy_service("pricing-svc").unwrap().id, ids[2]);
    }

    assert!(registry.mark_unhealthy("pricing-svc", &ids[2]));
    assert!(registry.get_healthy_service("pricing-svc").is_none());
}

/// Heartbeats restore unhealthy instances and keep the newest timestamp
#[tokio::test(start_paused = true)]
async fn test_heartbeat_restores_unhealthy_instance() {
    let registry = ServiceRegistry::with_defaults();
    let id = registry.register_service(registration("pricing-svc", 8080));
    registry.update_heartbeat("pricing-svc", &id);
    registry.mark_unhealthy("pricing-svc", &id);
    assert!(registry.get_healthy_service("pricing-svc").is_none());

    advance(Duration::from_secs(3)).await;
    assert!(registry.update_heartbeat("pricing-svc", &id));

    let instance = registry.get_instance("pricing-svc", &id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Healthy);
    assert!(instance.last_heartbeat > instance.registered);
}

/// Ids are unique even for identical registrations at the same instant
#[tokio::test(start_paused = true)]
async fn test_instance_ids_are_unique() {
    let registry = ServiceRegistry::with_defaults();
    let ids: std::collections::HashSet<String> = (0..100)
        .map(|_| registry.register_service(registration("pricing-svc", 8080)))
        .collect();

    assert_eq!(ids.len(), 100);
    assert!(ids.iter().all(|id| id.starts_with("pricing-svc-")));
}

/// Overall status aggregates instance statuses
#[tokio::test(start_paused = true)]
async fn test_health_status_aggregation() {
    let registry = ServiceRegistry::with_defaults();
    let a = registry.register_service(registration("orders-svc", 1));
    let b = registry.register_service(registration("orders-svc", 2));
    registry.update_heartbeat("orders-svc", &a);
    registry.update_heartbeat("orders-svc", &b);

    let overall = |registry: &ServiceRegistry| registry.get_health_status()[0].overall_status;
    assert_eq!(overall(&registry), OverallStatus::Healthy);

    registry.mark_unhealthy("orders-svc", &a);
    assert_eq!(overall(&registry), OverallStatus::Degraded);

    registry.mark_unhealthy("orders-svc", &b);
    assert_eq!(overall(&registry), OverallStatus::Unhealthy);

    let report = registry.get_health_status();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].service_name, "orders-svc");
    assert_eq!(report[0].instances.len(), 2);
}

/// Verdicts move instances between healthy and unhealthy; errors mark everything unhealthy
#[tokio::test(start_paused = true)]
async fn test_run_health_checks_applies_verdicts() {
    let registry = ServiceRegistry::with_defaults();
    let healthy = registry.register_service(registration("search-svc", 1));
    let starting = registry.register_service(registration("search-svc", 2));
    registry.update_heartbeat("search-svc", &healthy);

    let check = ScriptedCheck::new(Ok(false));
    registry.add_health_check("search-svc", check.clone());

    registry.run_health_checks().await;
    assert_eq!(status_of(&registry, "search-svc", &healthy), InstanceStatus::Unhealthy);
    assert_eq!(status_of(&registry, "search-svc", &starting), InstanceStatus::Starting);

    check.set(Ok(true));
    registry.run_health_checks().await;
    assert_eq!(status_of(&registry, "search-svc", &healthy), InstanceStatus::Healthy);
    assert_eq!(status_of(&registry, "search-svc", &starting), InstanceStatus::Healthy);

    check.set(Err(RouterError::health_check("search-svc", "probe exploded")));
    registry.run_health_checks().await;
    assert_eq!(status_of(&registry, "search-svc", &healthy), InstanceStatus::Unhealthy);
    assert_eq!(status_of(&registry, "search-svc", &starting), InstanceStatus::Unhealthy);

    assert_eq!(check.calls(), 3);
}

/// Starting the health check timer twice leaves exactly one timer running
#[tokio::test(start_paused = true)]
async fn test_start_health_checks_is_idempotent() {
    let registry = Arc::new(ServiceRegistry::with_defaults());
    let check = ScriptedCheck::new(Ok(true));
    registry.add_health_check("search-svc", check.clone());

    registry.start_health_checks(Duration::from_secs(10));
    registry.start_health_checks(Duration::from_secs(10));
    assert!(registry.health_checks_running());

    sleep(Duration::from_secs(25)).await;
    assert_eq!(check.calls(), 2);

    assert!(registry.stop_health_checks());
    assert!(!registry.stop_health_checks());
    assert!(!registry.health_checks_running());

    sleep(Duration::from_secs(30)).await;
    assert_eq!(check.calls(), 2);
}

/// Cleanup purges by heartbeat age regardless of status
#[tokio::test(start_paused = true)]
async fn test_cleanup_inactive_services() {
    let registry = ServiceRegistry::with_defaults();
    let stale = registry.register_service(registration("pricing-svc", 8080));
    let fresh = registry.register_service(registration("pricing-svc", 8081));
    let mut events = registry.subscribe();

    advance(Duration::from_secs(40)).await;
    registry.update_heartbeat("pricing-svc", &fresh);
    advance(Duration::from_secs(20)).await;

    // stale is exactly 60s old, fresh 20s
    assert_eq!(registry.cleanup_inactive_services(Duration::from_secs(60)), 1);

    let remaining = registry.get_all_instances("pricing-svc");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, fresh);

    let mut purged = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::Purged { instance_id, .. } = event {
            purged.push(instance_id);
        }
    }
    assert_eq!(purged, vec![stale]);
}

/// The periodic cleanup timer removes instances that stop heartbeating
#[tokio::test(start_paused = true)]
async fn test_periodic_cleanup() {
    let registry = Arc::new(ServiceRegistry::with_defaults());
    let id = registry.register_service(registration("pricing-svc", 8080));

    registry.start_cleanup(Duration::from_secs(10), Duration::from_secs(30));
    registry.start_cleanup(Duration::from_secs(10), Duration::from_secs(30));
    assert!(registry.cleanup_running());

    sleep(Duration::from_secs(25)).await;
    assert!(registry.get_instance("pricing-svc", &id).is_some());

    sleep(Duration::from_secs(10)).await;
    assert!(registry.get_instance("pricing-svc", &id).is_none());
    assert!(registry.service_names().is_empty());

    registry.shutdown();
    assert!(!registry.cleanup_running());
}

/// The heartbeat helper keeps an instance routable until its handle is dropped
#[tokio::test(start_paused = true)]
async fn test_spawned_heartbeat_keeps_instance_fresh() {
    let registry = Arc::new(ServiceRegistry::with_defaults());
    let id = registry.register_service(registration("pricing-svc", 8080));
    let handle = spawn_heartbeat(Arc::clone(&registry), "pricing-svc", id.clone(), Duration::from_secs(10));

    sleep(Duration::from_secs(105)).await;
    assert_eq!(registry.get_healthy_service("pricing-svc").unwrap().id, id);
    assert!(handle.is_running());

    drop(handle);
    sleep(Duration::from_secs(31)).await;
    assert!(registry.get_healthy_service("pricing-svc").is_none());
}

/// The heartbeat loop ends once its instance is gone
#[tokio::test(start_paused = true)]
async fn test_heartbeat_stops_after_unregister() {
    let registry = Arc::new(ServiceRegistry::with_defaults());
    let id = registry.register_service(registration("pricing-svc", 8080));
    let handle = spawn_heartbeat(Arc::clone(&registry), "pricing-svc", id.clone(), Duration::from_secs(10));

    registry.unregister_service("pricing-svc", &id);
    sleep(Duration::from_secs(11)).await;
    assert!(!handle.is_running());
}

/// Custom timings are honoured
#[tokio::test(start_paused = true)]
async fn test_custom_freshness_window() {
    let registry = ServiceRegistry::new(RegistryConfig {
        startup_grace_period: Duration::from_secs(1),
        heartbeat_freshness: Duration::from_secs(5),
        ..Default::default()
    });
    let id = registry.register_service(registration("pricing-svc", 8080));

    advance(Duration::from_secs(1)).await;
    assert!(registry.get_healthy_service("pricing-svc").is_some());

    advance(Duration::from_secs(4)).await;
    assert!(registry.get_healthy_service("pricing-svc").is_none());

    registry.update_heartbeat("pricing-svc", &id);
    assert!(registry.get_healthy_service("pricing-svc").is_some());
}

/// Concurrent registrations and heartbeats from many tasks are all applied
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_and_heartbeats() {
    let registry = Arc::new(ServiceRegistry::with_defaults());

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let service = format!("svc-{}", i % 4);
                let id = registry.register_service(registration(&service, 9000 + i as u16));
                for _ in 0..10 {
                    assert!(registry.update_heartbeat(&service, &id));
                    tokio::task::yield_now().await;
                }
                id
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    let stats = registry.get_stats();
    assert_eq!(stats.total_services, 4);
    assert_eq!(stats.total_instances, 32);
    assert_eq!(stats.healthy_instances, 32);
    assert_eq!(registry.get_healthy_instances("svc-0").len(), 8);
}
