//! # Service Router - Daemon Entry Point
//!
//! Loads configuration, registers the statically declared instances, keeps
//! them alive with heartbeats and runs the registry's health check and cleanup
//! timers until SIGINT/SIGTERM.
//!
//! The configuration path comes from the first argument, then
//! `ROUTER_CONFIG_PATH`, then `config/router.yaml`. A missing file falls back to
//! defaults plus environment overrides.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use service_router::discovery::health_check::create_health_check;
use service_router::observability::{init_logging, install_prometheus};
use service_router::{spawn_heartbeat, HeartbeatHandle, LoadBalancer, RouterConfig, RouterResult, ServiceRegistry};

const DEFAULT_CONFIG_PATH: &str = "config/router.yaml";
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be initialised if configuration failed
        eprintln!("service-router failed: {}", e);
        error!(error = %e, "Service router failed");
        std::process::exit(1);
    }
}

async fn run() -> RouterResult<()> {
    let config = load_config().await?;
    init_logging(&config.observability.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "🚀 Starting service router");

    if install_prometheus(&config.observability.metrics)? {
        info!("📊 Metrics exporter enabled");
    }

    let registry = Arc::new(ServiceRegistry::new(config.registry.clone()));
    let heartbeats = register_static_services(&config, &registry)?;

    registry.start_health_checks(config.registry.health_check_interval);
    registry.start_cleanup(config.registry.cleanup_interval, config.registry.max_inactive_age);

    let balancer = LoadBalancer::with_http(Arc::clone(&registry), config.load_balancer.clone())?;
    info!(
        strategy = balancer.strategy_name(),
        services = registry.service_names().len(),
        instances = heartbeats.len(),
        "✅ Service router ready"
    );

    let mut report = tokio::time::interval(STATUS_REPORT_INTERVAL);
    report.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = report.tick() => report_status(&registry, &balancer),
        }
    }

    info!("🛑 Shutting down");
    for heartbeat in heartbeats {
        heartbeat.stop();
    }
    registry.shutdown();
    info!("✅ Service router shutdown complete");
    Ok(())
}

async fn load_config() -> RouterResult<RouterConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ROUTER_CONFIG_PATH").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    if !Path::new(&path).exists() {
        let mut config = RouterConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        return Ok(config);
    }

    if path.ends_with(".json") {
        RouterConfig::load_from_json(&path).await
    } else {
        RouterConfig::load_from_file(&path).await
    }
}

fn register_static_services(config: &RouterConfig, registry: &Arc<ServiceRegistry>) -> RouterResult<Vec<HeartbeatHandle>> {
    let mut heartbeats = Vec::new();

    for service in &config.services {
        if let Some(definition) = &service.health_check {
            registry.add_health_check(service.name.clone(), create_health_check(definition)?);
        }

        for registration in service.registrations() {
            let instance_id = registry.register_service(registration);
            heartbeats.push(spawn_heartbeat(
                Arc::clone(registry),
                service.name.clone(),
                instance_id,
                config.registry.heartbeat_interval,
            ));
        }
    }

    Ok(heartbeats)
}

fn report_status(registry: &ServiceRegistry, balancer: &LoadBalancer) {
    for health in registry.get_health_status() {
        let healthy = health.instances.iter().filter(|instance| instance.is_healthy()).count();
        let circuit = balancer.circuit_state(&health.service_name);
        info!(
            service = %health.service_name,
            overall_status = ?health.overall_status,
            healthy,
            instances = health.instances.len(),
            circuit = %circuit,
            "Service status"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("📡 Received SIGINT"),
        _ = terminate => info!("📡 Received SIGTERM"),
    }
}
