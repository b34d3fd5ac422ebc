//! Periodic heartbeats for instances the process itself owns.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::discovery::service_registry::ServiceRegistry;

/// Handle to a running heartbeat loop; the loop stops when the handle is dropped
#[derive(Debug)]
pub struct HeartbeatHandle {
    service_name: String,
    instance_id: String,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// True while the loop is alive; false once stopped or the instance vanished
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|task| !task.is_finished()).unwrap_or(false)
    }

    /// Stop heartbeating
    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Send a heartbeat for `instance_id` every `interval`
///
/// The loop ends on its own if the registry no longer knows the instance,
/// e.g. after it was unregistered or purged.
pub fn spawn_heartbeat(
    registry: Arc<ServiceRegistry>,
    service_name: impl Into<String>,
    instance_id: impl Into<String>,
    interval: Duration,
) -> HeartbeatHandle {
    let service_name = service_name.into();
    let instance_id = instance_id.into();

    let task = {
        let service_name = service_name.clone();
        let instance_id = instance_id.clone();
        let registry = Arc::downgrade(&registry);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if !registry.update_heartbeat(&service_name, &instance_id) {
                    warn!(
                        service = %service_name,
                        instance_id = %instance_id,
                        "Instance no longer registered, stopping heartbeat"
                    );
                    break;
                }
                debug!(service = %service_name, instance_id = %instance_id, "Heartbeat sent");
            }
        })
    };

    HeartbeatHandle {
        service_name,
        instance_id,
        task: Some(task),
    }
}
