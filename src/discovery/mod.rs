pub mod health_check;
pub mod heartbeat;
pub mod service_registry;

pub use health_check::{create_health_check, HealthCheck, HttpHealthCheck, TcpHealthCheck};
pub use heartbeat::{spawn_heartbeat, HeartbeatHandle};
pub use service_registry::{RegistryEvent, RegistryEventReceiver, RegistryStats, ServiceRegistry};
