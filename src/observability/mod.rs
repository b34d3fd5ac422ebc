// Logging and metrics configuration
pub mod config;

// Metrics exporter and metric names
pub mod metrics;

// Structured logging
pub mod logging;

pub use config::{LogConfig, LogFormat, MetricsConfig, ObservabilityConfig};
pub use logging::init_logging;
pub use metrics::install_prometheus;
