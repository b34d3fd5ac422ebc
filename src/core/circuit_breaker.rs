//! Circuit Breaker Implementation
//!
//! Per-service failure bookkeeping and the breaker state machine used by the
//! load balancer. The state is stored as plain fields (`failures`,
//! `circuit_breaker_open`, `circuit_breaker_opened_at`) and the
//! Closed/Open/HalfOpen state is derived from them lazily on every call.
//!
//! ## States:
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Requests fail fast until the cooldown elapses
//! - **HalfOpen**: Cooldown elapsed, exactly one probe request is admitted
//!
//! ## Transitions:
//! - Closed -> Open: `failures >= threshold`
//! - Open -> HalfOpen: cooldown elapsed since `circuit_breaker_opened_at`
//! - HalfOpen -> Closed: the probe succeeds
//! - HalfOpen -> Open: the probe fails (fresh `circuit_breaker_opened_at`)
//!
//! `ServiceStats` is not synchronized itself; the balancer keeps one per service
//! behind its own mutex so unrelated services never contend.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state derived from `ServiceStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Outcome of asking the breaker whether a request may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed
    Allowed,
    /// Breaker half-open, this request is the single recovery probe
    Probe,
    /// Breaker open, or a probe is already in flight
    Rejected,
}

/// Per-service circuit breaker and connection bookkeeping
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    /// In-flight requests currently routed to the service
    pub connections: usize,

    /// Consecutive failures since the last success
    pub failures: u32,

    /// Most recent failure
    pub last_failure: Option<Instant>,

    pub circuit_breaker_open: bool,

    /// Set whenever `circuit_breaker_open` is true
    pub circuit_breaker_opened_at: Option<Instant>,

    /// A half-open probe has been admitted and not yet resolved
    pub probe_in_flight: bool,

    /// Lifetime counters for introspection
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub times_opened: u64,
}

impl ServiceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current breaker state at `now` for the given cooldown
    pub fn state(&self, now: Instant, cooldown: Duration) -> CircuitState {
        if !self.circuit_breaker_open {
            return CircuitState::Closed;
        }

        match self.circuit_breaker_opened_at {
            Some(opened_at) if now.saturating_duration_since(opened_at) < cooldown => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    /// Whether requests are currently rejected without a network call
    pub fn is_open(&self, now: Instant, cooldown: Duration) -> bool {
        self.state(now, cooldown) == CircuitState::Open
    }

    /// Decide whether a request may proceed
    ///
    /// In half-open state only the first caller is admitted, as the probe;
    /// everyone else keeps failing fast until the probe resolves.
    pub fn admit(&mut self, now: Instant, cooldown: Duration) -> Admission {
        let admission = match self.state(now, cooldown) {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen if self.probe_in_flight => Admission::Rejected,
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Admission::Probe
            }
        };

        match admission {
            Admission::Rejected => self.rejected_requests += 1,
            _ => self.total_requests += 1,
        }
        admission
    }

    /// Release a probe that never reached the network (e.g. no healthy instance)
    pub fn abandon_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// Record a successful request: reset failures and close the breaker
    ///
    /// Returns true if the breaker was open before this call.
    pub fn record_success(&mut self) -> bool {
        let was_open = self.circuit_breaker_open;

        self.successful_requests += 1;
        self.failures = 0;
        self.last_failure = None;
        self.circuit_breaker_open = false;
        self.circuit_breaker_opened_at = None;
        self.probe_in_flight = false;

        was_open
    }

    /// Record a failed request, opening the breaker at `threshold`
    ///
    /// Returns true if this call opened (or re-opened) the breaker.
    pub fn record_failure(&mut self, now: Instant, threshold: u32) -> bool {
        self.failed_requests += 1;
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(now);
        self.probe_in_flight = false;

        if self.failures >= threshold {
            self.circuit_breaker_open = true;
            self.circuit_breaker_opened_at = Some(now);
            self.times_opened += 1;
            true
        } else {
            false
        }
    }

    /// Manually force the breaker open (for operator override)
    pub fn force_open(&mut self, now: Instant) {
        self.circuit_breaker_open = true;
        self.circuit_breaker_opened_at = Some(now);
        self.probe_in_flight = false;
        self.times_opened += 1;
    }

    /// Manually close the breaker and forget failures
    pub fn force_close(&mut self) {
        self.failures = 0;
        self.last_failure = None;
        self.circuit_breaker_open = false;
        self.circuit_breaker_opened_at = None;
        self.probe_in_flight = false;
    }

    /// Serializable view for dashboards
    pub fn snapshot(&self, now: Instant, cooldown: Duration) -> ServiceStatsSnapshot {
        ServiceStatsSnapshot {
            connections: self.connections,
            failures: self.failures,
            circuit_state: self.state(now, cooldown),
            last_failure_ms_ago: self
                .last_failure
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            open_for_ms: self
                .circuit_breaker_opened_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            rejected_requests: self.rejected_requests,
            times_opened: self.times_opened,
        }
    }
}

/// Immutable snapshot of one service's stats
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatsSnapshot {
    pub connections: usize,
    pub failures: u32,
    pub circuit_state: CircuitState,
    pub last_failure_ms_ago: Option<u64>,
    pub open_for_ms: Option<u64>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub times_opened: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(60);

    #[test]
    fn test_initial_state_is_closed() {
        let stats = ServiceStats::new();
        assert_eq!(stats.state(Instant::now(), COOLDOWN), CircuitState::Closed);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.connections, 0);
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let mut stats = ServiceStats::new();
        let now = Instant::now();

        assert!(!stats.record_failure(now, 3));
        assert!(!stats.record_failure(now, 3));
        assert_eq!(stats.state(now, COOLDOWN), CircuitState::Closed);

        assert!(stats.record_failure(now, 3));
        assert_eq!(stats.state(now, COOLDOWN), CircuitState::Open);
        assert!(stats.circuit_breaker_opened_at.is_some());

        let mut stats_copy = stats.clone();
        assert_eq!(stats_copy.admit(now, COOLDOWN), Admission::Rejected);
        assert_eq!(stats_copy.rejected_requests, 1);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let mut stats = ServiceStats::new();
        let opened = Instant::now();
        stats.record_failure(opened, 1);

        let later = opened + COOLDOWN;
        assert_eq!(stats.state(later, COOLDOWN), CircuitState::HalfOpen);
        assert_eq!(stats.admit(later, COOLDOWN), Admission::Probe);
        assert_eq!(stats.admit(later, COOLDOWN), Admission::Rejected);

        stats.abandon_probe();
        assert_eq!(stats.admit(later, COOLDOWN), Admission::Probe);
    }

    #[test]
    fn test_probe_success_closes_breaker() {
        let mut stats = ServiceStats::new();
        let opened = Instant::now();
        stats.record_failure(opened, 2);
        stats.record_failure(opened, 2);

        let later = opened + COOLDOWN + Duration::from_millis(1);
        assert_eq!(stats.admit(later, COOLDOWN), Admission::Probe);
        assert!(stats.record_success());

        assert_eq!(stats.state(later, COOLDOWN), CircuitState::Closed);
        assert_eq!(stats.failures, 0);
        assert!(stats.last_failure.is_none());
        assert!(stats.circuit_breaker_opened_at.is_none());
        assert!(!stats.probe_in_flight);
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_timestamp() {
        let mut stats = ServiceStats::new();
        let opened = Instant::now();
        stats.record_failure(opened, 1);

        let later = opened + COOLDOWN * 2;
        assert_eq!(stats.admit(later, COOLDOWN), Admission::Probe);
        assert!(stats.record_failure(later, 1));

        assert_eq!(stats.circuit_breaker_opened_at, Some(later));
        assert_eq!(stats.state(later, COOLDOWN), CircuitState::Open);
        assert_eq!(stats.times_opened, 2);
    }

    #[test]
    fn test_open_implies_opened_at() {
        let mut stats = ServiceStats::new();
        let now = Instant::now();
        for _ in 0..10 {
            stats.record_failure(now, 4);
            if stats.circuit_breaker_open {
                assert!(stats.circuit_breaker_opened_at.is_some());
            }
        }
        stats.force_open(now);
        assert!(stats.circuit_breaker_opened_at.is_some());
    }

    #[test]
    fn test_manual_override() {
        let mut stats = ServiceStats::new();
        let now = Instant::now();

        stats.force_open(now);
        assert_eq!(stats.state(now, COOLDOWN), CircuitState::Open);

        stats.force_close();
        assert_eq!(stats.state(now, COOLDOWN), CircuitState::Closed);
    }

    #[test]
    fn test_snapshot() {
        let mut stats = ServiceStats::new();
        let now = Instant::now();
        stats.admit(now, COOLDOWN);
        stats.record_failure(now, 5);
        stats.connections = 2;

        let snapshot = stats.snapshot(now + Duration::from_millis(250), COOLDOWN);
        assert_eq!(snapshot.connections, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.circuit_state, CircuitState::Closed);
        assert_eq!(snapshot.last_failure_ms_ago, Some(250));
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
    }
}
