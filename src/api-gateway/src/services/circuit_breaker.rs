//! Per-service circuit breaker
//!
//! Closed → Open after a run of consecutive failures; Open → HalfOpen once
//! the cooldown elapses; HalfOpen admits a single probe whose outcome
//! either closes the circuit or re-opens it.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Snapshot for health and admin surfaces
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Breakers for every downstream service
pub struct CircuitBreakerService {
    breakers: Mutex<HashMap<String, Breaker>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreakerService {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold,
            cooldown,
        }
    }

    /// May a request to this service proceed right now?
    pub fn can_execute(&self, service_name: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        let cooldown = self.cooldown;
        let breaker = breakers
            .entry(service_name.to_string())
            .or_insert_with(Breaker::new);

        if breaker.state == CircuitState::Open {
            let cooled = breaker
                .opened_at
                .map(|t| t.elapsed() >= cooldown)
                .unwrap_or(true);
            if cooled {
                info!(service = service_name, "Circuit half-open, admitting probe");
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = false;
            }
        }

        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    false
                } else {
                    breaker.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self, service_name: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        if let Some(breaker) = breakers.get_mut(service_name) {
            if breaker.state != CircuitState::Closed {
                info!(service = service_name, "Circuit closed");
            }
            breaker.state = CircuitState::Closed;
            breaker.consecutive_failures = 0;
            breaker.opened_at = None;
            breaker.probe_in_flight = false;
        }
    }

    pub fn record_failure(&self, service_name: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        let breaker = breakers
            .entry(service_name.to_string())
            .or_insert_with(Breaker::new);

        breaker.consecutive_failures += 1;
        breaker.probe_in_flight = false;

        let should_open = breaker.state == CircuitState::HalfOpen
            || breaker.consecutive_failures >= self.failure_threshold;
        if should_open && breaker.state != CircuitState::Open {
            warn!(
                service = service_name,
                failures = breaker.consecutive_failures,
                "Circuit opened"
            );
        }
        if should_open {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self, service_name: &str) -> CircuitState {
        self.breakers
            .lock()
            .expect("breaker lock")
            .get(service_name)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers
            .lock()
            .expect("breaker lock")
            .iter()
            .map(|(name, b)| {
                (
                    name.clone(),
                    BreakerSnapshot {
                        state: b.state,
                        consecutive_failures: b.consecutive_failures,
                    },
                )
            })
            .collect()
    }

    /// Admin reset back to closed
    pub fn reset(&self, service_name: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock");
        if let Some(breaker) = breakers.get_mut(service_name) {
            *breaker = Breaker::new();
        }
    }
}

impl Default for CircuitBreakerService {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_consecutive_failures() {
        let service = CircuitBreakerService::new(5, Duration::from_secs(30));

        for _ in 0..4 {
            service.record_failure("erp");
            assert!(service.can_execute("erp"));
        }
        service.record_failure("erp");
        assert_eq!(service.state("erp"), CircuitState::Open);
        assert!(!service.can_execute("erp"));
    }

    #[test]
    fn test_success_resets_failure_run() {
        let service = CircuitBreakerService::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            service.record_failure("erp");
        }
        service.record_success("erp");
        for _ in 0..4 {
            service.record_failure("erp");
        }
        // Run was broken; still closed
        assert_eq!(service.state("erp"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let service = CircuitBreakerService::new(2, Duration::from_millis(10));
        service.record_failure("erp");
        service.record_failure("erp");
        assert!(!service.can_execute("erp"));

        std::thread::sleep(Duration::from_millis(20));

        // One probe passes, a second concurrent call does not
        assert!(service.can_execute("erp"));
        assert_eq!(service.state("erp"), CircuitState::HalfOpen);
        assert!(!service.can_execute("erp"));

        service.record_success("erp");
        assert_eq!(service.state("erp"), CircuitState::Closed);
        assert!(service.can_execute("erp"));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let service = CircuitBreakerService::new(2, Duration::from_millis(10));
        service.record_failure("erp");
        service.record_failure("erp");
        std::thread::sleep(Duration::from_millis(20));
        assert!(service.can_execute("erp"));

        service.record_failure("erp");
        assert_eq!(service.state("erp"), CircuitState::Open);
        assert!(!service.can_execute("erp"));
    }

    #[test]
    fn test_services_are_independent() {
        let service = CircuitBreakerService::new(1, Duration::from_secs(30));
        service.record_failure("erp");
        assert!(!service.can_execute("erp"));
        assert!(service.can_execute("crm"));
    }
}
