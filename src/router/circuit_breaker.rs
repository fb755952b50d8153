//! Per-node circuit breaker state machine: closed, open, half-open,
//! filtering candidate nodes before the load balancer picks one. Failures
//! increment a counter and the circuit opens once it crosses the
//! configured threshold.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::util::now_unix_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitRecord {
    state: CircuitState,
    failures: u32,
    opened_at: i64,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: 0,
        }
    }
}

pub struct CircuitBreaker {
    enabled: bool,
    threshold: u32,
    timeout_secs: u64,
    records: RwLock<HashMap<String, CircuitRecord>>,
}

impl CircuitBreaker {
    pub fn new(enabled: bool, threshold: u32, timeout_secs: u64) -> Self {
        Self {
            enabled,
            threshold,
            timeout_secs,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// `true` if `node_id` may currently receive traffic. Transitions a
    /// timed-out open circuit to half-open as a side effect, matching the
    /// source's filter step.
    pub fn is_available(&self, node_id: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let mut records = self.records.write();
        let record = records.entry(node_id.to_string()).or_default();
        match record.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if now_unix_seconds() - record.opened_at >= self.timeout_secs as i64 {
                    record.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, node_id: &str) {
        if !self.enabled {
            return;
        }
        let mut records = self.records.write();
        let record = records.entry(node_id.to_string()).or_default();
        match record.state {
            CircuitState::HalfOpen => {
                record.state = CircuitState::Closed;
                record.failures = 0;
            }
            CircuitState::Closed => {
                record.failures = record.failures.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, node_id: &str) {
        if !self.enabled {
            return;
        }
        let mut records = self.records.write();
        let record = records.entry(node_id.to_string()).or_default();
        match record.state {
            CircuitState::HalfOpen => {
                record.state = CircuitState::Open;
                record.opened_at = now_unix_seconds();
            }
            CircuitState::Closed => {
                record.failures += 1;
                if record.failures >= self.threshold {
                    record.state = CircuitState::Open;
                    record.opened_at = now_unix_seconds();
                }
            }
            CircuitState::Open => {
                record.failures += 1;
            }
        }
    }

    pub fn reset(&self, node_id: &str) {
        let mut records = self.records.write();
        records.insert(node_id.to_string(), CircuitRecord::default());
    }

    pub fn state(&self, node_id: &str) -> CircuitState {
        self.records
            .read()
            .get(node_id)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn failure_count(&self, node_id: &str) -> u32 {
        self.records.read().get(node_id).map(|r| r.failures).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(true, 3, 10);
        cb.record_failure("n1");
        cb.record_failure("n1");
        assert!(cb.is_available("n1"));
        cb.record_failure("n1");
        assert_eq!(cb.state("n1"), CircuitState::Open);
        assert!(!cb.is_available("n1"));
    }

    #[test]
    fn half_open_success_closes_and_zeroes_failures() {
        let cb = CircuitBreaker::new(true, 1, 0);
        cb.record_failure("n1");
        assert_eq!(cb.state("n1"), CircuitState::Open);
        assert!(cb.is_available("n1")); // timeout=0, transitions to half-open
        assert_eq!(cb.state("n1"), CircuitState::HalfOpen);
        cb.record_success("n1");
        assert_eq!(cb.state("n1"), CircuitState::Closed);
        assert_eq!(cb.failure_count("n1"), 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(true, 1, 0);
        cb.record_failure("n1");
        cb.is_available("n1");
        assert_eq!(cb.state("n1"), CircuitState::HalfOpen);
        cb.record_failure("n1");
        assert_eq!(cb.state("n1"), CircuitState::Open);
    }

    #[test]
    fn reset_forces_closed() {
        let cb = CircuitBreaker::new(true, 1, 1000);
        cb.record_failure("n1");
        assert_eq!(cb.state("n1"), CircuitState::Open);
        cb.reset("n1");
        assert_eq!(cb.state("n1"), CircuitState::Closed);
        assert!(cb.is_available("n1"));
    }
}
