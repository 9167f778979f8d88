use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    probe_inflight: bool,
}

/// Per-source failure isolation. CLOSED admits everything; after the
/// configured number of consecutive failures the circuit OPENs and rejects
/// until the cool-down elapses, then HALF_OPEN admits exactly one probe.
/// A failed probe re-opens with the cool-down doubled, up to a bound.
pub struct CircuitBreaker {
    threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(cfg: &BreakerConfig) -> Self {
        Self {
            threshold: cfg.failure_threshold.max(1),
            base_cooldown: Duration::from_secs(cfg.cooldown_secs),
            max_cooldown: Duration::from_secs(cfg.max_cooldown_secs.max(cfg.cooldown_secs)),
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, source_id: &str) -> bool {
        self.allow_at(source_id, Instant::now())
    }

    pub fn record_outcome(&self, source_id: &str, success: bool) {
        self.record_outcome_at(source_id, success, Instant::now())
    }

    pub fn state(&self, source_id: &str) -> CircuitState {
        let circuits = self.lock();
        circuits
            .get(source_id)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh_circuit(&self) -> Circuit {
        Circuit {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown: self.base_cooldown,
            probe_inflight: false,
        }
    }

    pub(crate) fn allow_at(&self, source_id: &str, now: Instant) -> bool {
        let mut circuits = self.lock();
        let circuit = circuits
            .entry(source_id.to_string())
            .or_insert_with(|| self.fresh_circuit());
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                if elapsed < circuit.cooldown {
                    return false;
                }
                info!(source = source_id, "circuit half-open, allowing probe");
                circuit.state = CircuitState::HalfOpen;
                circuit.probe_inflight = true;
                true
            }
            CircuitState::HalfOpen => {
                if circuit.probe_inflight {
                    false
                } else {
                    circuit.probe_inflight = true;
                    true
                }
            }
        }
    }

    /// Outcomes count even for sources that never passed through `allow`;
    /// discovery failures report here directly.
    pub(crate) fn record_outcome_at(&self, source_id: &str, success: bool, now: Instant) {
        let mut circuits = self.lock();
        let circuit = circuits
            .entry(source_id.to_string())
            .or_insert_with(|| self.fresh_circuit());
        circuit.probe_inflight = false;
        if success {
            if circuit.state != CircuitState::Closed {
                info!(source = source_id, "circuit closed");
            }
            circuit.state = CircuitState::Closed;
            circuit.consecutive_failures = 0;
            circuit.cooldown = self.base_cooldown;
            circuit.opened_at = None;
            return;
        }
        circuit.consecutive_failures += 1;
        match circuit.state {
            CircuitState::HalfOpen => {
                // Failed probe: back to open, cool-down doubled and bounded.
                circuit.cooldown = (circuit.cooldown * 2).min(self.max_cooldown);
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                warn!(
                    source = source_id,
                    cooldown_secs = circuit.cooldown.as_secs(),
                    "probe failed, circuit re-opened"
                );
            }
            CircuitState::Closed if circuit.consecutive_failures >= self.threshold => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                warn!(
                    source = source_id,
                    failures = circuit.consecutive_failures,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }
}
