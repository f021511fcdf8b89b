//! Circuit breaker pattern for worker failure isolation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures tolerated inside the window; one more opens the circuit (default: 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Trailing window for counting failures, in seconds (default: 60).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// First cooldown after opening, in seconds (default: 30).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Factor applied to the cooldown after a failed trial (default: 2.0).
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,

    /// Upper bound on the cooldown, in seconds (default: 600).
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

fn default_failure_threshold() -> usize {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_cooldown_multiplier() -> f64 {
    2.0
}

fn default_max_cooldown_secs() -> u64 {
    600
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

/// Invalid circuit breaker settings.
#[derive(Debug, Error, PartialEq)]
pub enum CircuitBreakerConfigError {
    /// Threshold must be at least one failure.
    #[error("failure_threshold must be greater than 0")]
    InvalidThreshold,

    /// Window and cooldown must be non-zero.
    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    /// Multiplier below one would shorten cooldowns.
    #[error("cooldown_multiplier must be >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    /// Cap below the base cooldown.
    #[error("max_cooldown_secs ({max}) must be >= cooldown_secs ({base})")]
    CapBelowBase {
        /// Configured cap.
        max: u64,
        /// Configured base cooldown.
        base: u64,
    },
}

impl CircuitBreakerConfig {
    /// Validates the settings.
    ///
    /// # Errors
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), CircuitBreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerConfigError::InvalidThreshold);
        }
        if self.window_secs == 0 {
            return Err(CircuitBreakerConfigError::ZeroDuration("window_secs"));
        }
        if self.cooldown_secs == 0 {
            return Err(CircuitBreakerConfigError::ZeroDuration("cooldown_secs"));
        }
        if !(self.cooldown_multiplier >= 1.0) {
            return Err(CircuitBreakerConfigError::InvalidMultiplier(self.cooldown_multiplier));
        }
        if self.max_cooldown_secs < self.cooldown_secs {
            return Err(CircuitBreakerConfigError::CapBelowBase {
                max: self.max_cooldown_secs,
                base: self.cooldown_secs,
            });
        }
        Ok(())
    }

    /// Get the failure window as a Duration.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Get the base cooldown as a Duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Get the cooldown cap as a Duration.
    #[must_use]
    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }
}

/// Circuit breaker state for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - normal operation.
    Closed,
    /// Circuit is open - skipping the worker until the instant passes.
    Open {
        /// When the cooldown ends.
        until: Instant,
    },
    /// Circuit is half-open - one trial request is allowed.
    HalfOpen {
        /// Whether the trial has been handed out.
        trial_in_flight: bool,
    },
}

#[derive(Debug)]
struct WorkerCircuit {
    state: CircuitState,
    failures: VecDeque<Instant>,
    cooldown: Duration,
}

impl WorkerCircuit {
    fn new(cooldown: Duration) -> Self {
        Self { state: CircuitState::Closed, failures: VecDeque::new(), cooldown }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Moves an expired open circuit to half-open.
    fn refresh(&mut self, now: Instant) {
        if let CircuitState::Open { until } = self.state {
            if now >= until {
                self.state = CircuitState::HalfOpen { trial_in_flight: false };
            }
        }
    }
}

/// Circuit breaker keeping one circuit per worker.
#[derive(Debug)]
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, WorkerCircuit>>,
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Creates a circuit breaker with the given settings.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { circuits: Mutex::new(HashMap::new()), config }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerCircuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the worker could be dispatched to right now.
    ///
    /// Does not reserve the half-open trial; see [`CircuitBreaker::try_acquire`].
    pub fn is_available(&self, worker_id: &str) -> bool {
        let now = Instant::now();
        let mut circuits = self.lock();
        let Some(circuit) = circuits.get_mut(worker_id) else { return true };
        circuit.refresh(now);
        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen { trial_in_flight: false } => true,
            CircuitState::Open { .. } | CircuitState::HalfOpen { trial_in_flight: true } => false,
        }
    }

    /// Admits a dispatch to the worker, reserving the trial if half-open.
    ///
    /// # Returns
    /// `false` if the circuit is open or its trial is already taken.
    pub fn try_acquire(&self, worker_id: &str) -> bool {
        let now = Instant::now();
        let mut circuits = self.lock();
        let Some(circuit) = circuits.get_mut(worker_id) else { return true };
        circuit.refresh(now);
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen { trial_in_flight: false } => {
                circuit.state = CircuitState::HalfOpen { trial_in_flight: true };
                info!(worker_id = %worker_id, "Circuit breaker: admitting half-open trial");
                true
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen { trial_in_flight: true } => false,
        }
    }

    /// Hands back a half-open trial that was reserved but never dispatched.
    ///
    /// # Returns
    /// `true` if a reserved trial was released.
    pub fn release_trial(&self, worker_id: &str) -> bool {
        let mut circuits = self.lock();
        let Some(circuit) = circuits.get_mut(worker_id) else { return false };
        if circuit.state == (CircuitState::HalfOpen { trial_in_flight: true }) {
            circuit.state = CircuitState::HalfOpen { trial_in_flight: false };
            debug!(worker_id = %worker_id, "Circuit breaker: half-open trial released");
            true
        } else {
            false
        }
    }

    /// Records a successful execution.
    pub fn record_success(&self, worker_id: &str) {
        let now = Instant::now();
        let mut circuits = self.lock();
        let Some(circuit) = circuits.get_mut(worker_id) else { return };
        circuit.refresh(now);

        if let CircuitState::HalfOpen { .. } = circuit.state {
            circuit.state = CircuitState::Closed;
            circuit.failures.clear();
            circuit.cooldown = self.config.cooldown();
            info!(worker_id = %worker_id, "Circuit breaker: HalfOpen -> Closed (trial succeeded)");
        }
    }

    /// Records a failed execution.
    pub fn record_failure(&self, worker_id: &str) {
        let now = Instant::now();
        let window = self.config.window();
        let mut circuits = self.lock();
        let circuit = circuits
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerCircuit::new(self.config.cooldown()));
        circuit.refresh(now);
        circuit.failures.push_back(now);
        circuit.prune(now, window);

        match circuit.state {
            CircuitState::Closed => {
                if circuit.failures.len() > self.config.failure_threshold {
                    circuit.state = CircuitState::Open { until: now + circuit.cooldown };
                    warn!(
                        worker_id = %worker_id,
                        failures = circuit.failures.len(),
                        threshold = self.config.failure_threshold,
                        cooldown_secs = circuit.cooldown.as_secs_f64(),
                        "Circuit breaker: Closed -> Open (failure threshold exceeded)"
                    );
                } else {
                    debug!(worker_id = %worker_id, failures = circuit.failures.len(), "Recorded worker failure");
                }
            }
            CircuitState::HalfOpen { .. } => {
                let next = circuit.cooldown.mul_f64(self.config.cooldown_multiplier);
                circuit.cooldown = next.min(self.config.max_cooldown());
                circuit.state = CircuitState::Open { until: now + circuit.cooldown };
                warn!(
                    worker_id = %worker_id,
                    cooldown_secs = circuit.cooldown.as_secs_f64(),
                    "Circuit breaker: HalfOpen -> Open (trial failed)"
                );
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Gets the current circuit state for a worker.
    pub fn state(&self, worker_id: &str) -> CircuitState {
        let now = Instant::now();
        let mut circuits = self.lock();
        circuits.get_mut(worker_id).map_or(CircuitState::Closed, |circuit| {
            circuit.refresh(now);
            circuit.state
        })
    }

    /// Current cooldown for a worker.
    pub fn current_cooldown(&self, worker_id: &str) -> Duration {
        self.lock().get(worker_id).map_or_else(|| self.config.cooldown(), |c| c.cooldown)
    }

    /// Failures currently inside the trailing window.
    pub fn failure_count(&self, worker_id: &str) -> usize {
        let now = Instant::now();
        let window = self.config.window();
        let mut circuits = self.lock();
        circuits.get_mut(worker_id).map_or(0, |circuit| {
            circuit.prune(now, window);
            circuit.failures.len()
        })
    }

    /// Get the breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            window_secs: 60,
            cooldown_secs: 30,
            cooldown_multiplier: 2.0,
            max_cooldown_secs: 90,
        })
    }

    fn open(breaker: &CircuitBreaker, worker: &str) {
        for _ in 0..4 {
            breaker.record_failure(worker);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_only_above_threshold() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure("w");
        }
        assert_eq!(breaker.failure_count("w"), 3);
        assert!(breaker.is_available("w"));
        assert_eq!(breaker.state("w"), CircuitState::Closed);

        breaker.record_failure("w");
        assert!(!breaker.is_available("w"));
        assert!(!breaker.try_acquire("w"));
        assert!(matches!(breaker.state("w"), CircuitState::Open { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_failure("w");
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.record_failure("w");
        assert_eq!(breaker.failure_count("w"), 1);
        assert_eq!(breaker.state("w"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let breaker = breaker();
        open(&breaker, "w");
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(breaker.is_available("w"));
        assert!(breaker.try_acquire("w"));
        assert!(!breaker.try_acquire("w"));
        assert!(!breaker.is_available("w"));

        breaker.record_success("w");
        assert_eq!(breaker.state("w"), CircuitState::Closed);
        assert_eq!(breaker.failure_count("w"), 0);
        assert!(breaker.try_acquire("w"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_backs_off_up_to_cap() {
        let breaker = breaker();
        open(&breaker, "w");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.try_acquire("w"));
        breaker.record_failure("w");
        assert_eq!(breaker.current_cooldown("w"), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!breaker.is_available("w"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.try_acquire("w"));
        breaker.record_failure("w");
        assert_eq!(breaker.current_cooldown("w"), Duration::from_secs(90));

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(breaker.try_acquire("w"));
        breaker.record_success("w");
        assert_eq!(breaker.current_cooldown("w"), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_can_be_taken_again() {
        let breaker = breaker();
        open(&breaker, "w");
        assert!(!breaker.release_trial("w"));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.try_acquire("w"));
        assert!(!breaker.try_acquire("w"));

        assert!(breaker.release_trial("w"));
        assert_eq!(breaker.state("w"), CircuitState::HalfOpen { trial_in_flight: false });
        assert!(breaker.try_acquire("w"));
        assert!(!breaker.release_trial("ghost"));
    }

    #[tokio::test]
    async fn test_unknown_worker_is_closed() {
        let breaker = CircuitBreaker::default();
        assert!(breaker.is_available("fresh"));
        assert_eq!(breaker.state("fresh"), CircuitState::Closed);
        breaker.record_success("fresh");
        assert_eq!(breaker.failure_count("fresh"), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let bad = CircuitBreakerConfig { cooldown_multiplier: 0.5, ..CircuitBreakerConfig::default() };
        assert_eq!(bad.validate(), Err(CircuitBreakerConfigError::InvalidMultiplier(0.5)));
        let capped = CircuitBreakerConfig { max_cooldown_secs: 10, ..CircuitBreakerConfig::default() };
        assert!(matches!(capped.validate(), Err(CircuitBreakerConfigError::CapBelowBase { .. })));
    }
}
