//! Closed/Open/Half-Open circuit breaker with cooldown and limited probe
//! concurrency (spec §4.4, C4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::types::{BreakerState, CircuitBreakerSnapshot, ExecutionStats};

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub cooldown_period_ms: u64,
    pub half_open_max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub previous_state: BreakerState,
    pub new_state: BreakerState,
    pub consecutive_failures: u32,
    pub reason: String,
    pub timestamp_ms: u64,
}

pub type StateChangeListener = Box<dyn Fn(StateChangeEvent) + Send + Sync>;

#[derive(Debug, Default)]
pub struct BreakerMetrics {
    pub times_tripped: AtomicU64,
    pub total_failures: AtomicU64,
    pub total_successes: AtomicU64,
    /// Accumulated open-duration across all trips, updated when the breaker leaves Open.
    pub total_open_time_ms: AtomicU64,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at_ms: Option<u64>,
    half_open_attempts_used: u32,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    listener: Mutex<Option<StateChangeListener>>,
    pub metrics: BreakerMetrics,
    stats: Arc<ExecutionStats>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>, stats: Arc<ExecutionStats>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at_ms: None,
                half_open_attempts_used: 0,
            }),
            listener: Mutex::new(None),
            metrics: BreakerMetrics::default(),
            stats,
        }
    }

    pub fn on_state_change(&self, listener: StateChangeListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn emit(&self, previous: BreakerState, new: BreakerState, failures: u32, reason: &str) {
        if let Some(cb) = self.listener.lock().unwrap().as_ref() {
            cb(StateChangeEvent {
                previous_state: previous,
                new_state: new,
                consecutive_failures: failures,
                reason: reason.to_string(),
                timestamp_ms: self.clock.now_ms(),
            });
        }
        tracing::info!(?previous, ?new, failures, reason, "circuit breaker state change");
    }

    /// Open -> HalfOpen transition happens lazily on the first `can_execute()` call at
    /// or after `opened_at + cooldown`; HalfOpen caps concurrent probes at
    /// `half_open_max_attempts`.
    pub fn can_execute(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let now = self.clock.now_ms();
                let opened_at = inner.opened_at_ms.unwrap_or(now);
                if now >= opened_at.saturating_add(self.config.cooldown_period_ms) {
                    let elapsed = now.saturating_sub(opened_at);
                    self.metrics.total_open_time_ms.fetch_add(elapsed, Ordering::Relaxed);
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_attempts_used = 0;
                    let failures = inner.consecutive_failures;
                    drop(inner);
                    self.emit(BreakerState::Open, BreakerState::HalfOpen, failures, "cooldown elapsed");
                    self.record_half_open_attempt()
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                drop(inner);
                self.record_half_open_attempt()
            }
        }
    }

    fn record_half_open_attempt(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::HalfOpen {
            return inner.state == BreakerState::Closed;
        }
        if inner.half_open_attempts_used < self.config.half_open_max_attempts {
            inner.half_open_attempts_used += 1;
            true
        } else {
            false
        }
    }

    pub fn record_success(&self) {
        self.metrics.total_successes.fetch_add(1, Ordering::Relaxed);
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at_ms = None;
                drop(inner);
                self.emit(BreakerState::HalfOpen, BreakerState::Closed, 0, "recovered");
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.metrics.total_failures.fetch_add(1, Ordering::Relaxed);
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at_ms = Some(self.clock.now_ms());
                    self.metrics.times_tripped.fetch_add(1, Ordering::Relaxed);
                    self.stats.incr_circuit_breaker_trips();
                    let failures = inner.consecutive_failures;
                    drop(inner);
                    self.emit(BreakerState::Closed, BreakerState::Open, failures, "failure threshold reached");
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at_ms = Some(self.clock.now_ms());
                self.metrics.times_tripped.fetch_add(1, Ordering::Relaxed);
                self.stats.incr_circuit_breaker_trips();
                let failures = inner.consecutive_failures;
                drop(inner);
                self.emit(BreakerState::HalfOpen, BreakerState::Open, failures, "probe failed");
            }
            BreakerState::Open => {}
        }
    }

    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.state;
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at_ms = None;
        drop(inner);
        self.emit(previous, BreakerState::Closed, 0, "Manual force-close");
    }

    pub fn force_open(&self, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        let previous = inner.state;
        inner.state = BreakerState::Open;
        inner.opened_at_ms = Some(self.clock.now_ms());
        self.metrics.times_tripped.fetch_add(1, Ordering::Relaxed);
        self.stats.incr_circuit_breaker_trips();
        let failures = inner.consecutive_failures;
        drop(inner);
        self.emit(previous, BreakerState::Open, failures, &format!("Manual force-open: {reason}"));
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at_ms: inner.opened_at_ms,
            half_open_attempts_used: inner.half_open_attempts_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = ManualClock::new(0);
        let cb = CircuitBreaker::new(
            BreakerConfig {
                enabled: true,
                failure_threshold: 3,
                cooldown_period_ms: 60_000,
                half_open_max_attempts: 1,
            },
            clock.clone(),
            Arc::new(ExecutionStats::default()),
        );
        (cb, clock)
    }

    #[test]
    fn full_cycle_trip_cooldown_recover() {
        let (cb, clock) = breaker();
        assert!(cb.can_execute());
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.snapshot().state, BreakerState::Open);
        assert!(!cb.can_execute());

        clock.advance(60_001);
        assert!(cb.can_execute());
        assert_eq!(cb.snapshot().state, BreakerState::HalfOpen);

        // halfOpenMaxAttempts = 1: second concurrent probe within HalfOpen is rejected.
        assert!(!cb.can_execute());

        cb.record_success();
        let snap = cb.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.consecutive_failures, 0);

        assert_eq!(cb.metrics.times_tripped.load(Ordering::SeqCst), 1);
        assert_eq!(cb.metrics.total_successes.load(Ordering::SeqCst), 1);
        assert_eq!(cb.metrics.total_failures.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn half_open_failure_reopens() {
        let (cb, clock) = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        clock.advance(60_001);
        assert!(cb.can_execute());
        cb.record_failure();
        assert_eq!(cb.snapshot().state, BreakerState::Open);
    }

    #[test]
    fn manual_overrides() {
        let (cb, _clock) = breaker();
        cb.force_open("maintenance");
        assert_eq!(cb.snapshot().state, BreakerState::Open);
        cb.force_close();
        assert_eq!(cb.snapshot().state, BreakerState::Closed);
    }

    #[test]
    fn trips_are_reflected_in_execution_stats() {
        let clock = ManualClock::new(0);
        let stats = Arc::new(ExecutionStats::default());
        let cb = CircuitBreaker::new(
            BreakerConfig { enabled: true, failure_threshold: 2, cooldown_period_ms: 60_000, half_open_max_attempts: 1 },
            clock,
            stats.clone(),
        );
        assert_eq!(stats.circuit_breaker_trips(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.snapshot().state, BreakerState::Open);
        assert_eq!(stats.circuit_breaker_trips(), 1);

        cb.force_open("maintenance");
        assert_eq!(stats.circuit_breaker_trips(), 2);
    }
}
