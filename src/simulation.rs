//! Adaptor over multiple simulation backends with bounded timeouts and ordered
//! fallback (spec §4.15, C15), grounded in the bundler/paymaster backend-fallback
//! pattern used for account-abstraction submission.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::strategy::PreparedExecution;

#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub success: bool,
    pub would_revert: bool,
    pub revert_reason: Option<String>,
    pub return_value: Option<String>,
    pub provider: String,
    pub latency_ms: u64,
}

/// One simulation backend (local `eth_call`, Tenderly, Alchemy, ...). Implementations
/// distinguish a revert (a real simulation result) from a transport error (the
/// backend itself is unreachable) so the caller can fall through only on the latter.
#[async_trait]
pub trait SimulationBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn simulate(&self, prepared: &PreparedExecution, chain: &str) -> eyre::Result<SimulationOutcome>;
}

#[derive(Debug, PartialEq)]
pub struct SimulationServiceConfig {
    pub backend_timeout_ms: u64,
    pub min_simulation_profit_native: f64,
    /// Opportunities must clear this much wall-clock budget (ms) before expiry to
    /// be worth simulating at all; otherwise simulation is skipped outright.
    pub time_critical_threshold_ms: u64,
}

/// Tries each configured backend in order, falling through to the next on
/// transport failure or timeout; the first backend that actually returns a
/// simulation result (success or revert) wins.
pub struct SimulationService {
    config: SimulationServiceConfig,
    backends: Vec<Arc<dyn SimulationBackend>>,
}

impl SimulationService {
    pub fn new(config: SimulationServiceConfig, backends: Vec<Arc<dyn SimulationBackend>>) -> Self {
        Self { config, backends }
    }

    pub fn should_simulate(&self, expected_profit_native: f64, ms_until_expiry: u64) -> bool {
        expected_profit_native >= self.config.min_simulation_profit_native
            && ms_until_expiry >= self.config.time_critical_threshold_ms
    }

    pub async fn simulate(&self, prepared: &PreparedExecution, chain: &str) -> SimulationOutcome {
        let timeout = Duration::from_millis(self.config.backend_timeout_ms);
        for backend in &self.backends {
            let start = std::time::Instant::now();
            match tokio::time::timeout(timeout, backend.simulate(prepared, chain)).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(err)) => {
                    tracing::warn!(backend = backend.name(), error = %err, "simulation backend error, trying next");
                }
                Err(_) => {
                    tracing::warn!(backend = backend.name(), latency_ms = start.elapsed().as_millis(), "simulation backend timed out, trying next");
                }
            }
        }
        SimulationOutcome {
            success: false,
            would_revert: false,
            revert_reason: None,
            return_value: None,
            provider: "none".into(),
            latency_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn prepared() -> PreparedExecution {
        PreparedExecution {
            opportunity_id: "op-1".into(),
            chain: "ethereum".into(),
            gas_price_wei: 1,
            nonce_lock_held: true,
        }
    }

    struct FailingBackend(&'static str);
    #[async_trait]
    impl SimulationBackend for FailingBackend {
        fn name(&self) -> &str {
            self.0
        }
        async fn simulate(&self, _prepared: &PreparedExecution, _chain: &str) -> eyre::Result<SimulationOutcome> {
            Err(eyre::eyre!("transport error"))
        }
    }

    struct SucceedingBackend(&'static str, Arc<AtomicBool>);
    #[async_trait]
    impl SimulationBackend for SucceedingBackend {
        fn name(&self) -> &str {
            self.0
        }
        async fn simulate(&self, _prepared: &PreparedExecution, _chain: &str) -> eyre::Result<SimulationOutcome> {
            self.1.store(true, Ordering::SeqCst);
            Ok(SimulationOutcome {
                success: true,
                would_revert: false,
                revert_reason: None,
                return_value: Some("0x1".into()),
                provider: self.0.to_string(),
                latency_ms: 5,
            })
        }
    }

    #[tokio::test]
    async fn falls_through_failing_backends_to_a_succeeding_one() {
        let called = Arc::new(AtomicBool::new(false));
        let service = SimulationService::new(
            SimulationServiceConfig { backend_timeout_ms: 200, min_simulation_profit_native: 0.0, time_critical_threshold_ms: 0 },
            vec![
                Arc::new(FailingBackend("tenderly")),
                Arc::new(SucceedingBackend("alchemy", called.clone())),
            ],
        );
        let outcome = service.simulate(&prepared(), "ethereum").await;
        assert!(outcome.success);
        assert_eq!(outcome.provider, "alchemy");
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn all_backends_failing_yields_unsuccessful_outcome() {
        let service = SimulationService::new(
            SimulationServiceConfig { backend_timeout_ms: 200, min_simulation_profit_native: 0.0, time_critical_threshold_ms: 0 },
            vec![Arc::new(FailingBackend("tenderly")), Arc::new(FailingBackend("alchemy"))],
        );
        let outcome = service.simulate(&prepared(), "ethereum").await;
        assert!(!outcome.success);
    }

    #[test]
    fn should_simulate_respects_profit_and_time_thresholds() {
        let service = SimulationService::new(
            SimulationServiceConfig { backend_timeout_ms: 200, min_simulation_profit_native: 0.01, time_critical_threshold_ms: 2_000 },
            vec![],
        );
        assert!(service.should_simulate(0.02, 3_000));
        assert!(!service.should_simulate(0.001, 3_000));
        assert!(!service.should_simulate(0.02, 500));
    }
}
