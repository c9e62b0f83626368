//! Coordinator driving the dequeue -> risk -> strategy -> record-outcome pipeline
//! (spec §4.13, C13). Owns stats, the nonce manager reference, the strategy
//! registry, and a starting/running/stopping/stopped state machine; the actual
//! strategy logic lives behind the `Strategy` trait, not here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::breaker::CircuitBreaker;
use crate::consumer::Consumer;
use crate::lock_tracker::LockTracker;
use crate::nonce::NonceAllocator;
use crate::queue::Queue;
use crate::risk::{RiskAssessmentInput, RiskOrchestrator};
use crate::simulation::SimulationService;
use crate::strategy::StrategyRegistry;
use crate::types::{ExecutionStats, Opportunity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct Engine {
    state: RwLock<EngineState>,
    queue: Arc<Queue>,
    consumer: Arc<Consumer>,
    breaker: Arc<CircuitBreaker>,
    risk: Arc<RiskOrchestrator>,
    strategies: Arc<StrategyRegistry>,
    simulation: Arc<SimulationService>,
    nonce: Arc<NonceAllocator>,
    lock_tracker: Arc<LockTracker>,
    stats: Arc<ExecutionStats>,
    /// Re-entrancy guard set synchronously at entry to `process_one`, before any
    /// await point, so the queue's synchronous item-available signal can never
    /// observe two overlapping in-flight items (spec §5).
    processing: AtomicBool,
    execution_timeout: std::time::Duration,
}

const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 30_000;

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<Queue>,
        consumer: Arc<Consumer>,
        breaker: Arc<CircuitBreaker>,
        risk: Arc<RiskOrchestrator>,
        strategies: Arc<StrategyRegistry>,
        simulation: Arc<SimulationService>,
        nonce: Arc<NonceAllocator>,
        lock_tracker: Arc<LockTracker>,
        stats: Arc<ExecutionStats>,
    ) -> Self {
        Self::with_execution_timeout(
            queue,
            consumer,
            breaker,
            risk,
            strategies,
            simulation,
            nonce,
            lock_tracker,
            stats,
            std::time::Duration::from_millis(DEFAULT_EXECUTION_TIMEOUT_MS),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_execution_timeout(
        queue: Arc<Queue>,
        consumer: Arc<Consumer>,
        breaker: Arc<CircuitBreaker>,
        risk: Arc<RiskOrchestrator>,
        strategies: Arc<StrategyRegistry>,
        simulation: Arc<SimulationService>,
        nonce: Arc<NonceAllocator>,
        lock_tracker: Arc<LockTracker>,
        stats: Arc<ExecutionStats>,
        execution_timeout: std::time::Duration,
    ) -> Self {
        Self {
            state: RwLock::new(EngineState::Starting),
            queue,
            consumer,
            breaker,
            risk,
            strategies,
            simulation,
            nonce,
            lock_tracker,
            stats,
            processing: AtomicBool::new(false),
            execution_timeout,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.read().unwrap()
    }

    pub fn start(&self) {
        *self.state.write().unwrap() = EngineState::Running;
    }

    pub fn stop(&self) {
        *self.state.write().unwrap() = EngineState::Stopping;
        self.consumer.stop();
        *self.state.write().unwrap() = EngineState::Stopped;
    }

    /// Pulls and processes everything currently queued. In production this is
    /// driven by the queue's item-available callback; tests call it directly.
    pub async fn drain_queue(&self) {
        while let Some(opportunity) = self.queue.dequeue() {
            self.process_one(opportunity).await;
        }
    }

    /// Guarded by `processing`; on the rare re-entrant hit (the guard is meant to
    /// make this unreachable in steady state, see `drain_queue`'s single-drain-task
    /// caller) the opportunity is re-queued rather than dropped, so it is never
    /// silently lost.
    async fn process_one(&self, opportunity: Opportunity) {
        if self.processing.swap(true, Ordering::SeqCst) {
            tracing::warn!(opportunity_id = %opportunity.id, "re-entrant engine invocation detected; re-queueing");
            if !self.queue.enqueue(opportunity) {
                tracing::error!("re-entrant opportunity dropped: queue rejected re-enqueue");
            }
            return;
        }
        self.process_one_inner(opportunity).await;
        self.processing.store(false, Ordering::SeqCst);
    }

    /// Runs the dequeue -> risk -> strategy -> record-outcome pipeline. Every exit
    /// path funnels through the end of the `'pipeline` block so `mark_complete` -
    /// the consumer's sole deferred-ACK trigger (spec §4.7) - fires exactly once per
    /// opportunity regardless of which stage short-circuits.
    async fn process_one_inner(&self, opportunity: Opportunity) {
        self.stats.incr_attempts();
        let opportunity_id = opportunity.id.clone();
        let chain = opportunity.chain().unwrap_or("unknown").to_string();
        let opportunity_key = opportunity_type_key(&opportunity);

        'pipeline: {
            if !self.breaker.can_execute() {
                tracing::debug!(opportunity_id, "circuit breaker open, skipping");
                self.stats.incr_rejected();
                break 'pipeline;
            }

            let decision = match self.risk.assess(&RiskAssessmentInput {
                opportunity_key: opportunity_key.clone(),
                expected_profit_native: opportunity.expected_profit,
                expected_loss_native: opportunity.expected_profit * 0.1,
            }) {
                Ok(decision) => decision,
                Err(err) => {
                    tracing::debug!(opportunity_id, error = %err, "risk pipeline rejected opportunity");
                    self.stats.incr_rejected();
                    break 'pipeline;
                }
            };

            let Some(strategy) = self.strategies.get(opportunity.kind) else {
                tracing::warn!(opportunity_id, "no strategy registered for opportunity type");
                self.stats.incr_failed();
                self.risk.record_outcome(
                    &opportunity_key,
                    &crate::types::ExecutionOutcome::Failed { gas_cost_native: 0.0, reason: "no strategy".into() },
                );
                break 'pipeline;
            };

            let prepared = match strategy.prepare(&opportunity, &decision).await {
                Ok(prepared) => prepared,
                Err(err) => {
                    tracing::warn!(opportunity_id, error = %err, "strategy prepare failed");
                    self.stats.incr_failed();
                    self.breaker.record_failure();
                    self.nonce.release_lock(&chain, &opportunity_id);
                    self.risk.record_outcome(
                        &opportunity_key,
                        &crate::types::ExecutionOutcome::Failed { gas_cost_native: 0.0, reason: err.to_string() },
                    );
                    break 'pipeline;
                }
            };

            if self.simulation.should_simulate(opportunity.expected_profit, time_until_expiry_ms(&opportunity)) {
                let outcome = self.simulation.simulate(&prepared, &chain).await;
                if outcome.would_revert {
                    tracing::debug!(opportunity_id, reason = ?outcome.revert_reason, "simulation predicts revert, skipping execution");
                    self.stats.incr_rejected();
                    self.nonce.release_lock(&chain, &opportunity_id);
                    self.risk.record_outcome(
                        &opportunity_key,
                        &crate::types::ExecutionOutcome::Failed {
                            gas_cost_native: 0.0,
                            reason: outcome.revert_reason.unwrap_or_else(|| "simulated revert".into()),
                        },
                    );
                    break 'pipeline;
                }
            }

            let outcome = match self.execute_with_timeout(&chain, &opportunity_id, strategy.as_ref(), &prepared).await {
                Ok(outcome) => outcome,
                Err(err) => crate::types::ExecutionOutcome::Failed { gas_cost_native: 0.0, reason: err.to_string() },
            };

            self.nonce.release_lock(&chain, &opportunity_id);
            self.lock_tracker.clear_on_success(&opportunity_id);

            if outcome.is_success() {
                self.stats.incr_successful();
                self.breaker.record_success();
            } else {
                self.stats.incr_failed();
                self.breaker.record_failure();
            }
            self.risk.record_outcome(&opportunity_key, &outcome);
        }

        self.consumer.mark_complete(&opportunity_id).await;
    }

    /// Bounds a strategy's on-chain submission so a hung RPC call can't wedge the
    /// single drain task forever; records the stall as an execution timeout
    /// (spec §3 `executionTimeouts`) rather than letting it look like a generic
    /// execution failure.
    async fn execute_with_timeout(
        &self,
        chain: &str,
        opportunity_id: &str,
        strategy: &dyn crate::strategy::Strategy,
        prepared: &crate::strategy::PreparedExecution,
    ) -> eyre::Result<crate::types::ExecutionOutcome> {
        match tokio::time::timeout(self.execution_timeout, strategy.execute(prepared)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(opportunity_id, chain, timeout_ms = self.execution_timeout.as_millis() as u64, "strategy execution timed out");
                self.stats.incr_execution_timeouts();
                Err(crate::errors::EngineError::ExecutionTimeout { timeout_ms: self.execution_timeout.as_millis() as u64 }.into())
            }
        }
    }
}

fn opportunity_type_key(opportunity: &Opportunity) -> String {
    format!("{:?}", opportunity.kind)
}

fn time_until_expiry_ms(opportunity: &Opportunity) -> u64 {
    opportunity.expires_at_ms.saturating_sub(opportunity.execution_received_at_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::clock::{ManualClock, SystemClock};
    use crate::consumer::{Consumer, ConsumerConfig};
    use crate::queue::{Queue, QueueConfig};
    use crate::risk::RiskConfig;
    use crate::simulation::SimulationServiceConfig;
    use crate::strategy::{PreparedExecution, Strategy, StrategyRegistry};
    use crate::stream::InMemoryStreams;
    use crate::types::{ExecutionOutcome, OpportunityType};
    use async_trait::async_trait;

    fn opp(id: &str) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            kind: OpportunityType::Simple,
            token_in: "WETH".into(),
            token_out: "USDC".into(),
            amount_in: 1,
            expected_profit: 0.05,
            confidence: 0.9,
            expires_at_ms: 1_000_000,
            buy_chain: Some("ethereum".into()),
            sell_chain: None,
            buy_dex: None,
            sell_dex: None,
            pipeline_timestamps: Default::default(),
            execution_received_at_ms: 0,
        }
    }

    struct AlwaysSucceeds;
    #[async_trait]
    impl Strategy for AlwaysSucceeds {
        fn opportunity_type(&self) -> OpportunityType {
            OpportunityType::Simple
        }
        async fn prepare(&self, opportunity: &Opportunity, _decision: &crate::risk::RiskDecision) -> eyre::Result<PreparedExecution> {
            Ok(PreparedExecution {
                opportunity_id: opportunity.id.clone(),
                chain: "ethereum".into(),
                gas_price_wei: 1,
                nonce_lock_held: false,
            })
        }
        async fn execute(&self, _prepared: &PreparedExecution) -> eyre::Result<ExecutionOutcome> {
            Ok(ExecutionOutcome::Success { profit_native: 0.05, gas_cost_native: 0.001 })
        }
    }

    fn build_engine() -> (Arc<Engine>, Arc<Queue>) {
        let clock = ManualClock::new(0);
        let queue = Arc::new(Queue::new(QueueConfig { max_size: 10, high_water_mark: 8, low_water_mark: 2 }));
        let streams = Arc::new(InMemoryStreams::default());
        let consumer = Arc::new(Consumer::new(
            ConsumerConfig {
                batch_size: 10,
                block_ms: 100,
                stream_name: "s".into(),
                group_name: "g".into(),
                service_name: "svc".into(),
                instance_id: "1".into(),
                pending_stale_after_ms: 60_000,
            },
            clock.clone(),
            streams.clone(),
            streams.clone(),
            queue.clone(),
            Arc::new(ExecutionStats::default()),
        ));
        let stats = Arc::new(ExecutionStats::default());
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig { enabled: true, failure_threshold: 3, cooldown_period_ms: 60_000, half_open_max_attempts: 1 },
            clock.clone(),
            stats.clone(),
        ));
        let risk = Arc::new(RiskOrchestrator::new(
            RiskConfig { max_in_flight_trades: 3, kelly: crate::risk::KellyConfig { enabled: false, base_size_wei: 1, min_fraction: 0.0 }, ..RiskConfig::default() },
            stats.clone(),
        ));
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(AlwaysSucceeds));
        let simulation = Arc::new(SimulationService::new(
            SimulationServiceConfig { backend_timeout_ms: 200, min_simulation_profit_native: 1.0, time_critical_threshold_ms: 0 },
            vec![],
        ));
        let nonce = Arc::new(NonceAllocator::new());
        let lock_tracker = Arc::new(LockTracker::new(Arc::new(SystemClock)));

        let engine = Arc::new(Engine::new(
            queue.clone(),
            consumer,
            breaker,
            risk,
            Arc::new(registry),
            simulation,
            nonce,
            lock_tracker,
            stats,
        ));
        (engine, queue)
    }

    #[tokio::test]
    async fn successful_execution_updates_stats_and_breaker() {
        let (engine, queue) = build_engine();
        engine.start();
        queue.enqueue(opp("op-1"));
        engine.drain_queue().await;
        assert_eq!(engine.stats.successful(), 1);
        assert_eq!(engine.stats.attempts(), 1);
        assert_eq!(engine.risk.get_in_flight_count(), 0);
    }

    #[tokio::test]
    async fn open_breaker_skips_processing() {
        let (engine, queue) = build_engine();
        engine.breaker.force_open("test");
        queue.enqueue(opp("op-1"));
        engine.drain_queue().await;
        assert_eq!(engine.stats.attempts(), 1);
        assert_eq!(engine.stats.successful(), 0);
        assert_eq!(engine.stats.rejected(), 1);
    }
}
