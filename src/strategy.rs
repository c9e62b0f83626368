//! Strategy interface and registry. Concrete per-opportunity-type execution logic
//! (the actual swap construction, flash-loan orchestration, etc.) is out of scope
//! (spec §2 Non-goals); this module defines the seam the engine calls through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::risk::RiskDecision;
use crate::types::{ExecutionOutcome, Opportunity, OpportunityType};

/// Everything a strategy's `prepare` step may reach into, assembled by the engine
/// per opportunity (spec §4.13 step 4: GasOptimizer, MevShaper, NonceAllocator,
/// BridgeFilter, CommitReveal as needed).
pub struct PreparedExecution {
    pub opportunity_id: String,
    pub chain: String,
    pub gas_price_wei: u128,
    pub nonce_lock_held: bool,
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn opportunity_type(&self) -> OpportunityType;

    /// Builds everything needed to submit: gas pricing, MEV shaping, nonce lock,
    /// bridge checks, commit-reveal as applicable. Pure preparation, no submission.
    async fn prepare(&self, opportunity: &Opportunity, decision: &RiskDecision) -> eyre::Result<PreparedExecution>;

    /// Submits the prepared transaction and waits for (or reports) its outcome.
    async fn execute(&self, prepared: &PreparedExecution) -> eyre::Result<ExecutionOutcome>;
}

/// Maps opportunity type to the strategy responsible for it.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<OpportunityType, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self { strategies: HashMap::new() }
    }

    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(strategy.opportunity_type(), strategy);
    }

    pub fn get(&self, kind: OpportunityType) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(&kind).cloned()
    }
}
