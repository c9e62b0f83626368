use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opportunity kinds recognized by the consumer's structural validation (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityType {
    Simple,
    CrossChain,
    FlashLoan,
    Backrun,
    Uniswapx,
    Statistical,
}

impl OpportunityType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "simple" => Some(Self::Simple),
            "cross-chain" | "cross_chain" => Some(Self::CrossChain),
            "flash-loan" | "flash_loan" => Some(Self::FlashLoan),
            "backrun" => Some(Self::Backrun),
            "uniswapx" => Some(Self::Uniswapx),
            "statistical" => Some(Self::Statistical),
            _ => None,
        }
    }
}

/// Input entity, immutable once consumed except for pipeline-timestamp stamping (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OpportunityType,
    pub token_in: String,
    pub token_out: String,
    /// Wei-scale integer amount, carried as a decimal string on the wire (spec §6) and
    /// parsed into an arbitrary-precision-safe u128 here.
    pub amount_in: u128,
    pub expected_profit: f64,
    pub confidence: f64,
    pub expires_at_ms: u64,
    pub buy_chain: Option<String>,
    pub sell_chain: Option<String>,
    pub buy_dex: Option<String>,
    pub sell_dex: Option<String>,
    #[serde(default)]
    pub pipeline_timestamps: BTreeMap<String, u64>,
    /// Set by the consumer on receipt; not part of the wire payload.
    #[serde(skip)]
    pub execution_received_at_ms: u64,
}

impl Opportunity {
    pub fn chain(&self) -> Option<&str> {
        self.buy_chain.as_deref().or(self.sell_chain.as_deref())
    }

    pub fn stamp(&mut self, milestone: &str, at_ms: u64) {
        self.pipeline_timestamps.insert(milestone.to_string(), at_ms);
    }
}

/// Tracks one outstanding deferred-ACK entry (spec §3, §4.7).
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub stream_name: String,
    pub group_name: String,
    pub message_id: String,
    pub queued_at_ms: u64,
    pub opportunity_id: String,
}

/// One sample in a chain's gas-price history (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct GasBaselineEntry {
    pub price_wei: u128,
    pub timestamp_ms: u64,
}

/// Circuit breaker states (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at_ms: Option<u64>,
    pub half_open_attempts_used: u32,
}

/// Durable commit-reveal record (spec §3, §4.11). Integer fields are carried as decimal
/// strings on the wire/storage boundary and as u128 once deserialized, per spec §4.11
/// ("Serialization") — this struct is the in-memory, already-parsed representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentRecord {
    pub commitment_hash: String,
    pub chain: String,
    pub asset: String,
    pub amount_in: u128,
    pub swap_path: Vec<String>,
    pub min_profit: u128,
    pub deadline_ms: u64,
    pub salt: String,
    pub commit_block: u64,
    pub reveal_block: u64,
    pub created_at_ms: u64,
}

/// Monotonically non-decreasing counters (spec §3). Plain integers mutated from a single
/// conceptual owner (the engine), per §5's shared-resource policy.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub received: AtomicU64,
    pub attempts: AtomicU64,
    pub successful: AtomicU64,
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
    pub queue_rejects: AtomicU64,
    pub lock_conflicts: AtomicU64,
    pub execution_timeouts: AtomicU64,
    pub provider_reconnections: AtomicU64,
    pub circuit_breaker_trips: AtomicU64,
    pub risk_ev_rejections: AtomicU64,
    pub risk_position_size_rejections: AtomicU64,
    pub risk_drawdown_blocks: AtomicU64,
    pub stale_lock_recoveries: AtomicU64,
}

macro_rules! counter_accessors {
    ($($field:ident => $inc:ident, $get:ident;)*) => {
        $(
            pub fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
            pub fn $get(&self) -> u64 {
                self.$field.load(Ordering::Relaxed)
            }
        )*
    };
}

impl ExecutionStats {
    counter_accessors! {
        received => incr_received, received;
        attempts => incr_attempts, attempts;
        successful => incr_successful, successful;
        failed => incr_failed, failed;
        rejected => incr_rejected, rejected;
        queue_rejects => incr_queue_rejects, queue_rejects;
        lock_conflicts => incr_lock_conflicts, lock_conflicts;
        execution_timeouts => incr_execution_timeouts, execution_timeouts;
        provider_reconnections => incr_provider_reconnections, provider_reconnections;
        circuit_breaker_trips => incr_circuit_breaker_trips, circuit_breaker_trips;
        risk_ev_rejections => incr_risk_ev_rejections, risk_ev_rejections;
        risk_position_size_rejections => incr_risk_position_size_rejections, risk_position_size_rejections;
        risk_drawdown_blocks => incr_risk_drawdown_blocks, risk_drawdown_blocks;
        stale_lock_recoveries => incr_stale_lock_recoveries, stale_lock_recoveries;
    }

    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        HashMap::from([
            ("received", self.received()),
            ("attempts", self.attempts()),
            ("successful", self.successful()),
            ("failed", self.failed()),
            ("rejected", self.rejected()),
            ("queueRejects", self.queue_rejects()),
            ("lockConflicts", self.lock_conflicts()),
            ("executionTimeouts", self.execution_timeouts()),
            ("providerReconnections", self.provider_reconnections()),
            ("circuitBreakerTrips", self.circuit_breaker_trips()),
            ("riskEVRejections", self.risk_ev_rejections()),
            (
                "riskPositionSizeRejections",
                self.risk_position_size_rejections(),
            ),
            ("riskDrawdownBlocks", self.risk_drawdown_blocks()),
            ("staleLockRecoveries", self.stale_lock_recoveries()),
        ])
    }
}

/// Standby/active configuration (spec §3, §4.12).
#[derive(Debug, Clone, PartialEq)]
pub struct StandbyConfig {
    pub is_standby: bool,
    pub queue_paused_on_start: bool,
    pub activation_disables_simulation: bool,
    pub region_id: Option<String>,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            is_standby: false,
            queue_paused_on_start: false,
            activation_disables_simulation: false,
            region_id: None,
        }
    }
}

/// Execution outcome fed back into `RiskOrchestrator::record_outcome` (spec §4.8, §4.13),
/// shaped after the tri-state result in
/// `other_examples/.../lst-arb-bot-src-executor-mod.rs.rs` (`ExecutionResult`).
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success { profit_native: f64, gas_cost_native: f64 },
    Reverted { gas_cost_native: f64, reason: String },
    Failed { gas_cost_native: f64, reason: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn gas_cost_native(&self) -> f64 {
        match self {
            ExecutionOutcome::Success { gas_cost_native, .. } => *gas_cost_native,
            ExecutionOutcome::Reverted { gas_cost_native, .. } => *gas_cost_native,
            ExecutionOutcome::Failed { gas_cost_native, .. } => *gas_cost_native,
        }
    }
}

/// Convert a fractional native-unit amount into integer wei by explicit truncation, per
/// spec §9 ("every conversion to integer wei uses floor(x * 10^18) explicitly").
pub fn native_to_wei_floor(native: f64) -> u128 {
    if native.is_nan() || native < 0.0 {
        return 0;
    }
    (native * 1e18).floor() as u128
}
