//! Sequential risk pipeline: in-flight cap, drawdown breaker, expected-value gate,
//! Kelly sizing (spec §4.8, C8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::errors::EngineError;
use crate::types::{native_to_wei_floor, ExecutionOutcome, ExecutionStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawdownState {
    Normal,
    Caution,
    Halted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawdownConfig {
    pub enabled: bool,
    pub window_size: usize,
    /// Cumulative wei loss over the window at which the breaker enters CAUTION.
    pub caution_threshold_wei: i128,
    /// Cumulative wei loss over the window at which the breaker HALTS entirely.
    pub halt_threshold_wei: i128,
    /// Scaled by 10000; applied to proposed position size while in CAUTION.
    pub caution_size_multiplier: u64,
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: 50,
            caution_threshold_wei: -1_000_000_000_000_000_000, // -1 native unit
            halt_threshold_wei: -5_000_000_000_000_000_000,    // -5 native units
            caution_size_multiplier: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrawdownCheck {
    pub allowed: bool,
    pub state: DrawdownState,
    pub size_multiplier: u64,
    pub cumulative_pnl_wei: i128,
}

/// Tracks a rolling window of realized pnl (wei) and derives a CAUTION/HALT state.
pub struct DrawdownBreaker {
    config: DrawdownConfig,
    window: Mutex<std::collections::VecDeque<i128>>,
    caution_events: AtomicU32,
}

impl DrawdownBreaker {
    pub fn new(config: DrawdownConfig) -> Self {
        Self {
            config,
            window: Mutex::new(std::collections::VecDeque::new()),
            caution_events: AtomicU32::new(0),
        }
    }

    pub fn check(&self) -> DrawdownCheck {
        if !self.config.enabled {
            return DrawdownCheck {
                allowed: true,
                state: DrawdownState::Normal,
                size_multiplier: 10_000,
                cumulative_pnl_wei: 0,
            };
        }
        let cumulative: i128 = self.window.lock().unwrap().iter().sum();
        let state = if cumulative <= self.config.halt_threshold_wei {
            DrawdownState::Halted
        } else if cumulative <= self.config.caution_threshold_wei {
            DrawdownState::Caution
        } else {
            DrawdownState::Normal
        };
        if state == DrawdownState::Caution {
            self.caution_events.fetch_add(1, Ordering::Relaxed);
        }
        DrawdownCheck {
            allowed: state != DrawdownState::Halted,
            size_multiplier: if state == DrawdownState::Caution {
                self.config.caution_size_multiplier
            } else {
                10_000
            },
            state,
            cumulative_pnl_wei: cumulative,
        }
    }

    pub fn record_pnl(&self, pnl_wei: i128) {
        let mut guard = self.window.lock().unwrap();
        guard.push_back(pnl_wei);
        while guard.len() > self.config.window_size {
            guard.pop_front();
        }
    }

    pub fn caution_events(&self) -> u32 {
        self.caution_events.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EvCalculation {
    pub win_probability: f64,
    pub expected_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KellyConfig {
    pub enabled: bool,
    /// Base bankroll (wei) the Kelly fraction is applied against.
    pub base_size_wei: u128,
    /// Hard floor; fractions below this are treated as zero to avoid dust trades.
    pub min_fraction: f64,
}

/// Per opportunity-type running win/loss counters feeding the Kelly sizer's
/// win-probability and profit/loss estimates.
#[derive(Default)]
struct ProbabilityBucket {
    wins: u64,
    losses: u64,
    total_profit_wei: u128,
    total_loss_wei: u128,
}

pub struct ProbabilityTracker {
    buckets: Mutex<HashMap<String, ProbabilityBucket>>,
}

impl ProbabilityTracker {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, key: &str, won: bool, profit_wei: u128, loss_wei: u128) {
        let mut guard = self.buckets.lock().unwrap();
        let bucket = guard.entry(key.to_string()).or_default();
        if won {
            bucket.wins += 1;
            bucket.total_profit_wei += profit_wei;
        } else {
            bucket.losses += 1;
            bucket.total_loss_wei += loss_wei;
        }
    }

    /// Laplace-smoothed win probability and average profit/loss magnitude in wei.
    fn estimate(&self, key: &str) -> (f64, f64, f64) {
        let guard = self.buckets.lock().unwrap();
        match guard.get(key) {
            Some(b) => {
                let total = (b.wins + b.losses) as f64;
                let win_probability = (b.wins as f64 + 1.0) / (total + 2.0);
                let avg_profit = if b.wins > 0 { b.total_profit_wei as f64 / b.wins as f64 } else { 0.0 };
                let avg_loss = if b.losses > 0 { b.total_loss_wei as f64 / b.losses as f64 } else { 0.0 };
                (win_probability, avg_profit, avg_loss)
            }
            None => (0.5, 0.0, 0.0),
        }
    }
}

pub struct RiskAssessmentInput {
    pub opportunity_key: String,
    pub expected_profit_native: f64,
    pub expected_loss_native: f64,
}

#[derive(Debug)]
pub struct RiskDecision {
    pub allowed: bool,
    pub drawdown_check: DrawdownCheck,
    pub ev_calculation: Option<EvCalculation>,
    pub position_size_wei: u128,
    pub recommended_size_wei: u128,
}

#[derive(Debug, PartialEq)]
pub struct RiskConfig {
    pub max_in_flight_trades: u32,
    pub drawdown: DrawdownConfig,
    pub ev: EvConfig,
    pub kelly: KellyConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_in_flight_trades: 3,
            drawdown: DrawdownConfig::default(),
            ev: EvConfig { enabled: true },
            kelly: KellyConfig {
                enabled: true,
                base_size_wei: 1_000_000_000_000_000_000,
                min_fraction: 0.0,
            },
        }
    }
}

/// Coordinates the drawdown -> EV -> Kelly pipeline in front of strategy execution.
/// `in_flight_count` is incremented only on accept and always decremented exactly
/// once per accepted assessment, in `record_outcome`, regardless of outcome shape.
pub struct RiskOrchestrator {
    config: RiskConfig,
    drawdown: DrawdownBreaker,
    probability: ProbabilityTracker,
    stats: std::sync::Arc<ExecutionStats>,
    in_flight_count: AtomicI64,
}

impl RiskOrchestrator {
    pub fn new(config: RiskConfig, stats: std::sync::Arc<ExecutionStats>) -> Self {
        let drawdown = DrawdownBreaker::new(config.drawdown.clone());
        Self {
            config,
            drawdown,
            probability: ProbabilityTracker::new(),
            stats,
            in_flight_count: AtomicI64::new(0),
        }
    }

    pub fn get_in_flight_count(&self) -> i64 {
        self.in_flight_count.load(Ordering::SeqCst)
    }

    pub fn assess(&self, input: &RiskAssessmentInput) -> Result<RiskDecision, EngineError> {
        if self.in_flight_count.load(Ordering::SeqCst) >= self.config.max_in_flight_trades as i64 {
            self.stats.incr_risk_drawdown_blocks();
            return Err(EngineError::InFlightCapReached);
        }

        let drawdown_check = self.drawdown.check();
        if !drawdown_check.allowed {
            self.stats.incr_risk_drawdown_blocks();
            return Err(EngineError::DrawdownHalt);
        }

        let (win_probability, avg_profit_wei, avg_loss_wei) = self.probability.estimate(&input.opportunity_key);

        let ev_calculation = if self.config.ev.enabled {
            let expected_value =
                win_probability * input.expected_profit_native - (1.0 - win_probability) * input.expected_loss_native;
            if expected_value < 0.0 {
                self.stats.incr_risk_ev_rejections();
                return Err(EngineError::LowEv);
            }
            Some(EvCalculation { win_probability, expected_value })
        } else {
            None
        };

        let position_size_wei = if self.config.kelly.enabled {
            let size = self.kelly_size(win_probability, avg_profit_wei, avg_loss_wei, &drawdown_check);
            if size == 0 {
                self.stats.incr_risk_position_size_rejections();
                return Err(EngineError::PositionSize);
            }
            size
        } else {
            self.config.kelly.base_size_wei
        };

        self.in_flight_count.fetch_add(1, Ordering::SeqCst);
        Ok(RiskDecision {
            allowed: true,
            drawdown_check,
            ev_calculation,
            position_size_wei,
            recommended_size_wei: position_size_wei,
        })
    }

    /// Kelly fraction f* = p - q/b, where b is the profit/loss odds ratio estimated
    /// from the probability tracker. `drawdown_check.size_multiplier` is applied with
    /// scaled-integer math (x10000/10000) to avoid float drift on the final sizing step.
    fn kelly_size(&self, win_probability: f64, avg_profit_wei: f64, avg_loss_wei: f64, drawdown_check: &DrawdownCheck) -> u128 {
        let b = if avg_loss_wei > 0.0 { avg_profit_wei / avg_loss_wei } else { 1.0 };
        if b <= 0.0 {
            return 0;
        }
        let q = 1.0 - win_probability;
        let fraction = win_probability - q / b;
        if fraction <= self.config.kelly.min_fraction || fraction.is_nan() {
            return 0;
        }
        let fraction = fraction.min(1.0);
        let raw_size = (self.config.kelly.base_size_wei as f64 * fraction) as u128;
        raw_size
            .saturating_mul(drawdown_check.size_multiplier as u128)
            / 10_000
    }

    /// Updates the probability tracker and drawdown breaker from a completed outcome,
    /// then always decrements `in_flight_count` exactly once, mirroring a `finally`
    /// block, even though Rust has no exceptions to unwind through here.
    pub fn record_outcome(&self, opportunity_key: &str, outcome: &ExecutionOutcome) {
        let gas_cost_wei = native_to_wei_floor(outcome.gas_cost_native());
        match outcome {
            ExecutionOutcome::Success { profit_native, .. } => {
                let profit_wei = native_to_wei_floor(*profit_native);
                self.probability.record(opportunity_key, true, profit_wei, 0);
                let pnl = profit_wei as i128 - gas_cost_wei as i128;
                self.drawdown.record_pnl(pnl);
            }
            ExecutionOutcome::Reverted { .. } | ExecutionOutcome::Failed { .. } => {
                self.probability.record(opportunity_key, false, 0, gas_cost_wei);
                self.drawdown.record_pnl(-(gas_cost_wei as i128));
            }
        }
        self.in_flight_count.fetch_sub(1, Ordering::SeqCst);
    }
}
