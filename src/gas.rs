//! Per-chain gas-price baseline, spike detection, and linear-regression prediction
//! (spec §4.3, C3).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::errors::EngineError;
use crate::types::GasBaselineEntry;

#[derive(Debug, Clone, PartialEq)]
pub struct ChainGasConfig {
    pub min_wei: u128,
    pub max_wei: u128,
    /// Spike threshold multiplier over baseline, typically 1.5x-5x.
    pub spike_multiplier: f64,
    /// Block time in ms; chains at or under 2s get the shorter median-cache TTL.
    pub block_time_ms: u64,
}

#[derive(Debug, PartialEq)]
pub struct GasOptimizerConfig {
    pub max_gas_history: usize,
    pub window_ms: u64,
    pub ema_smoothing_factor: f64,
    pub default_median_cache_ttl_ms: u64,
    pub fast_chain_median_cache_ttl_ms: u64,
    pub median_cache_cap: usize,
    pub chains: HashMap<String, ChainGasConfig>,
}

impl GasOptimizerConfig {
    /// Clamps an out-of-range alpha to [0.01, 0.99] and logs a warning, per spec §7.
    pub fn clamp_alpha(alpha: f64) -> f64 {
        if !(0.01..=0.99).contains(&alpha) {
            tracing::warn!(alpha, "EMA smoothing factor out of range; clamping");
            alpha.clamp(0.01, 0.99)
        } else {
            alpha
        }
    }
}

struct ChainState {
    history: VecDeque<GasBaselineEntry>,
    ema_scaled: Option<i128>, // EMA * 1000, integer
    median_cache: Option<(u128, u64)>,
    regression_ring: VecDeque<GasBaselineEntry>,
}

impl ChainState {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            ema_scaled: None,
            median_cache: None,
            regression_ring: VecDeque::new(),
        }
    }
}

pub struct GasOptimizer {
    config: GasOptimizerConfig,
    clock: Arc<dyn Clock>,
    chains: Mutex<HashMap<String, ChainState>>,
}

const ALPHA_DENOM: i128 = 1000;
const REGRESSION_RING_CAP: usize = 30;

impl GasOptimizer {
    pub fn new(config: GasOptimizerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            chains: Mutex::new(HashMap::new()),
        }
    }

    fn chain_cfg(&self, chain: &str) -> ChainGasConfig {
        self.config
            .chains
            .get(chain)
            .cloned()
            .unwrap_or(ChainGasConfig {
                min_wei: 1,
                max_wei: u128::MAX,
                spike_multiplier: 3.0,
                block_time_ms: 12_000,
            })
    }

    /// Validates a configured gas-price override against the chain's bounds; NaN or
    /// out-of-range values fall back to the minimum and are logged (spec §4.3, §7).
    pub fn validate_override(&self, chain: &str, value_wei: f64) -> u128 {
        let cfg = self.chain_cfg(chain);
        if value_wei.is_nan() {
            tracing::warn!(chain, "gas price override is NaN; falling back to min");
            return cfg.min_wei;
        }
        let v = value_wei as u128;
        if v < cfg.min_wei || v > cfg.max_wei {
            tracing::warn!(chain, value_wei, min = cfg.min_wei, max = cfg.max_wei, "gas price override out of bounds; clamping to min");
            return cfg.min_wei;
        }
        v
    }

    /// Appends a sample to the time-windowed, size-capped history and recomputes the
    /// EMA with scaled-integer arithmetic to avoid float drift in wei math.
    pub fn update_baseline(&self, chain: &str, price_wei: u128) {
        let now = self.clock.now_ms();
        let alpha = GasOptimizerConfig::clamp_alpha(self.config.ema_smoothing_factor);
        let alpha_scaled = (alpha * ALPHA_DENOM as f64).round() as i128;

        let mut guard = self.chains.lock().unwrap();
        let state = guard.entry(chain.to_string()).or_insert_with(ChainState::new);

        state.history.push_back(GasBaselineEntry {
            price_wei,
            timestamp_ms: now,
        });
        Self::compact(&mut state.history, now, self.config.window_ms, self.config.max_gas_history);

        state.regression_ring.push_back(GasBaselineEntry {
            price_wei,
            timestamp_ms: now,
        });
        while state.regression_ring.len() > REGRESSION_RING_CAP {
            state.regression_ring.pop_front();
        }

        let new_ema = match state.ema_scaled {
            None => price_wei as i128 * ALPHA_DENOM,
            Some(prev) => {
                // ema = alpha*price + (1-alpha)*prev, all in *1000 fixed point.
                (alpha_scaled * price_wei as i128 + (ALPHA_DENOM - alpha_scaled) * prev / ALPHA_DENOM)
            }
        };
        state.ema_scaled = Some(new_ema);
        state.median_cache = None; // invalidate on new sample
        tracing::debug!(chain, price_wei, "gas baseline updated");
    }

    fn compact(history: &mut VecDeque<GasBaselineEntry>, now: u64, window_ms: u64, cap: usize) {
        while let Some(front) = history.front() {
            if now.saturating_sub(front.timestamp_ms) > window_ms {
                history.pop_front();
            } else {
                break;
            }
        }
        while history.len() > cap {
            history.pop_front();
        }
    }

    /// Drops gas-history entries older than `max_age_ms`, keeping at most
    /// `keep_most_recent`, in place — called by the health monitor's compaction pass
    /// (spec §4.14). Mutates the existing deque rather than replacing it, preserving
    /// any external reference semantics a strategy might hold.
    pub fn compact_all(&self, max_age_ms: u64, keep_most_recent: usize) {
        let now = self.clock.now_ms();
        let mut guard = self.chains.lock().unwrap();
        for state in guard.values_mut() {
            Self::compact(&mut state.history, now, max_age_ms, keep_most_recent);
        }
    }

    /// Drops all cached history/EMA/median state for a chain. Called after its RPC
    /// client reconnects (spec §4.5): prior gas samples may no longer reflect the
    /// chain's actual price behavior, so the chain restarts cold rather than blending
    /// pre- and post-reconnect data.
    pub fn invalidate_chain(&self, chain: &str) {
        self.chains.lock().unwrap().remove(chain);
    }

    /// Fast path: EMA. Cold-start fallback for <3 samples. For >=3, the
    /// TTL-cached median (2s for fast chains, 5s otherwise).
    pub fn get_baseline(&self, chain: &str) -> u128 {
        let cfg = self.chain_cfg(chain);
        let now = self.clock.now_ms();
        let mut guard = self.chains.lock().unwrap();
        let state = guard.entry(chain.to_string()).or_insert_with(ChainState::new);

        if let Some(ema) = state.ema_scaled {
            if state.history.len() >= 3 {
                let ttl = if cfg.block_time_ms <= 2_000 {
                    self.config.fast_chain_median_cache_ttl_ms
                } else {
                    self.config.default_median_cache_ttl_ms
                };
                if let Some((cached, at)) = state.median_cache {
                    if now.saturating_sub(at) <= ttl {
                        return cached;
                    }
                }
                let median = Self::median_of(&state.history);
                state.median_cache = Some((median, now));
                // Hard-cap median cache: since we only store one entry per chain here,
                // the cap applies at the `chains` map level via oldest-eviction below.
                self.evict_oldest_median_cache_if_needed(&mut guard);
                return median;
            }
            let avg = ema / ALPHA_DENOM;
            return match state.history.len() {
                1 => (avg as u128).saturating_mul(5) / 2,
                _ => (avg as u128).saturating_mul(4) / 2,
            };
        }
        cfg.min_wei
    }

    fn evict_oldest_median_cache_if_needed(&self, guard: &mut HashMap<String, ChainState>) {
        let cap = self.config.median_cache_cap;
        let populated: Vec<(String, u64)> = guard
            .iter()
            .filter_map(|(chain, s)| s.median_cache.map(|(_, at)| (chain.clone(), at)))
            .collect();
        if populated.len() > cap {
            if let Some((oldest_chain, _)) = populated.iter().min_by_key(|(_, at)| *at) {
                if let Some(s) = guard.get_mut(oldest_chain) {
                    s.median_cache = None;
                }
            }
        }
    }

    fn median_of(history: &VecDeque<GasBaselineEntry>) -> u128 {
        let mut prices: Vec<u128> = history.iter().map(|e| e.price_wei).collect();
        prices.sort_unstable();
        let n = prices.len();
        if n == 0 {
            return 0;
        }
        if n % 2 == 1 {
            prices[n / 2]
        } else {
            (prices[n / 2 - 1] + prices[n / 2]) / 2
        }
    }

    /// Aborts with `ERR_GAS_SPIKE` if `current` exceeds `baseline * spike_multiplier`.
    pub fn check_spike(&self, chain: &str, current_wei: u128) -> Result<(), EngineError> {
        let baseline = self.get_baseline(chain);
        let cfg = self.chain_cfg(chain);
        let threshold = (baseline as f64) * cfg.spike_multiplier;
        if (current_wei as f64) > threshold {
            return Err(EngineError::GasSpike {
                chain: chain.to_string(),
                current: current_wei,
                baseline,
                multiplier: cfg.spike_multiplier,
            });
        }
        Ok(())
    }

    pub fn get_optimal_gas_price(&self, chain: &str) -> u128 {
        self.get_baseline(chain)
    }

    /// Re-fetches a fee quote immediately before broadcast; aborts if it rose more
    /// than 50% since `previous_wei`, warns at 20%.
    pub fn refresh_for_submission(&self, chain: &str, previous_wei: u128, current_wei: u128) -> Result<u128, EngineError> {
        if previous_wei > 0 {
            let ratio = current_wei as f64 / previous_wei as f64;
            if ratio > 1.5 {
                return Err(EngineError::GasSpike {
                    chain: chain.to_string(),
                    current: current_wei,
                    baseline: previous_wei,
                    multiplier: 1.5,
                });
            }
            if ratio > 1.2 {
                tracing::warn!(chain, previous_wei, current_wei, ratio, "gas price rose >20% since quote");
            }
        }
        Ok(current_wei)
    }

    /// Linear regression over up to 30 recent samples; falls back to the EMA when the
    /// input is degenerate (all-same-timestamp). Requires >=5 samples. Result is
    /// clamped to be positive.
    pub fn predict(&self, chain: &str, horizon_ms: u64) -> Option<u128> {
        let guard = self.chains.lock().unwrap();
        let state = guard.get(chain)?;
        if state.regression_ring.len() < 5 {
            return None;
        }
        let now = self.clock.now_ms();
        let xs: Vec<f64> = state
            .regression_ring
            .iter()
            .map(|e| e.timestamp_ms as f64 - now as f64)
            .collect();
        let ys: Vec<f64> = state.regression_ring.iter().map(|e| e.price_wei as f64).collect();

        let n = xs.len() as f64;
        let mean_x = xs.iter().sum::<f64>() / n;
        let mean_y = ys.iter().sum::<f64>() / n;
        let var_x: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();

        if var_x.abs() < f64::EPSILON {
            // Degenerate: all-same-timestamp input. Fall back to EMA.
            return state.ema_scaled.map(|e| (e / ALPHA_DENOM).max(0) as u128);
        }

        let cov_xy: f64 = xs
            .iter()
            .zip(ys.iter())
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();
        let slope = cov_xy / var_x;
        let intercept = mean_y - slope * mean_x;
        let predicted = intercept + slope * (horizon_ms as f64);

        if predicted <= 0.0 {
            return state.ema_scaled.map(|e| (e / ALPHA_DENOM).max(0) as u128);
        }
        Some(predicted as u128)
    }
}
