//! CLI parsing, environment overrides, and fatal-configuration validation (spec §6, §7).
//!
//! Follows the keeper's `KeeperConfig::from_cli_and_deployment` shape: a
//! `clap::Parser` for flags, environment-variable fallback chains for secrets and
//! per-deployment overrides, then a single validation pass that either clamps with a
//! warning or fails construction outright.

use std::collections::HashMap;

use clap::Parser;

use crate::breaker::BreakerConfig;
use crate::bridge::BridgeFilterConfig;
use crate::consumer::ConsumerConfig;
use crate::errors::ConfigError;
use crate::gas::{ChainGasConfig, GasOptimizerConfig};
use crate::mev::{ChainMevSettings, MevShaperConfig};
use crate::providers::ProviderRegistryConfig;
use crate::queue::QueueConfig;
use crate::risk::{DrawdownConfig, EvConfig, KellyConfig, RiskConfig};
use crate::simulation::SimulationServiceConfig;
use crate::types::StandbyConfig;

/// Execution-engine CLI, mirroring the keeper's `--long-flag` / env-fallback style.
#[derive(Parser, Debug)]
#[command(name = "arb-execution-engine", version, about = "Consumes arbitrage opportunities and drives them through risk, MEV, and strategy pipelines")]
pub struct Args {
    /// Comma-separated `chain=url` pairs, e.g. `ethereum=https://...,arbitrum=https://...`.
    #[arg(long, env = "EXEC_ENGINE_CHAIN_URLS")]
    pub chain_urls: String,

    #[arg(long, env = "EXEC_ENGINE_STREAM_NAME", default_value = "opportunities")]
    pub stream_name: String,

    #[arg(long, env = "EXEC_ENGINE_GROUP_NAME", default_value = "execution-engine")]
    pub group_name: String,

    #[arg(long, env = "EXEC_ENGINE_INSTANCE_ID", default_value = "instance-1")]
    pub instance_id: String,

    #[arg(long, env = "EXEC_ENGINE_CONSUMER_BATCH_SIZE", default_value_t = 10)]
    pub consumer_batch_size: usize,

    #[arg(long, env = "EXEC_ENGINE_CONSUMER_BLOCK_MS", default_value_t = 200)]
    pub consumer_block_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_PENDING_MAX_AGE_MS", default_value_t = 600_000)]
    pub pending_message_max_age_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_QUEUE_MAX_SIZE", default_value_t = 1_000)]
    pub queue_max_size: usize,

    #[arg(long, env = "EXEC_ENGINE_QUEUE_HIGH_WATER_MARK", default_value_t = 800)]
    pub queue_high_water_mark: usize,

    #[arg(long, env = "EXEC_ENGINE_QUEUE_LOW_WATER_MARK", default_value_t = 200)]
    pub queue_low_water_mark: usize,

    #[arg(long, env = "EXEC_ENGINE_BREAKER_ENABLED", default_value_t = true)]
    pub breaker_enabled: bool,

    #[arg(long, env = "EXEC_ENGINE_BREAKER_FAILURE_THRESHOLD", default_value_t = 5)]
    pub breaker_failure_threshold: u32,

    #[arg(long, env = "EXEC_ENGINE_BREAKER_COOLDOWN_MS", default_value_t = 30_000)]
    pub breaker_cooldown_period_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_BREAKER_HALF_OPEN_MAX_ATTEMPTS", default_value_t = 1)]
    pub breaker_half_open_max_attempts: u32,

    #[arg(long, env = "EXEC_ENGINE_HEALTH_CHECK_INTERVAL_MS", default_value_t = 30_000)]
    pub health_check_interval_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_RECONNECTION_FAILURE_THRESHOLD", default_value_t = 3)]
    pub reconnection_failure_threshold: u32,

    #[arg(long, env = "EXEC_ENGINE_CONNECTIVITY_TIMEOUT_MS", default_value_t = 5_000)]
    pub connectivity_timeout_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_GAS_MAX_HISTORY", default_value_t = 100)]
    pub gas_max_history: usize,

    #[arg(long, env = "EXEC_ENGINE_GAS_WINDOW_MS", default_value_t = 300_000)]
    pub gas_window_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_GAS_EMA_ALPHA", default_value_t = 0.3)]
    pub gas_ema_smoothing_factor: f64,

    #[arg(long, env = "EXEC_ENGINE_GAS_MEDIAN_TTL_MS", default_value_t = 5_000)]
    pub gas_default_median_cache_ttl_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_GAS_FAST_MEDIAN_TTL_MS", default_value_t = 2_000)]
    pub gas_fast_chain_median_cache_ttl_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_GAS_MEDIAN_CACHE_CAP", default_value_t = 64)]
    pub gas_median_cache_cap: usize,

    #[arg(long, env = "EXEC_ENGINE_MAX_IN_FLIGHT_TRADES", default_value_t = 3)]
    pub max_in_flight_trades: u32,

    #[arg(long, env = "EXEC_ENGINE_NONCE_LOCK_TIMEOUT_MS", default_value_t = 10_000)]
    pub nonce_lock_timeout_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_MEV_MAX_PRIORITY_FEE_GWEI", default_value_t = 3)]
    pub mev_max_priority_fee_gwei: u64,

    #[arg(long, env = "EXEC_ENGINE_BRIDGE_MAX_FEE_PERCENTAGE", default_value_t = 50.0)]
    pub bridge_max_fee_percentage: f64,

    #[arg(long, env = "EXEC_ENGINE_IS_STANDBY", default_value_t = false)]
    pub is_standby: bool,

    #[arg(long, env = "EXEC_ENGINE_QUEUE_PAUSED_ON_START", default_value_t = false)]
    pub queue_paused_on_start: bool,

    #[arg(long, env = "EXEC_ENGINE_ACTIVATION_DISABLES_SIMULATION", default_value_t = false)]
    pub activation_disables_simulation: bool,

    #[arg(long, env = "EXEC_ENGINE_REGION_ID")]
    pub region_id: Option<String>,

    #[arg(long, env = "EXEC_ENGINE_SIM_MIN_PROFIT", default_value_t = 50.0)]
    pub simulation_min_profit_native: f64,

    #[arg(long, env = "EXEC_ENGINE_SIM_TIME_CRITICAL_MS", default_value_t = 2_000)]
    pub simulation_time_critical_threshold_ms: u64,

    #[arg(long, env = "EXEC_ENGINE_SIM_BACKEND_TIMEOUT_MS", default_value_t = 3_000)]
    pub simulation_backend_timeout_ms: u64,

    /// Run in simulation mode (no live submission). Required explicitly in
    /// production; running without it there is a fatal configuration error.
    #[arg(long, env = "EXEC_ENGINE_SIMULATION_MODE", default_value_t = false)]
    pub simulation_mode: bool,

    /// Explicit operator acknowledgement that simulation mode is intended in a
    /// production deployment (spec §6, §7).
    #[arg(long, env = "EXEC_ENGINE_SIMULATION_OVERRIDE", default_value_t = false)]
    pub simulation_override: bool,

    #[arg(long, env = "EXEC_ENGINE_ENVIRONMENT", default_value = "production")]
    pub environment: String,

    #[arg(long, env = "EXEC_ENGINE_SERVICE_NAME", default_value = "execution-engine")]
    pub service_name: String,
}

/// Per-chain gas bounds and private-key env var name, assembled after parsing
/// `--chain-urls` (spec §6: per-chain private-key variables, per-chain gas-price
/// overrides validated against bounds).
#[derive(Debug, PartialEq)]
pub struct ChainSettings {
    pub url: String,
    pub private_key_env: String,
    pub gas: ChainGasConfig,
}

#[derive(Debug, PartialEq)]
pub struct EngineConfig {
    pub chains: HashMap<String, ChainSettings>,
    pub consumer: ConsumerConfig,
    pub queue: QueueConfig,
    pub breaker: BreakerConfig,
    pub providers: ProviderRegistryConfig,
    pub gas: GasOptimizerConfig,
    pub risk: RiskConfig,
    pub nonce_lock_timeout_ms: u64,
    pub mev: MevShaperConfig,
    pub bridge: BridgeFilterConfig,
    pub standby: StandbyConfig,
    pub simulation: SimulationServiceConfig,
    pub simulation_mode: bool,
    pub service_name: String,
    pub instance_id: String,
}

/// Per-chain default gas bounds used when a chain isn't individually overridden via
/// `EXEC_ENGINE_GAS_BOUNDS_<CHAIN>` (`min:max`, wei). Mirrors the keeper's pattern of
/// falling back to a sane default rather than requiring every chain be spelled out.
const DEFAULT_MIN_GAS_WEI: u128 = 1_000_000_000;
const DEFAULT_MAX_GAS_WEI: u128 = 1_000_000_000_000;
const DEFAULT_SPIKE_MULTIPLIER: f64 = 3.0;
const DEFAULT_BLOCK_TIME_MS: u64 = 12_000;

impl EngineConfig {
    /// Parses `Args` from the process command line and environment, then validates.
    pub fn parse_and_validate() -> Result<Self, ConfigError> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let mut chains = HashMap::new();
        for pair in args.chain_urls.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((chain, url)) = pair.split_once('=') else {
                return Err(ConfigError::Other(format!("malformed chain url entry: {pair}")));
            };
            let chain = chain.trim().to_string();
            let private_key_env = format!("EXEC_ENGINE_PRIVATE_KEY_{}", chain.to_uppercase());

            let bounds_env = format!("EXEC_ENGINE_GAS_BOUNDS_{}", chain.to_uppercase());
            let (min_wei, max_wei) = match std::env::var(&bounds_env) {
                Ok(raw) => parse_gas_bounds(&chain, &raw)?,
                Err(_) => (DEFAULT_MIN_GAS_WEI, DEFAULT_MAX_GAS_WEI),
            };
            if min_wei > max_wei {
                return Err(ConfigError::InvalidGasBounds { chain: chain.clone(), min: min_wei, max: max_wei });
            }

            chains.insert(
                chain.clone(),
                ChainSettings {
                    url: url.trim().to_string(),
                    private_key_env,
                    gas: ChainGasConfig {
                        min_wei,
                        max_wei,
                        spike_multiplier: DEFAULT_SPIKE_MULTIPLIER,
                        block_time_ms: DEFAULT_BLOCK_TIME_MS,
                    },
                },
            );
        }
        if chains.is_empty() {
            return Err(ConfigError::Other("at least one chain=url pair is required".into()));
        }

        let queue = QueueConfig {
            max_size: args.queue_max_size,
            high_water_mark: args.queue_high_water_mark,
            low_water_mark: args.queue_low_water_mark,
        };
        queue.validate()?;

        let ema_alpha = GasOptimizerConfig::clamp_alpha(args.gas_ema_smoothing_factor);

        let gas_chains = chains.iter().map(|(name, settings)| (name.clone(), settings.gas.clone())).collect();

        let is_production = args.environment.eq_ignore_ascii_case("production");
        if args.simulation_mode && is_production && !args.simulation_override {
            return Err(ConfigError::SimulationInProductionWithoutOverride);
        }

        let mev_chain_settings = chains
            .keys()
            .map(|chain| {
                (
                    chain.clone(),
                    ChainMevSettings { max_priority_fee_wei: args.mev_max_priority_fee_gwei as u128 * 1_000_000_000, ..Default::default() },
                )
            })
            .collect();

        Ok(Self {
            chains,
            consumer: ConsumerConfig {
                batch_size: args.consumer_batch_size,
                block_ms: args.consumer_block_ms,
                stream_name: args.stream_name,
                group_name: args.group_name,
                service_name: args.service_name.clone(),
                instance_id: args.instance_id.clone(),
                pending_stale_after_ms: args.pending_message_max_age_ms,
            },
            queue,
            breaker: BreakerConfig {
                enabled: args.breaker_enabled,
                failure_threshold: args.breaker_failure_threshold,
                cooldown_period_ms: args.breaker_cooldown_period_ms,
                half_open_max_attempts: args.breaker_half_open_max_attempts,
            },
            providers: ProviderRegistryConfig {
                health_check_interval_ms: args.health_check_interval_ms,
                reconnection_failure_threshold: args.reconnection_failure_threshold,
                connectivity_timeout_ms: args.connectivity_timeout_ms,
            },
            gas: GasOptimizerConfig {
                max_gas_history: args.gas_max_history,
                window_ms: args.gas_window_ms,
                ema_smoothing_factor: ema_alpha,
                default_median_cache_ttl_ms: args.gas_default_median_cache_ttl_ms,
                fast_chain_median_cache_ttl_ms: args.gas_fast_chain_median_cache_ttl_ms,
                median_cache_cap: args.gas_median_cache_cap,
                chains: gas_chains,
            },
            risk: RiskConfig {
                max_in_flight_trades: args.max_in_flight_trades,
                drawdown: DrawdownConfig::default(),
                ev: EvConfig { enabled: true },
                kelly: KellyConfig { enabled: true, base_size_wei: 1_000_000_000_000_000_000, min_fraction: 0.0 },
            },
            nonce_lock_timeout_ms: args.nonce_lock_timeout_ms,
            mev: MevShaperConfig { providers: HashMap::new(), chain_settings: mev_chain_settings },
            bridge: BridgeFilterConfig { max_fee_percentage: args.bridge_max_fee_percentage },
            standby: StandbyConfig {
                is_standby: args.is_standby,
                queue_paused_on_start: args.queue_paused_on_start,
                activation_disables_simulation: args.activation_disables_simulation,
                region_id: args.region_id,
            },
            simulation: SimulationServiceConfig {
                backend_timeout_ms: args.simulation_backend_timeout_ms,
                min_simulation_profit_native: args.simulation_min_profit_native,
                time_critical_threshold_ms: args.simulation_time_critical_threshold_ms,
            },
            simulation_mode: args.simulation_mode,
            service_name: args.service_name,
            instance_id: args.instance_id,
        })
    }
}

fn parse_gas_bounds(chain: &str, raw: &str) -> Result<(u128, u128), ConfigError> {
    let (min_str, max_str) = raw
        .split_once(':')
        .ok_or_else(|| ConfigError::Other(format!("gas bounds for {chain} must be `min:max`, got `{raw}`")))?;
    let min = min_str.trim().parse::<u128>().map_err(|_| ConfigError::Other(format!("invalid min gas wei for {chain}: {min_str}")))?;
    let max = max_str.trim().parse::<u128>().map_err(|_| ConfigError::Other(format!("invalid max gas wei for {chain}: {max_str}")))?;
    Ok((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from([
            "arb-execution-engine",
            "--chain-urls",
            "ethereum=https://eth.example.com",
            "--environment",
            "development",
        ])
    }

    #[test]
    fn parses_chain_urls_into_per_chain_settings() {
        let config = EngineConfig::from_args(base_args()).unwrap();
        assert_eq!(config.chains.len(), 1);
        let ethereum = config.chains.get("ethereum").unwrap();
        assert_eq!(ethereum.url, "https://eth.example.com");
        assert_eq!(ethereum.private_key_env, "EXEC_ENGINE_PRIVATE_KEY_ETHEREUM");
    }

    #[test]
    fn rejects_empty_chain_list() {
        let mut args = base_args();
        args.chain_urls = String::new();
        assert!(EngineConfig::from_args(args).is_err());
    }

    #[test]
    fn rejects_invalid_water_marks() {
        let mut args = base_args();
        args.queue_low_water_mark = args.queue_high_water_mark;
        assert!(matches!(EngineConfig::from_args(args), Err(ConfigError::InvalidWaterMarks { .. })));
    }

    #[test]
    fn clamps_out_of_range_ema_alpha() {
        let mut args = base_args();
        args.gas_ema_smoothing_factor = 5.0;
        let config = EngineConfig::from_args(args).unwrap();
        assert!(config.gas.ema_smoothing_factor <= 0.99);
    }

    #[test]
    fn simulation_in_production_without_override_is_fatal() {
        let mut args = base_args();
        args.environment = "production".to_string();
        args.simulation_mode = true;
        args.simulation_override = false;
        assert_eq!(EngineConfig::from_args(args), Err(ConfigError::SimulationInProductionWithoutOverride));
    }

    #[test]
    fn simulation_in_production_with_override_is_allowed() {
        let mut args = base_args();
        args.environment = "production".to_string();
        args.simulation_mode = true;
        args.simulation_override = true;
        assert!(EngineConfig::from_args(args).is_ok());
    }

    #[test]
    fn malformed_gas_bounds_env_var_is_rejected() {
        std::env::set_var("EXEC_ENGINE_GAS_BOUNDS_ETHEREUM", "not-a-range");
        let result = EngineConfig::from_args(base_args());
        std::env::remove_var("EXEC_ENGINE_GAS_BOUNDS_ETHEREUM");
        assert!(result.is_err());
    }
}
