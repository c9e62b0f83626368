//! MEV eligibility check and transaction fee shaping (spec §4.9, C9).

use std::collections::HashMap;
use std::sync::Arc;

use crate::gas::GasOptimizer;
use crate::providers::{ChainRpc, FeeData};

#[derive(Debug, Clone, PartialEq)]
pub struct MevProviderConfig {
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainMevSettings {
    pub disabled: bool,
    pub min_profit_for_protection: f64,
    pub max_priority_fee_wei: u128,
}

impl Default for ChainMevSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            min_profit_for_protection: 0.0,
            max_priority_fee_wei: 3_000_000_000, // 3 gwei
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct MevShaperConfig {
    pub providers: HashMap<String, Vec<MevProviderConfig>>,
    pub chain_settings: HashMap<String, ChainMevSettings>,
}

#[derive(Debug, Clone)]
pub struct EligibilityResult {
    pub should_use_mev: bool,
    pub provider: Option<String>,
    pub chain_settings: ChainMevSettings,
}

/// A transaction request shaped for submission; a narrow subset of what the
/// eventual strategy/signer builds, sufficient for fee-shaping purposes.
#[derive(Debug, Clone, Default)]
pub struct TxRequest {
    pub tx_type: Option<u8>,
    pub max_fee_per_gas_wei: Option<u128>,
    pub max_priority_fee_per_gas_wei: Option<u128>,
    pub gas_price_wei: Option<u128>,
}

pub struct MevShaper {
    config: MevShaperConfig,
    gas: Arc<GasOptimizer>,
}

impl MevShaper {
    pub fn new(config: MevShaperConfig, gas: Arc<GasOptimizer>) -> Self {
        Self { config, gas }
    }

    fn chain_settings(&self, chain: &str) -> ChainMevSettings {
        self.config.chain_settings.get(chain).cloned().unwrap_or_default()
    }

    /// Eligible iff at least one enabled provider exists for the chain, the chain
    /// setting does not explicitly disable MEV protection, and the opportunity's
    /// expected profit clears `minProfitForProtection`.
    pub fn check_eligibility(&self, chain: &str, expected_profit: Option<f64>) -> EligibilityResult {
        let settings = self.chain_settings(chain);
        let fallback_chain = self.get_provider_fallback_chain(chain);
        let provider = fallback_chain.into_iter().next();

        let profit_ok = expected_profit.map(|p| p >= settings.min_profit_for_protection).unwrap_or(true);

        let should_use_mev = !settings.disabled && provider.is_some() && profit_ok;
        EligibilityResult {
            should_use_mev,
            provider: if should_use_mev { provider } else { None },
            chain_settings: settings,
        }
    }

    /// Ordered list of enabled providers for `chain`; callers iterate and fall back
    /// to the public mempool once every private provider has failed.
    pub fn get_provider_fallback_chain(&self, chain: &str) -> Vec<String> {
        self.config
            .providers
            .get(chain)
            .map(|providers| {
                providers
                    .iter()
                    .filter(|p| p.enabled)
                    .map(|p| p.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// EIP-1559 when fee data is available; otherwise legacy `gasPrice` from the gas
    /// optimizer's baseline. Provider/fee-data errors degrade to the legacy path with
    /// a warning rather than failing the submission.
    pub async fn apply_protection(&self, tx: &mut TxRequest, chain: &str, rpc: &dyn ChainRpc) {
        let settings = self.chain_settings(chain);
        match rpc.get_fee_data().await {
            Ok(FeeData {
                max_fee_per_gas_wei: Some(max_fee),
                max_priority_fee_per_gas_wei: Some(max_priority),
                ..
            }) => {
                tx.tx_type = Some(2);
                tx.max_fee_per_gas_wei = Some(max_fee);
                tx.max_priority_fee_per_gas_wei = Some(max_priority.min(settings.max_priority_fee_wei));
                tx.gas_price_wei = None;
            }
            Ok(_) => {
                tracing::warn!(chain, "fee data missing EIP-1559 fields, falling back to legacy gas price");
                self.apply_legacy(tx, chain);
            }
            Err(err) => {
                tracing::warn!(chain, error = %err, "fee data fetch failed, falling back to legacy gas price");
                self.apply_legacy(tx, chain);
            }
        }
    }

    fn apply_legacy(&self, tx: &mut TxRequest, chain: &str) {
        tx.tx_type = Some(0);
        tx.gas_price_wei = Some(self.gas.get_optimal_gas_price(chain));
        tx.max_fee_per_gas_wei = None;
        tx.max_priority_fee_per_gas_wei = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::gas::{GasOptimizerConfig, ChainGasConfig};
    use crate::providers::test_support::FakeRpc;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Eip1559Rpc;
    #[async_trait]
    impl ChainRpc for Eip1559Rpc {
        async fn get_block_number(&self) -> eyre::Result<u64> {
            Ok(1)
        }
        async fn get_fee_data(&self) -> eyre::Result<FeeData> {
            Ok(FeeData {
                gas_price_wei: None,
                max_fee_per_gas_wei: Some(50_000_000_000),
                max_priority_fee_per_gas_wei: Some(5_000_000_000),
            })
        }
    }

    fn shaper() -> MevShaper {
        let mut providers = HashMap::new();
        providers.insert(
            "ethereum".to_string(),
            vec![
                MevProviderConfig { name: "flashbots".into(), enabled: true },
                MevProviderConfig { name: "mevblocker".into(), enabled: false },
            ],
        );
        let mut chain_settings = HashMap::new();
        chain_settings.insert(
            "ethereum".to_string(),
            ChainMevSettings { disabled: false, min_profit_for_protection: 0.01, max_priority_fee_wei: 2_000_000_000 },
        );
        let gas_config = GasOptimizerConfig {
            max_gas_history: 50,
            window_ms: 60_000,
            ema_smoothing_factor: 0.2,
            default_median_cache_ttl_ms: 5_000,
            fast_chain_median_cache_ttl_ms: 1_000,
            median_cache_cap: 16,
            chains: HashMap::from([(
                "ethereum".to_string(),
                ChainGasConfig { min_wei: 1_000_000_000, max_wei: 500_000_000_000, spike_multiplier: 3.0, block_time_ms: 12_000 },
            )]),
        };
        let gas = Arc::new(GasOptimizer::new(gas_config, Arc::new(SystemClock)));
        MevShaper::new(MevShaperConfig { providers, chain_settings }, gas)
    }

    #[test]
    fn eligible_when_profit_clears_threshold() {
        let shaper = shaper();
        let result = shaper.check_eligibility("ethereum", Some(0.02));
        assert!(result.should_use_mev);
        assert_eq!(result.provider.as_deref(), Some("flashbots"));
    }

    #[test]
    fn ineligible_below_min_profit() {
        let shaper = shaper();
        let result = shaper.check_eligibility("ethereum", Some(0.001));
        assert!(!result.should_use_mev);
    }

    #[test]
    fn fallback_chain_excludes_disabled_providers() {
        let shaper = shaper();
        assert_eq!(shaper.get_provider_fallback_chain("ethereum"), vec!["flashbots".to_string()]);
    }

    #[tokio::test]
    async fn apply_protection_uses_eip1559_when_available() {
        let shaper = shaper();
        let rpc = Eip1559Rpc;
        let mut tx = TxRequest::default();
        shaper.apply_protection(&mut tx, "ethereum", &rpc).await;
        assert_eq!(tx.tx_type, Some(2));
        assert!(tx.max_fee_per_gas_wei.is_some());
        assert!(tx.max_priority_fee_per_gas_wei.unwrap() <= 2_000_000_000);
    }

    #[tokio::test]
    async fn apply_protection_falls_back_on_rpc_error() {
        let shaper = shaper();
        let rpc = FakeRpc::new();
        rpc.set_failing(true);
        let mut tx = TxRequest::default();
        shaper.apply_protection(&mut tx, "ethereum", &*rpc).await;
        assert_eq!(tx.tx_type, Some(0));
        assert!(tx.gas_price_wei.is_some());
    }
}
