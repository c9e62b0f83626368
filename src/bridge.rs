//! Cross-chain bridge profitability filter (spec §4.10, C10).

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeFilterConfig {
    /// Percentage (0-100) of expected profit the bridge fee may consume before the
    /// opportunity is rejected as unprofitable.
    pub max_fee_percentage: f64,
}

impl Default for BridgeFilterConfig {
    fn default() -> Self {
        Self { max_fee_percentage: 50.0 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeAnalysisOptions {
    pub bridge_fee_wei: u128,
}

#[derive(Debug, Clone)]
pub struct BridgeAnalysis {
    pub is_profitable: bool,
    pub bridge_fee_usd: f64,
    pub bridge_fee_eth: f64,
    pub profit_after_fees: f64,
    pub fee_percentage_of_profit: f64,
    pub reason: Option<String>,
}

pub struct BridgeFilter {
    config: BridgeFilterConfig,
}

impl BridgeFilter {
    pub fn new(config: BridgeFilterConfig) -> Self {
        Self { config }
    }

    /// `expectedProfit == 0` is a degenerate case: the fee consumes 100% of (zero)
    /// profit by convention, so the opportunity is rejected rather than divide-by-zero.
    pub fn analyze(&self, bridge_fee_wei: u128, expected_profit_usd: f64, native_token_price_usd: f64) -> BridgeAnalysis {
        let bridge_fee_eth = bridge_fee_wei as f64 / 1e18;
        let bridge_fee_usd = bridge_fee_eth * native_token_price_usd;

        if expected_profit_usd == 0.0 {
            return BridgeAnalysis {
                is_profitable: false,
                bridge_fee_usd,
                bridge_fee_eth,
                profit_after_fees: -bridge_fee_usd,
                fee_percentage_of_profit: 100.0,
                reason: Some("expected profit is zero".into()),
            };
        }

        let fee_percentage_of_profit = (bridge_fee_usd / expected_profit_usd) * 100.0;
        let profit_after_fees = expected_profit_usd - bridge_fee_usd;
        let is_profitable = fee_percentage_of_profit < self.config.max_fee_percentage;

        BridgeAnalysis {
            is_profitable,
            bridge_fee_usd,
            bridge_fee_eth,
            profit_after_fees,
            fee_percentage_of_profit,
            reason: if is_profitable {
                None
            } else {
                Some(format!(
                    "bridge fee consumes {:.1}% of profit, exceeding the {:.1}% limit",
                    fee_percentage_of_profit, self.config.max_fee_percentage
                ))
            },
        }
    }

    /// Minimum profit (USD) required so the bridge fee stays under `max_fee_percentage`.
    pub fn get_minimum_profit_required(&self, bridge_fee_usd: f64) -> f64 {
        bridge_fee_usd / (self.config.max_fee_percentage / 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> BridgeFilter {
        BridgeFilter::new(BridgeFilterConfig { max_fee_percentage: 50.0 })
    }

    #[test]
    fn profitable_when_fee_below_limit() {
        let analysis = filter().analyze(1_000_000_000_000_000, 100.0, 2_000.0);
        // bridge_fee_eth = 0.001, bridge_fee_usd = 2.0, 2% of profit
        assert!(analysis.is_profitable);
        assert!((analysis.fee_percentage_of_profit - 2.0).abs() < 1e-9);
    }

    #[test]
    fn unprofitable_when_fee_at_or_above_limit() {
        let analysis = filter().analyze(25_000_000_000_000_000, 100.0, 2_000.0);
        // bridge_fee_usd = 50.0, exactly 50% -> not profitable (strictly below required)
        assert!(!analysis.is_profitable);
        assert!(analysis.reason.is_some());
    }

    #[test]
    fn zero_expected_profit_is_unprofitable() {
        let analysis = filter().analyze(1, 0.0, 2_000.0);
        assert!(!analysis.is_profitable);
        assert_eq!(analysis.fee_percentage_of_profit, 100.0);
    }

    #[test]
    fn minimum_profit_required_matches_inverse_of_threshold() {
        let min = filter().get_minimum_profit_required(50.0);
        assert!((min - 100.0).abs() < 1e-9);
    }
}
