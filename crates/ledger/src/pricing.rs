use std::collections::HashMap;

use sa_domain::config::LedgerSettingsConfig;

/// Converts raw LLM token usage and tool invocations into credits, and
/// raw credits into USD for developer payout accounting.
///
/// Modeled on the same per-model rate-table pattern as
/// `sa_domain::config::ModelPricing::estimate_cost` — a flat
/// dollars-per-million-tokens rate, looked up by model name — but
/// denominated in platform credits and keyed by pricing tier rather
/// than by model alone, since a single model can be offered at
/// multiple tiers.
#[derive(Debug, Clone)]
pub struct PricingTable {
    tier_credits_per_unit: HashMap<String, f64>,
    model_rates: HashMap<String, ModelRate>,
    settlement_multiplier: f64,
}

#[derive(Debug, Clone, Copy)]
struct ModelRate {
    input_usd_per_mtok: f64,
    output_usd_per_mtok: f64,
}

impl PricingTable {
    pub fn from_config(config: &LedgerSettingsConfig) -> Self {
        let tier_credits_per_unit = config
            .pricing
            .tiers
            .iter()
            .map(|t| (t.tier.clone(), t.credits_per_unit))
            .collect();
        let model_rates = config
            .pricing
            .model_rates
            .iter()
            .map(|m| {
                (
                    m.model.clone(),
                    ModelRate {
                        input_usd_per_mtok: m.input_usd_per_mtok,
                        output_usd_per_mtok: m.output_usd_per_mtok,
                    },
                )
            })
            .collect();
        Self {
            tier_credits_per_unit,
            model_rates,
            settlement_multiplier: config.settlement_multiplier,
        }
    }

    /// Credits owed for `units` consumption units (e.g. per-1K-token
    /// blocks) at the given tier. Unknown tiers fall back to a
    /// conservative default rate of 1.0 credit/unit rather than
    /// panicking — a misconfigured tier should overcharge, not give
    /// away usage for free.
    pub fn calculate_llm_credits(&self, tier: &str, units: f64) -> f64 {
        let rate = self.tier_credits_per_unit.get(tier).copied().unwrap_or(1.0);
        rate * units
    }

    /// Estimated USD cost of a completion, used for developer payout
    /// accounting and admin cost dashboards (never shown to the end
    /// user, who is billed in credits).
    pub fn calculate_llm_cost_usd(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        let rate = match self.model_rates.get(model) {
            Some(r) => *r,
            None => return 0.0,
        };
        (input_tokens as f64 * rate.input_usd_per_mtok
            + output_tokens as f64 * rate.output_usd_per_mtok)
            / 1_000_000.0
    }

    /// Flat per-invocation credit cost for a tool call.
    pub fn calculate_tool_cost(&self, tool_credits_per_call: f64) -> f64 {
        tool_credits_per_call
    }

    /// Applies the platform settlement multiplier to a raw credit sum
    /// (e.g. to fold in a margin or promotional discount).
    pub fn calculate_settlement_total(&self, raw_credits: f64) -> f64 {
        raw_credits * self.settlement_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::config::{LedgerSettingsConfig, ModelRateConfig, PricingConfig, PricingTierConfig};

    fn table() -> PricingTable {
        let config = LedgerSettingsConfig {
            pricing: PricingConfig {
                tiers: vec![PricingTierConfig {
                    tier: "standard".into(),
                    credits_per_unit: 2.0,
                }],
                model_rates: vec![ModelRateConfig {
                    model: "gpt-4o".into(),
                    input_usd_per_mtok: 2.5,
                    output_usd_per_mtok: 10.0,
                }],
            },
            settlement_multiplier: 1.1,
            developer_revenue_share: 0.7,
            sweep_interval_seconds: 300,
            welcome_bonus_amount: 5.0,
        };
        PricingTable::from_config(&config)
    }

    #[test]
    fn llm_credits_use_tier_rate() {
        let t = table();
        assert!((t.calculate_llm_credits("standard", 3.0) - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_tier_falls_back_to_one_credit_per_unit() {
        let t = table();
        assert!((t.calculate_llm_credits("unknown", 4.0) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn usd_cost_matches_per_million_rate() {
        let t = table();
        let cost = t.calculate_llm_cost_usd("gpt-4o", 1_000_000, 0);
        assert!((cost - 2.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let t = table();
        assert_eq!(t.calculate_llm_cost_usd("unknown-model", 1000, 1000), 0.0);
    }

    #[test]
    fn settlement_applies_multiplier() {
        let t = table();
        assert!((t.calculate_settlement_total(10.0) - 11.0).abs() < 1e-9);
    }
}
