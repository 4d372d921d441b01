use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wallet ledger & settlement pricing configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for wallet debits, settlement sweeps, and developer revenue
/// share. Named `LedgerSettingsConfig` to avoid colliding with the
/// `pz-ledger` crate's own types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettingsConfig {
    /// Model/tool pricing table.
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Flat multiplier applied at final settlement (e.g. platform margin).
    #[serde(default = "d_multiplier")]
    pub settlement_multiplier: f64,
    /// Share of settled credits routed to the developer wallet (0.0-1.0).
    #[serde(default = "d_dev_share")]
    pub developer_revenue_share: f64,
    /// Interval between sweeps that settle orphaned pending consume records
    /// left behind by crashed turns (seconds).
    #[serde(default = "d_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// One-time credit granted to the `free` bucket the first time a
    /// user's wallet is touched.
    #[serde(default = "d_welcome_bonus")]
    pub welcome_bonus_amount: f64,
}

impl Default for LedgerSettingsConfig {
    fn default() -> Self {
        Self {
            pricing: PricingConfig::default(),
            settlement_multiplier: d_multiplier(),
            developer_revenue_share: d_dev_share(),
            sweep_interval_seconds: d_sweep_interval(),
            welcome_bonus_amount: d_welcome_bonus(),
        }
    }
}

/// Credit-tier and per-model USD rate table.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PricingConfig {
    /// Credit cost per consumption unit, by tier name (e.g. "standard", "pro").
    #[serde(default)]
    pub tiers: Vec<PricingTierConfig>,
    /// Per-model USD-per-million-token rates, used for cost estimation
    /// and developer earning calculation.
    #[serde(default)]
    pub model_rates: Vec<ModelRateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTierConfig {
    pub tier: String,
    /// Credits charged per consumption unit (e.g. per 1K tokens).
    pub credits_per_unit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRateConfig {
    pub model: String,
    pub input_usd_per_mtok: f64,
    pub output_usd_per_mtok: f64,
}

fn d_multiplier() -> f64 {
    1.0
}
fn d_dev_share() -> f64 {
    0.7
}
fn d_sweep_interval() -> u64 {
    300
}
fn d_welcome_bonus() -> f64 {
    5.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = LedgerSettingsConfig::default();
        assert!((cfg.settlement_multiplier - 1.0).abs() < f64::EPSILON);
        assert!((cfg.developer_revenue_share - 0.7).abs() < f64::EPSILON);
        assert!(cfg.pricing.tiers.is_empty());
    }

    #[test]
    fn deserialize_empty_uses_defaults() {
        let cfg: LedgerSettingsConfig = toml::from_str("").unwrap();
        assert!((cfg.settlement_multiplier - 1.0).abs() < f64::EPSILON);
    }
}
