use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use sa_domain::error::{Error, Result};
use sa_domain::model::{Attribution, DeveloperEarning, ForkMode, WalletBucket};
use uuid::Uuid;

use crate::wallet::WalletLedger;

/// Attributes a settled turn's spend to the developer who published the
/// agent that ran it, and tracks per-agent earning totals for the
/// marketplace listing dashboard.
///
/// A forked agent still pays the original author unless the fork itself
/// has been published as its own listing with its own
/// `developer_user_id` — that distinction lives entirely in
/// [`Attribution`], this service just trusts whatever attribution the
/// turn was opened with.
/// A developer's withdrawable balance, tracked separately from the
/// shared [`WalletLedger`]'s `earned` bucket so it can carry its own
/// `total_withdrawn` counter — the earned bucket is still the real
/// money (credited/debited alongside it on every reward/withdrawal),
/// this is the payout-accounting view on top of it.
#[derive(Debug, Clone, Copy, Default)]
struct DeveloperWalletState {
    available_balance: f64,
    total_withdrawn: f64,
}

pub struct DeveloperRewardService {
    ledger: Arc<WalletLedger>,
    earnings: RwLock<Vec<DeveloperEarning>>,
    wallets: RwLock<HashMap<String, DeveloperWalletState>>,
}

impl DeveloperRewardService {
    pub fn new(ledger: Arc<WalletLedger>) -> Self {
        Self {
            ledger,
            earnings: RwLock::new(Vec::new()),
            wallets: RwLock::new(HashMap::new()),
        }
    }

    /// Reward the agent's developer for a settled turn. No-op (and no
    /// earning record) for agents with no attributed developer, e.g. an
    /// official first-party agent nobody forked.
    pub fn reward_for_turn(
        &self,
        attribution: &Attribution,
        turn_id: Uuid,
        gross_credits: f64,
        revenue_share: f64,
    ) -> Option<f64> {
        let developer_user_id = attribution.developer_user_id.as_ref()?;
        let payout = gross_credits * revenue_share;
        self.ledger.credit(
            developer_user_id,
            WalletBucket::Earned,
            payout,
            "developer reward",
        );
        self.wallets
            .write()
            .entry(developer_user_id.clone())
            .or_default()
            .available_balance += payout;
        self.earnings.write().push(DeveloperEarning {
            developer_user_id: developer_user_id.clone(),
            agent_id: attribution.agent_id.clone(),
            marketplace_id: attribution.marketplace_id.clone(),
            turn_id,
            credits: payout,
            total_consumed: gross_credits,
            fork_mode: attribution.fork_mode,
            created_at: Utc::now(),
        });
        Some(payout)
    }

    fn available_balance(&self, developer_user_id: &str) -> f64 {
        self.wallets
            .read()
            .get(developer_user_id)
            .map(|w| w.available_balance)
            .unwrap_or(0.0)
    }

    fn total_withdrawn(&self, developer_user_id: &str) -> f64 {
        self.wallets
            .read()
            .get(developer_user_id)
            .map(|w| w.total_withdrawn)
            .unwrap_or(0.0)
    }

    /// Withdraw `amount` from a developer's available balance, moving it
    /// to `total_withdrawn` and draining the shared `earned` bucket by
    /// the same amount. Errors rather than short-withdrawing — a payout
    /// that silently pays less than requested is a billing bug, not a
    /// graceful degradation.
    fn withdraw(&self, developer_user_id: &str, amount: f64) -> Result<()> {
        {
            let mut wallets = self.wallets.write();
            let state = wallets.entry(developer_user_id.to_string()).or_default();
            if state.available_balance < amount {
                return Err(Error::InsufficientBalance {
                    needed: amount,
                    available: state.available_balance,
                });
            }
            state.available_balance -= amount;
            state.total_withdrawn += amount;
        }
        self.ledger
            .deduct_ordered(developer_user_id, amount, None, "developer withdrawal");
        Ok(())
    }

    /// Total earned credits for one developer across every agent.
    pub fn earnings_summary(&self, developer_user_id: &str) -> f64 {
        self.earnings
            .read()
            .iter()
            .filter(|e| e.developer_user_id == developer_user_id)
            .map(|e| e.credits)
            .sum()
    }

    /// Earnings broken down per agent_id for one developer, for the
    /// marketplace earnings dashboard.
    pub fn earnings_summary_by_agent(&self, developer_user_id: &str) -> HashMap<String, f64> {
        let mut totals: HashMap<String, f64> = HashMap::new();
        for entry in self.earnings.read().iter() {
            if entry.developer_user_id == developer_user_id {
                *totals.entry(entry.agent_id.clone()).or_insert(0.0) += entry.credits;
            }
        }
        totals
    }

    /// Aggregate earnings and turn count for a single published listing
    /// (agent_id), regardless of developer — used by the listing detail
    /// page to show total usage across every developer who forked it.
    pub fn listing_earnings_stats(&self, agent_id: &str) -> ListingEarningsStats {
        let entries: Vec<_> = self
            .earnings
            .read()
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect();
        let total_credits = entries.iter().map(|e| e.credits).sum();
        ListingEarningsStats {
            agent_id: agent_id.to_string(),
            total_credits,
            turn_count: entries.len(),
        }
    }

    /// Whether a turn's attribution should pay the original author
    /// rather than a fork's listed developer. Forked agents with no
    /// `developer_user_id` of their own fall back to crediting the
    /// original via `marketplace_id` lookup at the call site; this
    /// method only classifies the attribution itself.
    pub fn is_forked(&self, attribution: &Attribution) -> bool {
        attribution.fork_mode == ForkMode::Forked
    }
}

#[derive(Debug, Clone)]
pub struct ListingEarningsStats {
    pub agent_id: String,
    pub total_credits: f64,
    pub turn_count: usize,
}

/// A developer's withdrawable-balance view, backed by the issuing
/// [`DeveloperRewardService`]'s own `available_balance`/`total_withdrawn`
/// counters rather than reading the shared [`WalletLedger`]'s `earned`
/// bucket directly — the earned bucket is still debited on withdrawal so
/// a developer who is also a platform user has one consistent overall
/// balance, but payout accounting needs its own running total.
pub struct DeveloperWallet<'a> {
    service: &'a DeveloperRewardService,
    developer_user_id: String,
}

impl<'a> DeveloperWallet<'a> {
    pub fn new(service: &'a DeveloperRewardService, developer_user_id: impl Into<String>) -> Self {
        Self {
            service,
            developer_user_id: developer_user_id.into(),
        }
    }

    pub fn available_balance(&self) -> f64 {
        self.service.available_balance(&self.developer_user_id)
    }

    pub fn total_withdrawn(&self) -> f64 {
        self.service.total_withdrawn(&self.developer_user_id)
    }

    /// Withdraw `amount` from the developer's available balance.
    pub fn withdraw(&self, amount: f64) -> Result<()> {
        self.service.withdraw(&self.developer_user_id, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribution(developer: Option<&str>, fork_mode: ForkMode) -> Attribution {
        Attribution {
            agent_id: "agent-1".into(),
            marketplace_id: Some("listing-1".into()),
            developer_user_id: developer.map(|s| s.to_string()),
            fork_mode,
        }
    }

    #[test]
    fn reward_pays_attributed_developer_their_share() {
        let ledger = Arc::new(WalletLedger::new());
        let svc = DeveloperRewardService::new(ledger.clone());
        let attribution = attribution(Some("dev1"), ForkMode::Original);

        let payout = svc.reward_for_turn(&attribution, Uuid::new_v4(), 10.0, 0.7);
        assert_eq!(payout, Some(7.0));
        assert_eq!(ledger.balance("dev1").earned_balance, 7.0);
    }

    #[test]
    fn reward_is_noop_without_attributed_developer() {
        let ledger = Arc::new(WalletLedger::new());
        let svc = DeveloperRewardService::new(ledger.clone());
        let attribution = attribution(None, ForkMode::Original);

        let payout = svc.reward_for_turn(&attribution, Uuid::new_v4(), 10.0, 0.7);
        assert_eq!(payout, None);
        assert_eq!(svc.earnings_summary("anyone"), 0.0);
    }

    #[test]
    fn earnings_summary_sums_across_turns() {
        let ledger = Arc::new(WalletLedger::new());
        let svc = DeveloperRewardService::new(ledger);
        let attribution = attribution(Some("dev1"), ForkMode::Forked);
        svc.reward_for_turn(&attribution, Uuid::new_v4(), 10.0, 0.5);
        svc.reward_for_turn(&attribution, Uuid::new_v4(), 20.0, 0.5);
        assert_eq!(svc.earnings_summary("dev1"), 15.0);
    }

    #[test]
    fn earnings_summary_by_agent_splits_per_agent() {
        let ledger = Arc::new(WalletLedger::new());
        let svc = DeveloperRewardService::new(ledger);
        let mut a1 = attribution(Some("dev1"), ForkMode::Original);
        a1.agent_id = "agent-a".into();
        let mut a2 = attribution(Some("dev1"), ForkMode::Original);
        a2.agent_id = "agent-b".into();
        svc.reward_for_turn(&a1, Uuid::new_v4(), 10.0, 1.0);
        svc.reward_for_turn(&a2, Uuid::new_v4(), 4.0, 1.0);

        let totals = svc.earnings_summary_by_agent("dev1");
        assert_eq!(totals.get("agent-a"), Some(&10.0));
        assert_eq!(totals.get("agent-b"), Some(&4.0));
    }

    #[test]
    fn listing_stats_aggregate_across_developers() {
        let ledger = Arc::new(WalletLedger::new());
        let svc = DeveloperRewardService::new(ledger);
        let a1 = attribution(Some("dev1"), ForkMode::Original);
        let mut a2 = attribution(Some("dev2"), ForkMode::Forked);
        a2.agent_id = a1.agent_id.clone();
        svc.reward_for_turn(&a1, Uuid::new_v4(), 10.0, 1.0);
        svc.reward_for_turn(&a2, Uuid::new_v4(), 5.0, 1.0);

        let stats = svc.listing_earnings_stats("agent-1");
        assert_eq!(stats.turn_count, 2);
        assert_eq!(stats.total_credits, 15.0);
    }

    #[test]
    fn withdraw_succeeds_within_balance() {
        let ledger = Arc::new(WalletLedger::new());
        let svc = DeveloperRewardService::new(ledger.clone());
        let attribution = attribution(Some("dev1"), ForkMode::Original);
        svc.reward_for_turn(&attribution, Uuid::new_v4(), 20.0, 1.0);

        let wallet = DeveloperWallet::new(&svc, "dev1");
        wallet.withdraw(12.0).unwrap();
        assert_eq!(wallet.available_balance(), 8.0);
        assert_eq!(wallet.total_withdrawn(), 12.0);
        assert_eq!(ledger.balance("dev1").earned_balance, 8.0);
    }

    #[test]
    fn withdraw_errors_when_balance_insufficient() {
        let ledger = Arc::new(WalletLedger::new());
        let svc = DeveloperRewardService::new(ledger);
        let attribution = attribution(Some("dev1"), ForkMode::Original);
        svc.reward_for_turn(&attribution, Uuid::new_v4(), 5.0, 1.0);

        let wallet = DeveloperWallet::new(&svc, "dev1");
        let result = wallet.withdraw(10.0);
        assert!(result.is_err());
        assert_eq!(wallet.available_balance(), 5.0);
        assert_eq!(wallet.total_withdrawn(), 0.0);
    }
}
