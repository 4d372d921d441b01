use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use sa_domain::error::{Error, Result};
use sa_domain::model::{LedgerEntry, Wallet, WalletBucket};
use uuid::Uuid;

/// In-process wallet store and ordered debit engine. Mirrors the
/// `RwLock<HashMap<...>>` + typed-counter shape of
/// `sa-gateway`'s `runtime::quota::QuotaTracker`, generalized from daily
/// token/cost counters to a three-bucket credit balance plus an
/// append-only ledger of every movement.
///
/// Buckets are drained in a fixed order — free, then paid, then earned —
/// so promotional credit always gets used up before a user's own
/// top-ups or developer earnings.
pub struct WalletLedger {
    wallets: RwLock<HashMap<String, Wallet>>,
    entries: RwLock<Vec<LedgerEntry>>,
    /// Credited to `free` the first time a wallet is touched. Zero
    /// disables the bonus entirely (no entry is written).
    welcome_bonus_amount: f64,
}

impl Default for WalletLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletLedger {
    pub fn new() -> Self {
        Self::with_welcome_bonus(0.0)
    }

    pub fn with_welcome_bonus(amount: f64) -> Self {
        Self {
            wallets: RwLock::new(HashMap::new()),
            entries: RwLock::new(Vec::new()),
            welcome_bonus_amount: amount,
        }
    }

    /// Fetch a user's wallet, creating it (with the welcome bonus, if
    /// configured) on first touch.
    fn get_or_create(&self, user_id: &str) -> Wallet {
        let is_new = !self.wallets.read().contains_key(user_id);
        let wallet = self
            .wallets
            .write()
            .entry(user_id.to_string())
            .or_insert_with(|| Wallet {
                user_id: user_id.to_string(),
                free_balance: 0.0,
                paid_balance: 0.0,
                earned_balance: 0.0,
                virtual_total: 0.0,
                total_credited: 0.0,
                total_consumed: 0.0,
                updated_at: Utc::now(),
            })
            .clone();
        if is_new && self.welcome_bonus_amount > 0.0 {
            self.credit(user_id, WalletBucket::Free, self.welcome_bonus_amount, "welcome_bonus");
            return self.wallets.read().get(user_id).expect("just created").clone();
        }
        wallet
    }

    pub fn balance(&self, user_id: &str) -> Wallet {
        self.get_or_create(user_id)
    }

    /// Pre-dispatch soft probe: does this user have any balance at all?
    /// Bootstraps the wallet (and its welcome bonus) on first touch, same
    /// as every other entry point, so a brand-new user's first message
    /// never gets rejected for lack of a wallet.
    pub fn has_positive_balance(&self, user_id: &str) -> bool {
        self.get_or_create(user_id).total_balance() > 0.0
    }

    /// Credit a single bucket (top-up, grant, or developer payout).
    pub fn credit(&self, user_id: &str, bucket: WalletBucket, amount: f64, reason: &str) {
        self.get_or_create(user_id);
        let (balance_after, total_balance_after) = {
            let mut wallets = self.wallets.write();
            let wallet = wallets.get_mut(user_id).expect("just created");
            let balance_after = match bucket {
                WalletBucket::Free => {
                    wallet.free_balance += amount;
                    wallet.free_balance
                }
                WalletBucket::Paid => {
                    wallet.paid_balance += amount;
                    wallet.paid_balance
                }
                WalletBucket::Earned => {
                    wallet.earned_balance += amount;
                    wallet.earned_balance
                }
            };
            wallet.virtual_total += amount;
            wallet.total_credited += amount;
            wallet.updated_at = Utc::now();
            (balance_after, wallet.virtual_total)
        };
        self.record(user_id, bucket, amount, reason, None, balance_after, total_balance_after);
    }

    /// Debit `amount` credits from `user_id`, draining free → paid →
    /// earned in that order. Best-effort short-deduction: if the total
    /// balance is less than `amount`, everything available is taken and
    /// the shortfall is returned rather than erroring — matching the
    /// original `deduct_wallet_ordered` semantics, where a turn that ran
    /// slightly over budget is never retroactively denied its output.
    ///
    /// Returns the amount actually deducted, which may be less than
    /// `amount` when the wallet is exhausted.
    pub fn deduct_ordered(
        &self,
        user_id: &str,
        amount: f64,
        turn_id: Option<Uuid>,
        reason: &str,
    ) -> f64 {
        self.get_or_create(user_id);
        let mut remaining = amount;
        let mut deducted = 0.0;
        // bucket, amount taken, balance_after, total_balance_after
        let mut movements: Vec<(WalletBucket, f64, f64, f64)> = Vec::new();

        {
            let mut wallets = self.wallets.write();
            let wallet = wallets.get_mut(user_id).expect("just created");
            for (bucket, balance) in [
                (WalletBucket::Free, &mut wallet.free_balance),
                (WalletBucket::Paid, &mut wallet.paid_balance),
                (WalletBucket::Earned, &mut wallet.earned_balance),
            ] {
                if remaining <= 0.0 {
                    break;
                }
                let take = remaining.min(*balance);
                if take > 0.0 {
                    *balance -= take;
                    remaining -= take;
                    deducted += take;
                    movements.push((bucket, take, *balance, 0.0));
                }
            }
            wallet.virtual_total -= deducted;
            wallet.total_consumed += deducted;
            wallet.updated_at = Utc::now();
            for movement in &mut movements {
                movement.3 = wallet.virtual_total;
            }
        }

        for (bucket, take, balance_after, total_balance_after) in movements {
            self.record(user_id, bucket, -take, reason, turn_id, balance_after, total_balance_after);
        }

        deducted
    }

    /// Strict variant: errors instead of short-deducting. Used when the
    /// caller needs a hard guarantee the full amount was available
    /// (e.g. a pre-authorized wallet check before starting a turn).
    pub fn deduct_ordered_strict(
        &self,
        user_id: &str,
        amount: f64,
        turn_id: Option<Uuid>,
        reason: &str,
    ) -> Result<()> {
        let wallet = self.get_or_create(user_id);
        if wallet.total_balance() < amount {
            return Err(Error::InsufficientBalance {
                needed: amount,
                available: wallet.total_balance(),
            });
        }
        self.deduct_ordered(user_id, amount, turn_id, reason);
        Ok(())
    }

    fn record(
        &self,
        user_id: &str,
        bucket: WalletBucket,
        delta: f64,
        reason: &str,
        turn_id: Option<Uuid>,
        balance_after: f64,
        total_balance_after: f64,
    ) {
        self.entries.write().push(LedgerEntry {
            entry_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            bucket,
            delta,
            reason: reason.to_string(),
            turn_id,
            created_at: Utc::now(),
            balance_after,
            total_balance_after,
        });
    }

    /// All ledger entries for a user, oldest first.
    pub fn history(&self, user_id: &str) -> Vec<LedgerEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_user_has_zero_balance() {
        let ledger = WalletLedger::new();
        let wallet = ledger.balance("u1");
        assert_eq!(wallet.total_balance(), 0.0);
    }

    #[test]
    fn credit_then_debit_drains_free_first() {
        let ledger = WalletLedger::new();
        ledger.credit("u1", WalletBucket::Free, 5.0, "grant");
        ledger.credit("u1", WalletBucket::Paid, 10.0, "topup");

        let deducted = ledger.deduct_ordered("u1", 7.0, None, "turn");
        assert_eq!(deducted, 7.0);

        let wallet = ledger.balance("u1");
        assert_eq!(wallet.free_balance, 0.0);
        assert_eq!(wallet.paid_balance, 8.0);
    }

    #[test]
    fn debit_falls_through_all_three_buckets_in_order() {
        let ledger = WalletLedger::new();
        ledger.credit("u1", WalletBucket::Free, 1.0, "grant");
        ledger.credit("u1", WalletBucket::Paid, 1.0, "topup");
        ledger.credit("u1", WalletBucket::Earned, 1.0, "reward");

        ledger.deduct_ordered("u1", 2.5, None, "turn");

        let wallet = ledger.balance("u1");
        assert_eq!(wallet.free_balance, 0.0);
        assert_eq!(wallet.paid_balance, 0.0);
        assert!((wallet.earned_balance - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn debit_short_deducts_when_balance_insufficient() {
        let ledger = WalletLedger::new();
        ledger.credit("u1", WalletBucket::Free, 3.0, "grant");

        let deducted = ledger.deduct_ordered("u1", 10.0, None, "turn");
        assert_eq!(deducted, 3.0);
        assert_eq!(ledger.balance("u1").total_balance(), 0.0);
    }

    #[test]
    fn strict_debit_errors_on_insufficient_balance() {
        let ledger = WalletLedger::new();
        ledger.credit("u1", WalletBucket::Free, 1.0, "grant");
        let result = ledger.deduct_ordered_strict("u1", 5.0, None, "turn");
        assert!(result.is_err());
        // Balance must be unchanged on the error path.
        assert_eq!(ledger.balance("u1").free_balance, 1.0);
    }

    #[test]
    fn virtual_total_tracks_credited_minus_consumed() {
        let ledger = WalletLedger::new();
        ledger.credit("u1", WalletBucket::Free, 5.0, "grant");
        ledger.credit("u1", WalletBucket::Paid, 10.0, "topup");
        ledger.deduct_ordered("u1", 4.0, None, "turn");

        let wallet = ledger.balance("u1");
        assert_eq!(wallet.total_credited, 15.0);
        assert_eq!(wallet.total_consumed, 4.0);
        assert_eq!(wallet.virtual_total, wallet.total_credited - wallet.total_consumed);
        assert_eq!(wallet.virtual_total, wallet.total_balance());
    }

    #[test]
    fn ledger_entry_captures_balance_after() {
        let ledger = WalletLedger::new();
        ledger.credit("u1", WalletBucket::Free, 5.0, "grant");
        ledger.deduct_ordered("u1", 2.0, None, "turn");
        let history = ledger.history("u1");
        assert_eq!(history[0].balance_after, 5.0);
        assert_eq!(history[0].total_balance_after, 5.0);
        assert_eq!(history[1].balance_after, 3.0);
        assert_eq!(history[1].total_balance_after, 3.0);
    }

    #[test]
    fn history_records_every_movement() {
        let ledger = WalletLedger::new();
        ledger.credit("u1", WalletBucket::Free, 5.0, "grant");
        ledger.deduct_ordered("u1", 2.0, None, "turn");
        let history = ledger.history("u1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].delta, 5.0);
        assert_eq!(history[1].delta, -2.0);
    }
}
