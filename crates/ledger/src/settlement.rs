use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sa_domain::error::Result;
use sa_domain::model::{Attribution, ConsumeRecord, ConsumeRecordKind, ConsumeStatus, WalletBucket};
use uuid::Uuid;

use crate::wallet::WalletLedger;

/// Pending → success/failed settlement of what a turn actually cost.
///
/// A turn opens a pending [`ConsumeRecord`] with an *estimate* before it
/// starts spending tokens, so a crash mid-turn leaves a debitable trace
/// instead of silently giving away usage. When the turn finishes, the
/// record is settled with the *actual* cost and the wallet is debited
/// for the difference (or refunded, if the estimate overshot).
pub struct SettlementService {
    ledger: Arc<WalletLedger>,
    records: RwLock<HashMap<Uuid, ConsumeRecord>>,
}

impl SettlementService {
    pub fn new(ledger: Arc<WalletLedger>) -> Self {
        Self {
            ledger,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Open a pending consume record before a turn starts spending.
    /// Carries no session/topic/attribution detail — used only for a
    /// turn-level pre-authorization estimate, not for the per-event LLM
    /// or tool-call records (see [`open_llm_record`](Self::open_llm_record)
    /// / [`open_tool_record`](Self::open_tool_record)).
    pub fn open_record(&self, turn_id: Uuid, user_id: &str, estimated_credits: f64) -> Uuid {
        self.insert(ConsumeRecord {
            record_id: Uuid::new_v4(),
            turn_id,
            user_id: user_id.to_string(),
            kind: ConsumeRecordKind::Llm,
            estimated_credits,
            actual_credits: None,
            status: ConsumeStatus::Pending,
            created_at: Utc::now(),
            settled_at: None,
            session_id: None,
            topic_id: None,
            message_id: None,
            agent_id: None,
            marketplace_id: None,
            developer_user_id: None,
            tier: None,
            model: None,
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
            tool_name: None,
        })
    }

    fn insert(&self, record: ConsumeRecord) -> Uuid {
        let id = record.record_id;
        self.records.write().insert(id, record);
        id
    }

    /// Settle a pending record with the turn's actual cost, debiting the
    /// wallet for that amount (ordered free → paid → earned). Returns
    /// the amount actually deducted, which may be less than
    /// `actual_credits` if the wallet ran dry mid-turn.
    pub fn settle(&self, record_id: Uuid, actual_credits: f64) -> Result<f64> {
        let (user_id, turn_id) = {
            let mut records = self.records.write();
            let record = match records.get_mut(&record_id) {
                Some(r) => r,
                None => return Ok(0.0),
            };
            record.actual_credits = Some(actual_credits);
            record.status = ConsumeStatus::Success;
            record.settled_at = Some(Utc::now());
            (record.user_id.clone(), record.turn_id)
        };
        let deducted = self.ledger.deduct_ordered(
            &user_id,
            actual_credits,
            Some(turn_id),
            "turn settlement",
        );
        Ok(deducted)
    }

    /// Mark a record failed without charging the wallet (the turn never
    /// produced billable output).
    pub fn fail(&self, record_id: Uuid) {
        if let Some(record) = self.records.write().get_mut(&record_id) {
            record.status = ConsumeStatus::Failed;
            record.settled_at = Some(Utc::now());
        }
    }

    pub fn get(&self, record_id: Uuid) -> Option<ConsumeRecord> {
        self.records.read().get(&record_id).cloned()
    }

    /// Open an `llm`-kind record already settled with an actual amount
    /// in hand (`token_usage` knows its cost the moment it arrives —
    /// there's no separate "estimate" phase like a turn-level
    /// pre-authorization). Stays `Pending` until
    /// [`settle_turn`](Self::settle_turn) bulk-transitions every pending
    /// record for the turn at finalization.
    #[allow(clippy::too_many_arguments)]
    pub fn open_llm_record(
        &self,
        turn_id: Uuid,
        user_id: &str,
        credits: f64,
        attribution: &Attribution,
        session_id: &str,
        topic_id: Uuid,
        message_id: Option<Uuid>,
        tier: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: f64,
    ) -> Uuid {
        self.insert(ConsumeRecord {
            record_id: Uuid::new_v4(),
            turn_id,
            user_id: user_id.to_string(),
            kind: ConsumeRecordKind::Llm,
            estimated_credits: credits,
            actual_credits: Some(credits),
            status: ConsumeStatus::Pending,
            created_at: Utc::now(),
            settled_at: None,
            session_id: Some(session_id.to_string()),
            topic_id: Some(topic_id),
            message_id,
            agent_id: Some(attribution.agent_id.clone()),
            marketplace_id: attribution.marketplace_id.clone(),
            developer_user_id: attribution.developer_user_id.clone(),
            tier: Some(tier.to_string()),
            model: Some(model.to_string()),
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
            cost_usd: Some(cost_usd),
            tool_name: None,
        })
    }

    /// Open a `tool_call`-kind record, same settled-on-arrival shape as
    /// [`open_llm_record`](Self::open_llm_record) but billing a flat
    /// per-invocation rate instead of token volume.
    pub fn open_tool_record(
        &self,
        turn_id: Uuid,
        user_id: &str,
        credits: f64,
        attribution: &Attribution,
        session_id: &str,
        topic_id: Uuid,
        message_id: Option<Uuid>,
        tool_name: &str,
    ) -> Uuid {
        self.insert(ConsumeRecord {
            record_id: Uuid::new_v4(),
            turn_id,
            user_id: user_id.to_string(),
            kind: ConsumeRecordKind::ToolCall,
            estimated_credits: credits,
            actual_credits: Some(credits),
            status: ConsumeStatus::Pending,
            created_at: Utc::now(),
            settled_at: None,
            session_id: Some(session_id.to_string()),
            topic_id: Some(topic_id),
            message_id,
            agent_id: Some(attribution.agent_id.clone()),
            marketplace_id: attribution.marketplace_id.clone(),
            developer_user_id: attribution.developer_user_id.clone(),
            tier: None,
            model: None,
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
            tool_name: Some(tool_name.to_string()),
        })
    }

    /// All still-pending records for a turn, in the order they were
    /// opened.
    pub fn pending_for_turn(&self, turn_id: Uuid) -> Vec<ConsumeRecord> {
        let mut records: Vec<ConsumeRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.turn_id == turn_id && r.status == ConsumeStatus::Pending)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// `finalize_and_settle`: sum every pending record's amount for this
    /// turn, deduct that total from the wallet in one ordered debit, and
    /// bulk-transition the records to `success` regardless of whether the
    /// deduction fully covered the sum (best-effort — see
    /// [`WalletLedger::deduct_ordered`]). A zero or negative sum still
    /// bulk-marks the records success without touching the wallet.
    pub fn settle_turn(&self, turn_id: Uuid, user_id: &str) -> f64 {
        let pending = self.pending_for_turn(turn_id);
        let total: f64 = pending.iter().map(|r| r.actual_credits.unwrap_or(r.estimated_credits)).sum();

        let deducted = if total > 0.0 {
            self.ledger
                .deduct_ordered(user_id, total, Some(turn_id), "turn settlement")
        } else {
            0.0
        };

        let mut records = self.records.write();
        for r in &pending {
            if let Some(record) = records.get_mut(&r.record_id) {
                record.status = ConsumeStatus::Success;
                record.settled_at = Some(Utc::now());
                if record.actual_credits.is_none() {
                    record.actual_credits = Some(record.estimated_credits);
                }
            }
        }
        deducted
    }

    /// Settle any pending record created at or after `cutoff` using its
    /// estimate as the actual cost. Used for the exception-path sweep
    /// that reconciles turns whose worker crashed before it could call
    /// [`settle`](Self::settle) — the cutoff prevents a sweep from ever
    /// reaching back past the turn it was triggered for and resettling
    /// unrelated, much older pending records.
    pub fn sweep_orphaned_since(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let to_sweep: Vec<Uuid> = self
            .records
            .read()
            .values()
            .filter(|r| r.status == ConsumeStatus::Pending && r.created_at >= cutoff)
            .map(|r| r.record_id)
            .collect();

        for id in &to_sweep {
            let estimate = self.records.read().get(id).map(|r| r.estimated_credits);
            if let Some(estimate) = estimate {
                let _ = self.settle(*id, estimate);
                tracing::warn!(record_id = %id, "swept orphaned consume record");
            }
        }
        to_sweep
    }

    /// Credit the sum into a developer's earned bucket, applying the
    /// configured revenue share.
    pub fn pay_developer(&self, developer_user_id: &str, gross_credits: f64, share: f64) -> f64 {
        let payout = gross_credits * share;
        self.ledger
            .credit(developer_user_id, WalletBucket::Earned, payout, "developer reward");
        payout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn service() -> (SettlementService, Arc<WalletLedger>) {
        let ledger = Arc::new(WalletLedger::new());
        (SettlementService::new(ledger.clone()), ledger)
    }

    #[test]
    fn settle_debits_actual_not_estimated_cost() {
        let (svc, ledger) = service();
        ledger.credit("u1", WalletBucket::Paid, 10.0, "topup");
        let turn_id = Uuid::new_v4();
        let record_id = svc.open_record(turn_id, "u1", 5.0);

        let deducted = svc.settle(record_id, 3.0).unwrap();
        assert_eq!(deducted, 3.0);
        assert_eq!(ledger.balance("u1").paid_balance, 7.0);

        let record = svc.get(record_id).unwrap();
        assert_eq!(record.status, ConsumeStatus::Success);
        assert_eq!(record.actual_credits, Some(3.0));
    }

    #[test]
    fn fail_does_not_touch_wallet() {
        let (svc, ledger) = service();
        ledger.credit("u1", WalletBucket::Paid, 10.0, "topup");
        let record_id = svc.open_record(Uuid::new_v4(), "u1", 5.0);
        svc.fail(record_id);
        assert_eq!(ledger.balance("u1").paid_balance, 10.0);
        assert_eq!(svc.get(record_id).unwrap().status, ConsumeStatus::Failed);
    }

    #[test]
    fn llm_record_is_tagged_and_settles_into_success() {
        let (svc, ledger) = service();
        ledger.credit("u1", WalletBucket::Paid, 10.0, "topup");
        let attribution = Attribution {
            agent_id: "agent-1".into(),
            marketplace_id: Some("listing-1".into()),
            developer_user_id: Some("dev1".into()),
            fork_mode: sa_domain::model::ForkMode::Original,
        };
        let turn_id = Uuid::new_v4();
        let topic_id = Uuid::new_v4();
        let record_id = svc.open_llm_record(
            turn_id, "u1", 2.0, &attribution, "sess1", topic_id, None,
            "standard", "gpt-4o", 500, 100, 0.01,
        );

        let record = svc.get(record_id).unwrap();
        assert_eq!(record.kind, ConsumeRecordKind::Llm);
        assert_eq!(record.developer_user_id.as_deref(), Some("dev1"));
        assert_eq!(record.model.as_deref(), Some("gpt-4o"));

        svc.settle_turn(turn_id, "u1");
        assert_eq!(svc.get(record_id).unwrap().status, ConsumeStatus::Success);
        assert_eq!(ledger.balance("u1").paid_balance, 8.0);
    }

    #[test]
    fn tool_record_is_tagged_by_tool_name() {
        let (svc, _ledger) = service();
        let attribution = Attribution {
            agent_id: "agent-1".into(),
            marketplace_id: None,
            developer_user_id: None,
            fork_mode: sa_domain::model::ForkMode::Original,
        };
        let record_id = svc.open_tool_record(
            Uuid::new_v4(), "u1", 0.1, &attribution, "sess1", Uuid::new_v4(), None, "exec",
        );
        let record = svc.get(record_id).unwrap();
        assert_eq!(record.kind, ConsumeRecordKind::ToolCall);
        assert_eq!(record.tool_name.as_deref(), Some("exec"));
    }

    #[test]
    fn sweep_settles_pending_records_at_or_after_cutoff() {
        let (svc, ledger) = service();
        ledger.credit("u1", WalletBucket::Paid, 100.0, "topup");
        let cutoff = Utc::now() - ChronoDuration::seconds(1);
        let record_id = svc.open_record(Uuid::new_v4(), "u1", 4.0);

        let swept = svc.sweep_orphaned_since(cutoff);
        assert_eq!(swept, vec![record_id]);
        assert_eq!(svc.get(record_id).unwrap().status, ConsumeStatus::Success);
        assert_eq!(ledger.balance("u1").paid_balance, 96.0);
    }

    #[test]
    fn sweep_ignores_records_before_cutoff() {
        let (svc, _ledger) = service();
        let record_id = svc.open_record(Uuid::new_v4(), "u1", 4.0);
        let future_cutoff = Utc::now() + ChronoDuration::seconds(60);
        let swept = svc.sweep_orphaned_since(future_cutoff);
        assert!(swept.is_empty());
        assert_eq!(svc.get(record_id).unwrap().status, ConsumeStatus::Pending);
    }

    #[test]
    fn pay_developer_applies_revenue_share() {
        let (svc, ledger) = service();
        let payout = svc.pay_developer("dev1", 10.0, 0.7);
        assert!((payout - 7.0).abs() < f64::EPSILON);
        assert_eq!(ledger.balance("dev1").earned_balance, 7.0);
    }
}
