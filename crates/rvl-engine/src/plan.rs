//! Distribution plan computation.
//!
//! A [`DistributionPlan`] captures everything one transaction owes: at most
//! one affiliate commission draft and one partner split draft per configured
//! partner, each with its implied pending-balance increment. Planning is a
//! pure function of `(transaction, affiliate, settings, now)` — running it
//! twice yields byte-identical drafts, which is what makes the store-side
//! apply idempotent under at-least-once dispatch.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use rvl_config::{CommissionSettings, PartnershipSettings};
use rvl_schemas::{BaseType, Currency, EntryKind, Transaction, TxEvent};

use crate::rounding::pct_of_cents;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Monetary invariant violations that make a transaction unplannable.
///
/// These indicate a normalization bug upstream, not a business condition;
/// the dispatcher treats them as non-retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// `gross_cents` must be non-negative.
    NegativeGross { gross_cents: i64 },
    /// `fee_cents`, when present, must be non-negative.
    NegativeFee { fee_cents: i64 },
    /// `net_after_fees_cents`, when present, must be non-negative.
    NegativeNet { net_after_fees_cents: i64 },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::NegativeGross { gross_cents } => {
                write!(f, "plan invariant: gross_cents must be >= 0, got {gross_cents}")
            }
            PlanError::NegativeFee { fee_cents } => {
                write!(f, "plan invariant: fee_cents must be >= 0, got {fee_cents}")
            }
            PlanError::NegativeNet { net_after_fees_cents } => {
                write!(
                    f,
                    "plan invariant: net_after_fees_cents must be >= 0, got {net_after_fees_cents}"
                )
            }
        }
    }
}

impl std::error::Error for PlanError {}

// ---------------------------------------------------------------------------
// Drafts
// ---------------------------------------------------------------------------

/// The affiliate commission a plan wants persisted.
///
/// Composite identity `(tx_id, affiliate_id, kind)` — the store inserts the
/// entry only if that identity is new, and increments the affiliate's
/// pending balance by `amount_cents` only when the insert happened.
#[derive(Debug, Clone, PartialEq)]
pub struct CommissionDraft {
    pub tenant_id: String,
    pub affiliate_id: String,
    pub user_uid: String,
    pub product_id: String,
    pub tx_id: Uuid,
    pub kind: EntryKind,
    pub recurrence_no: i32,
    pub base_type: BaseType,
    pub base_cents: i64,
    pub rate: f64,
    pub amount_cents: i64,
    pub currency: Currency,
    pub hold_until: DateTime<Utc>,
    pub invoice_id: Option<String>,
    pub charge_id: Option<String>,
    pub balance_transaction_id: Option<String>,
}

/// One partner's share of a transaction, with the full monetary
/// decomposition carried for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerSplitDraft {
    pub tenant_id: String,
    pub partner_id: String,
    pub user_uid: String,
    pub product_id: String,
    pub tx_id: Uuid,
    pub kind: EntryKind,
    pub recurrence_no: i32,
    pub gross_cents: i64,
    pub fee_cents: i64,
    pub net_after_fees_cents: i64,
    pub affiliate_cents: i64,
    pub base_sociedade_cents: i64,
    pub share_pct: f64,
    pub amount_cents: i64,
    pub currency: Currency,
    pub hold_until: DateTime<Utc>,
    pub invoice_id: Option<String>,
    pub charge_id: Option<String>,
    pub balance_transaction_id: Option<String>,
}

/// Everything one distribution run wants to write, as a pure value.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionPlan {
    pub tx_id: Uuid,
    pub currency: Currency,
    pub base_type: BaseType,
    pub base_cents: i64,
    pub net_after_fees_cents: i64,
    pub kind: EntryKind,
    pub recurrence_no: i32,
    pub rate: f64,
    pub affiliate_cents: i64,
    pub base_sociedade_cents: i64,
    pub commission: Option<CommissionDraft>,
    pub splits: Vec<PartnerSplitDraft>,
}

impl DistributionPlan {
    /// Total cents this plan distributes across all beneficiaries.
    pub fn total_distributed_cents(&self) -> i64 {
        self.affiliate_cents + self.splits.iter().map(|s| s.amount_cents).sum::<i64>()
    }

    /// `true` when the plan writes nothing (no affiliate, no partners).
    pub fn is_empty(&self) -> bool {
        self.commission.is_none() && self.splits.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Compute the distribution plan for one transaction.
///
/// - `affiliate_id` comes from the referral lookup; `None` means no
///   commission is owed.
/// - Recurrence is classified from the declared event kind only: `renewal`
///   ⇒ recurring at `recurring_pct` with recurrence 2, anything else ⇒
///   first at `first_pct` with recurrence 1.
/// - The percentage base is net-of-fees iff the settings say `net` **and**
///   the platform settles net; otherwise gross.
/// - Partner splits are clamped to the still-unallocated remainder of the
///   partnership base so `affiliate + Σ splits <= net_after_fees` holds
///   exactly, even when rounding of full-allocation shares would overshoot
///   by a cent.
///
/// # Errors
/// [`PlanError`] if the transaction's monetary fields violate sign
/// invariants. The plan is never partially built.
pub fn plan_distribution(
    tx_id: Uuid,
    tx: &Transaction,
    affiliate_id: Option<&str>,
    commission: &CommissionSettings,
    partnership: &PartnershipSettings,
    now: DateTime<Utc>,
) -> Result<DistributionPlan, PlanError> {
    validate_monetary(tx)?;

    let net_after_fees = tx.monetary.net_cents();
    let fee_cents = tx.monetary.fee_cents.unwrap_or(0);

    let base_type = if commission.defaults.base == BaseType::Net && tx.platform.uses_net_accounting()
    {
        BaseType::Net
    } else {
        BaseType::Gross
    };
    let base_cents = match base_type {
        BaseType::Net => net_after_fees,
        BaseType::Gross => tx.monetary.gross_cents,
    };

    let (kind, recurrence_no, rate) = match tx.event {
        TxEvent::Renewal => (EntryKind::Recurring, 2, commission.defaults.recurring_pct),
        _ => (EntryKind::First, 1, commission.defaults.first_pct),
    };

    // Commission is owed only when a referral resolved and the rate is
    // positive. Clamped to both the base and the net amount so no single
    // entry can exceed what the transaction actually brought in.
    let affiliate_cents = match affiliate_id {
        Some(_) if rate > 0.0 => pct_of_cents(base_cents, rate)
            .clamp(0, base_cents.min(net_after_fees).max(0)),
        _ => 0,
    };

    let stripe = tx.store_ids.stripe.clone().unwrap_or_default();

    let commission_draft = match affiliate_id {
        Some(aff) if affiliate_cents > 0 => Some(CommissionDraft {
            tenant_id: tx.tenant_id.clone(),
            affiliate_id: aff.to_string(),
            user_uid: tx.user_uid.clone(),
            product_id: tx.product_id.clone(),
            tx_id,
            kind,
            recurrence_no,
            base_type,
            base_cents,
            rate,
            amount_cents: affiliate_cents,
            currency: tx.monetary.currency,
            hold_until: now + Duration::days(commission.defaults.hold_days),
            invoice_id: stripe.invoice_id.clone(),
            charge_id: stripe.charge_id.clone(),
            balance_transaction_id: stripe.balance_transaction_id.clone(),
        }),
        _ => None,
    };

    let base_sociedade_cents = (net_after_fees - affiliate_cents).max(0);
    let split_hold_until = now + Duration::days(partnership.hold_days_partners);

    let mut splits = Vec::with_capacity(partnership.shares.len());
    let mut unallocated = base_sociedade_cents;
    for share in &partnership.shares {
        let amount_cents = pct_of_cents(base_sociedade_cents, share.pct).clamp(0, unallocated);
        unallocated -= amount_cents;
        splits.push(PartnerSplitDraft {
            tenant_id: tx.tenant_id.clone(),
            partner_id: share.partner_id.clone(),
            user_uid: tx.user_uid.clone(),
            product_id: tx.product_id.clone(),
            tx_id,
            kind,
            recurrence_no,
            gross_cents: tx.monetary.gross_cents,
            fee_cents,
            net_after_fees_cents: net_after_fees,
            affiliate_cents,
            base_sociedade_cents,
            share_pct: share.pct,
            amount_cents,
            currency: tx.monetary.currency,
            hold_until: split_hold_until,
            invoice_id: stripe.invoice_id.clone(),
            charge_id: stripe.charge_id.clone(),
            balance_transaction_id: stripe.balance_transaction_id.clone(),
        });
    }

    Ok(DistributionPlan {
        tx_id,
        currency: tx.monetary.currency,
        base_type,
        base_cents,
        net_after_fees_cents: net_after_fees,
        kind,
        recurrence_no,
        rate,
        affiliate_cents,
        base_sociedade_cents,
        commission: commission_draft,
        splits,
    })
}

fn validate_monetary(tx: &Transaction) -> Result<(), PlanError> {
    let m = &tx.monetary;
    if m.gross_cents < 0 {
        return Err(PlanError::NegativeGross { gross_cents: m.gross_cents });
    }
    if let Some(fee) = m.fee_cents {
        if fee < 0 {
            return Err(PlanError::NegativeFee { fee_cents: fee });
        }
    }
    if let Some(net) = m.net_after_fees_cents {
        if net < 0 {
            return Err(PlanError::NegativeNet { net_after_fees_cents: net });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rvl_config::PartnerShare;
    use rvl_schemas::{Monetary, Platform, StoreIds, StripeStoreIds};

    fn stripe_tx(event: TxEvent, gross: i64, fee: i64, net: i64) -> Transaction {
        Transaction {
            tenant_id: "t1".into(),
            user_uid: "u1".into(),
            product_id: "p1".into(),
            platform: Platform::StripeWeb,
            event,
            store_ids: StoreIds {
                stripe: Some(StripeStoreIds {
                    invoice_id: Some("in_123".into()),
                    charge_id: Some("ch_123".into()),
                    balance_transaction_id: Some("txn_123".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            monetary: Monetary {
                currency: Currency::Brl,
                gross_cents: gross,
                fee_cents: Some(fee),
                net_after_fees_cents: Some(net),
            },
            occurred_at: Utc::now(),
            dedupe_key: "invoice:in_123".into(),
        }
    }

    fn two_equal_partners() -> PartnershipSettings {
        PartnershipSettings {
            shares: vec![
                PartnerShare { partner_id: "A".into(), pct: 0.5 },
                PartnerShare { partner_id: "B".into(), pct: 0.5 },
            ],
            hold_days_partners: 14,
        }
    }

    fn plan(
        tx: &Transaction,
        affiliate: Option<&str>,
        partnership: &PartnershipSettings,
    ) -> DistributionPlan {
        plan_distribution(
            Uuid::new_v4(),
            tx,
            affiliate,
            &CommissionSettings::default(),
            partnership,
            Utc::now(),
        )
        .unwrap()
    }

    // --- Reference scenarios ------------------------------------------------

    #[test]
    fn first_purchase_with_affiliate_and_two_partners() {
        let tx = stripe_tx(TxEvent::InitialPurchase, 10_000, 300, 9_700);
        let p = plan(&tx, Some("aff-1"), &two_equal_partners());

        assert_eq!(p.base_type, BaseType::Net);
        assert_eq!(p.base_cents, 9_700);
        assert_eq!(p.affiliate_cents, 2_910);
        assert_eq!(p.base_sociedade_cents, 6_790);
        assert_eq!(p.splits.len(), 2);
        assert_eq!(p.splits[0].partner_id, "A");
        assert_eq!(p.splits[0].amount_cents, 3_395);
        assert_eq!(p.splits[1].partner_id, "B");
        assert_eq!(p.splits[1].amount_cents, 3_395);

        let c = p.commission.as_ref().unwrap();
        assert_eq!(c.kind, EntryKind::First);
        assert_eq!(c.recurrence_no, 1);
        assert_eq!(c.rate, 0.30);
        assert_eq!(c.invoice_id.as_deref(), Some("in_123"));
    }

    #[test]
    fn no_affiliate_means_full_base_to_partners() {
        let tx = stripe_tx(TxEvent::InitialPurchase, 10_000, 300, 9_700);
        let p = plan(&tx, None, &two_equal_partners());

        assert_eq!(p.affiliate_cents, 0);
        assert!(p.commission.is_none());
        assert_eq!(p.base_sociedade_cents, 9_700);
        assert_eq!(p.splits[0].amount_cents, 4_850);
        assert_eq!(p.splits[1].amount_cents, 4_850);
    }

    #[test]
    fn renewal_uses_recurring_rate() {
        let tx = stripe_tx(TxEvent::Renewal, 10_000, 300, 9_700);
        let p = plan(&tx, Some("aff-1"), &two_equal_partners());

        assert_eq!(p.kind, EntryKind::Recurring);
        assert_eq!(p.recurrence_no, 2);
        assert_eq!(p.rate, 0.15);
        assert_eq!(p.affiliate_cents, 1_455);
        let c = p.commission.as_ref().unwrap();
        assert_eq!(c.kind, EntryKind::Recurring);
        assert_eq!(c.recurrence_no, 2);
    }

    // --- Base resolution ----------------------------------------------------

    #[test]
    fn mobile_platform_uses_gross_base() {
        let mut tx = stripe_tx(TxEvent::InitialPurchase, 990, 0, 990);
        tx.platform = Platform::Ios;
        tx.monetary.fee_cents = None;
        tx.monetary.net_after_fees_cents = None;

        let p = plan(&tx, Some("aff-1"), &PartnershipSettings::default());
        assert_eq!(p.base_type, BaseType::Gross);
        assert_eq!(p.base_cents, 990);
        assert_eq!(p.affiliate_cents, 297);
    }

    #[test]
    fn gross_setting_overrides_net_platform() {
        let tx = stripe_tx(TxEvent::InitialPurchase, 10_000, 300, 9_700);
        let mut settings = CommissionSettings::default();
        settings.defaults.base = BaseType::Gross;

        let p = plan_distribution(
            Uuid::new_v4(),
            &tx,
            Some("aff-1"),
            &settings,
            &PartnershipSettings::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(p.base_type, BaseType::Gross);
        assert_eq!(p.base_cents, 10_000);
        // 30% of gross, partnership base still derived from net.
        assert_eq!(p.affiliate_cents, 3_000);
        assert_eq!(p.base_sociedade_cents, 6_700);
    }

    #[test]
    fn net_absent_falls_back_to_gross() {
        let mut tx = stripe_tx(TxEvent::InitialPurchase, 5_000, 0, 0);
        tx.monetary.fee_cents = None;
        tx.monetary.net_after_fees_cents = None;

        let p = plan(&tx, Some("aff-1"), &two_equal_partners());
        assert_eq!(p.base_cents, 5_000);
        assert_eq!(p.net_after_fees_cents, 5_000);
    }

    // --- Invariants ---------------------------------------------------------

    #[test]
    fn total_never_exceeds_net_after_fees() {
        // An odd base with full 50/50 allocation: 99 → 50 + 49, not 50 + 50.
        let mut tx = stripe_tx(TxEvent::InitialPurchase, 99, 0, 99);
        tx.monetary.fee_cents = None;
        let p = plan(&tx, None, &two_equal_partners());
        assert_eq!(p.splits[0].amount_cents, 50);
        assert_eq!(p.splits[1].amount_cents, 49);
        assert!(p.total_distributed_cents() <= p.net_after_fees_cents);
    }

    #[test]
    fn commission_clamped_to_net_when_base_is_gross() {
        // Heavy fees: 30% of gross would exceed the net amount.
        let tx = stripe_tx(TxEvent::InitialPurchase, 10_000, 9_500, 500);
        let mut settings = CommissionSettings::default();
        settings.defaults.base = BaseType::Gross;

        let p = plan_distribution(
            Uuid::new_v4(),
            &tx,
            Some("aff-1"),
            &settings,
            &two_equal_partners(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(p.affiliate_cents, 500);
        assert_eq!(p.base_sociedade_cents, 0);
        assert!(p.total_distributed_cents() <= p.net_after_fees_cents);
    }

    #[test]
    fn zero_rate_produces_no_commission_draft() {
        let tx = stripe_tx(TxEvent::InitialPurchase, 10_000, 300, 9_700);
        let mut settings = CommissionSettings::default();
        settings.defaults.first_pct = 0.0;

        let p = plan_distribution(
            Uuid::new_v4(),
            &tx,
            Some("aff-1"),
            &settings,
            &PartnershipSettings::default(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(p.affiliate_cents, 0);
        assert!(p.commission.is_none());
        assert_eq!(p.base_sociedade_cents, 9_700);
    }

    #[test]
    fn empty_partnership_means_no_splits() {
        let tx = stripe_tx(TxEvent::InitialPurchase, 10_000, 300, 9_700);
        let p = plan(&tx, None, &PartnershipSettings::default());
        assert!(p.splits.is_empty());
        assert!(p.is_empty());
    }

    #[test]
    fn hold_until_offsets_by_configured_days() {
        let now = Utc::now();
        let tx = stripe_tx(TxEvent::InitialPurchase, 10_000, 300, 9_700);
        let mut partnership = two_equal_partners();
        partnership.hold_days_partners = 30;

        let p = plan_distribution(
            Uuid::new_v4(),
            &tx,
            Some("aff-1"),
            &CommissionSettings::default(),
            &partnership,
            now,
        )
        .unwrap();
        let c = p.commission.as_ref().unwrap();
        assert_eq!(c.hold_until, now + Duration::days(14));
        assert!(c.hold_until > now);
        assert_eq!(p.splits[0].hold_until, now + Duration::days(30));
    }

    #[test]
    fn planning_is_deterministic() {
        let now = Utc::now();
        let tx_id = Uuid::new_v4();
        let tx = stripe_tx(TxEvent::Renewal, 10_000, 300, 9_700);
        let partnership = two_equal_partners();

        let a = plan_distribution(
            tx_id, &tx, Some("aff-1"), &CommissionSettings::default(), &partnership, now,
        )
        .unwrap();
        let b = plan_distribution(
            tx_id, &tx, Some("aff-1"), &CommissionSettings::default(), &partnership, now,
        )
        .unwrap();
        assert_eq!(a, b);
    }

    // --- Monetary invariant rejection --------------------------------------

    #[test]
    fn rejects_negative_gross() {
        let tx = stripe_tx(TxEvent::Refund, -10_000, 0, 0);
        let err = plan_distribution(
            Uuid::new_v4(),
            &tx,
            None,
            &CommissionSettings::default(),
            &PartnershipSettings::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, PlanError::NegativeGross { gross_cents: -10_000 });
    }

    #[test]
    fn rejects_negative_fee() {
        let tx = stripe_tx(TxEvent::InitialPurchase, 10_000, -1, 9_700);
        let err = plan_distribution(
            Uuid::new_v4(),
            &tx,
            None,
            &CommissionSettings::default(),
            &PartnershipSettings::default(),
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err, PlanError::NegativeFee { fee_cents: -1 });
    }

    #[test]
    fn refund_and_cancel_classify_as_first() {
        // Classification is by declared event kind only; non-renewal kinds
        // (including refund/cancel, whose reversal is out of scope) plan at
        // the first-purchase rate.
        for event in [TxEvent::Refund, TxEvent::Cancel, TxEvent::Reactivation] {
            let tx = stripe_tx(event, 10_000, 300, 9_700);
            let p = plan(&tx, Some("aff-1"), &PartnershipSettings::default());
            assert_eq!(p.kind, EntryKind::First);
            assert_eq!(p.recurrence_no, 1);
            assert_eq!(p.rate, 0.30);
        }
    }
}
