//! At-least-once delivery from the provider must never pay anyone twice:
//! re-ingesting the same billing event converges on one transaction id, one
//! ledger entry per beneficiary, and one round of balance increments.

use rvl_config::{CommissionSettings, PartnerShare, PartnershipSettings};
use rvl_testkit::{sample_stripe_tx, MemLedger};

fn two_equal_partners() -> PartnershipSettings {
    PartnershipSettings {
        shares: vec![
            PartnerShare { partner_id: "A".into(), pct: 0.5 },
            PartnerShare { partner_id: "B".into(), pct: 0.5 },
        ],
        hold_days_partners: 14,
    }
}

#[test]
fn triple_delivery_single_payout() {
    let ledger = MemLedger::new();
    ledger.set_commission_settings(CommissionSettings::default());
    ledger.set_partnership_settings(two_equal_partners());
    ledger.set_referral("t1", "u1", "aff-1");

    let tx = sample_stripe_tx("invoice:in_123");

    // Three deliveries of the same event, distribution after each.
    let first = ledger.ingest(&tx).unwrap();
    assert!(first.created);
    ledger.distribute(first.tx_id).unwrap();

    for _ in 0..2 {
        let again = ledger.ingest(&tx).unwrap();
        assert_eq!(again.tx_id, first.tx_id);
        assert!(!again.created);
        ledger.distribute(again.tx_id).unwrap();
    }

    // 30% of 9700 net; the remainder split 50/50.
    assert_eq!(ledger.affiliate_pending_cents("aff-1"), 2_910);
    assert_eq!(ledger.partner_pending_cents("A"), 3_395);
    assert_eq!(ledger.partner_pending_cents("B"), 3_395);

    assert_eq!(ledger.commission_entries_for_tx(first.tx_id).len(), 1);
    assert_eq!(ledger.split_entries_for_tx(first.tx_id).len(), 2);
}

#[test]
fn balances_always_equal_entry_sums() {
    let ledger = MemLedger::new();
    ledger.set_commission_settings(CommissionSettings::default());
    ledger.set_partnership_settings(two_equal_partners());
    ledger.set_referral("t1", "u1", "aff-1");

    // Several distinct billing events for the same user.
    for key in ["invoice:in_1", "invoice:in_2", "invoice:in_3"] {
        let tx = sample_stripe_tx(key);
        let ingested = ledger.ingest(&tx).unwrap();
        // Distribute twice per event; the second run must change nothing.
        ledger.distribute(ingested.tx_id).unwrap();
        let second = ledger.distribute(ingested.tx_id).unwrap();
        assert!(!second.commission_created);
        assert_eq!(second.splits_created, 0);
    }

    assert_eq!(
        ledger.affiliate_pending_cents("aff-1"),
        ledger.sum_commission_cents("aff-1")
    );
    for partner in ["A", "B"] {
        assert_eq!(
            ledger.partner_pending_cents(partner),
            ledger.sum_split_cents(partner)
        );
    }
    assert_eq!(ledger.affiliate_pending_cents("aff-1"), 3 * 2_910);
}

#[test]
fn distinct_events_get_distinct_ids() {
    let ledger = MemLedger::new();
    let a = ledger.ingest(&sample_stripe_tx("invoice:in_a")).unwrap();
    let b = ledger.ingest(&sample_stripe_tx("invoice:in_b")).unwrap();
    assert_ne!(a.tx_id, b.tx_id);
    assert!(a.created && b.created);
}
