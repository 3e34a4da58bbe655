//! rvl-schemas
//!
//! Canonical domain types shared by every crate in the workspace:
//! - the `Transaction` produced by normalization and persisted exactly once
//! - derived ledger records (`CommissionEntry`, `PartnerSplitEntry`)
//! - running balances per beneficiary
//!
//! All monetary amounts are integer cents (`i64`). No floats are ever stored;
//! percentage rates appear only as inputs to the planning step in rvl-engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Closed enums
// ---------------------------------------------------------------------------

/// Settlement currency of a transaction and every record derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Brl,
    Usd,
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Brl => "brl",
            Currency::Usd => "usd",
            Currency::Eur => "eur",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "brl" => Some(Currency::Brl),
            "usd" => Some(Currency::Usd),
            "eur" => Some(Currency::Eur),
            _ => None,
        }
    }
}

/// Payment surface the event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    StripeWeb,
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::StripeWeb => "stripe_web",
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stripe_web" => Some(Platform::StripeWeb),
            "ios" => Some(Platform::Ios),
            "android" => Some(Platform::Android),
            _ => None,
        }
    }

    /// Only the web checkout surface reports processor fees, so only it can
    /// be settled net-of-fees. Mobile stores report gross amounts.
    pub fn uses_net_accounting(&self) -> bool {
        matches!(self, Platform::StripeWeb)
    }
}

/// Kind of real-world billing event a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxEvent {
    InitialPurchase,
    Renewal,
    Refund,
    Cancel,
    Reactivation,
}

impl TxEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxEvent::InitialPurchase => "initial_purchase",
            TxEvent::Renewal => "renewal",
            TxEvent::Refund => "refund",
            TxEvent::Cancel => "cancel",
            TxEvent::Reactivation => "reactivation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial_purchase" => Some(TxEvent::InitialPurchase),
            "renewal" => Some(TxEvent::Renewal),
            "refund" => Some(TxEvent::Refund),
            "cancel" => Some(TxEvent::Cancel),
            "reactivation" => Some(TxEvent::Reactivation),
            _ => None,
        }
    }
}

/// Recurrence classification of a derived ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    First,
    Recurring,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::First => "first",
            EntryKind::Recurring => "recurring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first" => Some(EntryKind::First),
            "recurring" => Some(EntryKind::Recurring),
            _ => None,
        }
    }
}

/// Which monetary figure the percentage was applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseType {
    Net,
    Gross,
}

impl BaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseType::Net => "net",
            BaseType::Gross => "gross",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "net" => Some(BaseType::Net),
            "gross" => Some(BaseType::Gross),
            _ => None,
        }
    }
}

/// Lifecycle of a ledger entry's funds. `Pending` until the hold elapses;
/// the pending→available transition and payout are external processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Available,
    Paid,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Available => "available",
            EntryStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "available" => Some(EntryStatus::Available),
            "paid" => Some(EntryStatus::Paid),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Monetary fields of a canonical transaction, all in integer cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monetary {
    pub currency: Currency,
    pub gross_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_after_fees_cents: Option<i64>,
}

impl Monetary {
    /// Net-of-fees amount, falling back to gross when the processor has not
    /// reported fees (mobile stores, checkout sessions before the invoice).
    pub fn net_cents(&self) -> i64 {
        self.net_after_fees_cents.unwrap_or(self.gross_cents)
    }
}

/// Apple store identifiers for a mobile purchase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IosStoreIds {
    pub original_transaction_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

/// Google Play identifiers for a mobile purchase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AndroidStoreIds {
    pub purchase_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

/// Stripe object identifiers, carried onto derived entries for audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeStoreIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_transaction_id: Option<String>,
}

/// Provider-native identifiers attached to a transaction. At most one of the
/// three arms is populated, matching the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ios: Option<IosStoreIds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub android: Option<AndroidStoreIds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe: Option<StripeStoreIds>,
}

/// One canonical monetary transaction, produced by normalization from a
/// provider payload.
///
/// The id is assigned by the Idempotency Gate when the dedupe key is first
/// claimed — producers never supply one. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tenant_id: String,
    pub user_uid: String,
    pub product_id: String,
    pub platform: Platform,
    pub event: TxEvent,
    #[serde(default)]
    pub store_ids: StoreIds,
    pub monetary: Monetary,
    pub occurred_at: DateTime<Utc>,
    /// Caller-supplied key uniquely identifying the real-world billing event
    /// (e.g. `invoice:in_123`). Collapses at-least-once deliveries into one
    /// transaction.
    pub dedupe_key: String,
}

// ---------------------------------------------------------------------------
// Derived ledger records
// ---------------------------------------------------------------------------

/// Affiliate commission derived from exactly one transaction.
///
/// Deterministic identity: `(tx_id, affiliate_id, kind)` — re-running
/// distribution for the same transaction can never create a second row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionEntry {
    pub entry_id: Uuid,
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
    pub status: EntryStatus,
    pub hold_until: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Partner revenue share derived from exactly one transaction.
///
/// Carries the full monetary decomposition (gross → fees → net → affiliate →
/// partnership base) so every amount can be audited without joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerSplitEntry {
    pub entry_id: Uuid,
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
    pub status: EntryStatus,
    pub hold_until: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// Running balance for one affiliate. `pending_cents` grows monotonically as
/// commission entries are created; the pending→available transition after
/// the hold elapses and the available→paid transition on payout are owned by
/// external processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateBalance {
    pub affiliate_id: String,
    pub currency: Currency,
    pub pending_cents: i64,
    pub available_cents: i64,
    pub paid_cents: i64,
    pub updated_at: DateTime<Utc>,
}

/// Running balance for one revenue-sharing partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerBalance {
    pub partner_id: String,
    pub currency: Currency,
    pub pending_cents: i64,
    pub available_cents: i64,
    pub paid_cents: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for e in [
            TxEvent::InitialPurchase,
            TxEvent::Renewal,
            TxEvent::Refund,
            TxEvent::Cancel,
            TxEvent::Reactivation,
        ] {
            assert_eq!(TxEvent::parse(e.as_str()), Some(e));
        }
        assert_eq!(TxEvent::parse("chargeback"), None);
        assert_eq!(Platform::parse("stripe_web"), Some(Platform::StripeWeb));
        assert_eq!(EntryKind::parse("recurring"), Some(EntryKind::Recurring));
        assert_eq!(EntryStatus::parse("pending"), Some(EntryStatus::Pending));
        assert_eq!(BaseType::parse("net"), Some(BaseType::Net));
        assert_eq!(Currency::parse("brl"), Some(Currency::Brl));
    }

    #[test]
    fn net_cents_falls_back_to_gross() {
        let m = Monetary {
            currency: Currency::Brl,
            gross_cents: 990,
            fee_cents: None,
            net_after_fees_cents: None,
        };
        assert_eq!(m.net_cents(), 990);

        let m = Monetary {
            currency: Currency::Brl,
            gross_cents: 10_000,
            fee_cents: Some(300),
            net_after_fees_cents: Some(9_700),
        };
        assert_eq!(m.net_cents(), 9_700);
    }

    #[test]
    fn only_stripe_web_settles_net() {
        assert!(Platform::StripeWeb.uses_net_accounting());
        assert!(!Platform::Ios.uses_net_accounting());
        assert!(!Platform::Android.uses_net_accounting());
    }

    #[test]
    fn transaction_serde_shape() {
        let tx = Transaction {
            tenant_id: "t1".into(),
            user_uid: "u1".into(),
            product_id: "p1".into(),
            platform: Platform::StripeWeb,
            event: TxEvent::InitialPurchase,
            store_ids: StoreIds {
                stripe: Some(StripeStoreIds {
                    invoice_id: Some("in_123".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            monetary: Monetary {
                currency: Currency::Brl,
                gross_cents: 10_000,
                fee_cents: Some(300),
                net_after_fees_cents: Some(9_700),
            },
            occurred_at: Utc::now(),
            dedupe_key: "invoice:in_123".into(),
        };
        let v = serde_json::to_value(&tx).unwrap();
        assert_eq!(v["platform"], "stripe_web");
        assert_eq!(v["event"], "initial_purchase");
        assert_eq!(v["monetary"]["currency"], "brl");
        let back: Transaction = serde_json::from_value(v).unwrap();
        assert_eq!(back, tx);
    }
}
