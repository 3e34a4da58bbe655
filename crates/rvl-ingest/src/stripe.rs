//! Web-checkout normalization (Stripe payloads).
//!
//! Two variants reach the core from this surface:
//! - `invoice.payment_succeeded` with the charge's balance transaction
//!   expanded — the authoritative record, carrying real fees and net;
//! - `checkout.session.completed` — fired before the invoice exists, so the
//!   fee is unknown and net is provisionally the gross amount.
//!
//! Tenant and user identity travel in object metadata; a payload without
//! them is still accepted with placeholder identifiers so the money is never
//! dropped, matching how upstream attribution gaps are reconciled later.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use rvl_schemas::{Monetary, Platform, StoreIds, StripeStoreIds, Transaction, TxEvent};

use crate::{parse_currency, require_non_blank, NormalizeError};

pub const TENANT_UNKNOWN: &str = "TENANT_UNKNOWN";
pub const USER_UNKNOWN: &str = "USER_UNKNOWN";
pub const PRODUCT_UNKNOWN: &str = "PRODUCT_UNKNOWN";

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StripeMetadata {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user_uid: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub checkout_session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeDetail {
    #[serde(default)]
    pub amount: i64,
}

/// The charge's balance transaction, expanded on retrieval. Carries the
/// processor's own gross/fee figures in cents.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceTransaction {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub fee: i64,
    #[serde(default)]
    pub fee_details: Vec<FeeDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCharge {
    pub id: String,
    #[serde(default)]
    pub balance_transaction: Option<BalanceTransaction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLinePrice {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub price: Option<InvoiceLinePrice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceStatusTransitions {
    /// Epoch seconds at which the invoice was paid.
    #[serde(default)]
    pub paid_at: Option<i64>,
}

/// `invoice.payment_succeeded` payload, with `charge.balance_transaction`
/// and `lines.data.price` expanded.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub metadata: StripeMetadata,
    #[serde(default)]
    pub lines: InvoiceLines,
    #[serde(default)]
    pub charge: Option<StripeCharge>,
    #[serde(default)]
    pub status_transitions: InvoiceStatusTransitions,
}

/// `checkout.session.completed` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub amount_total: i64,
    #[serde(default)]
    pub metadata: StripeMetadata,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Build the canonical transaction for a paid invoice.
///
/// Gross/fee/net come from the balance transaction when expanded; otherwise
/// gross falls back to `amount_paid` with a zero fee. A renewal is an
/// invoice whose billing reason is `subscription_cycle`.
pub fn normalize_invoice(
    inv: &StripeInvoice,
    now: DateTime<Utc>,
) -> Result<Transaction, NormalizeError> {
    require_non_blank(&inv.id, "invoice.id")?;
    let currency = parse_currency(inv.currency.as_deref())?;

    let bt = inv.charge.as_ref().and_then(|c| c.balance_transaction.as_ref());
    let gross = bt.map(|b| b.amount).unwrap_or(inv.amount_paid);
    let fee = bt
        .map(|b| b.fee + b.fee_details.iter().map(|d| d.amount).sum::<i64>())
        .unwrap_or(0);

    if gross <= 0 {
        return Err(NormalizeError::NonPositiveAmount { field: "invoice.amount", cents: gross });
    }
    if fee < 0 {
        return Err(NormalizeError::NegativeAmount { field: "invoice.fee", cents: fee });
    }
    if fee > gross {
        return Err(NormalizeError::FeeExceedsGross { gross_cents: gross, fee_cents: fee });
    }

    let event = match inv.billing_reason.as_deref() {
        Some("subscription_cycle") => TxEvent::Renewal,
        _ => TxEvent::InitialPurchase,
    };

    let occurred_at = inv
        .status_transitions
        .paid_at
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or(now);

    let product_id = inv
        .lines
        .data
        .first()
        .and_then(|l| l.price.as_ref())
        .and_then(|p| p.id.clone())
        .unwrap_or_else(|| PRODUCT_UNKNOWN.to_string());

    Ok(Transaction {
        tenant_id: meta_or(&inv.metadata.tenant_id, TENANT_UNKNOWN),
        user_uid: meta_or(&inv.metadata.user_uid, USER_UNKNOWN),
        product_id,
        platform: Platform::StripeWeb,
        event,
        store_ids: StoreIds {
            stripe: Some(StripeStoreIds {
                checkout_session_id: inv.metadata.checkout_session_id.clone(),
                invoice_id: Some(inv.id.clone()),
                charge_id: inv.charge.as_ref().map(|c| c.id.clone()),
                balance_transaction_id: bt.map(|b| b.id.clone()),
            }),
            ..Default::default()
        },
        monetary: Monetary {
            currency,
            gross_cents: gross,
            fee_cents: Some(fee),
            net_after_fees_cents: Some(gross - fee),
        },
        occurred_at,
        dedupe_key: format!("invoice:{}", inv.id),
    })
}

/// Build the canonical transaction for a completed checkout session.
///
/// Fees are unknown until the invoice lands, so net is provisionally equal
/// to gross. Always an initial purchase.
pub fn normalize_checkout_session(
    session: &StripeCheckoutSession,
    now: DateTime<Utc>,
) -> Result<Transaction, NormalizeError> {
    require_non_blank(&session.id, "checkout_session.id")?;
    let currency = parse_currency(session.currency.as_deref())?;

    let gross = session.amount_total;
    if gross <= 0 {
        return Err(NormalizeError::NonPositiveAmount {
            field: "checkout_session.amount_total",
            cents: gross,
        });
    }

    Ok(Transaction {
        tenant_id: meta_or(&session.metadata.tenant_id, TENANT_UNKNOWN),
        user_uid: meta_or(&session.metadata.user_uid, USER_UNKNOWN),
        product_id: meta_or(&session.metadata.product_id, PRODUCT_UNKNOWN),
        platform: Platform::StripeWeb,
        event: TxEvent::InitialPurchase,
        store_ids: StoreIds {
            stripe: Some(StripeStoreIds {
                checkout_session_id: Some(session.id.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        monetary: Monetary {
            currency,
            gross_cents: gross,
            fee_cents: None,
            net_after_fees_cents: Some(gross),
        },
        occurred_at: now,
        dedupe_key: format!("checkout:{}", session.id),
    })
}

fn meta_or(value: &Option<String>, fallback: &str) -> String {
    match value {
        Some(s) if !s.trim().is_empty() => s.clone(),
        _ => fallback.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
