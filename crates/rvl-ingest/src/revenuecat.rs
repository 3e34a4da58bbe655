//! Mobile subscription normalization (RevenueCat webhook events).
//!
//! RevenueCat aggregates both mobile stores, so the payload declares its own
//! platform. Amounts arrive as a decimal price in the purchased currency;
//! they are converted to cents here with the same half-away-from-zero rule
//! the distribution math uses. Mobile stores do not report processor fees,
//! so net always equals gross.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use rvl_schemas::{Monetary, Platform, StoreIds, Transaction, TxEvent};

use crate::{parse_currency, require_non_blank, NormalizeError};

use crate::stripe::{PRODUCT_UNKNOWN, TENANT_UNKNOWN, USER_UNKNOWN};

/// One RevenueCat webhook event body.
#[derive(Debug, Clone, Deserialize)]
pub struct RevenueCatEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub app_user_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Decimal price in the purchased currency (e.g. `9.90`).
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub event_timestamp_ms: Option<i64>,
}

/// Map the RevenueCat event type string onto the canonical event kind.
/// Substring matching mirrors how RC composes its type names
/// (e.g. `UNCANCELLATION` must win over `CANCELLATION`).
fn map_event_type(t: &str) -> TxEvent {
    if t.contains("RENEWAL") {
        TxEvent::Renewal
    } else if t.contains("UNCANCELLATION") {
        TxEvent::Reactivation
    } else if t.contains("CANCELLATION") {
        TxEvent::Cancel
    } else if t.contains("REFUND") {
        TxEvent::Refund
    } else {
        TxEvent::InitialPurchase
    }
}

/// Build the canonical transaction for a RevenueCat event.
///
/// Cancellations legitimately carry no price; they normalize to a zero-cent
/// transaction so the cancellation still lands in the canonical record.
pub fn normalize_revenuecat(
    ev: &RevenueCatEvent,
    now: DateTime<Utc>,
) -> Result<Transaction, NormalizeError> {
    require_non_blank(&ev.event_id, "event.event_id")?;
    require_non_blank(&ev.event_type, "event.type")?;
    let currency = parse_currency(ev.currency.as_deref())?;

    let platform = match ev.platform.as_deref() {
        Some("ios") => Platform::Ios,
        Some("android") | None => Platform::Android,
        Some(other) => {
            return Err(NormalizeError::UnknownPlatform { raw: other.to_string() });
        }
    };

    let gross = match ev.price {
        Some(price) => (price * 100.0).round() as i64,
        None => 0,
    };
    if gross < 0 {
        return Err(NormalizeError::NegativeAmount { field: "event.price", cents: gross });
    }

    let occurred_at = ev
        .event_timestamp_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(now);

    Ok(Transaction {
        tenant_id: ev
            .tenant_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| TENANT_UNKNOWN.to_string()),
        user_uid: ev
            .app_user_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| USER_UNKNOWN.to_string()),
        product_id: ev
            .product_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| PRODUCT_UNKNOWN.to_string()),
        platform,
        event: map_event_type(&ev.event_type),
        store_ids: StoreIds::default(),
        monetary: Monetary {
            currency,
            gross_cents: gross,
            fee_cents: None,
            net_after_fees_cents: Some(gross),
        },
        occurred_at,
        dedupe_key: format!("rc:event:{}", ev.event_id),
    })
}
