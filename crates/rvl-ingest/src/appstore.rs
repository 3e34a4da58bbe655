//! Mobile subscription normalization (App Store server notifications).
//!
//! The webhook layer verifies the JWS chain and decodes both the outer
//! notification and the signed transaction info before handing them here as
//! plain structs. The original-transaction id plus the purchase timestamp
//! form the dedupe key: Apple redelivers notifications, and one real-world
//! renewal may surface through several notification types.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use rvl_schemas::{IosStoreIds, Monetary, Platform, StoreIds, Transaction, TxEvent};

use crate::{parse_currency, require_non_blank, NormalizeError};

use crate::stripe::{TENANT_UNKNOWN, USER_UNKNOWN};

/// Decoded signed transaction info from the notification payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppleTransactionInfo {
    pub original_transaction_id: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    pub product_id: String,
    /// Purchase timestamp in epoch milliseconds.
    #[serde(default)]
    pub purchase_date: Option<i64>,
    /// Price in milliunits of the currency (Apple reports 9990 for 9.99).
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    /// App account token, used upstream to carry the tenant user uid.
    #[serde(default)]
    pub app_account_token: Option<String>,
}

/// Decoded App Store server notification (v2), post-verification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppleNotification {
    pub notification_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    pub transaction: AppleTransactionInfo,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Map the notification type onto the canonical event kind.
fn map_notification_type(t: &str) -> TxEvent {
    if t.contains("DID_RENEW") {
        TxEvent::Renewal
    } else if t.contains("DID_CHANGE_RENEWAL_STATUS") || t.contains("DID_FAIL_TO_RENEW") {
        TxEvent::Cancel
    } else if t.contains("REFUND") {
        TxEvent::Refund
    } else {
        TxEvent::InitialPurchase
    }
}

/// Build the canonical transaction for a decoded App Store notification.
pub fn normalize_apple(
    n: &AppleNotification,
    now: DateTime<Utc>,
) -> Result<Transaction, NormalizeError> {
    require_non_blank(&n.notification_type, "notification.notification_type")?;
    require_non_blank(
        &n.transaction.original_transaction_id,
        "transaction.original_transaction_id",
    )?;
    require_non_blank(&n.transaction.product_id, "transaction.product_id")?;
    let currency = parse_currency(n.transaction.currency.as_deref())?;

    // Milliunits → cents, truncating the sub-cent digit Apple never uses.
    let gross = match n.transaction.price {
        Some(milli) => milli / 10,
        None => 0,
    };
    if gross < 0 {
        return Err(NormalizeError::NegativeAmount { field: "transaction.price", cents: gross });
    }

    let occurred_ms = n.transaction.purchase_date.unwrap_or(now.timestamp_millis());
    let occurred_at = Utc
        .timestamp_millis_opt(occurred_ms)
        .single()
        .unwrap_or(now);

    Ok(Transaction {
        tenant_id: n
            .tenant_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| TENANT_UNKNOWN.to_string()),
        user_uid: n
            .transaction
            .app_account_token
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| USER_UNKNOWN.to_string()),
        product_id: n.transaction.product_id.clone(),
        platform: Platform::Ios,
        event: map_notification_type(&n.notification_type),
        store_ids: StoreIds {
            ios: Some(IosStoreIds {
                original_transaction_id: n.transaction.original_transaction_id.clone(),
                transaction_id: n.transaction.transaction_id.clone(),
            }),
            ..Default::default()
        },
        monetary: Monetary {
            currency,
            gross_cents: gross,
            fee_cents: None,
            net_after_fees_cents: Some(gross),
        },
        occurred_at,
        dedupe_key: format!(
            "ios:orig:{}:{}",
            n.transaction.original_transaction_id, occurred_ms
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(notification_type: &str) -> AppleNotification {
        serde_json::from_value(json!({
            "notificationType": notification_type,
            "transaction": {
                "originalTransactionId": "100000001",
                "transactionId": "100000002",
                "productId": "premium_monthly",
                "purchaseDate": 1700000000000_i64,
                "price": 9900,
                "currency": "brl",
                "appAccountToken": "u1"
            }
        }))
        .unwrap()
    }

    #[test]
    fn renewal_notification_normalizes() {
        let tx = normalize_apple(&notification("DID_RENEW"), Utc::now()).unwrap();
        assert_eq!(tx.event, TxEvent::Renewal);
        assert_eq!(tx.platform, Platform::Ios);
        assert_eq!(tx.monetary.gross_cents, 990);
        assert_eq!(tx.user_uid, "u1");
        assert_eq!(tx.dedupe_key, "ios:orig:100000001:1700000000000");
        let ios = tx.store_ids.ios.unwrap();
        assert_eq!(ios.original_transaction_id, "100000001");
        assert_eq!(ios.transaction_id.as_deref(), Some("100000002"));
    }

    #[test]
    fn notification_type_mapping() {
        assert_eq!(map_notification_type("DID_RENEW"), TxEvent::Renewal);
        assert_eq!(map_notification_type("DID_CHANGE_RENEWAL_STATUS"), TxEvent::Cancel);
        assert_eq!(map_notification_type("DID_FAIL_TO_RENEW"), TxEvent::Cancel);
        assert_eq!(map_notification_type("REFUND"), TxEvent::Refund);
        assert_eq!(map_notification_type("SUBSCRIBED"), TxEvent::InitialPurchase);
    }

    #[test]
    fn same_event_redelivered_yields_same_dedupe_key() {
        let n = notification("DID_RENEW");
        let a = normalize_apple(&n, Utc::now()).unwrap();
        let b = normalize_apple(&n, Utc::now()).unwrap();
        assert_eq!(a.dedupe_key, b.dedupe_key);
    }

    #[test]
    fn missing_original_transaction_id_is_rejected() {
        let mut n = notification("DID_RENEW");
        n.transaction.original_transaction_id = " ".into();
        assert_eq!(
            normalize_apple(&n, Utc::now()),
            Err(NormalizeError::BlankField {
                field: "transaction.original_transaction_id"
            })
        );
    }

    #[test]
    fn missing_price_normalizes_to_zero() {
        let mut n = notification("DID_CHANGE_RENEWAL_STATUS");
        n.transaction.price = None;
        let tx = normalize_apple(&n, Utc::now()).unwrap();
        assert_eq!(tx.event, TxEvent::Cancel);
        assert_eq!(tx.monetary.gross_cents, 0);
    }

    #[test]
    fn missing_account_token_uses_placeholder() {
        let mut n = notification("SUBSCRIBED");
        n.transaction.app_account_token = None;
        let tx = normalize_apple(&n, Utc::now()).unwrap();
        assert_eq!(tx.user_uid, USER_UNKNOWN);
    }
}
