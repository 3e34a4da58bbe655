//! Settings snapshots and the referral lookup.
//!
//! Settings are two JSON documents keyed by scope. The read path never
//! fails on an absent or partial document — built-in defaults apply — so a
//! distribution run always has a usable snapshot.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;

use rvl_config::{CommissionSettings, PartnershipSettings};

pub const SCOPE_COMMISSION: &str = "commission";
pub const SCOPE_PARTNERSHIP: &str = "partnership";

/// Read one raw settings document; `None` when the scope has no row.
pub async fn load_settings_doc(pool: &PgPool, scope: &str) -> Result<Option<Value>> {
    let row: Option<(Value,)> =
        sqlx::query_as::<_, (Value,)>("select doc from settings where scope = $1")
            .bind(scope)
            .fetch_optional(pool)
            .await
            .context("settings read failed")?;
    Ok(row.map(|(doc,)| doc))
}

/// Upsert one settings document. Callers validate before writing; the read
/// path applies whatever is stored.
pub async fn store_settings_doc(pool: &PgPool, scope: &str, doc: &Value) -> Result<()> {
    sqlx::query(
        r#"
        insert into settings (scope, doc, updated_at)
        values ($1, $2, now())
        on conflict (scope) do update
          set doc = excluded.doc, updated_at = now()
        "#,
    )
    .bind(scope)
    .bind(doc)
    .execute(pool)
    .await
    .context("settings upsert failed")?;
    Ok(())
}

/// Commission snapshot for one distribution run.
pub async fn load_commission_settings(pool: &PgPool) -> Result<CommissionSettings> {
    let doc = load_settings_doc(pool, SCOPE_COMMISSION).await?;
    Ok(CommissionSettings::from_doc(doc.as_ref()))
}

/// Partnership snapshot for one distribution run.
pub async fn load_partnership_settings(pool: &PgPool) -> Result<PartnershipSettings> {
    let doc = load_settings_doc(pool, SCOPE_PARTNERSHIP).await?;
    Ok(PartnershipSettings::from_doc(doc.as_ref()))
}

/// Referral lookup: the affiliate credited for a user's transactions, if
/// any. This is the only relationship distribution consults.
pub async fn affiliate_for_user(
    pool: &PgPool,
    tenant_id: &str,
    user_uid: &str,
) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as::<_, (String,)>(
        "select affiliate_id from referrals where tenant_id = $1 and user_uid = $2",
    )
    .bind(tenant_id)
    .bind(user_uid)
    .fetch_optional(pool)
    .await
    .context("referral lookup failed")?;
    Ok(row.map(|(affiliate_id,)| affiliate_id))
}

/// Record (or update) a user's referring affiliate.
pub async fn set_referral(
    pool: &PgPool,
    tenant_id: &str,
    user_uid: &str,
    affiliate_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into referrals (tenant_id, user_uid, affiliate_id)
        values ($1, $2, $3)
        on conflict (tenant_id, user_uid) do update
          set affiliate_id = excluded.affiliate_id
        "#,
    )
    .bind(tenant_id)
    .bind(user_uid)
    .bind(affiliate_id)
    .execute(pool)
    .await
    .context("referral upsert failed")?;
    Ok(())
}
