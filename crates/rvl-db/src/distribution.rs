//! Distribution apply + orchestration.
//!
//! `apply_distribution` is the only place ledger entries and balances are
//! ever written, and it writes them in **one** database transaction: every
//! entry insert is conditional on its composite identity being new, and a
//! pending-balance increment happens only when its entry actually inserted.
//! Either the whole unit commits or none of it does — partial ledger state
//! is never observable, and re-invocation for the same transaction id is a
//! no-op per entry.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction as DbTx};
use tracing::{error, info, warn};
use uuid::Uuid;

use rvl_dispatch::{AbandonSink, DistributionHandler, PermanentFailure};
use rvl_engine::{plan_distribution, CommissionDraft, DistributionPlan, PartnerSplitDraft, PlanError};
use rvl_schemas::{
    AffiliateBalance, BaseType, CommissionEntry, Currency, EntryKind, EntryStatus, PartnerBalance,
    PartnerSplitEntry,
};

use crate::settings::{affiliate_for_user, load_commission_settings, load_partnership_settings};
use crate::txstore::fetch_transaction;

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// What one apply call actually wrote. Zero everywhere means the plan was
/// already fully applied by an earlier delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    pub commission_created: bool,
    pub splits_created: usize,
}

/// Write a distribution plan atomically: commission entry + affiliate
/// balance increment, one split entry + partner balance increment per
/// share. All-or-nothing.
pub async fn apply_distribution(pool: &PgPool, plan: &DistributionPlan) -> Result<ApplyOutcome> {
    let mut dbtx = pool.begin().await.context("apply_distribution begin failed")?;
    let mut outcome = ApplyOutcome::default();

    if let Some(commission) = &plan.commission {
        if insert_commission_entry(&mut dbtx, commission).await? {
            increment_affiliate_pending(
                &mut dbtx,
                &commission.affiliate_id,
                commission.currency,
                commission.amount_cents,
            )
            .await?;
            outcome.commission_created = true;
        }
    }

    for split in &plan.splits {
        if insert_partner_split_entry(&mut dbtx, split).await? {
            increment_partner_pending(
                &mut dbtx,
                &split.partner_id,
                split.currency,
                split.amount_cents,
            )
            .await?;
            outcome.splits_created += 1;
        }
    }

    dbtx.commit().await.context("apply_distribution commit failed")?;
    Ok(outcome)
}

async fn insert_commission_entry(
    dbtx: &mut DbTx<'_, Postgres>,
    draft: &CommissionDraft,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        insert into commission_entries (
          entry_id, tenant_id, affiliate_id, user_uid, product_id, tx_id,
          kind, recurrence_no, base_type, base_cents, rate, amount_cents,
          currency, status, hold_until,
          invoice_id, charge_id, balance_transaction_id
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
          $13, 'pending', $14, $15, $16, $17
        )
        on conflict on constraint uq_commission_identity do nothing
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&draft.tenant_id)
    .bind(&draft.affiliate_id)
    .bind(&draft.user_uid)
    .bind(&draft.product_id)
    .bind(draft.tx_id)
    .bind(draft.kind.as_str())
    .bind(draft.recurrence_no)
    .bind(draft.base_type.as_str())
    .bind(draft.base_cents)
    .bind(draft.rate)
    .bind(draft.amount_cents)
    .bind(draft.currency.as_str())
    .bind(draft.hold_until)
    .bind(&draft.invoice_id)
    .bind(&draft.charge_id)
    .bind(&draft.balance_transaction_id)
    .execute(&mut **dbtx)
    .await
    .context("commission entry insert failed")?;
    Ok(res.rows_affected() == 1)
}

async fn insert_partner_split_entry(
    dbtx: &mut DbTx<'_, Postgres>,
    draft: &PartnerSplitDraft,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        insert into partner_split_entries (
          entry_id, tenant_id, partner_id, user_uid, product_id, tx_id,
          kind, recurrence_no, gross_cents, fee_cents, net_after_fees_cents,
          affiliate_cents, base_sociedade_cents, share_pct, amount_cents,
          currency, status, hold_until,
          invoice_id, charge_id, balance_transaction_id
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
          $12, $13, $14, $15, $16, 'pending', $17, $18, $19, $20
        )
        on conflict on constraint uq_partner_split_identity do nothing
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&draft.tenant_id)
    .bind(&draft.partner_id)
    .bind(&draft.user_uid)
    .bind(&draft.product_id)
    .bind(draft.tx_id)
    .bind(draft.kind.as_str())
    .bind(draft.recurrence_no)
    .bind(draft.gross_cents)
    .bind(draft.fee_cents)
    .bind(draft.net_after_fees_cents)
    .bind(draft.affiliate_cents)
    .bind(draft.base_sociedade_cents)
    .bind(draft.share_pct)
    .bind(draft.amount_cents)
    .bind(draft.currency.as_str())
    .bind(draft.hold_until)
    .bind(&draft.invoice_id)
    .bind(&draft.charge_id)
    .bind(&draft.balance_transaction_id)
    .execute(&mut **dbtx)
    .await
    .context("partner split entry insert failed")?;
    Ok(res.rows_affected() == 1)
}

async fn increment_affiliate_pending(
    dbtx: &mut DbTx<'_, Postgres>,
    affiliate_id: &str,
    currency: Currency,
    amount_cents: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into affiliate_balances (affiliate_id, currency, pending_cents, updated_at)
        values ($1, $2, $3, now())
        on conflict (affiliate_id) do update
          set pending_cents = affiliate_balances.pending_cents + excluded.pending_cents,
              updated_at = now()
        "#,
    )
    .bind(affiliate_id)
    .bind(currency.as_str())
    .bind(amount_cents)
    .execute(&mut **dbtx)
    .await
    .context("affiliate balance increment failed")?;
    Ok(())
}

async fn increment_partner_pending(
    dbtx: &mut DbTx<'_, Postgres>,
    partner_id: &str,
    currency: Currency,
    amount_cents: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into partner_balances (partner_id, currency, pending_cents, updated_at)
        values ($1, $2, $3, now())
        on conflict (partner_id) do update
          set pending_cents = partner_balances.pending_cents + excluded.pending_cents,
              updated_at = now()
        "#,
    )
    .bind(partner_id)
    .bind(currency.as_str())
    .bind(amount_cents)
    .execute(&mut **dbtx)
    .await
    .context("partner balance increment failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Result of one distribution run for a transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributeOutcome {
    Applied(ApplyOutcome),
    /// The id is unknown — logged and skipped, never retried.
    Skipped,
}

/// Run distribution for one transaction id: load the record, snapshot the
/// settings, resolve the affiliate, plan, apply.
pub async fn distribute_transaction(pool: &PgPool, tx_id: Uuid) -> Result<DistributeOutcome> {
    let Some(stored) = fetch_transaction(pool, tx_id).await? else {
        warn!(%tx_id, "distribution requested for unknown transaction; skipping");
        return Ok(DistributeOutcome::Skipped);
    };

    let commission = load_commission_settings(pool).await?;
    let partnership = load_partnership_settings(pool).await?;
    let affiliate = affiliate_for_user(pool, &stored.tx.tenant_id, &stored.tx.user_uid).await?;

    let plan = plan_distribution(
        tx_id,
        &stored.tx,
        affiliate.as_deref(),
        &commission,
        &partnership,
        Utc::now(),
    )
    .map_err(|e| anyhow!(e).context("distribution planning failed"))?;

    let outcome = apply_distribution(pool, &plan).await?;
    info!(
        %tx_id,
        commission_created = outcome.commission_created,
        splits_created = outcome.splits_created,
        total_cents = plan.total_distributed_cents(),
        "distribution applied"
    );
    Ok(DistributeOutcome::Applied(outcome))
}

/// Production [`DistributionHandler`]: distribute against a Postgres pool.
#[derive(Clone)]
pub struct PgDistributor {
    pool: PgPool,
}

impl PgDistributor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributionHandler for PgDistributor {
    async fn process(&self, tx_id: Uuid) -> Result<()> {
        match distribute_transaction(&self.pool, tx_id).await {
            Ok(_) => Ok(()),
            Err(err) => Err(classify_failure(err)),
        }
    }
}

/// Decide whether a distribution failure is worth the dispatcher's retry
/// budget. Planner rejections and non-transient store errors cannot succeed
/// on retry, so they are marked [`PermanentFailure`] and go straight to the
/// dead-letter table.
fn classify_failure(err: anyhow::Error) -> anyhow::Error {
    let permanent = err.chain().any(|cause| {
        if let Some(db_err) = cause.downcast_ref::<sqlx::Error>() {
            return !crate::is_transient_error(db_err);
        }
        cause.downcast_ref::<PlanError>().is_some()
    });
    if permanent {
        anyhow::Error::new(PermanentFailure(err))
    } else {
        err
    }
}

/// Production [`AbandonSink`]: record the unit in `dispatch_dlq` so an
/// operator can re-drive it (`rvl redrive <tx_id>`).
#[derive(Clone)]
pub struct PgAbandonSink {
    pool: PgPool,
}

impl PgAbandonSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AbandonSink for PgAbandonSink {
    async fn abandoned(&self, tx_id: Uuid, attempts: u32, last_error: &str) {
        if let Err(err) = record_abandoned_dispatch(&self.pool, tx_id, attempts, last_error).await
        {
            // Nothing left to do but shout: the unit is now only visible in
            // logs until someone reconciles by hand.
            error!(%tx_id, error = %format!("{err:#}"), "failed to record abandoned dispatch");
        }
    }
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AbandonedDispatch {
    pub dlq_id: i64,
    pub tx_id: Uuid,
    pub attempts: i32,
    pub last_error: String,
    pub abandoned_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Insert one dead-letter row for an abandoned unit of work.
pub async fn record_abandoned_dispatch(
    pool: &PgPool,
    tx_id: Uuid,
    attempts: u32,
    last_error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into dispatch_dlq (tx_id, attempts, last_error)
        values ($1, $2, $3)
        "#,
    )
    .bind(tx_id)
    .bind(attempts as i32)
    .bind(last_error)
    .execute(pool)
    .await
    .context("dispatch_dlq insert failed")?;
    Ok(())
}

/// Unresolved dead letters, oldest first.
pub async fn list_abandoned(pool: &PgPool) -> Result<Vec<AbandonedDispatch>> {
    let rows = sqlx::query(
        r#"
        select dlq_id, tx_id, attempts, last_error, abandoned_at, resolved_at
        from dispatch_dlq
        where resolved_at is null
        order by abandoned_at
        "#,
    )
    .fetch_all(pool)
    .await
    .context("dispatch_dlq list failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(AbandonedDispatch {
                dlq_id: row.try_get("dlq_id")?,
                tx_id: row.try_get("tx_id")?,
                attempts: row.try_get("attempts")?,
                last_error: row.try_get("last_error")?,
                abandoned_at: row.try_get("abandoned_at")?,
                resolved_at: row.try_get("resolved_at")?,
            })
        })
        .collect()
}

/// Mark every unresolved dead letter for a transaction as reconciled.
/// Returns the number of rows resolved.
pub async fn resolve_abandoned(pool: &PgPool, tx_id: Uuid) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update dispatch_dlq
        set resolved_at = now()
        where tx_id = $1 and resolved_at is null
        "#,
    )
    .bind(tx_id)
    .execute(pool)
    .await
    .context("dispatch_dlq resolve failed")?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Read surface (balances, entries, audit sums)
// ---------------------------------------------------------------------------

pub async fn fetch_affiliate_balance(
    pool: &PgPool,
    affiliate_id: &str,
) -> Result<Option<AffiliateBalance>> {
    let row = sqlx::query(
        r#"
        select affiliate_id, currency, pending_cents, available_cents, paid_cents, updated_at
        from affiliate_balances
        where affiliate_id = $1
        "#,
    )
    .bind(affiliate_id)
    .fetch_optional(pool)
    .await
    .context("affiliate balance read failed")?;

    row.map(|row| {
        let currency_raw: String = row.try_get("currency")?;
        Ok(AffiliateBalance {
            affiliate_id: row.try_get("affiliate_id")?,
            currency: Currency::parse(&currency_raw)
                .ok_or_else(|| anyhow!("invalid currency in store: {currency_raw}"))?,
            pending_cents: row.try_get("pending_cents")?,
            available_cents: row.try_get("available_cents")?,
            paid_cents: row.try_get("paid_cents")?,
            updated_at: row.try_get("updated_at")?,
        })
    })
    .transpose()
}

pub async fn fetch_partner_balance(
    pool: &PgPool,
    partner_id: &str,
) -> Result<Option<PartnerBalance>> {
    let row = sqlx::query(
        r#"
        select partner_id, currency, pending_cents, available_cents, paid_cents, updated_at
        from partner_balances
        where partner_id = $1
        "#,
    )
    .bind(partner_id)
    .fetch_optional(pool)
    .await
    .context("partner balance read failed")?;

    row.map(|row| {
        let currency_raw: String = row.try_get("currency")?;
        Ok(PartnerBalance {
            partner_id: row.try_get("partner_id")?,
            currency: Currency::parse(&currency_raw)
                .ok_or_else(|| anyhow!("invalid currency in store: {currency_raw}"))?,
            pending_cents: row.try_get("pending_cents")?,
            available_cents: row.try_get("available_cents")?,
            paid_cents: row.try_get("paid_cents")?,
            updated_at: row.try_get("updated_at")?,
        })
    })
    .transpose()
}

/// Commission entries derived from one transaction.
pub async fn list_commission_entries_for_tx(
    pool: &PgPool,
    tx_id: Uuid,
) -> Result<Vec<CommissionEntry>> {
    let rows = sqlx::query(
        r#"
        select
          entry_id, tenant_id, affiliate_id, user_uid, product_id, tx_id,
          kind, recurrence_no, base_type, base_cents, rate, amount_cents,
          currency, status, hold_until,
          invoice_id, charge_id, balance_transaction_id, created_at
        from commission_entries
        where tx_id = $1
        order by affiliate_id, kind
        "#,
    )
    .bind(tx_id)
    .fetch_all(pool)
    .await
    .context("commission entries read failed")?;

    rows.into_iter()
        .map(|row| {
            let kind_raw: String = row.try_get("kind")?;
            let base_type_raw: String = row.try_get("base_type")?;
            let currency_raw: String = row.try_get("currency")?;
            let status_raw: String = row.try_get("status")?;
            Ok(CommissionEntry {
                entry_id: row.try_get("entry_id")?,
                tenant_id: row.try_get("tenant_id")?,
                affiliate_id: row.try_get("affiliate_id")?,
                user_uid: row.try_get("user_uid")?,
                product_id: row.try_get("product_id")?,
                tx_id: row.try_get("tx_id")?,
                kind: EntryKind::parse(&kind_raw)
                    .ok_or_else(|| anyhow!("invalid entry kind in store: {kind_raw}"))?,
                recurrence_no: row.try_get("recurrence_no")?,
                base_type: BaseType::parse(&base_type_raw)
                    .ok_or_else(|| anyhow!("invalid base type in store: {base_type_raw}"))?,
                base_cents: row.try_get("base_cents")?,
                rate: row.try_get("rate")?,
                amount_cents: row.try_get("amount_cents")?,
                currency: Currency::parse(&currency_raw)
                    .ok_or_else(|| anyhow!("invalid currency in store: {currency_raw}"))?,
                status: EntryStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("invalid entry status in store: {status_raw}"))?,
                hold_until: row.try_get("hold_until")?,
                invoice_id: row.try_get("invoice_id")?,
                charge_id: row.try_get("charge_id")?,
                balance_transaction_id: row.try_get("balance_transaction_id")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Partner split entries derived from one transaction.
pub async fn list_partner_splits_for_tx(
    pool: &PgPool,
    tx_id: Uuid,
) -> Result<Vec<PartnerSplitEntry>> {
    let rows = sqlx::query(
        r#"
        select
          entry_id, tenant_id, partner_id, user_uid, product_id, tx_id,
          kind, recurrence_no, gross_cents, fee_cents, net_after_fees_cents,
          affiliate_cents, base_sociedade_cents, share_pct, amount_cents,
          currency, status, hold_until,
          invoice_id, charge_id, balance_transaction_id, created_at
        from partner_split_entries
        where tx_id = $1
        order by partner_id, kind
        "#,
    )
    .bind(tx_id)
    .fetch_all(pool)
    .await
    .context("partner split entries read failed")?;

    rows.into_iter()
        .map(|row| {
            let kind_raw: String = row.try_get("kind")?;
            let currency_raw: String = row.try_get("currency")?;
            let status_raw: String = row.try_get("status")?;
            Ok(PartnerSplitEntry {
                entry_id: row.try_get("entry_id")?,
                tenant_id: row.try_get("tenant_id")?,
                partner_id: row.try_get("partner_id")?,
                user_uid: row.try_get("user_uid")?,
                product_id: row.try_get("product_id")?,
                tx_id: row.try_get("tx_id")?,
                kind: EntryKind::parse(&kind_raw)
                    .ok_or_else(|| anyhow!("invalid entry kind in store: {kind_raw}"))?,
                recurrence_no: row.try_get("recurrence_no")?,
                gross_cents: row.try_get("gross_cents")?,
                fee_cents: row.try_get("fee_cents")?,
                net_after_fees_cents: row.try_get("net_after_fees_cents")?,
                affiliate_cents: row.try_get("affiliate_cents")?,
                base_sociedade_cents: row.try_get("base_sociedade_cents")?,
                share_pct: row.try_get("share_pct")?,
                amount_cents: row.try_get("amount_cents")?,
                currency: Currency::parse(&currency_raw)
                    .ok_or_else(|| anyhow!("invalid currency in store: {currency_raw}"))?,
                status: EntryStatus::parse(&status_raw)
                    .ok_or_else(|| anyhow!("invalid entry status in store: {status_raw}"))?,
                hold_until: row.try_get("hold_until")?,
                invoice_id: row.try_get("invoice_id")?,
                charge_id: row.try_get("charge_id")?,
                balance_transaction_id: row.try_get("balance_transaction_id")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Audit sum: total commission cents ever written for an affiliate.
/// A clean system satisfies `sum == pending + available + paid`.
pub async fn sum_commission_cents(pool: &PgPool, affiliate_id: &str) -> Result<i64> {
    let (sum,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select coalesce(sum(amount_cents), 0)::bigint
        from commission_entries
        where affiliate_id = $1
        "#,
    )
    .bind(affiliate_id)
    .fetch_one(pool)
    .await
    .context("commission sum failed")?;
    Ok(sum)
}

/// Audit sum: total split cents ever written for a partner.
pub async fn sum_partner_split_cents(pool: &PgPool, partner_id: &str) -> Result<i64> {
    let (sum,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select coalesce(sum(amount_cents), 0)::bigint
        from partner_split_entries
        where partner_id = $1
        "#,
    )
    .bind(partner_id)
    .fetch_one(pool)
    .await
    .context("partner split sum failed")?;
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_errors_classify_as_permanent() {
        let err = anyhow!(PlanError::NegativeGross { gross_cents: -1 })
            .context("distribution planning failed");
        assert!(classify_failure(err).is::<PermanentFailure>());
    }

    #[test]
    fn non_transient_store_errors_classify_as_permanent() {
        let err = anyhow::Error::new(sqlx::Error::RowNotFound).context("entry read failed");
        assert!(classify_failure(err).is::<PermanentFailure>());
    }

    #[test]
    fn transient_store_errors_stay_retryable() {
        let err = anyhow::Error::new(sqlx::Error::PoolTimedOut).context("apply failed");
        assert!(!classify_failure(err).is::<PermanentFailure>());
    }

    #[test]
    fn errors_without_known_cause_stay_retryable() {
        let err = anyhow!("dispatch hand-off failed");
        assert!(!classify_failure(err).is::<PermanentFailure>());
    }
}
