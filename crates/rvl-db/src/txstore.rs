//! Canonical transaction store and the ingestion pipeline helper.
//!
//! `insert_transaction` is a pure create-iff-absent: the `tx_id` primary key
//! turns re-delivery after a partial failure (gate succeeded, something
//! downstream did not) into a no-op instead of a duplicate financial record.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use rvl_dispatch::TxQueue;
use rvl_schemas::{Currency, Monetary, Platform, StoreIds, Transaction, TxEvent};

use crate::gate::acquire_tx_key;

/// Result of pushing one normalized transaction through the gate + writer.
/// Either way the caller gets the stable id for the dedupe key; only
/// `Created` means this delivery persisted the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created { tx_id: Uuid },
    Duplicate { tx_id: Uuid },
}

impl IngestOutcome {
    pub fn tx_id(&self) -> Uuid {
        match self {
            IngestOutcome::Created { tx_id } | IngestOutcome::Duplicate { tx_id } => *tx_id,
        }
    }
}

/// Persist the canonical transaction iff no record for `tx_id` exists.
/// Returns whether this call created the record.
pub async fn insert_transaction(pool: &PgPool, tx_id: Uuid, tx: &Transaction) -> Result<bool> {
    let store_ids =
        serde_json::to_value(&tx.store_ids).context("store_ids serialization failed")?;

    let res = sqlx::query(
        r#"
        insert into transactions (
          tx_id, tenant_id, user_uid, product_id, platform, event,
          currency, gross_cents, fee_cents, net_after_fees_cents,
          store_ids, occurred_at, dedupe_key
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
        )
        on conflict (tx_id) do nothing
        "#,
    )
    .bind(tx_id)
    .bind(&tx.tenant_id)
    .bind(&tx.user_uid)
    .bind(&tx.product_id)
    .bind(tx.platform.as_str())
    .bind(tx.event.as_str())
    .bind(tx.monetary.currency.as_str())
    .bind(tx.monetary.gross_cents)
    .bind(tx.monetary.fee_cents)
    .bind(tx.monetary.net_after_fees_cents)
    .bind(&store_ids)
    .bind(tx.occurred_at)
    .bind(&tx.dedupe_key)
    .execute(pool)
    .await
    .context("insert_transaction failed")?;

    Ok(res.rows_affected() == 1)
}

/// Full ingestion step for one normalized transaction:
/// gate → writer → dispatcher.
///
/// The id is enqueued for distribution on **every** delivery, not just the
/// first: distribution is idempotent, and re-enqueueing on a duplicate heals
/// the partial failure where an earlier delivery persisted the record but
/// crashed before the hand-off.
pub async fn ingest_transaction(
    pool: &PgPool,
    queue: &TxQueue,
    tx: &Transaction,
) -> Result<IngestOutcome> {
    let tx_id = acquire_tx_key(pool, &tx.dedupe_key).await?;
    let persisted = insert_transaction(pool, tx_id, tx).await?;

    queue
        .enqueue(tx_id)
        .await
        .map_err(|e| anyhow!("dispatch hand-off failed: {e}"))?;

    Ok(if persisted {
        IngestOutcome::Created { tx_id }
    } else {
        IngestOutcome::Duplicate { tx_id }
    })
}

/// A transaction as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredTransaction {
    pub tx_id: Uuid,
    pub tx: Transaction,
    pub created_at: DateTime<Utc>,
}

/// Load one canonical transaction; `None` if the id is unknown.
pub async fn fetch_transaction(pool: &PgPool, tx_id: Uuid) -> Result<Option<StoredTransaction>> {
    let row = sqlx::query(
        r#"
        select
          tx_id, tenant_id, user_uid, product_id, platform, event,
          currency, gross_cents, fee_cents, net_after_fees_cents,
          store_ids, occurred_at, dedupe_key, created_at
        from transactions
        where tx_id = $1
        "#,
    )
    .bind(tx_id)
    .fetch_optional(pool)
    .await
    .context("fetch_transaction failed")?;

    let Some(row) = row else {
        return Ok(None);
    };

    let platform_raw: String = row.try_get("platform")?;
    let event_raw: String = row.try_get("event")?;
    let currency_raw: String = row.try_get("currency")?;
    let store_ids_raw: serde_json::Value = row.try_get("store_ids")?;

    let tx = Transaction {
        tenant_id: row.try_get("tenant_id")?,
        user_uid: row.try_get("user_uid")?,
        product_id: row.try_get("product_id")?,
        platform: Platform::parse(&platform_raw)
            .ok_or_else(|| anyhow!("invalid platform in store: {platform_raw}"))?,
        event: TxEvent::parse(&event_raw)
            .ok_or_else(|| anyhow!("invalid event in store: {event_raw}"))?,
        store_ids: serde_json::from_value::<StoreIds>(store_ids_raw)
            .context("store_ids deserialization failed")?,
        monetary: Monetary {
            currency: Currency::parse(&currency_raw)
                .ok_or_else(|| anyhow!("invalid currency in store: {currency_raw}"))?,
            gross_cents: row.try_get("gross_cents")?,
            fee_cents: row.try_get("fee_cents")?,
            net_after_fees_cents: row.try_get("net_after_fees_cents")?,
        },
        occurred_at: row.try_get("occurred_at")?,
        dedupe_key: row.try_get("dedupe_key")?,
    };

    Ok(Some(StoredTransaction {
        tx_id: row.try_get("tx_id")?,
        tx,
        created_at: row.try_get("created_at")?,
    }))
}
