//! Idempotency Gate: maps a dedupe key to a stable transaction id.
//!
//! The whole gate is one conditional insert against the `tx_keys` primary
//! key. Concurrent claimants for the same key race on the constraint; the
//! store picks exactly one winner, and every loser reads the winner's id.
//! A duplicate key is therefore never an error — only genuine storage
//! trouble surfaces, and that is retryable by the caller.

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

/// Claim (or re-read) the transaction id for a dedupe key.
///
/// Safe to call any number of times for the same key — always converges to
/// one id. The freshly minted candidate id is only ever visible if this
/// call won the insert.
pub async fn acquire_tx_key(pool: &PgPool, dedupe_key: &str) -> Result<Uuid> {
    if dedupe_key.trim().is_empty() {
        bail!("dedupe_key must not be blank");
    }

    let candidate = Uuid::new_v4();
    let inserted = sqlx::query(
        r#"
        insert into tx_keys (dedupe_key, tx_id)
        values ($1, $2)
        on conflict (dedupe_key) do nothing
        "#,
    )
    .bind(dedupe_key)
    .bind(candidate)
    .execute(pool)
    .await
    .context("tx_keys conditional insert failed")?;

    if inserted.rows_affected() == 1 {
        return Ok(candidate);
    }

    // Lost the race (or the key was claimed long ago): read the winner.
    let (tx_id,): (Uuid,) =
        sqlx::query_as::<_, (Uuid,)>("select tx_id from tx_keys where dedupe_key = $1")
            .bind(dedupe_key)
            .fetch_one(pool)
            .await
            .context("tx_keys winner lookup failed")?;

    Ok(tx_id)
}
