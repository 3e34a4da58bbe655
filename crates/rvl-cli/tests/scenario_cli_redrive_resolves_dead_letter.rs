//! `rvl redrive` must re-run distribution for an abandoned transaction and
//! mark its dead letters reconciled on success.
//!
//! This test is DB-backed and is skipped if RVL_DATABASE_URL is not set.

use chrono::Utc;
use uuid::Uuid;

use rvl_schemas::{Currency, Monetary, Platform, StoreIds, Transaction, TxEvent};

#[tokio::test]
async fn cli_redrive_resolves_dead_letter() -> anyhow::Result<()> {
    // Skip if no DB configured (local + CI friendly).
    let url = match std::env::var(rvl_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: RVL_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = match sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("SKIP: cannot connect to DB: {e}");
            return Ok(());
        }
    };
    if let Err(e) = rvl_db::migrate(&pool).await {
        eprintln!("SKIP: cannot migrate DB: {e}");
        return Ok(());
    }

    // A persisted transaction whose distribution was abandoned.
    let tx = Transaction {
        tenant_id: "t-test".into(),
        user_uid: format!("u-{}", Uuid::new_v4()),
        product_id: "plan-pro".into(),
        platform: Platform::StripeWeb,
        event: TxEvent::InitialPurchase,
        store_ids: StoreIds::default(),
        monetary: Monetary {
            currency: Currency::Brl,
            gross_cents: 10_000,
            fee_cents: Some(300),
            net_after_fees_cents: Some(9_700),
        },
        occurred_at: Utc::now(),
        dedupe_key: format!("test:cli:{}", Uuid::new_v4()),
    };
    let tx_id = rvl_db::acquire_tx_key(&pool, &tx.dedupe_key).await?;
    assert!(rvl_db::insert_transaction(&pool, tx_id, &tx).await?);
    rvl_db::record_abandoned_dispatch(&pool, tx_id, 3, "simulated outage").await?;

    // Redrive via CLI.
    let mut cmd = assert_cmd::Command::cargo_bin("rvl")?;
    cmd.env(rvl_db::ENV_DB_URL, &url)
        .args(["redrive", "--tx-id", &tx_id.to_string()]);
    cmd.assert().success();

    // The dead letter is gone from the operator's queue.
    let listed = rvl_db::list_abandoned(&pool).await?;
    assert!(listed.iter().all(|e| e.tx_id != tx_id));

    Ok(())
}
