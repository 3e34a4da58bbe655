//! rvl-db
//!
//! The durable side of the pipeline, on Postgres via sqlx:
//! - [`gate`] — Idempotency Gate: one transaction id per dedupe key, ever
//! - [`txstore`] — canonical transaction writer (create-iff-absent) and the
//!   ingestion pipeline helper that hands new ids to the dispatcher
//! - [`settings`] — commission/partnership snapshots and referral lookup
//! - [`distribution`] — atomic apply of a distribution plan (entries +
//!   balance increments in one DB transaction), orchestration, dead letters
//!
//! All coordination happens through the store's transactional primitives:
//! unique-constraint conditional inserts, atomic increments, multi-row
//! transactions. No long-held locks, no in-process shared state.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod distribution;
pub mod gate;
pub mod settings;
pub mod txstore;

pub use distribution::{
    apply_distribution, distribute_transaction, fetch_affiliate_balance, fetch_partner_balance,
    list_abandoned, list_commission_entries_for_tx, list_partner_splits_for_tx,
    record_abandoned_dispatch, resolve_abandoned, sum_commission_cents, sum_partner_split_cents,
    AbandonedDispatch, ApplyOutcome, DistributeOutcome, PgAbandonSink, PgDistributor,
};
pub use gate::acquire_tx_key;
pub use settings::{
    affiliate_for_user, load_commission_settings, load_partnership_settings, load_settings_doc,
    set_referral, store_settings_doc, SCOPE_COMMISSION, SCOPE_PARTNERSHIP,
};
pub use txstore::{
    fetch_transaction, ingest_transaction, insert_transaction, IngestOutcome, StoredTransaction,
};

pub const ENV_DB_URL: &str = "RVL_DATABASE_URL";

/// Connect to Postgres using RVL_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url =
        std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='transactions'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus { ok, has_transactions_table: exists })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_transactions_table: bool,
}

/// Whether a sqlx error is worth retrying with backoff: serialization
/// failures, deadlocks, and pool/connection trouble. Constraint violations
/// and data errors are not transient. Consulted by the distribution handler
/// to decide whether a failed unit keeps its dispatcher retry budget.
pub fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_trouble_is_transient() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        assert!(is_transient_error(&io));
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(is_transient_error(&sqlx::Error::WorkerCrashed));
    }

    #[test]
    fn data_errors_are_not_transient() {
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
        assert!(!is_transient_error(&sqlx::Error::ColumnNotFound("tx_id".into())));
    }

    #[derive(Debug)]
    struct StubDbError(&'static str);

    impl std::fmt::Display for StubDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "sqlstate {}", self.0)
        }
    }

    impl std::error::Error for StubDbError {}

    impl sqlx::error::DatabaseError for StubDbError {
        fn message(&self) -> &str {
            "stub database error"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(std::borrow::Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn db_error(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(StubDbError(code)))
    }

    #[test]
    fn serialization_failures_and_deadlocks_are_transient() {
        assert!(is_transient_error(&db_error("40001")));
        assert!(is_transient_error(&db_error("40P01")));
    }

    #[test]
    fn constraint_violations_are_not_transient() {
        assert!(!is_transient_error(&db_error("23505")));
        assert!(!is_transient_error(&db_error("23514")));
    }
}
