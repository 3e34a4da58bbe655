//! rvl — operator CLI for the revenue ledger.
//!
//! Thin wrapper over rvl-db: schema management, settings inspection,
//! balance lookups, and the manual-reconciliation loop for abandoned
//! distribution work.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use rvl_db::DistributeOutcome;

#[derive(Parser)]
#[command(name = "rvl")]
#[command(about = "Revenue ledger CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Print the stored commission + partnership settings documents and the
    /// effective values after defaults.
    SettingsShow,

    /// Validate and store a settings document for one scope.
    SettingsSet {
        /// `commission` or `partnership`
        #[arg(long)]
        scope: String,
        /// The settings document as a JSON string
        #[arg(long)]
        json: String,
    },

    /// Record (or update) a user's referring affiliate.
    SetReferral {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        affiliate: String,
    },

    /// Print one affiliate's balance.
    AffiliateBalance {
        #[arg(long)]
        affiliate: String,
    },

    /// Print one partner's balance.
    PartnerBalance {
        #[arg(long)]
        partner: String,
    },

    /// List distribution work abandoned after the retry budget.
    AbandonedList,

    /// Re-run distribution for an abandoned transaction and, on success,
    /// mark its dead letters reconciled.
    Redrive {
        /// Transaction id
        #[arg(long)]
        tx_id: String,
    },

    /// Run distribution for a transaction id (idempotent; safe to repeat).
    Distribute {
        /// Transaction id
        #[arg(long)]
        tx_id: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = rvl_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = rvl_db::status(&pool).await?;
                    println!("db_ok={} has_transactions_table={}", s.ok, s.has_transactions_table);
                }
                DbCmd::Migrate => {
                    rvl_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::SettingsShow => {
            let pool = rvl_db::connect_from_env().await?;

            let commission_doc = rvl_db::load_settings_doc(&pool, rvl_db::SCOPE_COMMISSION).await?;
            let partnership_doc =
                rvl_db::load_settings_doc(&pool, rvl_db::SCOPE_PARTNERSHIP).await?;
            println!(
                "commission_doc={}",
                commission_doc.map_or_else(|| "<absent>".into(), |d| d.to_string())
            );
            println!(
                "partnership_doc={}",
                partnership_doc.map_or_else(|| "<absent>".into(), |d| d.to_string())
            );

            let commission = rvl_db::load_commission_settings(&pool).await?;
            let partnership = rvl_db::load_partnership_settings(&pool).await?;
            let d = &commission.defaults;
            println!(
                "effective_commission first_pct={} recurring_pct={} months={} base={} hold_days={} cookie_ttl_days={} min_payout_cents={}",
                d.first_pct,
                d.recurring_pct,
                d.months,
                d.base.as_str(),
                d.hold_days,
                d.cookie_ttl_days,
                d.min_payout_cents
            );
            println!(
                "effective_partnership shares={} hold_days_partners={}",
                partnership.shares.len(),
                partnership.hold_days_partners
            );
            for share in &partnership.shares {
                println!("partner_share partner_id={} pct={}", share.partner_id, share.pct);
            }
        }

        Commands::SettingsSet { scope, json } => {
            let doc: serde_json::Value =
                serde_json::from_str(&json).context("settings document is not valid JSON")?;

            // Validate against the schema for the scope before storing; the
            // read path applies whatever is stored.
            match scope.as_str() {
                rvl_db::SCOPE_COMMISSION => {
                    serde_json::from_value::<rvl_config::CommissionSettings>(doc.clone())
                        .context("not a commission settings document")?
                        .validate()?
                }
                rvl_db::SCOPE_PARTNERSHIP => {
                    serde_json::from_value::<rvl_config::PartnershipSettings>(doc.clone())
                        .context("not a partnership settings document")?
                        .validate()?
                }
                other => anyhow::bail!("unknown settings scope: {other}"),
            }

            let pool = rvl_db::connect_from_env().await?;
            rvl_db::store_settings_doc(&pool, &scope, &doc).await?;
            println!("settings_stored=true scope={scope}");
        }

        Commands::SetReferral { tenant, user, affiliate } => {
            let pool = rvl_db::connect_from_env().await?;
            rvl_db::set_referral(&pool, &tenant, &user, &affiliate).await?;
            println!("referral_set=true tenant={tenant} user={user} affiliate={affiliate}");
        }

        Commands::AffiliateBalance { affiliate } => {
            let pool = rvl_db::connect_from_env().await?;
            match rvl_db::fetch_affiliate_balance(&pool, &affiliate).await? {
                Some(b) => println!(
                    "affiliate={} currency={} pending_cents={} available_cents={} paid_cents={}",
                    b.affiliate_id,
                    b.currency.as_str(),
                    b.pending_cents,
                    b.available_cents,
                    b.paid_cents
                ),
                None => println!("affiliate={affiliate} balance=<absent>"),
            }
        }

        Commands::PartnerBalance { partner } => {
            let pool = rvl_db::connect_from_env().await?;
            match rvl_db::fetch_partner_balance(&pool, &partner).await? {
                Some(b) => println!(
                    "partner={} currency={} pending_cents={} available_cents={} paid_cents={}",
                    b.partner_id,
                    b.currency.as_str(),
                    b.pending_cents,
                    b.available_cents,
                    b.paid_cents
                ),
                None => println!("partner={partner} balance=<absent>"),
            }
        }

        Commands::AbandonedList => {
            let pool = rvl_db::connect_from_env().await?;
            let abandoned = rvl_db::list_abandoned(&pool).await?;
            println!("abandoned_count={}", abandoned.len());
            for a in abandoned {
                println!(
                    "tx_id={} attempts={} abandoned_at={} last_error={}",
                    a.tx_id,
                    a.attempts,
                    a.abandoned_at.to_rfc3339(),
                    a.last_error
                );
            }
        }

        Commands::Redrive { tx_id } => {
            let pool = rvl_db::connect_from_env().await?;
            let tx_uuid = Uuid::parse_str(&tx_id).context("invalid tx_id uuid")?;

            match rvl_db::distribute_transaction(&pool, tx_uuid).await? {
                DistributeOutcome::Applied(outcome) => {
                    let resolved = rvl_db::resolve_abandoned(&pool, tx_uuid).await?;
                    println!(
                        "redrive=ok tx_id={} commission_created={} splits_created={} dead_letters_resolved={}",
                        tx_uuid, outcome.commission_created, outcome.splits_created, resolved
                    );
                }
                DistributeOutcome::Skipped => {
                    // Unknown id: leave the dead letters alone for a human.
                    println!("redrive=skipped tx_id={tx_uuid} reason=unknown_transaction");
                }
            }
        }

        Commands::Distribute { tx_id } => {
            let pool = rvl_db::connect_from_env().await?;
            let tx_uuid = Uuid::parse_str(&tx_id).context("invalid tx_id uuid")?;

            match rvl_db::distribute_transaction(&pool, tx_uuid).await? {
                DistributeOutcome::Applied(outcome) => println!(
                    "distribute=ok tx_id={} commission_created={} splits_created={}",
                    tx_uuid, outcome.commission_created, outcome.splits_created
                ),
                DistributeOutcome::Skipped => {
                    println!("distribute=skipped tx_id={tx_uuid} reason=unknown_transaction")
                }
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
