//! rvl-testkit
//!
//! An in-memory ledger with the same transactional semantics as the
//! Postgres store: conditional gate insert, create-iff-absent writer,
//! all-or-nothing apply with per-identity conditional entry inserts.
//! Scenario tests drive the full pipeline (normalize → ingest → dispatch →
//! distribute) against it without a database.
//!
//! Not a mock: every guarantee the real store enforces with constraints is
//! enforced here with map keys, so a pipeline bug that would double-pay in
//! production also fails the scenario suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use rvl_config::{CommissionSettings, PartnershipSettings};
use rvl_dispatch::{AbandonSink, DistributionHandler};
use rvl_engine::{plan_distribution, CommissionDraft, DistributionPlan, PartnerSplitDraft};
use rvl_schemas::Transaction;

// ---------------------------------------------------------------------------
// In-memory ledger
// ---------------------------------------------------------------------------

/// Entry identity key: (tx_id, beneficiary_id, kind).
type IdentityKey = (Uuid, String, &'static str);

#[derive(Default)]
struct State {
    tx_keys: HashMap<String, Uuid>,
    transactions: HashMap<Uuid, Transaction>,
    referrals: HashMap<(String, String), String>,
    commission: CommissionSettings,
    partnership: PartnershipSettings,
    commission_entries: HashMap<IdentityKey, CommissionDraft>,
    split_entries: HashMap<IdentityKey, PartnerSplitDraft>,
    affiliate_pending: HashMap<String, i64>,
    partner_pending: HashMap<String, i64>,
}

/// Result of one in-memory ingest (gate + writer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemIngest {
    pub tx_id: Uuid,
    pub created: bool,
}

/// What one apply wrote (mirrors the store's apply outcome).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemApplyOutcome {
    pub commission_created: bool,
    pub splits_created: usize,
}

pub struct MemLedger {
    state: Mutex<State>,
    /// Failure injection: the next N `process` calls fail before touching
    /// any state, simulating a store outage seen by the dispatcher.
    fail_next: AtomicU32,
}

impl Default for MemLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_next: AtomicU32::new(0),
        }
    }

    pub fn set_commission_settings(&self, settings: CommissionSettings) {
        self.lock().commission = settings;
    }

    pub fn set_partnership_settings(&self, settings: PartnershipSettings) {
        self.lock().partnership = settings;
    }

    pub fn set_referral(&self, tenant_id: &str, user_uid: &str, affiliate_id: &str) {
        self.lock()
            .referrals
            .insert((tenant_id.to_string(), user_uid.to_string()), affiliate_id.to_string());
    }

    /// Make the next `n` distribution attempts fail.
    pub fn fail_next_attempts(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Gate: claim (or re-read) the id for a dedupe key.
    pub fn acquire_tx_key(&self, dedupe_key: &str) -> Result<Uuid> {
        if dedupe_key.trim().is_empty() {
            bail!("dedupe_key must not be blank");
        }
        let mut state = self.lock();
        Ok(*state.tx_keys.entry(dedupe_key.to_string()).or_insert_with(Uuid::new_v4))
    }

    /// Gate + writer for one normalized transaction.
    pub fn ingest(&self, tx: &Transaction) -> Result<MemIngest> {
        let tx_id = self.acquire_tx_key(&tx.dedupe_key)?;
        let mut state = self.lock();
        let created = match state.transactions.entry(tx_id) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(tx.clone());
                true
            }
            std::collections::hash_map::Entry::Occupied(_) => false,
        };
        Ok(MemIngest { tx_id, created })
    }

    pub fn transaction(&self, tx_id: Uuid) -> Option<Transaction> {
        self.lock().transactions.get(&tx_id).cloned()
    }

    /// Plan + apply for one transaction id, exactly like the store-backed
    /// orchestration. Unknown ids are an error here (tests control their own
    /// ids, so an unknown id is a test bug, not an operational event).
    pub fn distribute(&self, tx_id: Uuid) -> Result<MemApplyOutcome> {
        let mut state = self.lock();
        let tx = state
            .transactions
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown transaction: {tx_id}"))?;
        let affiliate = state
            .referrals
            .get(&(tx.tenant_id.clone(), tx.user_uid.clone()))
            .cloned();

        let plan = plan_distribution(
            tx_id,
            &tx,
            affiliate.as_deref(),
            &state.commission,
            &state.partnership,
            Utc::now(),
        )?;
        Ok(Self::apply_locked(&mut state, &plan))
    }

    /// All-or-nothing apply under one lock: entry insert iff the identity is
    /// new, balance increment iff the entry inserted.
    pub fn apply(&self, plan: &DistributionPlan) -> MemApplyOutcome {
        Self::apply_locked(&mut self.lock(), plan)
    }

    fn apply_locked(state: &mut State, plan: &DistributionPlan) -> MemApplyOutcome {
        let mut outcome = MemApplyOutcome::default();

        if let Some(commission) = &plan.commission {
            let key = (commission.tx_id, commission.affiliate_id.clone(), commission.kind.as_str());
            if !state.commission_entries.contains_key(&key) {
                state.commission_entries.insert(key, commission.clone());
                *state.affiliate_pending.entry(commission.affiliate_id.clone()).or_insert(0) +=
                    commission.amount_cents;
                outcome.commission_created = true;
            }
        }

        for split in &plan.splits {
            let key = (split.tx_id, split.partner_id.clone(), split.kind.as_str());
            if !state.split_entries.contains_key(&key) {
                state.split_entries.insert(key, split.clone());
                *state.partner_pending.entry(split.partner_id.clone()).or_insert(0) +=
                    split.amount_cents;
                outcome.splits_created += 1;
            }
        }

        outcome
    }

    // --- Read surface ------------------------------------------------------

    pub fn affiliate_pending_cents(&self, affiliate_id: &str) -> i64 {
        self.lock().affiliate_pending.get(affiliate_id).copied().unwrap_or(0)
    }

    pub fn partner_pending_cents(&self, partner_id: &str) -> i64 {
        self.lock().partner_pending.get(partner_id).copied().unwrap_or(0)
    }

    pub fn commission_entries_for_tx(&self, tx_id: Uuid) -> Vec<CommissionDraft> {
        self.lock()
            .commission_entries
            .iter()
            .filter(|((id, _, _), _)| *id == tx_id)
            .map(|(_, draft)| draft.clone())
            .collect()
    }

    pub fn split_entries_for_tx(&self, tx_id: Uuid) -> Vec<PartnerSplitDraft> {
        self.lock()
            .split_entries
            .iter()
            .filter(|((id, _, _), _)| *id == tx_id)
            .map(|(_, draft)| draft.clone())
            .collect()
    }

    pub fn sum_commission_cents(&self, affiliate_id: &str) -> i64 {
        self.lock()
            .commission_entries
            .iter()
            .filter(|((_, aff, _), _)| aff == affiliate_id)
            .map(|(_, draft)| draft.amount_cents)
            .sum()
    }

    pub fn sum_split_cents(&self, partner_id: &str) -> i64 {
        self.lock()
            .split_entries
            .iter()
            .filter(|((_, partner, _), _)| partner == partner_id)
            .map(|(_, draft)| draft.amount_cents)
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Test-only state; a poisoned lock means a test already panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DistributionHandler for MemLedger {
    async fn process(&self, tx_id: Uuid) -> Result<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            bail!("injected store outage ({remaining} failures left)");
        }
        self.distribute(tx_id).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Abandonment recording
// ---------------------------------------------------------------------------

/// Sink that records abandoned units for assertions.
#[derive(Default)]
pub struct MemAbandonSink {
    abandoned: Mutex<Vec<(Uuid, u32, String)>>,
}

impl MemAbandonSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn abandoned(&self) -> Vec<(Uuid, u32, String)> {
        self.abandoned.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AbandonSink for MemAbandonSink {
    async fn abandoned(&self, tx_id: Uuid, attempts: u32, last_error: &str) {
        self.abandoned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((tx_id, attempts, last_error.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A representative web-checkout transaction for scenario tests.
pub fn sample_stripe_tx(dedupe_key: &str) -> Transaction {
    use rvl_schemas::{Currency, Monetary, Platform, StoreIds, StripeStoreIds, TxEvent};

    Transaction {
        tenant_id: "t1".into(),
        user_uid: "u1".into(),
        product_id: "plan-pro".into(),
        platform: Platform::StripeWeb,
        event: TxEvent::InitialPurchase,
        store_ids: StoreIds {
            stripe: Some(StripeStoreIds {
                invoice_id: Some("in_123".into()),
                charge_id: Some("ch_123".into()),
                balance_transaction_id: Some("txn_123".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
        monetary: Monetary {
            currency: Currency::Brl,
            gross_cents: 10_000,
            fee_cents: Some(300),
            net_after_fees_cents: Some(9_700),
        },
        occurred_at: Utc::now(),
        dedupe_key: dedupe_key.to_string(),
    }
}
