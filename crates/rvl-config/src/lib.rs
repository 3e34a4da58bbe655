//! rvl-config
//!
//! Commission and partnership settings as **immutable snapshots**.
//!
//! The settings store holds two JSON documents (`commission`, `partnership`).
//! This crate parses them into typed snapshots with built-in defaults for
//! every field, so an absent or partial document is never an error — the
//! distribution run simply sees the defaults. Snapshots are loaded once per
//! distribution run and passed by reference; nothing here is long-lived
//! mutable process state.
//!
//! `validate()` is a write-path guard (CLI settings edits). The read path
//! never validates: whatever was accepted at write time is applied as-is.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use rvl_schemas::BaseType;

// ---------------------------------------------------------------------------
// Commission settings
// ---------------------------------------------------------------------------

/// Default commission parameters applied when the settings document omits a
/// field (or the whole document is absent).
pub const DEFAULT_FIRST_PCT: f64 = 0.30;
pub const DEFAULT_RECURRING_PCT: f64 = 0.15;
pub const DEFAULT_COMMISSION_MONTHS: u32 = 12;
pub const DEFAULT_COOKIE_TTL_DAYS: u32 = 60;
pub const DEFAULT_MIN_PAYOUT_CENTS: i64 = 20_000;
pub const DEFAULT_HOLD_DAYS: i64 = 14;

/// Tunable defaults for affiliate commission computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionDefaults {
    /// Rate applied to a first purchase.
    pub first_pct: f64,
    /// Rate applied to a renewal.
    pub recurring_pct: f64,
    /// How many recurrences remain commissionable.
    pub months: u32,
    /// Referral attribution window.
    pub cookie_ttl_days: u32,
    /// Minimum accumulated balance before payout is offered.
    pub min_payout_cents: i64,
    /// Days a new commission entry stays pending before release.
    pub hold_days: i64,
    /// Whether rates apply to net-of-fees or gross amounts.
    pub base: BaseType,
}

impl Default for CommissionDefaults {
    fn default() -> Self {
        Self {
            first_pct: DEFAULT_FIRST_PCT,
            recurring_pct: DEFAULT_RECURRING_PCT,
            months: DEFAULT_COMMISSION_MONTHS,
            cookie_ttl_days: DEFAULT_COOKIE_TTL_DAYS,
            min_payout_cents: DEFAULT_MIN_PAYOUT_CENTS,
            hold_days: DEFAULT_HOLD_DAYS,
            base: BaseType::Net,
        }
    }
}

/// Snapshot of the `commission` settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionSettings {
    pub defaults: CommissionDefaults,
}

impl CommissionSettings {
    /// Parse the stored JSON document, falling back to defaults field by
    /// field. `None` (document absent) yields the full default snapshot.
    pub fn from_doc(doc: Option<&Value>) -> Self {
        match doc {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_default(),
            None => Self::default(),
        }
    }

    /// Write-path validation: reject values the engine could not apply
    /// sensibly. Not called on the read path.
    pub fn validate(&self) -> Result<()> {
        let d = &self.defaults;
        if !(0.0..=1.0).contains(&d.first_pct) {
            bail!("commission first_pct must be within [0, 1], got {}", d.first_pct);
        }
        if !(0.0..=1.0).contains(&d.recurring_pct) {
            bail!(
                "commission recurring_pct must be within [0, 1], got {}",
                d.recurring_pct
            );
        }
        if d.hold_days < 0 {
            bail!("commission hold_days must be >= 0, got {}", d.hold_days);
        }
        if d.min_payout_cents < 0 {
            bail!(
                "commission min_payout_cents must be >= 0, got {}",
                d.min_payout_cents
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Partnership settings
// ---------------------------------------------------------------------------

pub const DEFAULT_HOLD_DAYS_PARTNERS: i64 = 14;

/// One partner's fixed share of the partnership base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerShare {
    pub partner_id: String,
    pub pct: f64,
}

/// Snapshot of the `partnership` settings document: an ordered set of
/// revenue shares plus the partner-side hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartnershipSettings {
    pub shares: Vec<PartnerShare>,
    pub hold_days_partners: i64,
}

impl Default for PartnershipSettings {
    fn default() -> Self {
        Self {
            shares: Vec::new(),
            hold_days_partners: DEFAULT_HOLD_DAYS_PARTNERS,
        }
    }
}

impl PartnershipSettings {
    /// Parse the stored JSON document; absent document means no partners.
    pub fn from_doc(doc: Option<&Value>) -> Self {
        match doc {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_default(),
            None => Self::default(),
        }
    }

    /// Write-path validation: each share within [0, 1], shares summing to at
    /// most 1.0, unique non-empty partner ids, non-negative hold.
    pub fn validate(&self) -> Result<()> {
        let mut sum = 0.0_f64;
        for s in &self.shares {
            if s.partner_id.trim().is_empty() {
                bail!("partnership share has empty partner_id");
            }
            if !(0.0..=1.0).contains(&s.pct) {
                bail!(
                    "partnership share for '{}' must be within [0, 1], got {}",
                    s.partner_id,
                    s.pct
                );
            }
            sum += s.pct;
        }
        // Tolerate float noise at the boundary (e.g. 0.5 + 0.5).
        if sum > 1.0 + 1e-9 {
            bail!("partnership shares sum to {sum}, exceeding 1.0");
        }
        let mut ids: Vec<&str> = self.shares.iter().map(|s| s.partner_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.shares.len() {
            bail!("partnership shares contain a duplicate partner_id");
        }
        if self.hold_days_partners < 0 {
            bail!(
                "partnership hold_days_partners must be >= 0, got {}",
                self.hold_days_partners
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_documents_yield_defaults() {
        let c = CommissionSettings::from_doc(None);
        assert_eq!(c.defaults.first_pct, 0.30);
        assert_eq!(c.defaults.recurring_pct, 0.15);
        assert_eq!(c.defaults.hold_days, 14);
        assert_eq!(c.defaults.base, BaseType::Net);

        let p = PartnershipSettings::from_doc(None);
        assert!(p.shares.is_empty());
        assert_eq!(p.hold_days_partners, 14);
    }

    #[test]
    fn partial_document_keeps_defaults_for_missing_fields() {
        let c = CommissionSettings::from_doc(Some(&json!({
            "defaults": { "first_pct": 0.25 }
        })));
        assert_eq!(c.defaults.first_pct, 0.25);
        assert_eq!(c.defaults.recurring_pct, 0.15);
        assert_eq!(c.defaults.min_payout_cents, 20_000);
    }

    #[test]
    fn malformed_document_falls_back_entirely() {
        let c = CommissionSettings::from_doc(Some(&json!("not an object")));
        assert_eq!(c, CommissionSettings::default());
    }

    #[test]
    fn partnership_document_parses_shares_in_order() {
        let p = PartnershipSettings::from_doc(Some(&json!({
            "shares": [
                { "partner_id": "A", "pct": 0.5 },
                { "partner_id": "B", "pct": 0.5 }
            ],
            "hold_days_partners": 30
        })));
        assert_eq!(p.shares.len(), 2);
        assert_eq!(p.shares[0].partner_id, "A");
        assert_eq!(p.shares[1].partner_id, "B");
        assert_eq!(p.hold_days_partners, 30);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_pct() {
        let mut c = CommissionSettings::default();
        c.defaults.first_pct = 1.5;
        assert!(c.validate().is_err());

        let p = PartnershipSettings {
            shares: vec![PartnerShare { partner_id: "A".into(), pct: -0.1 }],
            hold_days_partners: 14,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_overcommitted_shares() {
        let p = PartnershipSettings {
            shares: vec![
                PartnerShare { partner_id: "A".into(), pct: 0.6 },
                PartnerShare { partner_id: "B".into(), pct: 0.6 },
            ],
            hold_days_partners: 14,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_accepts_exact_full_allocation() {
        let p = PartnershipSettings {
            shares: vec![
                PartnerShare { partner_id: "A".into(), pct: 0.5 },
                PartnerShare { partner_id: "B".into(), pct: 0.5 },
            ],
            hold_days_partners: 14,
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_partner() {
        let p = PartnershipSettings {
            shares: vec![
                PartnerShare { partner_id: "A".into(), pct: 0.2 },
                PartnerShare { partner_id: "A".into(), pct: 0.2 },
            ],
            hold_days_partners: 14,
        };
        assert!(p.validate().is_err());
    }
}
