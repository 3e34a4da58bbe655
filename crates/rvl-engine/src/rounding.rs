//! Percentage-of-cents arithmetic.
//!
//! One rounding rule is used for every beneficiary: **round half away from
//! zero**. Repeated computation of the same plan must produce identical cent
//! amounts, and audit sums must reconcile across retries, so the rule lives
//! in exactly one place.

/// Apply a percentage rate to a cent amount, rounding half away from zero.
///
/// `f64::round` already rounds half away from zero, which is the documented
/// rule here; the indirection exists so no call site reaches for a different
/// rounding mode.
pub fn pct_of_cents(base_cents: i64, pct: f64) -> i64 {
    (base_cents as f64 * pct).round() as i64
}
