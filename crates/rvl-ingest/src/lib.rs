//! rvl-ingest
//!
//! Event normalization: converts a provider-specific payload into one
//! canonical [`rvl_schemas::Transaction`].
//!
//! The variants form a **closed set**, one per event source:
//! - [`stripe::StripeInvoice`] / [`stripe::StripeCheckoutSession`] (web checkout)
//! - [`revenuecat::RevenueCatEvent`] (mobile subscription aggregator)
//! - [`appstore::AppleNotification`] (App Store server notification, decoded)
//!
//! Each payload is deserialized against a strict schema and validated before
//! a `Transaction` is produced; invalid payloads never reach the idempotency
//! gate. Webhook transport and signature verification happen upstream — this
//! crate consumes already-verified, already-decoded payload bodies.
//!
//! Every normalizer takes `now: DateTime<Utc>` instead of reading the clock,
//! keeping the whole crate pure and deterministic.

pub mod appstore;
pub mod revenuecat;
pub mod stripe;

mod error;

pub use error::NormalizeError;

pub(crate) fn require_non_blank(
    value: &str,
    field: &'static str,
) -> Result<(), NormalizeError> {
    if value.trim().is_empty() {
        return Err(NormalizeError::BlankField { field });
    }
    Ok(())
}

pub(crate) fn parse_currency(
    raw: Option<&str>,
) -> Result<rvl_schemas::Currency, NormalizeError> {
    match raw {
        // Providers occasionally omit the currency on zero-amount events;
        // the upstream account settles in BRL, so that is the fallback.
        None => Ok(rvl_schemas::Currency::Brl),
        Some(s) => {
            let lowered = s.to_ascii_lowercase();
            rvl_schemas::Currency::parse(&lowered)
                .ok_or(NormalizeError::UnknownCurrency { raw: s.to_string() })
        }
    }
}
