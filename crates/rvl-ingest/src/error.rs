use std::fmt;

/// Validation failures that reject a provider payload before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// A required string field is present but empty/whitespace.
    BlankField { field: &'static str },
    /// A monetary amount that must be strictly positive was not.
    NonPositiveAmount { field: &'static str, cents: i64 },
    /// A monetary amount that must be non-negative was not.
    NegativeAmount { field: &'static str, cents: i64 },
    /// Reported fee exceeds the gross amount.
    FeeExceedsGross { gross_cents: i64, fee_cents: i64 },
    /// Currency code outside the supported set.
    UnknownCurrency { raw: String },
    /// Platform string outside the supported set.
    UnknownPlatform { raw: String },
}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::BlankField { field } => {
                write!(f, "payload field '{field}' is blank")
            }
            NormalizeError::NonPositiveAmount { field, cents } => {
                write!(f, "payload field '{field}' must be > 0 cents, got {cents}")
            }
            NormalizeError::NegativeAmount { field, cents } => {
                write!(f, "payload field '{field}' must be >= 0 cents, got {cents}")
            }
            NormalizeError::FeeExceedsGross { gross_cents, fee_cents } => {
                write!(f, "fee {fee_cents} cents exceeds gross {gross_cents} cents")
            }
            NormalizeError::UnknownCurrency { raw } => {
                write!(f, "unsupported currency '{raw}'")
            }
            NormalizeError::UnknownPlatform { raw } => {
                write!(f, "unsupported platform '{raw}'")
            }
        }
    }
}

impl std::error::Error for NormalizeError {}
