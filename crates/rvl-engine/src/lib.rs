//! rvl-engine
//!
//! Distribution planning:
//! - resolve the percentage base (net-of-fees vs gross)
//! - classify recurrence and pick the commission rate
//! - compute affiliate commission and partner split amounts in cents
//! - produce entry drafts with deterministic composite identity
//! - pure deterministic logic (no IO, no clock reads, no store wiring)
//!
//! The plan is a value; applying it (atomic entry inserts + balance
//! increments) is the store's job.

mod plan;
mod rounding;

pub use plan::{
    plan_distribution, CommissionDraft, DistributionPlan, PartnerSplitDraft, PlanError,
};
pub use rounding::pct_of_cents;
