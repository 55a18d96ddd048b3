//! The billing core: per-upload orchestration, rate-limited chunk
//! workers, the per-IBAN profile engine with its cycle lock, and the
//! gateway outcome handlers shared with the webhook and reconciler
//! paths.
//!
//! Concurrency stance: nothing is serialized across debtors. Per-profile
//! correctness comes from the billing transaction (profile row locked
//! for its duration, every re-check under the lock); cross-worker
//! coordination (rate limits, circuit breaker, batch countdown, dispatch
//! lock) lives in the KV.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod eligibility;
mod orchestrator;
mod outcome;
mod worker;

pub use eligibility::{can_bill, BillRefusal};
pub use orchestrator::{
    run_recurring_sweep, BillingChunkJob, BillingOrchestrator, BILLING_CIRCUIT_KEY,
};
pub use outcome::{
    apply_attempt_status, deactivate_profile_for_chargeback, handle_success,
    should_auto_blacklist, void_attempt, CHARGEBACK_BLACKLIST_REASON,
};
pub use worker::{bill_one_debtor, BillResult, BillingDeps};
