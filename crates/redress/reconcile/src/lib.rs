//! Reconciliation: periodic polling of pending attempts and bulk
//! transaction refresh from the gateway.
//!
//! Both paths funnel into the same post-status handlers the webhook
//! uses, so side-effects are identical whichever way an outcome is
//! discovered.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod refresh;
mod sweep;

pub use refresh::{run_emp_refresh, EmpRefreshJob};
pub use sweep::{run_reconciliation_chunk, ReconcileJob, ReconcileSummary, RECONCILE_CIRCUIT_KEY};
