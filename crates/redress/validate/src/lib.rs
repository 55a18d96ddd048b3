//! Validation engine: ordered structural and semantic checks per debtor.
//!
//! Checks run in a fixed order and collect messages; a row is `valid`
//! only with an empty error list. Per-row failures never abort the
//! phase. Blacklist name/email checks reuse the dedup rules through the
//! same batched store queries.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod checks;
mod phase;

pub use checks::{validate_debtor, RowContext, MAX_AMOUNT, MAX_NAME_PART_LEN, MIN_AMOUNT};
pub use phase::{run_validation, ValidationJob, ValidationSummary};
