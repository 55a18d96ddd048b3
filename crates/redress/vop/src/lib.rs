//! Verification of Payee: a weighted 0-100 readiness score per debtor,
//! combining IBAN validity, SEPA membership, bank identification, SDD
//! capability and the sampled BAV name match.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod bank;
mod bav;
mod phase;
mod score;

pub use bank::{BankDirectory, BankLookup, RemoteBank, StaticBankLookup};
pub use bav::{BavClient, BavSampler, MockBavClient};
pub use phase::{run_vop, VopJob, VopRunner};
pub use score::{score, VopInputs};
