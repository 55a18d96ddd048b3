//! Relational store for the recovery pipeline.
//!
//! This crate defines the storage contract consumed by every phase:
//! - uploads and their per-phase progress
//! - debtors with validation state and skip bookkeeping
//! - per-IBAN debtor profiles (billing model, cycle lock, revenue)
//! - billing attempts, VOP logs, blacklist entries, chargebacks
//! - the local bank directory cache
//!
//! Design stance:
//! - PostgreSQL is the transactional source of truth; the in-memory
//!   adapter is deterministic and test-friendly.
//! - The billing hot path runs inside a [`BillingTxn`]: the profile row
//!   is loaded under a row lock and every re-check happens under that
//!   lock.
//! - Upload counters and meta documents are updated server-side in a
//!   single statement so concurrent chunk workers never read-modify-write.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StoreError, StoreResult};
pub use traits::{
    AttemptStore, BankStore, BillingTarget, BillingTxn, BlacklistStore, ChargebackStore,
    DebtorStore, InFlightAttempt, ProfileStore, Store, TxnStore, UploadStore, VopLogStore,
};

use std::sync::Arc;

/// Shared handle to the store implementation in use.
pub type StoreHandle = Arc<dyn Store>;
