//! Core domain types for the redress recovery pipeline.
//!
//! This crate defines the shared vocabulary of the system:
//! - entities (uploads, debtors, profiles, billing attempts, VOP logs,
//!   blacklist entries, chargebacks)
//! - status enums with explicit transition rules
//! - skip classification for the deduplication engine
//! - typed configuration for the closed option set
//!
//! Design stance:
//! - Amounts are [`rust_decimal::Decimal`], never floats.
//! - Entity ids are `i64` surrogate keys; cross-entity references are plain
//!   integer foreign keys, not in-memory object graphs.
//! - Status transitions are exhaustive matches so that adding a variant
//!   forces every call site to be revisited.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod config;
mod entities;
mod skip;
mod status;

pub use config::{
    BavConfig, BillingConfig, ChargebackConfig, CircuitConfig, ConfigError, IngestConfig,
    ModelRange, RateLimitConfig, ReconcileConfig, RedressConfig,
};
pub use entities::{
    AttemptContext, BankRecord, BillingAttempt, BlacklistEntry, Chargeback, Debtor, DebtorProfile,
    Meta, NewBillingAttempt, NewBlacklistEntry, NewChargeback, NewDebtor, NewUpload, NewVopLog,
    Upload, UploadPhases, VopLog,
};
pub use skip::{SkipClassification, SkipReason};
pub use status::{
    AttemptStatus, BillingModel, ChargebackSource, DebtorStatus, NameMatch, Phase, PhaseStatus,
    UploadStatus, ValidationStatus, VopResult,
};

/// Upload surrogate key.
pub type UploadId = i64;
/// Debtor surrogate key.
pub type DebtorId = i64;
/// Debtor-profile surrogate key.
pub type ProfileId = i64;
/// Billing-attempt surrogate key.
pub type AttemptId = i64;
