use crate::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redress_types::{
    AttemptId, AttemptStatus, BankRecord, BillingAttempt, BillingModel, BlacklistEntry,
    Chargeback, Debtor, DebtorId, DebtorProfile, DebtorStatus, Meta, NewBillingAttempt,
    NewBlacklistEntry, NewChargeback, NewDebtor, NewUpload, Phase, PhaseStatus, ProfileId,
    SkipReason, Upload, UploadId, UploadStatus, ValidationStatus,
};
use std::collections::{HashMap, HashSet};

/// Which debtors a billing run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingTarget {
    Model(BillingModel),
    All,
}

/// Latest in-flight (pending or approved) attempt for an IBAN hash,
/// used by the cooldown rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightAttempt {
    pub iban_hash: String,
    pub status: AttemptStatus,
    pub created_at: DateTime<Utc>,
}

/// Storage interface for uploads and their phase bookkeeping.
#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn create_upload(&self, new: NewUpload) -> StoreResult<Upload>;

    async fn get_upload(&self, id: UploadId) -> StoreResult<Option<Upload>>;

    async fn set_upload_status(&self, id: UploadId, status: UploadStatus) -> StoreResult<()>;

    async fn set_total_rows(&self, id: UploadId, total_rows: i64) -> StoreResult<()>;

    async fn set_column_mapping(&self, id: UploadId, mapping: Meta) -> StoreResult<()>;

    /// Transition one phase marker. The caller holds the phase job lock;
    /// the store only records the state.
    async fn set_phase_status(
        &self,
        id: UploadId,
        phase: Phase,
        status: PhaseStatus,
    ) -> StoreResult<()>;

    /// Atomically add to the processed/failed counters.
    async fn bump_upload_counters(
        &self,
        id: UploadId,
        processed: i64,
        failed: i64,
    ) -> StoreResult<()>;

    /// Atomically add to the per-reason skip histogram in `meta.skipped`.
    async fn bump_skip_counts(
        &self,
        id: UploadId,
        counts: &[(SkipReason, i64)],
    ) -> StoreResult<()>;

    /// Append row-error samples to `meta.errors`, capped server-side.
    async fn append_error_samples(
        &self,
        id: UploadId,
        samples: &[Meta],
        cap: usize,
    ) -> StoreResult<()>;

    /// Shallow-merge a patch document into `meta`.
    async fn merge_upload_meta(&self, id: UploadId, patch: Meta) -> StoreResult<()>;
}

/// Storage interface for debtors.
#[async_trait]
pub trait DebtorStore: Send + Sync {
    async fn insert_debtors(&self, rows: Vec<NewDebtor>) -> StoreResult<Vec<Debtor>>;

    async fn get_debtor(&self, id: DebtorId) -> StoreResult<Option<Debtor>>;

    async fn list_debtors_for_upload(&self, upload_id: UploadId) -> StoreResult<Vec<Debtor>>;

    /// Debtors of an upload awaiting validation.
    async fn unvalidated_debtors(&self, upload_id: UploadId) -> StoreResult<Vec<Debtor>>;

    /// Valid debtors of an upload (VOP input).
    async fn valid_debtors(&self, upload_id: UploadId) -> StoreResult<Vec<Debtor>>;

    async fn update_validation(
        &self,
        id: DebtorId,
        status: ValidationStatus,
        errors: Vec<String>,
        validated_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn set_debtor_status(&self, id: DebtorId, status: DebtorStatus) -> StoreResult<()>;

    async fn set_selected_for_bav(&self, ids: &[DebtorId], selected: bool) -> StoreResult<()>;

    /// IBAN hashes (from the given set) having a recovered debtor outside
    /// the given upload.
    async fn recovered_iban_hashes(
        &self,
        hashes: &[String],
        exclude_upload: UploadId,
    ) -> StoreResult<HashSet<String>>;

    /// The §4.6-shaped billing selection: valid, still uploaded, model
    /// matches the target (or no profile / target all), recurring profile
    /// or no in-flight attempt, and no BAV mismatch on record.
    async fn billable_debtors(
        &self,
        upload_id: UploadId,
        target: BillingTarget,
    ) -> StoreResult<Vec<Debtor>>;

    /// Recovered debtors, oldest first, for exports.
    async fn recovered_debtors(&self, limit: usize, offset: usize) -> StoreResult<Vec<Debtor>>;

    /// The most recent debtor row for an IBAN hash (recurring billing
    /// bills the profile through its latest known debtor).
    async fn latest_debtor_for_hash(&self, iban_hash: &str) -> StoreResult<Option<Debtor>>;
}

/// Storage interface for per-IBAN debtor profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, id: ProfileId) -> StoreResult<Option<DebtorProfile>>;

    async fn get_profile_by_hash(&self, iban_hash: &str) -> StoreResult<Option<DebtorProfile>>;

    /// Batched lookup for import-time exclusivity checks.
    async fn profiles_by_hashes(
        &self,
        hashes: &[String],
    ) -> StoreResult<HashMap<String, DebtorProfile>>;

    /// Get-or-create outside the billing transaction (import path). The
    /// existing profile wins; nothing is overwritten.
    async fn ensure_profile(
        &self,
        iban_hash: &str,
        iban_masked: &str,
        billing_model: BillingModel,
        currency: &str,
    ) -> StoreResult<DebtorProfile>;

    /// Full-row update outside the billing transaction (webhook and
    /// reconciler side-effects; they re-check state optimistically).
    async fn update_profile(&self, profile: &DebtorProfile) -> StoreResult<()>;

    /// Active recurring profiles whose cycle lock has expired.
    async fn profiles_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<DebtorProfile>>;
}

/// Storage interface for billing attempts.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn get_attempt(&self, id: AttemptId) -> StoreResult<Option<BillingAttempt>>;

    async fn find_attempt_by_unique_id(
        &self,
        unique_id: &str,
    ) -> StoreResult<Option<BillingAttempt>>;

    /// Hashes (from the given set) with any chargebacked attempt.
    async fn chargebacked_hashes(&self, hashes: &[String]) -> StoreResult<HashSet<String>>;

    /// Latest in-flight attempt per hash created at or after `since`.
    async fn in_flight_by_hashes(
        &self,
        hashes: &[String],
        since: DateTime<Utc>,
    ) -> StoreResult<HashMap<String, InFlightAttempt>>;

    async fn update_attempt_status(
        &self,
        id: AttemptId,
        status: AttemptStatus,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> StoreResult<()>;

    /// Record chargeback fields on the attempt row.
    async fn mark_attempt_chargebacked(
        &self,
        id: AttemptId,
        chargebacked_at: DateTime<Utc>,
        reason_code: Option<String>,
        error_code: Option<String>,
    ) -> StoreResult<()>;

    /// Shallow-merge a patch document into the attempt `meta`.
    async fn merge_attempt_meta(&self, id: AttemptId, patch: Meta) -> StoreResult<()>;

    /// Pending attempts eligible for reconciliation: older than
    /// `older_than`, carrying a gateway unique id, with fewer than
    /// `max_recon_attempts` reconciliation calls; ordered by created_at
    /// ascending with never-reconciled attempts first.
    async fn pending_for_reconciliation(
        &self,
        older_than: DateTime<Utc>,
        max_recon_attempts: i32,
        limit: usize,
    ) -> StoreResult<Vec<BillingAttempt>>;

    /// Bump the reconciliation counter and stamp the poll time.
    async fn record_reconciliation(&self, id: AttemptId, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Storage interface for VOP evaluation logs.
#[async_trait]
pub trait VopLogStore: Send + Sync {
    async fn insert_vop_log(&self, new: redress_types::NewVopLog) -> StoreResult<redress_types::VopLog>;

    /// Debtors of an upload with a recorded BAV `no` match.
    async fn bav_mismatch_debtors(&self, upload_id: UploadId) -> StoreResult<HashSet<DebtorId>>;

    async fn list_vop_logs_for_upload(
        &self,
        upload_id: UploadId,
    ) -> StoreResult<Vec<redress_types::VopLog>>;
}

/// Storage interface for the blacklist.
#[async_trait]
pub trait BlacklistStore: Send + Sync {
    /// Insert an entry; an existing entry for the same IBAN hash wins and
    /// is returned unchanged (idempotent).
    async fn add_blacklist_entry(&self, new: NewBlacklistEntry) -> StoreResult<BlacklistEntry>;

    async fn remove_blacklist_entry(&self, iban_hash: &str) -> StoreResult<bool>;

    /// Hashes (from the given set) present on the blacklist.
    async fn blacklisted_hashes(&self, hashes: &[String]) -> StoreResult<HashSet<String>>;

    /// Case-folded `(first, last)` pairs present on the blacklist.
    async fn blacklisted_names(
        &self,
        names: &[(String, String)],
    ) -> StoreResult<HashSet<(String, String)>>;

    /// Case-folded emails present on the blacklist.
    async fn blacklisted_emails(&self, emails: &[String]) -> StoreResult<HashSet<String>>;
}

/// Storage interface for chargeback records.
#[async_trait]
pub trait ChargebackStore: Send + Sync {
    /// Insert unless a chargeback for the same original transaction
    /// exists; returns the stored record and whether it was created now.
    async fn insert_chargeback(&self, new: NewChargeback) -> StoreResult<(Chargeback, bool)>;

    async fn chargeback_for_transaction(
        &self,
        original_transaction_unique_id: &str,
    ) -> StoreResult<Option<Chargeback>>;
}

/// Storage interface for the local bank directory.
#[async_trait]
pub trait BankStore: Send + Sync {
    async fn get_bank(&self, country: &str, bank_code: &str) -> StoreResult<Option<BankRecord>>;

    async fn upsert_bank(&self, record: BankRecord) -> StoreResult<()>;
}

/// The transactional section of the billing hot path.
///
/// The profile row is locked for the lifetime of the transaction; every
/// exclusivity and cycle-lock re-check happens through this object.
/// Dropping without [`BillingTxn::commit`] rolls back on the PostgreSQL
/// adapter; the memory adapter serializes transactions on a store-level
/// mutex and applies writes eagerly.
#[async_trait]
pub trait BillingTxn: Send {
    /// Load the profile for this hash under a row lock.
    async fn profile_for_update(&mut self, iban_hash: &str)
        -> StoreResult<Option<DebtorProfile>>;

    /// Create the profile for this hash (caller checked absence under the
    /// lock).
    async fn create_profile(
        &mut self,
        iban_hash: &str,
        iban_masked: &str,
        billing_model: BillingModel,
        currency: &str,
    ) -> StoreResult<DebtorProfile>;

    async fn save_profile(&mut self, profile: &DebtorProfile) -> StoreResult<()>;

    /// Next monotonic attempt number for a debtor (max existing + 1).
    async fn next_attempt_number(&mut self, debtor_id: DebtorId) -> StoreResult<i32>;

    async fn insert_attempt(&mut self, new: NewBillingAttempt) -> StoreResult<BillingAttempt>;

    async fn set_debtor_status(&mut self, id: DebtorId, status: DebtorStatus) -> StoreResult<()>;

    async fn link_profile(&mut self, debtor_id: DebtorId, profile_id: ProfileId)
        -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Entry point for billing transactions.
#[async_trait]
pub trait TxnStore: Send + Sync {
    async fn begin_billing(&self) -> StoreResult<Box<dyn BillingTxn>>;
}

/// Unified store bundle consumed by the pipeline phases.
pub trait Store:
    UploadStore
    + DebtorStore
    + ProfileStore
    + AttemptStore
    + VopLogStore
    + BlacklistStore
    + ChargebackStore
    + BankStore
    + TxnStore
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: UploadStore
        + DebtorStore
        + ProfileStore
        + AttemptStore
        + VopLogStore
        + BlacklistStore
        + ChargebackStore
        + BankStore
        + TxnStore
        + Send
        + Sync
{
}
