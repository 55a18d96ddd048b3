use crate::status::{
    AttemptStatus, BillingModel, ChargebackSource, DebtorStatus, NameMatch, PhaseStatus,
    UploadStatus, ValidationStatus, VopResult,
};
use crate::{AttemptId, DebtorId, ProfileId, UploadId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Free-form JSON document column shared by several entities.
pub type Meta = serde_json::Value;

/// Per-phase progress markers on an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPhases {
    pub validation: PhaseStatus,
    pub vop: PhaseStatus,
    pub billing: PhaseStatus,
    pub reconciliation: PhaseStatus,
}

impl Default for UploadPhases {
    fn default() -> Self {
        Self {
            validation: PhaseStatus::Idle,
            vop: PhaseStatus::Idle,
            billing: PhaseStatus::Idle,
            reconciliation: PhaseStatus::Idle,
        }
    }
}

/// One submitted spreadsheet and its full lifecycle across phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub id: UploadId,
    pub original_filename: String,
    pub stored_path: String,
    pub size_bytes: i64,
    pub uploader_id: i64,
    pub total_rows: i64,
    pub processed_records: i64,
    pub failed_records: i64,
    pub status: UploadStatus,
    pub phases: UploadPhases,
    /// header -> canonical field, decided once at ingest.
    pub column_mapping: Meta,
    /// Row errors (capped), skip histogram, batch ids, operator notes.
    pub meta: Meta,
    /// Billing model requested for the upload as a whole.
    pub billing_model: BillingModel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert form of [`Upload`].
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub original_filename: String,
    pub stored_path: String,
    pub size_bytes: i64,
    pub uploader_id: i64,
    pub billing_model: BillingModel,
}

/// One accepted spreadsheet row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debtor {
    pub id: DebtorId,
    pub upload_id: UploadId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    /// Normalized IBAN (uppercase, no separators).
    pub iban: String,
    /// SHA-256 of the normalized IBAN, hex-encoded. Two debtors may share
    /// it across uploads; it is the cross-upload identity of the account.
    pub iban_hash: String,
    pub iban_valid: bool,
    pub country: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    /// The raw row as parsed, for audit and re-validation.
    pub raw_row: Meta,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<String>,
    pub validated_at: Option<DateTime<Utc>>,
    pub status: DebtorStatus,
    /// Set at import when the dedup/exclusivity rules excluded this row;
    /// skipped debtors never enter validation or billing.
    pub skip_reason: Option<crate::skip::SkipReason>,
    /// Flagged for a BAV name-match call by the sampling selector.
    pub selected_for_bav: bool,
    pub profile_id: Option<ProfileId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert form of [`Debtor`].
#[derive(Debug, Clone)]
pub struct NewDebtor {
    pub upload_id: UploadId,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub iban: String,
    pub iban_hash: String,
    pub iban_valid: bool,
    pub country: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub raw_row: Meta,
    pub skip_reason: Option<crate::skip::SkipReason>,
    pub profile_id: Option<ProfileId>,
}

/// Per-IBAN long-lived billing record, shared across uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebtorProfile {
    pub id: ProfileId,
    /// Unique; the account identity.
    pub iban_hash: String,
    pub iban_masked: String,
    pub billing_model: BillingModel,
    /// Fixed recurring amount for non-legacy models; set on first use.
    pub billing_amount: Option<Decimal>,
    pub currency: String,
    pub is_active: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_billed_at: Option<DateTime<Utc>>,
    /// Cycle lock: no non-legacy attempt may be persisted before this.
    pub next_bill_at: Option<DateTime<Utc>>,
    /// Never negative; chargebacks deduct with a clamp at zero.
    pub lifetime_revenue: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a billing attempt originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptContext {
    BatchUpload,
    RecurringBilling,
}

impl AttemptContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchUpload => "batch_upload",
            Self::RecurringBilling => "recurring_billing",
        }
    }
}

/// One charge submitted to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingAttempt {
    pub id: AttemptId,
    pub debtor_id: DebtorId,
    /// Absent for recurring attempts not tied to an upload.
    pub upload_id: Option<UploadId>,
    pub profile_id: Option<ProfileId>,
    pub emp_account_id: Option<String>,
    /// Monotonic per debtor, starting at 1.
    pub attempt_number: i32,
    /// Gateway-assigned; unique when present.
    pub unique_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub billing_model: BillingModel,
    pub context: AttemptContext,
    pub status: AttemptStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub chargeback_reason_code: Option<String>,
    pub chargebacked_at: Option<DateTime<Utc>>,
    pub reconciliation_attempts: i32,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub meta: Meta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert form of [`BillingAttempt`].
#[derive(Debug, Clone)]
pub struct NewBillingAttempt {
    pub debtor_id: DebtorId,
    pub upload_id: Option<UploadId>,
    pub profile_id: Option<ProfileId>,
    pub emp_account_id: Option<String>,
    pub attempt_number: i32,
    pub unique_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub billing_model: BillingModel,
    pub context: AttemptContext,
    pub status: AttemptStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub meta: Meta,
}

/// Result of one VOP evaluation for a debtor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VopLog {
    pub id: i64,
    pub debtor_id: DebtorId,
    pub upload_id: UploadId,
    pub iban_masked: String,
    pub iban_valid: bool,
    pub bank_identified: bool,
    pub bank_name: Option<String>,
    pub bic: Option<String>,
    pub country: Option<String>,
    pub vop_score: u8,
    pub result: VopResult,
    /// True iff a BAV call completed with a definitive yes/partial/no.
    pub bav_verified: bool,
    pub bav_name_match: NameMatch,
    pub meta: Meta,
    pub created_at: DateTime<Utc>,
}

/// Insert form of [`VopLog`].
#[derive(Debug, Clone)]
pub struct NewVopLog {
    pub debtor_id: DebtorId,
    pub upload_id: UploadId,
    pub iban_masked: String,
    pub iban_valid: bool,
    pub bank_identified: bool,
    pub bank_name: Option<String>,
    pub bic: Option<String>,
    pub country: Option<String>,
    pub vop_score: u8,
    pub result: VopResult,
    pub bav_verified: bool,
    pub bav_name_match: NameMatch,
    pub meta: Meta,
}

/// An account (and optionally a person) barred from billing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: i64,
    /// Unique; compares against debtor iban hashes.
    pub iban_hash: String,
    pub iban: String,
    /// Case-folded on compare.
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub reason: String,
    pub source: String,
    pub added_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert form of [`BlacklistEntry`].
#[derive(Debug, Clone)]
pub struct NewBlacklistEntry {
    pub iban_hash: String,
    pub iban: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub reason: String,
    pub source: String,
    pub added_by: Option<String>,
}

/// A post-settlement reversal reported by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chargeback {
    pub id: i64,
    pub billing_attempt_id: AttemptId,
    pub debtor_id: DebtorId,
    /// Unique; one chargeback per original transaction.
    pub original_transaction_unique_id: String,
    pub cb_type: Option<String>,
    pub reason_code: Option<String>,
    pub reason_description: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub post_date: Option<DateTime<Utc>>,
    pub import_date: DateTime<Utc>,
    pub source: ChargebackSource,
    pub raw_response: Meta,
}

/// Insert form of [`Chargeback`].
#[derive(Debug, Clone)]
pub struct NewChargeback {
    pub billing_attempt_id: AttemptId,
    pub debtor_id: DebtorId,
    pub original_transaction_unique_id: String,
    pub cb_type: Option<String>,
    pub reason_code: Option<String>,
    pub reason_description: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub post_date: Option<DateTime<Utc>>,
    pub source: ChargebackSource,
    pub raw_response: Meta,
}

/// One row of the local bank directory, keyed (country, bank_code).
///
/// Filled from the remote lookup service and reused for 24 h via the KV
/// on top of this table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankRecord {
    pub country: String,
    pub bank_code: String,
    pub name: String,
    pub bic: Option<String>,
    /// Whether the bank supports SEPA direct debit.
    pub sdd_supported: bool,
    pub updated_at: DateTime<Utc>,
}

impl DebtorProfile {
    /// Deduct a chargeback from lifetime revenue, clamped at zero.
    pub fn deduct_revenue(&mut self, amount: Decimal) {
        self.lifetime_revenue = (self.lifetime_revenue - amount).max(Decimal::ZERO);
    }

    /// Whether the cycle lock blocks a non-legacy attempt at `now`.
    pub fn cycle_locked(&self, now: DateTime<Utc>) -> bool {
        match self.next_bill_at {
            Some(next) => now < next,
            None => false,
        }
    }
}
