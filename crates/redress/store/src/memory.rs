//! In-memory reference implementation of the store traits.
//!
//! Deterministic and test-friendly. Production deployments use the
//! PostgreSQL adapter as the transactional source of truth.

use crate::traits::{
    AttemptStore, BankStore, BillingTarget, BillingTxn, BlacklistStore, ChargebackStore,
    DebtorStore, InFlightAttempt, ProfileStore, TxnStore, UploadStore, VopLogStore,
};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redress_types::{
    AttemptId, AttemptStatus, BankRecord, BillingAttempt, BillingModel, BlacklistEntry,
    Chargeback, Debtor, DebtorId, DebtorProfile, DebtorStatus, Meta, NewBillingAttempt,
    NewBlacklistEntry, NewChargeback, NewDebtor, NewUpload, NewVopLog, Phase, PhaseStatus,
    ProfileId, SkipReason, Upload, UploadId, UploadPhases, UploadStatus, ValidationStatus,
    VopLog,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
struct Inner {
    uploads: HashMap<UploadId, Upload>,
    debtors: HashMap<DebtorId, Debtor>,
    profiles: HashMap<ProfileId, DebtorProfile>,
    attempts: HashMap<AttemptId, BillingAttempt>,
    vop_logs: HashMap<i64, VopLog>,
    blacklist: HashMap<i64, BlacklistEntry>,
    chargebacks: HashMap<i64, Chargeback>,
    banks: HashMap<(String, String), BankRecord>,
    seq: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn iban_hash_of(&self, debtor_id: DebtorId) -> Option<String> {
        self.debtors.get(&debtor_id).map(|d| d.iban_hash.clone())
    }
}

/// In-memory store adapter.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    /// Serializes billing transactions; coarse, but the adapter exists
    /// for tests and single-process runs.
    billing_gate: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

/// Shallow-merge `patch` into `target`; non-object patches replace.
fn merge_meta(target: &mut Meta, patch: Meta) {
    match (target, patch) {
        (Meta::Object(map), Meta::Object(patch_map)) => {
            for (k, v) in patch_map {
                map.insert(k, v);
            }
        }
        (slot, patch) => *slot = patch,
    }
}

fn lower(s: &str) -> String {
    s.trim().to_lowercase()
}

impl Inner {
    fn insert_debtor_row(&mut self, new: NewDebtor, now: DateTime<Utc>) -> Debtor {
        let id = self.next_id();
        let debtor = Debtor {
            id,
            upload_id: new.upload_id,
            first_name: new.first_name,
            last_name: new.last_name,
            email: new.email,
            iban: new.iban,
            iban_hash: new.iban_hash,
            iban_valid: new.iban_valid,
            country: new.country,
            amount: new.amount,
            currency: new.currency,
            raw_row: new.raw_row,
            validation_status: ValidationStatus::Pending,
            validation_errors: Vec::new(),
            validated_at: None,
            status: DebtorStatus::Uploaded,
            skip_reason: new.skip_reason,
            selected_for_bav: false,
            profile_id: new.profile_id,
            created_at: now,
            updated_at: now,
        };
        self.debtors.insert(id, debtor.clone());
        debtor
    }

    fn insert_attempt_row(
        &mut self,
        new: NewBillingAttempt,
        now: DateTime<Utc>,
    ) -> StoreResult<BillingAttempt> {
        if let Some(unique_id) = new.unique_id.as_deref() {
            let duplicate = self
                .attempts
                .values()
                .any(|a| a.unique_id.as_deref() == Some(unique_id));
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "billing attempt with unique_id {unique_id} already exists"
                )));
            }
        }
        let id = self.next_id();
        let attempt = BillingAttempt {
            id,
            debtor_id: new.debtor_id,
            upload_id: new.upload_id,
            profile_id: new.profile_id,
            emp_account_id: new.emp_account_id,
            attempt_number: new.attempt_number,
            unique_id: new.unique_id,
            amount: new.amount,
            currency: new.currency,
            billing_model: new.billing_model,
            context: new.context,
            status: new.status,
            error_code: new.error_code,
            error_message: new.error_message,
            chargeback_reason_code: None,
            chargebacked_at: None,
            reconciliation_attempts: 0,
            last_reconciled_at: None,
            meta: new.meta,
            created_at: now,
            updated_at: now,
        };
        self.attempts.insert(id, attempt.clone());
        Ok(attempt)
    }

    fn next_attempt_number_for(&self, debtor_id: DebtorId) -> i32 {
        self.attempts
            .values()
            .filter(|a| a.debtor_id == debtor_id)
            .map(|a| a.attempt_number)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn create_profile_row(
        &mut self,
        iban_hash: &str,
        iban_masked: &str,
        billing_model: BillingModel,
        currency: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<DebtorProfile> {
        if self.profiles.values().any(|p| p.iban_hash == iban_hash) {
            return Err(StoreError::Conflict(format!(
                "profile for iban hash {iban_hash} already exists"
            )));
        }
        let id = self.next_id();
        let profile = DebtorProfile {
            id,
            iban_hash: iban_hash.to_string(),
            iban_masked: iban_masked.to_string(),
            billing_model,
            billing_amount: None,
            currency: currency.to_string(),
            is_active: true,
            last_success_at: None,
            last_billed_at: None,
            next_bill_at: None,
            lifetime_revenue: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        };
        self.profiles.insert(id, profile.clone());
        Ok(profile)
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn create_upload(&self, new: NewUpload) -> StoreResult<Upload> {
        let mut inner = self.write()?;
        let now = Utc::now();
        let id = inner.next_id();
        let upload = Upload {
            id,
            original_filename: new.original_filename,
            stored_path: new.stored_path,
            size_bytes: new.size_bytes,
            uploader_id: new.uploader_id,
            total_rows: 0,
            processed_records: 0,
            failed_records: 0,
            status: UploadStatus::Pending,
            phases: UploadPhases::default(),
            column_mapping: Meta::Object(Default::default()),
            meta: Meta::Object(Default::default()),
            billing_model: new.billing_model,
            created_at: now,
            updated_at: now,
        };
        inner.uploads.insert(id, upload.clone());
        Ok(upload)
    }

    async fn get_upload(&self, id: UploadId) -> StoreResult<Option<Upload>> {
        Ok(self.read()?.uploads.get(&id).cloned())
    }

    async fn set_upload_status(&self, id: UploadId, status: UploadStatus) -> StoreResult<()> {
        let mut inner = self.write()?;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        upload.status = status;
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn set_total_rows(&self, id: UploadId, total_rows: i64) -> StoreResult<()> {
        let mut inner = self.write()?;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        upload.total_rows = total_rows;
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn set_column_mapping(&self, id: UploadId, mapping: Meta) -> StoreResult<()> {
        let mut inner = self.write()?;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        upload.column_mapping = mapping;
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn set_phase_status(
        &self,
        id: UploadId,
        phase: Phase,
        status: PhaseStatus,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        match phase {
            Phase::Validation => upload.phases.validation = status,
            Phase::Vop => upload.phases.vop = status,
            Phase::Billing => upload.phases.billing = status,
            Phase::Reconciliation => upload.phases.reconciliation = status,
        }
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn bump_upload_counters(
        &self,
        id: UploadId,
        processed: i64,
        failed: i64,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        upload.processed_records += processed;
        upload.failed_records += failed;
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn bump_skip_counts(
        &self,
        id: UploadId,
        counts: &[(SkipReason, i64)],
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        let meta = upload
            .meta
            .as_object_mut()
            .ok_or_else(|| StoreError::Serialization("upload meta is not an object".into()))?;
        let skipped = meta
            .entry("skipped")
            .or_insert_with(|| Meta::Object(Default::default()));
        let map = skipped
            .as_object_mut()
            .ok_or_else(|| StoreError::Serialization("meta.skipped is not an object".into()))?;
        for (reason, delta) in counts {
            let slot = map.entry(reason.as_str()).or_insert_with(|| 0.into());
            let current = slot.as_i64().unwrap_or(0);
            *slot = (current + delta).into();
        }
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn append_error_samples(
        &self,
        id: UploadId,
        samples: &[Meta],
        cap: usize,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        let meta = upload
            .meta
            .as_object_mut()
            .ok_or_else(|| StoreError::Serialization("upload meta is not an object".into()))?;
        let errors = meta
            .entry("errors")
            .or_insert_with(|| Meta::Array(Vec::new()));
        let list = errors
            .as_array_mut()
            .ok_or_else(|| StoreError::Serialization("meta.errors is not an array".into()))?;
        for sample in samples {
            if list.len() >= cap {
                break;
            }
            list.push(sample.clone());
        }
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn merge_upload_meta(&self, id: UploadId, patch: Meta) -> StoreResult<()> {
        let mut inner = self.write()?;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {id}")))?;
        merge_meta(&mut upload.meta, patch);
        upload.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl DebtorStore for MemoryStore {
    async fn insert_debtors(&self, rows: Vec<NewDebtor>) -> StoreResult<Vec<Debtor>> {
        let mut inner = self.write()?;
        let now = Utc::now();
        Ok(rows
            .into_iter()
            .map(|new| inner.insert_debtor_row(new, now))
            .collect())
    }

    async fn get_debtor(&self, id: DebtorId) -> StoreResult<Option<Debtor>> {
        Ok(self.read()?.debtors.get(&id).cloned())
    }

    async fn list_debtors_for_upload(&self, upload_id: UploadId) -> StoreResult<Vec<Debtor>> {
        let inner = self.read()?;
        let mut rows: Vec<Debtor> = inner
            .debtors
            .values()
            .filter(|d| d.upload_id == upload_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }

    async fn unvalidated_debtors(&self, upload_id: UploadId) -> StoreResult<Vec<Debtor>> {
        let inner = self.read()?;
        let mut rows: Vec<Debtor> = inner
            .debtors
            .values()
            .filter(|d| {
                d.upload_id == upload_id
                    && d.validation_status == ValidationStatus::Pending
                    && d.skip_reason.is_none()
            })
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }

    async fn valid_debtors(&self, upload_id: UploadId) -> StoreResult<Vec<Debtor>> {
        let inner = self.read()?;
        let mut rows: Vec<Debtor> = inner
            .debtors
            .values()
            .filter(|d| d.upload_id == upload_id && d.validation_status == ValidationStatus::Valid)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }

    async fn update_validation(
        &self,
        id: DebtorId,
        status: ValidationStatus,
        errors: Vec<String>,
        validated_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let debtor = inner
            .debtors
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("debtor {id}")))?;
        debtor.validation_status = status;
        debtor.validation_errors = errors;
        debtor.validated_at = Some(validated_at);
        debtor.updated_at = Utc::now();
        Ok(())
    }

    async fn set_debtor_status(&self, id: DebtorId, status: DebtorStatus) -> StoreResult<()> {
        let mut inner = self.write()?;
        let debtor = inner
            .debtors
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("debtor {id}")))?;
        debtor.status = status;
        debtor.updated_at = Utc::now();
        Ok(())
    }

    async fn set_selected_for_bav(&self, ids: &[DebtorId], selected: bool) -> StoreResult<()> {
        let mut inner = self.write()?;
        let now = Utc::now();
        for id in ids {
            if let Some(debtor) = inner.debtors.get_mut(id) {
                debtor.selected_for_bav = selected;
                debtor.updated_at = now;
            }
        }
        Ok(())
    }

    async fn recovered_iban_hashes(
        &self,
        hashes: &[String],
        exclude_upload: UploadId,
    ) -> StoreResult<HashSet<String>> {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let inner = self.read()?;
        Ok(inner
            .debtors
            .values()
            .filter(|d| {
                d.status == DebtorStatus::Recovered
                    && d.upload_id != exclude_upload
                    && wanted.contains(d.iban_hash.as_str())
            })
            .map(|d| d.iban_hash.clone())
            .collect())
    }

    async fn billable_debtors(
        &self,
        upload_id: UploadId,
        target: BillingTarget,
    ) -> StoreResult<Vec<Debtor>> {
        let inner = self.read()?;
        let mismatched: HashSet<DebtorId> = inner
            .vop_logs
            .values()
            .filter(|v| v.upload_id == upload_id && v.bav_name_match == redress_types::NameMatch::No)
            .map(|v| v.debtor_id)
            .collect();
        let in_flight: HashSet<DebtorId> = inner
            .attempts
            .values()
            .filter(|a| matches!(a.status, AttemptStatus::Pending | AttemptStatus::Approved))
            .map(|a| a.debtor_id)
            .collect();
        let mut rows: Vec<Debtor> = inner
            .debtors
            .values()
            .filter(|d| d.upload_id == upload_id)
            .filter(|d| d.skip_reason.is_none())
            .filter(|d| d.validation_status == ValidationStatus::Valid)
            .filter(|d| d.status == DebtorStatus::Uploaded)
            .filter(|d| {
                let profile = d.profile_id.and_then(|id| inner.profiles.get(&id));
                let model_ok = match (target, profile) {
                    (BillingTarget::All, _) => true,
                    (BillingTarget::Model(_), None) => true,
                    (BillingTarget::Model(m), Some(p)) => p.billing_model == m,
                };
                let flight_ok = profile.map(|p| p.billing_model.is_recurring()).unwrap_or(false)
                    || !in_flight.contains(&d.id);
                model_ok && flight_ok && !mismatched.contains(&d.id)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }

    async fn recovered_debtors(&self, limit: usize, offset: usize) -> StoreResult<Vec<Debtor>> {
        let inner = self.read()?;
        let mut rows: Vec<Debtor> = inner
            .debtors
            .values()
            .filter(|d| d.status == DebtorStatus::Recovered)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn latest_debtor_for_hash(&self, iban_hash: &str) -> StoreResult<Option<Debtor>> {
        let inner = self.read()?;
        Ok(inner
            .debtors
            .values()
            .filter(|d| d.iban_hash == iban_hash)
            .max_by_key(|d| d.id)
            .cloned())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get_profile(&self, id: ProfileId) -> StoreResult<Option<DebtorProfile>> {
        Ok(self.read()?.profiles.get(&id).cloned())
    }

    async fn get_profile_by_hash(&self, iban_hash: &str) -> StoreResult<Option<DebtorProfile>> {
        let inner = self.read()?;
        Ok(inner
            .profiles
            .values()
            .find(|p| p.iban_hash == iban_hash)
            .cloned())
    }

    async fn profiles_by_hashes(
        &self,
        hashes: &[String],
    ) -> StoreResult<HashMap<String, DebtorProfile>> {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let inner = self.read()?;
        Ok(inner
            .profiles
            .values()
            .filter(|p| wanted.contains(p.iban_hash.as_str()))
            .map(|p| (p.iban_hash.clone(), p.clone()))
            .collect())
    }

    async fn ensure_profile(
        &self,
        iban_hash: &str,
        iban_masked: &str,
        billing_model: BillingModel,
        currency: &str,
    ) -> StoreResult<DebtorProfile> {
        let mut inner = self.write()?;
        if let Some(existing) = inner.profiles.values().find(|p| p.iban_hash == iban_hash) {
            return Ok(existing.clone());
        }
        inner.create_profile_row(iban_hash, iban_masked, billing_model, currency, Utc::now())
    }

    async fn update_profile(&self, profile: &DebtorProfile) -> StoreResult<()> {
        let mut inner = self.write()?;
        let slot = inner
            .profiles
            .get_mut(&profile.id)
            .ok_or_else(|| StoreError::NotFound(format!("profile {}", profile.id)))?;
        let mut updated = profile.clone();
        updated.updated_at = Utc::now();
        *slot = updated;
        Ok(())
    }

    async fn profiles_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<DebtorProfile>> {
        let inner = self.read()?;
        let mut due: Vec<DebtorProfile> = inner
            .profiles
            .values()
            .filter(|p| {
                p.is_active
                    && p.billing_model.is_recurring()
                    && p.next_bill_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|p| p.next_bill_at);
        due.truncate(limit);
        Ok(due)
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn get_attempt(&self, id: AttemptId) -> StoreResult<Option<BillingAttempt>> {
        Ok(self.read()?.attempts.get(&id).cloned())
    }

    async fn find_attempt_by_unique_id(
        &self,
        unique_id: &str,
    ) -> StoreResult<Option<BillingAttempt>> {
        let inner = self.read()?;
        Ok(inner
            .attempts
            .values()
            .find(|a| a.unique_id.as_deref() == Some(unique_id))
            .cloned())
    }

    async fn chargebacked_hashes(&self, hashes: &[String]) -> StoreResult<HashSet<String>> {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let inner = self.read()?;
        let mut out = HashSet::new();
        for attempt in inner.attempts.values() {
            if attempt.status != AttemptStatus::Chargebacked {
                continue;
            }
            if let Some(hash) = inner.iban_hash_of(attempt.debtor_id) {
                if wanted.contains(hash.as_str()) {
                    out.insert(hash);
                }
            }
        }
        Ok(out)
    }

    async fn in_flight_by_hashes(
        &self,
        hashes: &[String],
        since: DateTime<Utc>,
    ) -> StoreResult<HashMap<String, InFlightAttempt>> {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let inner = self.read()?;
        let mut latest: HashMap<String, InFlightAttempt> = HashMap::new();
        for attempt in inner.attempts.values() {
            if !matches!(attempt.status, AttemptStatus::Pending | AttemptStatus::Approved) {
                continue;
            }
            if attempt.created_at < since {
                continue;
            }
            let Some(hash) = inner.iban_hash_of(attempt.debtor_id) else {
                continue;
            };
            if !wanted.contains(hash.as_str()) {
                continue;
            }
            let candidate = InFlightAttempt {
                iban_hash: hash.clone(),
                status: attempt.status,
                created_at: attempt.created_at,
            };
            latest
                .entry(hash)
                .and_modify(|current| {
                    if candidate.created_at > current.created_at {
                        *current = candidate.clone();
                    }
                })
                .or_insert(candidate);
        }
        Ok(latest)
    }

    async fn update_attempt_status(
        &self,
        id: AttemptId,
        status: AttemptStatus,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let attempt = inner
            .attempts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("billing attempt {id}")))?;
        attempt.status = status;
        if error_code.is_some() {
            attempt.error_code = error_code;
        }
        if error_message.is_some() {
            attempt.error_message = error_message;
        }
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_attempt_chargebacked(
        &self,
        id: AttemptId,
        chargebacked_at: DateTime<Utc>,
        reason_code: Option<String>,
        error_code: Option<String>,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let attempt = inner
            .attempts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("billing attempt {id}")))?;
        attempt.status = AttemptStatus::Chargebacked;
        attempt.chargebacked_at = Some(chargebacked_at);
        attempt.chargeback_reason_code = reason_code;
        if error_code.is_some() {
            attempt.error_code = error_code;
        }
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn merge_attempt_meta(&self, id: AttemptId, patch: Meta) -> StoreResult<()> {
        let mut inner = self.write()?;
        let attempt = inner
            .attempts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("billing attempt {id}")))?;
        merge_meta(&mut attempt.meta, patch);
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn pending_for_reconciliation(
        &self,
        older_than: DateTime<Utc>,
        max_recon_attempts: i32,
        limit: usize,
    ) -> StoreResult<Vec<BillingAttempt>> {
        let inner = self.read()?;
        let mut rows: Vec<BillingAttempt> = inner
            .attempts
            .values()
            .filter(|a| {
                a.status == AttemptStatus::Pending
                    && a.unique_id.is_some()
                    && a.created_at < older_than
                    && a.reconciliation_attempts < max_recon_attempts
            })
            .cloned()
            .collect();
        // created_at ascending; never-reconciled attempts first on ties.
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.last_reconciled_at.is_some().cmp(&b.last_reconciled_at.is_some()))
                .then(a.last_reconciled_at.cmp(&b.last_reconciled_at))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn record_reconciliation(&self, id: AttemptId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.write()?;
        let attempt = inner
            .attempts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("billing attempt {id}")))?;
        attempt.reconciliation_attempts += 1;
        attempt.last_reconciled_at = Some(at);
        attempt.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl VopLogStore for MemoryStore {
    async fn insert_vop_log(&self, new: NewVopLog) -> StoreResult<VopLog> {
        let mut inner = self.write()?;
        let id = inner.next_id();
        let log = VopLog {
            id,
            debtor_id: new.debtor_id,
            upload_id: new.upload_id,
            iban_masked: new.iban_masked,
            iban_valid: new.iban_valid,
            bank_identified: new.bank_identified,
            bank_name: new.bank_name,
            bic: new.bic,
            country: new.country,
            vop_score: new.vop_score,
            result: new.result,
            bav_verified: new.bav_verified,
            bav_name_match: new.bav_name_match,
            meta: new.meta,
            created_at: Utc::now(),
        };
        inner.vop_logs.insert(id, log.clone());
        Ok(log)
    }

    async fn bav_mismatch_debtors(&self, upload_id: UploadId) -> StoreResult<HashSet<DebtorId>> {
        let inner = self.read()?;
        Ok(inner
            .vop_logs
            .values()
            .filter(|v| v.upload_id == upload_id && v.bav_name_match == redress_types::NameMatch::No)
            .map(|v| v.debtor_id)
            .collect())
    }

    async fn list_vop_logs_for_upload(&self, upload_id: UploadId) -> StoreResult<Vec<VopLog>> {
        let inner = self.read()?;
        let mut rows: Vec<VopLog> = inner
            .vop_logs
            .values()
            .filter(|v| v.upload_id == upload_id)
            .cloned()
            .collect();
        rows.sort_by_key(|v| v.id);
        Ok(rows)
    }
}

#[async_trait]
impl BlacklistStore for MemoryStore {
    async fn add_blacklist_entry(&self, new: NewBlacklistEntry) -> StoreResult<BlacklistEntry> {
        let mut inner = self.write()?;
        if let Some(existing) = inner
            .blacklist
            .values()
            .find(|e| e.iban_hash == new.iban_hash)
        {
            return Ok(existing.clone());
        }
        let id = inner.next_id();
        let entry = BlacklistEntry {
            id,
            iban_hash: new.iban_hash,
            iban: new.iban,
            first_name: new.first_name,
            last_name: new.last_name,
            email: new.email,
            reason: new.reason,
            source: new.source,
            added_by: new.added_by,
            created_at: Utc::now(),
        };
        inner.blacklist.insert(id, entry.clone());
        Ok(entry)
    }

    async fn remove_blacklist_entry(&self, iban_hash: &str) -> StoreResult<bool> {
        let mut inner = self.write()?;
        let id = inner
            .blacklist
            .iter()
            .find(|(_, e)| e.iban_hash == iban_hash)
            .map(|(id, _)| *id);
        Ok(match id {
            Some(id) => inner.blacklist.remove(&id).is_some(),
            None => false,
        })
    }

    async fn blacklisted_hashes(&self, hashes: &[String]) -> StoreResult<HashSet<String>> {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let inner = self.read()?;
        Ok(inner
            .blacklist
            .values()
            .filter(|e| wanted.contains(e.iban_hash.as_str()))
            .map(|e| e.iban_hash.clone())
            .collect())
    }

    async fn blacklisted_names(
        &self,
        names: &[(String, String)],
    ) -> StoreResult<HashSet<(String, String)>> {
        let wanted: HashSet<(String, String)> = names
            .iter()
            .map(|(f, l)| (lower(f), lower(l)))
            .collect();
        let inner = self.read()?;
        let mut out = HashSet::new();
        for entry in inner.blacklist.values() {
            let (Some(first), Some(last)) = (&entry.first_name, &entry.last_name) else {
                continue;
            };
            let pair = (lower(first), lower(last));
            if wanted.contains(&pair) {
                out.insert(pair);
            }
        }
        Ok(out)
    }

    async fn blacklisted_emails(&self, emails: &[String]) -> StoreResult<HashSet<String>> {
        let wanted: HashSet<String> = emails.iter().map(|e| lower(e)).collect();
        let inner = self.read()?;
        let mut out = HashSet::new();
        for entry in inner.blacklist.values() {
            if let Some(email) = &entry.email {
                let folded = lower(email);
                if wanted.contains(&folded) {
                    out.insert(folded);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ChargebackStore for MemoryStore {
    async fn insert_chargeback(&self, new: NewChargeback) -> StoreResult<(Chargeback, bool)> {
        let mut inner = self.write()?;
        if let Some(existing) = inner
            .chargebacks
            .values()
            .find(|c| c.original_transaction_unique_id == new.original_transaction_unique_id)
        {
            return Ok((existing.clone(), false));
        }
        let id = inner.next_id();
        let record = Chargeback {
            id,
            billing_attempt_id: new.billing_attempt_id,
            debtor_id: new.debtor_id,
            original_transaction_unique_id: new.original_transaction_unique_id,
            cb_type: new.cb_type,
            reason_code: new.reason_code,
            reason_description: new.reason_description,
            amount: new.amount,
            currency: new.currency,
            post_date: new.post_date,
            import_date: Utc::now(),
            source: new.source,
            raw_response: new.raw_response,
        };
        inner.chargebacks.insert(id, record.clone());
        Ok((record, true))
    }

    async fn chargeback_for_transaction(
        &self,
        original_transaction_unique_id: &str,
    ) -> StoreResult<Option<Chargeback>> {
        let inner = self.read()?;
        Ok(inner
            .chargebacks
            .values()
            .find(|c| c.original_transaction_unique_id == original_transaction_unique_id)
            .cloned())
    }
}

#[async_trait]
impl BankStore for MemoryStore {
    async fn get_bank(&self, country: &str, bank_code: &str) -> StoreResult<Option<BankRecord>> {
        let inner = self.read()?;
        Ok(inner
            .banks
            .get(&(country.to_string(), bank_code.to_string()))
            .cloned())
    }

    async fn upsert_bank(&self, record: BankRecord) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner
            .banks
            .insert((record.country.clone(), record.bank_code.clone()), record);
        Ok(())
    }
}

/// Billing transaction over the memory adapter.
///
/// Holds the store-wide billing mutex; writes apply eagerly, so a
/// dropped-without-commit transaction is not rolled back. Tests that
/// exercise rollback behavior belong to the PostgreSQL adapter.
pub struct MemoryBillingTxn {
    inner: Arc<RwLock<Inner>>,
    _gate: OwnedMutexGuard<()>,
}

impl MemoryBillingTxn {
    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl BillingTxn for MemoryBillingTxn {
    async fn profile_for_update(
        &mut self,
        iban_hash: &str,
    ) -> StoreResult<Option<DebtorProfile>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?;
        Ok(inner
            .profiles
            .values()
            .find(|p| p.iban_hash == iban_hash)
            .cloned())
    }

    async fn create_profile(
        &mut self,
        iban_hash: &str,
        iban_masked: &str,
        billing_model: BillingModel,
        currency: &str,
    ) -> StoreResult<DebtorProfile> {
        let mut inner = self.write()?;
        inner.create_profile_row(iban_hash, iban_masked, billing_model, currency, Utc::now())
    }

    async fn save_profile(&mut self, profile: &DebtorProfile) -> StoreResult<()> {
        let mut inner = self.write()?;
        let slot = inner
            .profiles
            .get_mut(&profile.id)
            .ok_or_else(|| StoreError::NotFound(format!("profile {}", profile.id)))?;
        let mut updated = profile.clone();
        updated.updated_at = Utc::now();
        *slot = updated;
        Ok(())
    }

    async fn next_attempt_number(&mut self, debtor_id: DebtorId) -> StoreResult<i32> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?;
        Ok(inner.next_attempt_number_for(debtor_id))
    }

    async fn insert_attempt(&mut self, new: NewBillingAttempt) -> StoreResult<BillingAttempt> {
        let mut inner = self.write()?;
        inner.insert_attempt_row(new, Utc::now())
    }

    async fn set_debtor_status(&mut self, id: DebtorId, status: DebtorStatus) -> StoreResult<()> {
        let mut inner = self.write()?;
        let debtor = inner
            .debtors
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("debtor {id}")))?;
        debtor.status = status;
        debtor.updated_at = Utc::now();
        Ok(())
    }

    async fn link_profile(
        &mut self,
        debtor_id: DebtorId,
        profile_id: ProfileId,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let debtor = inner
            .debtors
            .get_mut(&debtor_id)
            .ok_or_else(|| StoreError::NotFound(format!("debtor {debtor_id}")))?;
        debtor.profile_id = Some(profile_id);
        debtor.updated_at = Utc::now();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl TxnStore for MemoryStore {
    async fn begin_billing(&self) -> StoreResult<Box<dyn BillingTxn>> {
        let gate = self.billing_gate.clone().lock_owned().await;
        Ok(Box::new(MemoryBillingTxn {
            inner: self.inner.clone(),
            _gate: gate,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redress_types::AttemptContext;
    use rust_decimal_macros::dec;

    fn new_debtor(upload_id: UploadId, hash: &str) -> NewDebtor {
        NewDebtor {
            upload_id,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: Some("ada@example.com".into()),
            iban: "DE89370400440532013000".into(),
            iban_hash: hash.into(),
            iban_valid: true,
            country: Some("DE".into()),
            amount: dec!(20.00),
            currency: "EUR".into(),
            raw_row: serde_json::json!({}),
            skip_reason: None,
            profile_id: None,
        }
    }

    async fn upload(store: &MemoryStore) -> Upload {
        store
            .create_upload(NewUpload {
                original_filename: "batch.csv".into(),
                stored_path: "/tmp/batch.csv".into(),
                size_bytes: 128,
                uploader_id: 1,
                billing_model: BillingModel::Legacy,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn skip_counts_accumulate_in_meta() {
        let store = MemoryStore::new();
        let up = upload(&store).await;
        store
            .bump_skip_counts(up.id, &[(SkipReason::Blacklisted, 2)])
            .await
            .unwrap();
        store
            .bump_skip_counts(up.id, &[(SkipReason::Blacklisted, 1)])
            .await
            .unwrap();
        let meta = store.get_upload(up.id).await.unwrap().unwrap().meta;
        assert_eq!(meta["skipped"]["blacklisted"], 3);
    }

    #[tokio::test]
    async fn error_samples_are_capped() {
        let store = MemoryStore::new();
        let up = upload(&store).await;
        let samples: Vec<Meta> = (0..10).map(|i| serde_json::json!({"row": i})).collect();
        store.append_error_samples(up.id, &samples, 5).await.unwrap();
        let meta = store.get_upload(up.id).await.unwrap().unwrap().meta;
        assert_eq!(meta["errors"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn attempt_unique_id_is_enforced() {
        let store = MemoryStore::new();
        let up = upload(&store).await;
        let debtors = store
            .insert_debtors(vec![new_debtor(up.id, "h1")])
            .await
            .unwrap();
        let mut txn = store.begin_billing().await.unwrap();
        let attempt = NewBillingAttempt {
            debtor_id: debtors[0].id,
            upload_id: Some(up.id),
            profile_id: None,
            emp_account_id: None,
            attempt_number: 1,
            unique_id: Some("txn-1".into()),
            amount: dec!(20.00),
            currency: "EUR".into(),
            billing_model: BillingModel::Legacy,
            context: AttemptContext::BatchUpload,
            status: AttemptStatus::Pending,
            error_code: None,
            error_message: None,
            meta: serde_json::json!({}),
        };
        txn.insert_attempt(attempt.clone()).await.unwrap();
        let duplicate = txn.insert_attempt(attempt).await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn in_flight_lookup_returns_latest() {
        let store = MemoryStore::new();
        let up = upload(&store).await;
        let debtors = store
            .insert_debtors(vec![new_debtor(up.id, "h1"), new_debtor(up.id, "h1")])
            .await
            .unwrap();
        let mut txn = store.begin_billing().await.unwrap();
        for (i, d) in debtors.iter().enumerate() {
            txn.insert_attempt(NewBillingAttempt {
                debtor_id: d.id,
                upload_id: Some(up.id),
                profile_id: None,
                emp_account_id: None,
                attempt_number: 1,
                unique_id: Some(format!("txn-{i}")),
                amount: dec!(20.00),
                currency: "EUR".into(),
                billing_model: BillingModel::Legacy,
                context: AttemptContext::BatchUpload,
                status: AttemptStatus::Pending,
                error_code: None,
                error_message: None,
                meta: serde_json::json!({}),
            })
            .await
            .unwrap();
        }
        txn.commit().await.unwrap();

        let since = Utc::now() - chrono::Duration::days(30);
        let found = store
            .in_flight_by_hashes(&["h1".to_string()], since)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["h1"].status, AttemptStatus::Pending);
    }

    #[tokio::test]
    async fn blacklist_add_is_idempotent_per_hash() {
        let store = MemoryStore::new();
        let entry = NewBlacklistEntry {
            iban_hash: "h9".into(),
            iban: "DE89370400440532013000".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            email: None,
            reason: "chargeback".into(),
            source: "webhook".into(),
            added_by: None,
        };
        let first = store.add_blacklist_entry(entry.clone()).await.unwrap();
        let second = store.add_blacklist_entry(entry).await.unwrap();
        assert_eq!(first.id, second.id);
        let hits = store
            .blacklisted_names(&[("ADA".into(), "lovelace".into())])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn reconciliation_ordering_prefers_unpolled() {
        let store = MemoryStore::new();
        let up = upload(&store).await;
        let debtors = store
            .insert_debtors(vec![new_debtor(up.id, "h1"), new_debtor(up.id, "h2")])
            .await
            .unwrap();
        let mut txn = store.begin_billing().await.unwrap();
        let mut ids = Vec::new();
        for (i, d) in debtors.iter().enumerate() {
            let a = txn
                .insert_attempt(NewBillingAttempt {
                    debtor_id: d.id,
                    upload_id: Some(up.id),
                    profile_id: None,
                    emp_account_id: None,
                    attempt_number: 1,
                    unique_id: Some(format!("u-{i}")),
                    amount: dec!(20.00),
                    currency: "EUR".into(),
                    billing_model: BillingModel::Legacy,
                    context: AttemptContext::BatchUpload,
                    status: AttemptStatus::Pending,
                    error_code: None,
                    error_message: None,
                    meta: serde_json::json!({}),
                })
                .await
                .unwrap();
            ids.push(a.id);
        }
        txn.commit().await.unwrap();
        store.record_reconciliation(ids[0], Utc::now()).await.unwrap();

        let horizon = Utc::now() + chrono::Duration::hours(1);
        let due = store
            .pending_for_reconciliation(horizon, 10, 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
        assert!(due[0].created_at <= due[1].created_at);

        // An attempt at its reconciliation budget drops out.
        let due = store.pending_for_reconciliation(horizon, 1, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, ids[1]);
    }
}
