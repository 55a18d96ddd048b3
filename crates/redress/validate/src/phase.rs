use crate::checks::{validate_debtor, RowContext};
use async_trait::async_trait;
use chrono::Utc;
use redress_cache::Kv as _;
use redress_jobs::{Job, JobCtx, JobError, JobOutcome, QueueName};
use redress_store::{BlacklistStore, DebtorStore, StoreHandle, StoreResult, UploadStore};
use redress_types::{Phase, PhaseStatus, UploadId, ValidationStatus};
use std::sync::Arc;
use tracing::{info, instrument};

/// Outcome of one validation phase run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub valid: usize,
    pub invalid: usize,
}

/// Validate every pending debtor of an upload.
///
/// Writes `validated_at` and drops the per-debtor validation cache entry
/// so a re-run starts from a clean slate.
#[instrument(skip(store, kv))]
pub async fn run_validation(
    store: &StoreHandle,
    kv: &redress_cache::KvHandle,
    upload_id: UploadId,
) -> StoreResult<ValidationSummary> {
    let debtors = store.unvalidated_debtors(upload_id).await?;
    if debtors.is_empty() {
        return Ok(ValidationSummary::default());
    }

    // One blacklist query per predicate for the whole phase.
    let name_pairs: Vec<(String, String)> = debtors
        .iter()
        .map(|d| (d.first_name.to_lowercase(), d.last_name.to_lowercase()))
        .collect();
    let emails: Vec<String> = debtors
        .iter()
        .filter_map(|d| d.email.as_deref().map(str::to_lowercase))
        .collect();
    let bad_names = store.blacklisted_names(&name_pairs).await?;
    let bad_emails = if emails.is_empty() {
        Default::default()
    } else {
        store.blacklisted_emails(&emails).await?
    };

    let mut summary = ValidationSummary::default();
    let now = Utc::now();
    for debtor in &debtors {
        let ctx = RowContext {
            name_blacklisted: bad_names.contains(&(
                debtor.first_name.trim().to_lowercase(),
                debtor.last_name.trim().to_lowercase(),
            )),
            email_blacklisted: debtor
                .email
                .as_deref()
                .map(|e| bad_emails.contains(&e.trim().to_lowercase()))
                .unwrap_or(false),
        };
        let errors = validate_debtor(debtor, &ctx);
        let status = if errors.is_empty() {
            summary.valid += 1;
            ValidationStatus::Valid
        } else {
            summary.invalid += 1;
            ValidationStatus::Invalid
        };
        store
            .update_validation(debtor.id, status, errors, now)
            .await?;
        kv.delete(&format!("debtor_validation_{}", debtor.id)).await;
    }

    info!(
        upload_id,
        valid = summary.valid,
        invalid = summary.invalid,
        "validation phase finished"
    );
    Ok(summary)
}

/// Queue job wrapping the validation phase for one upload.
///
/// The identity key guarantees at most one concurrent run per upload;
/// re-runs after completion are allowed.
pub struct ValidationJob {
    pub store: StoreHandle,
    pub kv: redress_cache::KvHandle,
    pub upload_id: UploadId,
}

#[async_trait]
impl Job for ValidationJob {
    fn queue(&self) -> QueueName {
        QueueName::High
    }

    fn name(&self) -> &str {
        "validation"
    }

    fn identity_key(&self) -> Option<String> {
        Some(format!("validation_{}", self.upload_id))
    }

    fn timeout(&self) -> std::time::Duration {
        // Whole-upload phase, not a chunk.
        std::time::Duration::from_secs(600)
    }

    async fn run(&self, _ctx: &JobCtx) -> Result<JobOutcome, JobError> {
        self.store
            .set_phase_status(self.upload_id, Phase::Validation, PhaseStatus::Started)
            .await
            .map_err(|e| JobError::Transient(e.to_string()))?;

        match run_validation(&self.store, &self.kv, self.upload_id).await {
            Ok(_) => {
                self.store
                    .set_phase_status(self.upload_id, Phase::Validation, PhaseStatus::Completed)
                    .await
                    .map_err(|e| JobError::Transient(e.to_string()))?;
                Ok(JobOutcome::Done)
            }
            Err(e) if e.is_transient() => Err(JobError::Transient(e.to_string())),
            Err(e) => {
                let _ = self
                    .store
                    .set_phase_status(self.upload_id, Phase::Validation, PhaseStatus::Failed)
                    .await;
                Err(JobError::Permanent(e.to_string()))
            }
        }
    }

    async fn on_failure(&self, _error: &JobError) {
        let _ = self
            .store
            .set_phase_status(self.upload_id, Phase::Validation, PhaseStatus::Failed)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redress_cache::MemoryKv;
    use redress_store::memory::MemoryStore;
    use redress_store::{DebtorStore, UploadStore};
    use redress_types::{BillingModel, NewDebtor, NewUpload};
    use rust_decimal_macros::dec;

    async fn seed(store: &MemoryStore) -> (i64, Vec<i64>) {
        let upload = store
            .create_upload(NewUpload {
                original_filename: "v.csv".into(),
                stored_path: "/tmp/v.csv".into(),
                size_bytes: 1,
                uploader_id: 1,
                billing_model: BillingModel::Legacy,
            })
            .await
            .unwrap();
        let rows = vec![
            NewDebtor {
                upload_id: upload.id,
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                email: Some("ada@example.com".into()),
                iban: "DE89370400440532013000".into(),
                iban_hash: "h1".into(),
                iban_valid: true,
                country: Some("DE".into()),
                amount: dec!(20.00),
                currency: "EUR".into(),
                raw_row: serde_json::json!({}),
                skip_reason: None,
                profile_id: None,
            },
            NewDebtor {
                upload_id: upload.id,
                first_name: "B4d".into(),
                last_name: "Name".into(),
                email: None,
                iban: "DE00000000000000000000".into(),
                iban_hash: "h2".into(),
                iban_valid: false,
                country: Some("DE".into()),
                amount: dec!(0.20),
                currency: "EUR".into(),
                raw_row: serde_json::json!({}),
                skip_reason: None,
                profile_id: None,
            },
        ];
        let ids = store
            .insert_debtors(rows)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        (upload.id, ids)
    }

    #[tokio::test]
    async fn phase_marks_rows_and_stamps_validated_at() {
        let store = MemoryStore::new();
        let (upload_id, ids) = seed(&store).await;
        let handle: StoreHandle = Arc::new(store);
        let kv: redress_cache::KvHandle = Arc::new(MemoryKv::new());

        let summary = run_validation(&handle, &kv, upload_id).await.unwrap();
        assert_eq!(summary, ValidationSummary { valid: 1, invalid: 1 });

        let good = handle.get_debtor(ids[0]).await.unwrap().unwrap();
        assert_eq!(good.validation_status, ValidationStatus::Valid);
        assert!(good.validation_errors.is_empty());
        assert!(good.validated_at.is_some());

        let bad = handle.get_debtor(ids[1]).await.unwrap().unwrap();
        assert_eq!(bad.validation_status, ValidationStatus::Invalid);
        assert!(!bad.validation_errors.is_empty());
    }

    #[tokio::test]
    async fn rerun_touches_nothing_once_validated() {
        let store = MemoryStore::new();
        let (upload_id, _) = seed(&store).await;
        let handle: StoreHandle = Arc::new(store);
        let kv: redress_cache::KvHandle = Arc::new(MemoryKv::new());

        run_validation(&handle, &kv, upload_id).await.unwrap();
        let second = run_validation(&handle, &kv, upload_id).await.unwrap();
        assert_eq!(second, ValidationSummary::default());
    }
}
