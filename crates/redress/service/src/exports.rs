use async_trait::async_trait;
use redress_cache::ProgressTracker;
use redress_jobs::{Job, JobCtx, JobError, JobOutcome, QueueName};
use redress_store::{DebtorStore, StoreHandle};
use std::path::PathBuf;

/// Streams recovered ("clean") debtors to a CSV file, paging through the
/// store and tracking progress under `clean_users_export:{job_id}`.
pub struct CleanUsersExportJob {
    pub store: StoreHandle,
    pub job_id: String,
    pub out_path: PathBuf,
}

const EXPORT_PAGE_SIZE: usize = 500;

#[async_trait]
impl Job for CleanUsersExportJob {
    fn queue(&self) -> QueueName {
        QueueName::Exports
    }

    fn name(&self) -> &str {
        "clean-users-export"
    }

    fn identity_key(&self) -> Option<String> {
        Some(format!("clean_users_export:{}", self.job_id))
    }

    async fn run(&self, ctx: &JobCtx) -> Result<JobOutcome, JobError> {
        let progress = ProgressTracker::new(ctx.kv.clone());
        let progress_key = format!("clean_users_export:{}", self.job_id);

        let mut writer = csv::Writer::from_path(&self.out_path)
            .map_err(|e| JobError::Permanent(format!("cannot open export file: {e}")))?;
        writer
            .write_record(["iban_masked", "first_name", "last_name", "email", "amount", "currency"])
            .map_err(|e| JobError::Permanent(e.to_string()))?;

        let mut offset = 0usize;
        let mut exported = 0usize;
        loop {
            let page = self
                .store
                .recovered_debtors(EXPORT_PAGE_SIZE, offset)
                .await
                .map_err(|e| JobError::Transient(e.to_string()))?;
            if page.is_empty() {
                break;
            }
            for debtor in &page {
                writer
                    .write_record([
                        redress_iban::mask(&debtor.iban),
                        debtor.first_name.clone(),
                        debtor.last_name.clone(),
                        debtor.email.clone().unwrap_or_default(),
                        debtor.amount.to_string(),
                        debtor.currency.clone(),
                    ])
                    .map_err(|e| JobError::Permanent(e.to_string()))?;
                exported += 1;
            }
            offset += page.len();
            progress
                .write(
                    &progress_key,
                    &serde_json::json!({ "exported": exported }),
                )
                .await;
        }
        writer
            .flush()
            .map_err(|e| JobError::Permanent(e.to_string()))?;
        progress
            .write(
                &progress_key,
                &serde_json::json!({ "exported": exported, "done": true }),
            )
            .await;
        Ok(JobOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redress_cache::{KvHandle, MemoryKv};
    use redress_jobs::JobRunner;
    use redress_store::memory::MemoryStore;
    use redress_store::UploadStore;
    use redress_types::{BillingModel, DebtorStatus, NewDebtor, NewUpload};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn export_writes_recovered_debtors_only() {
        let store_impl = MemoryStore::new();
        let upload = store_impl
            .create_upload(NewUpload {
                original_filename: "e.csv".into(),
                stored_path: "/tmp/e.csv".into(),
                size_bytes: 1,
                uploader_id: 1,
                billing_model: BillingModel::Legacy,
            })
            .await
            .unwrap();
        let debtors = store_impl
            .insert_debtors(
                (0..3)
                    .map(|i| NewDebtor {
                        upload_id: upload.id,
                        first_name: "Ada".into(),
                        last_name: format!("Lovelace {i}"),
                        email: None,
                        iban: "DE89370400440532013000".into(),
                        iban_hash: format!("h{i}"),
                        iban_valid: true,
                        country: Some("DE".into()),
                        amount: dec!(20.00),
                        currency: "EUR".into(),
                        raw_row: serde_json::json!({}),
                        skip_reason: None,
                        profile_id: None,
                    })
                    .collect(),
            )
            .await
            .unwrap();
        store_impl
            .set_debtor_status(debtors[0].id, DebtorStatus::Recovered)
            .await
            .unwrap();
        let store: StoreHandle = Arc::new(store_impl);

        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("clean.csv");
        let kv: KvHandle = Arc::new(MemoryKv::new());
        let runner = JobRunner::start(kv.clone(), |_| 1);
        runner
            .enqueue(Arc::new(CleanUsersExportJob {
                store,
                job_id: "42".into(),
                out_path: out_path.clone(),
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let content = std::fs::read_to_string(&out_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2, "header plus one recovered debtor");
        assert!(lines[1].contains("Lovelace 0"));
        runner.shutdown().await;
    }
}
