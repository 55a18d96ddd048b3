use crate::bank::BankDirectory;
use crate::bav::{BavClient, BavSampler};
use crate::score::{score, VopInputs};
use async_trait::async_trait;
use redress_cache::{KvHandle, ProgressTracker};
use redress_jobs::{Job, JobCtx, JobError, JobOutcome, QueueName};
use redress_store::{DebtorStore, StoreHandle, StoreResult, UploadStore, VopLogStore};
use redress_types::{
    BavConfig, NameMatch, NewVopLog, Phase, PhaseStatus, UploadId, VopResult,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Executes the VOP phase for uploads.
pub struct VopRunner {
    store: StoreHandle,
    kv: KvHandle,
    directory: Arc<BankDirectory>,
    bav: Arc<dyn BavClient>,
    config: BavConfig,
    /// Pause after a BAV-flagged debtor.
    flagged_delay: Duration,
    /// Pause after an unflagged debtor.
    unflagged_delay: Duration,
}

impl VopRunner {
    pub fn new(
        store: StoreHandle,
        kv: KvHandle,
        directory: Arc<BankDirectory>,
        bav: Arc<dyn BavClient>,
        config: BavConfig,
    ) -> Self {
        Self {
            store,
            kv,
            directory,
            bav,
            config,
            flagged_delay: Duration::from_millis(1000),
            unflagged_delay: Duration::from_millis(500),
        }
    }

    /// Test hook: remove the pacing delays.
    pub fn with_delays(mut self, flagged: Duration, unflagged: Duration) -> Self {
        self.flagged_delay = flagged;
        self.unflagged_delay = unflagged;
        self
    }
}

/// Score every valid debtor of an upload and persist a VOP log each.
#[instrument(skip(runner))]
pub async fn run_vop(runner: &VopRunner, upload_id: UploadId) -> StoreResult<usize> {
    let debtors = runner.store.valid_debtors(upload_id).await?;
    if debtors.is_empty() {
        return Ok(0);
    }

    let sampler = BavSampler::new(runner.kv.clone(), runner.config.clone());
    let budget = sampler.reserve(debtors.len()).await;
    let flagged_ids: Vec<i64> = debtors.iter().take(budget).map(|d| d.id).collect();
    if !flagged_ids.is_empty() {
        runner
            .store
            .set_selected_for_bav(&flagged_ids, true)
            .await?;
    }

    let progress = ProgressTracker::new(runner.kv.clone());
    let progress_key = format!("bav_progress_{upload_id}");

    let total = debtors.len();
    for (done, debtor) in debtors.iter().enumerate() {
        let flagged = flagged_ids.contains(&debtor.id);

        let bank = runner.directory.resolve(&debtor.iban).await?;
        let (bank_identified, sdd_supported) = bank
            .as_ref()
            .map(|b| (true, b.sdd_supported))
            .unwrap_or((false, false));

        let name_match = if flagged {
            runner
                .bav
                .verify_name(&debtor.iban, &debtor.first_name, &debtor.last_name)
                .await
        } else {
            NameMatch::Unavailable
        };
        let bav_verified = matches!(
            name_match,
            NameMatch::Yes | NameMatch::Partial | NameMatch::No
        );

        let country = redress_iban::country(&debtor.iban).map(str::to_string);
        let inputs = VopInputs {
            iban_valid: debtor.iban_valid,
            country_in_sepa: country
                .as_deref()
                .map(redress_iban::is_sepa)
                .unwrap_or(false),
            bank_identified,
            sdd_supported,
            name_match,
        };
        let vop_score = score(&inputs);

        runner
            .store
            .insert_vop_log(NewVopLog {
                debtor_id: debtor.id,
                upload_id,
                iban_masked: redress_iban::mask(&debtor.iban),
                iban_valid: debtor.iban_valid,
                bank_identified,
                bank_name: bank.as_ref().map(|b| b.name.clone()),
                bic: bank.as_ref().and_then(|b| b.bic.clone()),
                country,
                vop_score,
                result: VopResult::from_score(vop_score),
                bav_verified,
                bav_name_match: name_match,
                meta: serde_json::json!({ "selected_for_bav": flagged }),
            })
            .await?;

        progress
            .write(
                &progress_key,
                &serde_json::json!({ "total": total, "done": done + 1 }),
            )
            .await;

        let delay = if flagged {
            runner.flagged_delay
        } else {
            runner.unflagged_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    info!(upload_id, scored = total, flagged = flagged_ids.len(), "vop phase finished");
    Ok(total)
}

/// Queue job wrapping the VOP phase for one upload.
pub struct VopJob {
    pub runner: Arc<VopRunner>,
    pub upload_id: UploadId,
}

#[async_trait]
impl Job for VopJob {
    fn queue(&self) -> QueueName {
        QueueName::Vop
    }

    fn name(&self) -> &str {
        "vop"
    }

    fn identity_key(&self) -> Option<String> {
        Some(format!("vop_{}", self.upload_id))
    }

    fn timeout(&self) -> Duration {
        // Whole-upload phase with per-debtor pacing delays.
        Duration::from_secs(600)
    }

    async fn run(&self, _ctx: &JobCtx) -> Result<JobOutcome, JobError> {
        let store = &self.runner.store;
        store
            .set_phase_status(self.upload_id, Phase::Vop, PhaseStatus::Started)
            .await
            .map_err(|e| JobError::Transient(e.to_string()))?;

        match run_vop(&self.runner, self.upload_id).await {
            Ok(_) => {
                store
                    .set_phase_status(self.upload_id, Phase::Vop, PhaseStatus::Completed)
                    .await
                    .map_err(|e| JobError::Transient(e.to_string()))?;
                Ok(JobOutcome::Done)
            }
            Err(e) if e.is_transient() => Err(JobError::Transient(e.to_string())),
            Err(e) => {
                let _ = store
                    .set_phase_status(self.upload_id, Phase::Vop, PhaseStatus::Failed)
                    .await;
                Err(JobError::Permanent(e.to_string()))
            }
        }
    }

    async fn on_failure(&self, _error: &JobError) {
        let _ = self
            .runner
            .store
            .set_phase_status(self.upload_id, Phase::Vop, PhaseStatus::Failed)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::StaticBankLookup;
    use crate::bav::MockBavClient;
    use redress_cache::MemoryKv;
    use redress_store::memory::MemoryStore;
    use redress_types::{BillingModel, NewDebtor, NewUpload, ValidationStatus};
    use rust_decimal_macros::dec;

    const IBAN: &str = "DE89370400440532013000";

    async fn seed(store: &MemoryStore) -> (i64, i64) {
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
        let debtor = store
            .insert_debtors(vec![NewDebtor {
                upload_id: upload.id,
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                email: None,
                iban: IBAN.into(),
                iban_hash: redress_iban::hash(IBAN),
                iban_valid: true,
                country: Some("DE".into()),
                amount: dec!(20.00),
                currency: "EUR".into(),
                raw_row: serde_json::json!({}),
                skip_reason: None,
                profile_id: None,
            }])
            .await
            .unwrap()[0]
            .id;
        store
            .update_validation(debtor, ValidationStatus::Valid, vec![], chrono::Utc::now())
            .await
            .unwrap();
        (upload.id, debtor)
    }

    fn runner(store: StoreHandle, kv: KvHandle, bav: Arc<MockBavClient>, pct: u8) -> VopRunner {
        let directory = Arc::new(BankDirectory::new(
            store.clone(),
            kv.clone(),
            Arc::new(StaticBankLookup::new().with_bank(
                "DE",
                "37040044",
                "Commerzbank",
                Some("COBADEFFXXX"),
                true,
            )),
        ));
        VopRunner::new(
            store,
            kv,
            directory,
            bav,
            BavConfig {
                enabled: true,
                sampling_percentage: pct,
                daily_limit: 100,
                large_upload_cap: 100,
            },
        )
        .with_delays(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn scores_and_logs_a_verified_debtor() {
        let store_impl = MemoryStore::new();
        let (upload_id, debtor_id) = seed(&store_impl).await;
        let store: StoreHandle = Arc::new(store_impl);
        let kv: KvHandle = Arc::new(MemoryKv::new());
        let bav = Arc::new(MockBavClient::new());
        bav.set_answer(IBAN, NameMatch::Yes);

        let runner = runner(store.clone(), kv.clone(), bav, 100);
        let scored = run_vop(&runner, upload_id).await.unwrap();
        assert_eq!(scored, 1);

        let logs = store.list_vop_logs_for_upload(upload_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        let log = &logs[0];
        assert_eq!(log.debtor_id, debtor_id);
        assert_eq!(log.vop_score, 100);
        assert_eq!(log.result, VopResult::Verified);
        assert!(log.bav_verified);
        assert_eq!(log.bav_name_match, NameMatch::Yes);
        assert_eq!(log.bank_name.as_deref(), Some("Commerzbank"));

        let debtor = store.get_debtor(debtor_id).await.unwrap().unwrap();
        assert!(debtor.selected_for_bav);
        assert!(kv.get(&format!("bav_progress_{upload_id}")).await.is_some());
    }

    #[tokio::test]
    async fn unsampled_debtors_skip_bav() {
        let store_impl = MemoryStore::new();
        let (upload_id, debtor_id) = seed(&store_impl).await;
        let store: StoreHandle = Arc::new(store_impl);
        let kv: KvHandle = Arc::new(MemoryKv::new());
        let bav = Arc::new(MockBavClient::new());
        bav.set_answer(IBAN, NameMatch::Yes);

        let runner = runner(store.clone(), kv, bav, 0);
        run_vop(&runner, upload_id).await.unwrap();

        let logs = store.list_vop_logs_for_upload(upload_id).await.unwrap();
        assert_eq!(logs[0].bav_name_match, NameMatch::Unavailable);
        assert!(!logs[0].bav_verified);
        // Unavailable scores 85: bank identified, SDD capable, no match points.
        assert_eq!(logs[0].vop_score, 85);

        let debtor = store.get_debtor(debtor_id).await.unwrap().unwrap();
        assert!(!debtor.selected_for_bav);
    }
}
