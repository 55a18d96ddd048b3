use crate::error::{IngestError, IngestResult};
use crate::mapping::build_column_mapping;
use crate::row::NormalizedRow;
use crate::sheet::parse_file;
use async_trait::async_trait;
use chrono::Utc;
use redress_cache::Kv as _;
use redress_dedup::{exclusivity_skip, DedupCandidate, DedupEngine, SkipLedger, SKIP_SAMPLE_CAP};
use redress_jobs::{cancel_key, Job, JobCtx, JobError, JobOutcome, JobRunner, QueueName};
use redress_store::{DebtorStore, ProfileStore, StoreHandle, StoreResult, UploadStore};
use redress_types::{
    BillingModel, NewDebtor, NewUpload, RedressConfig, SkipClassification, Upload, UploadId,
    UploadStatus,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Entry point for spreadsheet ingestion.
pub struct Ingestor {
    store: StoreHandle,
    runner: Arc<JobRunner>,
    config: Arc<RedressConfig>,
}

impl Ingestor {
    pub fn new(store: StoreHandle, runner: Arc<JobRunner>, config: Arc<RedressConfig>) -> Self {
        Self {
            store,
            runner,
            config,
        }
    }

    /// Ingest a stored spreadsheet end to end: create the upload record,
    /// parse and map the file, then process rows inline (small uploads)
    /// or dispatch chunk jobs.
    #[instrument(skip(self), fields(file = %original_filename))]
    pub async fn ingest_file(
        &self,
        path: &Path,
        original_filename: &str,
        uploader_id: i64,
        billing_model: BillingModel,
    ) -> IngestResult<Upload> {
        let size_bytes = std::fs::metadata(path)
            .map(|m| m.len() as i64)
            .unwrap_or_default();
        let upload = self
            .store
            .create_upload(NewUpload {
                original_filename: original_filename.to_string(),
                stored_path: path.display().to_string(),
                size_bytes,
                uploader_id,
                billing_model,
            })
            .await?;

        match self.run_pipeline(&upload, path).await {
            Ok(()) => Ok(self
                .store
                .get_upload(upload.id)
                .await?
                .unwrap_or(upload)),
            Err(error) => {
                warn!(upload_id = upload.id, %error, "ingestion failed");
                self.store
                    .set_upload_status(upload.id, UploadStatus::Failed)
                    .await?;
                self.store
                    .merge_upload_meta(
                        upload.id,
                        serde_json::json!({ "ingest_error": error.to_string() }),
                    )
                    .await?;
                Err(error)
            }
        }
    }

    async fn run_pipeline(&self, upload: &Upload, path: &Path) -> IngestResult<()> {
        let sheet = parse_file(path, self.config.ingest.max_file_bytes)?;
        let mapping = build_column_mapping(&sheet.headers)?;

        self.store
            .set_column_mapping(upload.id, mapping.to_meta())
            .await?;
        self.store
            .set_total_rows(upload.id, sheet.total_rows() as i64)
            .await?;
        self.store
            .set_upload_status(upload.id, UploadStatus::Processing)
            .await?;

        let rows: Vec<NormalizedRow> = sheet
            .rows
            .iter()
            .map(|cells| NormalizedRow::from_cells(cells, &sheet.headers, &mapping))
            .collect();

        if rows.len() < self.config.ingest.inline_threshold {
            process_chunk(
                &self.store,
                &self.config,
                upload.id,
                upload.billing_model,
                &rows,
                0,
            )
            .await?;
            finalize_upload(&self.store, upload.id).await?;
            info!(upload_id = upload.id, rows = rows.len(), "upload ingested inline");
            return Ok(());
        }

        let chunk_size = self.config.ingest.chunk_size.max(1);
        let chunks: Vec<Vec<NormalizedRow>> = rows
            .chunks(chunk_size)
            .map(|c| c.to_vec())
            .collect();
        let remaining_key = format!("upload_ingest_remaining_{}", upload.id);

        // Seed the countdown before the first chunk can finish.
        self.runner
            .kv()
            .incr(
                &remaining_key,
                chunks.len() as i64,
                Some(Duration::from_secs(2 * 60 * 60)),
            )
            .await;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let job = DebtorChunkJob {
                store: self.store.clone(),
                config: self.config.clone(),
                upload_id: upload.id,
                billing_model: upload.billing_model,
                rows: chunk,
                offset: i * chunk_size,
                remaining_key: remaining_key.clone(),
            };
            self.runner.enqueue(Arc::new(job)).await;
        }
        Ok(())
    }
}

/// One chunk of rows dispatched to the queue.
pub struct DebtorChunkJob {
    store: StoreHandle,
    config: Arc<RedressConfig>,
    upload_id: UploadId,
    billing_model: BillingModel,
    rows: Vec<NormalizedRow>,
    offset: usize,
    remaining_key: String,
}

#[async_trait]
impl Job for DebtorChunkJob {
    fn queue(&self) -> QueueName {
        QueueName::Default
    }

    fn name(&self) -> &str {
        "debtor-chunk"
    }

    async fn run(&self, ctx: &JobCtx) -> Result<JobOutcome, JobError> {
        if ctx
            .kv
            .get(&cancel_key("upload", self.upload_id))
            .await
            .is_some()
        {
            info!(upload_id = self.upload_id, "chunk skipped: upload cancelled");
            return Ok(JobOutcome::Done);
        }

        process_chunk(
            &self.store,
            &self.config,
            self.upload_id,
            self.billing_model,
            &self.rows,
            self.offset,
        )
        .await
        .map_err(|e| match e {
            e if e.is_transient() => JobError::Transient(e.to_string()),
            e => JobError::Permanent(e.to_string()),
        })?;

        let left = ctx
            .kv
            .incr(&self.remaining_key, -1, Some(Duration::from_secs(2 * 60 * 60)))
            .await;
        if left <= 0 {
            ctx.kv.delete(&self.remaining_key).await;
            finalize_upload(&self.store, self.upload_id)
                .await
                .map_err(|e| JobError::Transient(e.to_string()))?;
        }
        Ok(JobOutcome::Done)
    }

    async fn on_failure(&self, error: &JobError) {
        warn!(upload_id = self.upload_id, %error, "debtor chunk failed permanently");
        let _ = self
            .store
            .bump_upload_counters(self.upload_id, 0, self.rows.len() as i64)
            .await;
    }
}

/// Process one chunk: classify against history, apply model exclusivity,
/// persist debtors (skipped rows included, carrying their reason), and
/// account counters.
pub async fn process_chunk(
    store: &StoreHandle,
    config: &RedressConfig,
    upload_id: UploadId,
    upload_model: BillingModel,
    rows: &[NormalizedRow],
    offset: usize,
) -> StoreResult<()> {
    let now = Utc::now();

    // Rows that cannot become debtors are row errors, not skips.
    let mut row_errors: Vec<redress_types::Meta> = Vec::new();
    let mut storable: Vec<(usize, &NormalizedRow)> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if row.is_storable() {
            storable.push((i, row));
        } else {
            let mut problems = Vec::new();
            if row.iban.is_empty() {
                problems.push("missing iban");
            }
            if row.first_name.is_empty() && row.last_name.is_empty() {
                problems.push("missing name");
            }
            if row.amount.is_none() {
                problems.push("missing or unparseable amount");
            }
            row_errors.push(serde_json::json!({
                // +2: 1-based data rows below the header row.
                "row": offset + i + 2,
                "errors": problems,
            }));
        }
    }

    let candidates: Vec<DedupCandidate> = storable
        .iter()
        .map(|(_, row)| DedupCandidate {
            iban_hash: row.iban_hash.clone(),
            first_name: row.first_name.clone(),
            last_name: row.last_name.clone(),
            email: row.email.clone(),
        })
        .collect();
    let dedup = DedupEngine::new(&**store, config.ingest.reattempt_cooldown_days);
    let history_skips = dedup.classify_batch(upload_id, &candidates, now).await?;

    let hashes: Vec<String> = candidates.iter().map(|c| c.iban_hash.clone()).collect();
    let mut profiles = store.profiles_by_hashes(&hashes).await?;

    let mut ledger = SkipLedger::new();
    let mut new_debtors = Vec::with_capacity(storable.len());
    for (position, (row_index, row)) in storable.iter().enumerate() {
        let amount = match row.amount {
            Some(amount) => amount,
            None => continue,
        };
        let row_model = config.billing.resolve_row_model(upload_model, amount);

        let skip: Option<SkipClassification> = match history_skips.get(&position) {
            Some(skip) => Some(skip.clone()),
            None => exclusivity_skip(row_model, profiles.get(&row.iban_hash))
                .map(SkipClassification::new),
        };

        let mut profile_id = profiles.get(&row.iban_hash).map(|p| p.id);
        if skip.is_none() && row_model.is_recurring() && profile_id.is_none() {
            let profile = store
                .ensure_profile(
                    &row.iban_hash,
                    &redress_iban::mask(&row.iban),
                    row_model,
                    &row.currency,
                )
                .await?;
            profile_id = Some(profile.id);
            profiles.insert(row.iban_hash.clone(), profile);
        }

        if let Some(skip) = &skip {
            ledger.record(offset + row_index + 2, skip);
        }

        new_debtors.push(NewDebtor {
            upload_id,
            first_name: row.first_name.clone(),
            last_name: row.last_name.clone(),
            email: row.email.clone(),
            iban: row.iban.clone(),
            iban_hash: row.iban_hash.clone(),
            iban_valid: row.iban_valid,
            country: row.country.clone(),
            amount,
            currency: row.currency.clone(),
            raw_row: row.raw.clone(),
            skip_reason: skip.map(|s| s.reason),
            profile_id,
        });
    }

    let inserted = store.insert_debtors(new_debtors).await?;
    store
        .bump_upload_counters(upload_id, inserted.len() as i64, row_errors.len() as i64)
        .await?;
    if !ledger.is_empty() {
        store.bump_skip_counts(upload_id, &ledger.counts()).await?;
        store
            .append_error_samples(upload_id, ledger.samples(), SKIP_SAMPLE_CAP)
            .await?;
    }
    if !row_errors.is_empty() {
        store
            .append_error_samples(upload_id, &row_errors, SKIP_SAMPLE_CAP)
            .await?;
    }
    Ok(())
}

/// Flip the upload to its terminal ingest status.
pub async fn finalize_upload(store: &StoreHandle, upload_id: UploadId) -> StoreResult<()> {
    let Some(upload) = store.get_upload(upload_id).await? else {
        return Ok(());
    };
    if upload.status == UploadStatus::Cancelled {
        return Ok(());
    }
    let status = if upload.processed_records == 0 && upload.failed_records > 0 {
        UploadStatus::Failed
    } else if upload.failed_records > 0 {
        UploadStatus::CompletedWithErrors
    } else {
        UploadStatus::Completed
    };
    store.set_upload_status(upload_id, status).await
}
