use crate::worker::{bill_one_debtor, BillResult, BillingDeps};
use async_trait::async_trait;
use chrono::Utc;
use redress_cache::{CircuitBreaker, Kv as _, RateLimiter};
use redress_jobs::{cancel_key, Job, JobCtx, JobError, JobOutcome, JobRunner, QueueName};
use redress_store::{BillingTarget, DebtorStore, ProfileStore, StoreResult, UploadStore};
use redress_types::{AttemptContext, BillingModel, DebtorId, Phase, PhaseStatus, UploadId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Key of the shared billing circuit breaker.
pub const BILLING_CIRCUIT_KEY: &str = "emp_circuit_breaker";
/// The dispatch lock protects one batch per upload at a time.
const DISPATCH_LOCK_TTL: Duration = Duration::from_secs(600);

/// Per-upload billing dispatcher.
pub struct BillingOrchestrator {
    deps: BillingDeps,
    runner: Arc<JobRunner>,
}

impl BillingOrchestrator {
    pub fn new(deps: BillingDeps, runner: Arc<JobRunner>) -> Self {
        Self { deps, runner }
    }

    fn dispatch_lock_key(upload_id: UploadId) -> String {
        format!("processbilling_{upload_id}_lock")
    }

    /// Select eligible debtors, fan out chunk jobs tagged with a batch
    /// id, and advance the upload's billing phase. Returns `false` when
    /// another batch for this upload is already running.
    #[instrument(skip(self))]
    pub async fn dispatch(
        &self,
        upload_id: UploadId,
        target: BillingTarget,
    ) -> StoreResult<bool> {
        let lock_key = Self::dispatch_lock_key(upload_id);
        if !self
            .deps
            .kv
            .set_nx(&lock_key, "1", DISPATCH_LOCK_TTL)
            .await
        {
            info!(upload_id, "billing dispatch short-circuited by the upload lock");
            return Ok(false);
        }

        let Some(upload) = self.deps.store.get_upload(upload_id).await? else {
            self.deps.kv.delete(&lock_key).await;
            return Ok(false);
        };

        let eligible = self.deps.store.billable_debtors(upload_id, target).await?;
        let batch_id = uuid::Uuid::new_v4().to_string();
        self.deps
            .store
            .set_phase_status(upload_id, Phase::Billing, PhaseStatus::Started)
            .await?;
        self.deps
            .store
            .merge_upload_meta(
                upload_id,
                serde_json::json!({ "billing_batch_id": batch_id }),
            )
            .await?;

        if eligible.is_empty() {
            self.deps
                .store
                .set_phase_status(upload_id, Phase::Billing, PhaseStatus::Completed)
                .await?;
            self.deps.kv.delete(&lock_key).await;
            info!(upload_id, "no eligible debtors; billing batch empty");
            return Ok(true);
        }

        let chunk_size = self.deps.config.billing.chunk_size.max(1);
        let chunks: Vec<Vec<DebtorId>> = eligible
            .iter()
            .map(|d| d.id)
            .collect::<Vec<_>>()
            .chunks(chunk_size)
            .map(|c| c.to_vec())
            .collect();
        let countdown_key = format!("billing_batch_remaining_{batch_id}");
        self.deps
            .kv
            .incr(&countdown_key, chunks.len() as i64, Some(DISPATCH_LOCK_TTL))
            .await;

        info!(
            upload_id,
            batch_id = %batch_id,
            debtors = eligible.len(),
            chunks = chunks.len(),
            "billing batch dispatched"
        );
        for ids in chunks {
            let job = BillingChunkJob {
                deps: self.deps.clone(),
                upload_id,
                upload_model: upload.billing_model,
                debtor_ids: ids,
                countdown_key: countdown_key.clone(),
                dispatch_lock_key: lock_key.clone(),
                batch_id: batch_id.clone(),
            };
            self.runner.enqueue(Arc::new(job)).await;
        }
        Ok(true)
    }
}

/// One chunk of a billing batch.
pub struct BillingChunkJob {
    deps: BillingDeps,
    upload_id: UploadId,
    upload_model: BillingModel,
    debtor_ids: Vec<DebtorId>,
    countdown_key: String,
    dispatch_lock_key: String,
    batch_id: String,
}

impl BillingChunkJob {
    fn release_delay(&self) -> Duration {
        Duration::from_secs(self.deps.config.circuit.release_delay_secs)
    }

    fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.deps.kv.clone(),
            BILLING_CIRCUIT_KEY,
            self.deps.config.billing.circuit_threshold,
            Duration::from_secs(self.deps.config.billing.circuit_open_secs),
        )
    }

    /// The batch `finally`: flip the phase to completed (success or
    /// partial) and let the next dispatch through.
    async fn complete_batch(&self) -> StoreResult<()> {
        self.deps
            .store
            .set_phase_status(self.upload_id, Phase::Billing, PhaseStatus::Completed)
            .await?;
        self.deps.kv.delete(&self.dispatch_lock_key).await;
        info!(upload_id = self.upload_id, batch_id = %self.batch_id, "billing batch completed");
        Ok(())
    }
}

#[async_trait]
impl Job for BillingChunkJob {
    fn queue(&self) -> QueueName {
        QueueName::Billing
    }

    fn name(&self) -> &str {
        "billing-chunk"
    }

    async fn run(&self, ctx: &JobCtx) -> Result<JobOutcome, JobError> {
        let breaker = self.breaker();
        if breaker.is_open().await {
            return Ok(JobOutcome::Release {
                delay: self.release_delay(),
            });
        }

        let limiter = RateLimiter::new(
            self.deps.kv.clone(),
            "billing_rate",
            self.deps.config.billing.rate_per_sec,
        );

        for debtor_id in &self.debtor_ids {
            if ctx
                .kv
                .get(&cancel_key("upload", self.upload_id))
                .await
                .is_some()
            {
                info!(upload_id = self.upload_id, "billing chunk cancelled");
                break;
            }
            if breaker.is_open().await {
                // Already-billed debtors skip themselves on re-entry.
                return Ok(JobOutcome::Release {
                    delay: self.release_delay(),
                });
            }
            limiter.acquire().await;

            let result = bill_one_debtor(
                &self.deps,
                *debtor_id,
                self.upload_model,
                Some(self.upload_id),
                AttemptContext::BatchUpload,
            )
            .await
            .map_err(|e| {
                if e.is_transient() {
                    JobError::Transient(e.to_string())
                } else {
                    JobError::Permanent(e.to_string())
                }
            })?;

            match result {
                BillResult::TransientFailure(message) => {
                    warn!(debtor_id, %message, "gateway failure counted against the circuit");
                    breaker.record_failure().await;
                }
                BillResult::Billed { .. } => breaker.record_success().await,
                BillResult::Skipped { .. } => {}
            }
        }

        let left = ctx.kv.incr(&self.countdown_key, -1, None).await;
        if left <= 0 {
            ctx.kv.delete(&self.countdown_key).await;
            self.complete_batch()
                .await
                .map_err(|e| JobError::Transient(e.to_string()))?;
        }
        Ok(JobOutcome::Done)
    }

    async fn on_failure(&self, error: &JobError) {
        warn!(upload_id = self.upload_id, %error, "billing chunk failed permanently");
        let left = self.deps.kv.incr(&self.countdown_key, -1, None).await;
        if left <= 0 {
            self.deps.kv.delete(&self.countdown_key).await;
            let _ = self.complete_batch().await;
        }
    }
}

/// Bill every active recurring profile whose cycle lock has expired,
/// through the latest debtor row known for the IBAN. Attempts carry no
/// upload id and the `recurring_billing` context.
#[instrument(skip(deps))]
pub async fn run_recurring_sweep(deps: &BillingDeps, limit: usize) -> StoreResult<usize> {
    let due = deps.store.profiles_due(Utc::now(), limit).await?;
    let mut billed = 0;
    for profile in due {
        let Some(debtor) = deps
            .store
            .latest_debtor_for_hash(&profile.iban_hash)
            .await?
        else {
            continue;
        };
        let result = bill_one_debtor(
            deps,
            debtor.id,
            profile.billing_model,
            None,
            AttemptContext::RecurringBilling,
        )
        .await?;
        if matches!(result, BillResult::Billed { .. }) {
            billed += 1;
        }
    }
    Ok(billed)
}
