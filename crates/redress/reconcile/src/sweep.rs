use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use redress_billing::apply_attempt_status;
use redress_cache::{CircuitBreaker, KvHandle, RateLimiter};
use redress_gateway::{GatewayError, GatewayHandle};
use redress_jobs::{Job, JobCtx, JobError, JobOutcome, QueueName};
use redress_store::{AttemptStore, StoreHandle, StoreResult};
use redress_types::{AttemptStatus, RedressConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Key of the reconciliation circuit breaker.
pub const RECONCILE_CIRCUIT_KEY: &str = "reconciliation_circuit_open";

/// Outcome of one reconciliation chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub polled: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Poll one chunk of pending attempts against the gateway.
///
/// Selection: pending, carrying a gateway unique id, older than the
/// configured minimum age, under the reconciliation budget; oldest
/// first, never-polled first. Every poll is counted on the attempt
/// whatever the outcome.
#[instrument(skip(store, kv, gateway, config))]
pub async fn run_reconciliation_chunk(
    store: &StoreHandle,
    kv: &KvHandle,
    gateway: &GatewayHandle,
    config: &RedressConfig,
) -> StoreResult<ReconcileSummary> {
    let now = Utc::now();
    let older_than = now - ChronoDuration::hours(config.reconcile.min_age_hours);
    let due = store
        .pending_for_reconciliation(
            older_than,
            config.reconcile.max_attempts,
            config.reconcile.chunk_size,
        )
        .await?;
    if due.is_empty() {
        return Ok(ReconcileSummary::default());
    }

    let breaker = CircuitBreaker::new(
        kv.clone(),
        RECONCILE_CIRCUIT_KEY,
        config.reconcile.circuit_threshold,
        Duration::from_secs(config.reconcile.circuit_open_secs),
    );
    let limiter = RateLimiter::new(kv.clone(), "reconcile_rate", config.reconcile.rate_per_sec);

    let mut summary = ReconcileSummary::default();
    for attempt in due {
        if breaker.is_open().await {
            info!("reconciliation circuit open, stopping the chunk early");
            break;
        }
        limiter.acquire().await;

        let Some(unique_id) = attempt.unique_id.as_deref() else {
            continue;
        };
        store.record_reconciliation(attempt.id, Utc::now()).await?;
        summary.polled += 1;

        match gateway.reconcile(unique_id).await {
            Ok(outcome) => {
                breaker.record_success().await;
                let Some(new_status) = outcome.status.to_attempt_status() else {
                    continue;
                };
                let applied = apply_attempt_status(
                    store,
                    config,
                    &attempt,
                    new_status,
                    outcome.error_code,
                    outcome.error_message,
                )
                .await?;
                if applied {
                    summary.updated += 1;
                }
            }
            Err(GatewayError::Transient(message)) => {
                warn!(unique_id, %message, "transient reconcile failure");
                breaker.record_failure().await;
                summary.failed += 1;
            }
            Err(error) => {
                // Explicitly invalid data: the attempt is done for.
                warn!(unique_id, %error, "permanent reconcile failure");
                let applied = apply_attempt_status(
                    store,
                    config,
                    &attempt,
                    AttemptStatus::Error,
                    None,
                    Some(error.to_string()),
                )
                .await?;
                if applied {
                    summary.updated += 1;
                }
            }
        }
    }
    info!(
        polled = summary.polled,
        updated = summary.updated,
        failed = summary.failed,
        "reconciliation chunk finished"
    );
    Ok(summary)
}

/// Queue job wrapping one reconciliation chunk.
pub struct ReconcileJob {
    pub store: StoreHandle,
    pub kv: KvHandle,
    pub gateway: GatewayHandle,
    pub config: Arc<RedressConfig>,
}

#[async_trait]
impl Job for ReconcileJob {
    fn queue(&self) -> QueueName {
        QueueName::Reconciliation
    }

    fn name(&self) -> &str {
        "reconcile-chunk"
    }

    fn identity_key(&self) -> Option<String> {
        Some("reconciliation_sweep".to_string())
    }

    async fn run(&self, _ctx: &JobCtx) -> Result<JobOutcome, JobError> {
        let breaker = CircuitBreaker::new(
            self.kv.clone(),
            RECONCILE_CIRCUIT_KEY,
            self.config.reconcile.circuit_threshold,
            Duration::from_secs(self.config.reconcile.circuit_open_secs),
        );
        if breaker.is_open().await {
            return Ok(JobOutcome::Release {
                delay: Duration::from_secs(self.config.circuit.release_delay_secs),
            });
        }
        run_reconciliation_chunk(&self.store, &self.kv, &self.gateway, &self.config)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    JobError::Transient(e.to_string())
                } else {
                    JobError::Permanent(e.to_string())
                }
            })?;
        Ok(JobOutcome::Done)
    }
}
