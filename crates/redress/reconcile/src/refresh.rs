use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redress_billing::{
    apply_attempt_status, deactivate_profile_for_chargeback, BILLING_CIRCUIT_KEY,
};
use redress_cache::{CircuitBreaker, KvHandle, ProgressTracker};
use redress_gateway::{GatewayError, GatewayHandle, TransactionRecord};
use redress_jobs::{Job, JobCtx, JobError, JobOutcome, QueueName};
use redress_store::{AttemptStore, ChargebackStore, DebtorStore, StoreHandle, StoreResult};
use redress_types::{
    AttemptStatus, ChargebackSource, DebtorStatus, NewChargeback, RedressConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Bulk transaction refresh: page through the gateway's listing for a
/// date range and apply the status map through the shared handlers.
/// Chargebacks discovered this way import with `source = api_sync`.
#[instrument(skip(store, kv, gateway, config), fields(job_id))]
pub async fn run_emp_refresh(
    store: &StoreHandle,
    kv: &KvHandle,
    gateway: &GatewayHandle,
    config: &RedressConfig,
    job_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> StoreResult<usize> {
    let progress = ProgressTracker::new(kv.clone());
    let progress_key = format!("emp_refresh_{job_id}");

    let mut page_n = 1u32;
    let mut applied = 0usize;
    loop {
        let page = match gateway.page(from, to, page_n).await {
            Ok(page) => page,
            Err(GatewayError::Transient(message)) => {
                warn!(page_n, %message, "transient refresh failure");
                return Err(redress_store::StoreError::Backend(message));
            }
            Err(error) => {
                warn!(page_n, %error, "refresh aborted");
                break;
            }
        };

        for transaction in &page.transactions {
            if apply_refreshed_transaction(store, gateway, config, transaction).await? {
                applied += 1;
            }
        }

        progress
            .write(
                &progress_key,
                &serde_json::json!({
                    "page": page_n,
                    "pages": page.pages_count,
                    "applied": applied,
                }),
            )
            .await;

        if !page.has_more {
            break;
        }
        page_n += 1;
    }
    info!(job_id, applied, "gateway refresh finished");
    Ok(applied)
}

/// Apply one listed transaction. Unknown unique ids are logged and
/// skipped; the authoritative record may arrive later.
async fn apply_refreshed_transaction(
    store: &StoreHandle,
    gateway: &GatewayHandle,
    config: &RedressConfig,
    transaction: &TransactionRecord,
) -> StoreResult<bool> {
    let Some(attempt) = store
        .find_attempt_by_unique_id(&transaction.unique_id)
        .await?
    else {
        info!(unique_id = %transaction.unique_id, "refresh hit an unknown attempt");
        return Ok(false);
    };

    let Some(new_status) = redress_gateway::GatewayStatus::parse(&transaction.status)
        .to_attempt_status()
    else {
        return Ok(false);
    };

    if new_status != AttemptStatus::Chargebacked {
        return apply_attempt_status(store, config, &attempt, new_status, None, None).await;
    }

    // Chargeback import path (api_sync source).
    if attempt.status == AttemptStatus::Chargebacked {
        return Ok(false);
    }
    let detail = gateway
        .chargeback_detail(&transaction.unique_id)
        .await
        .ok();
    let reason_code = detail.as_ref().and_then(|d| d.reason_code.clone());
    let reason_description = detail.as_ref().and_then(|d| d.reason_description.clone());

    store
        .mark_attempt_chargebacked(
            attempt.id,
            transaction.post_date.unwrap_or_else(Utc::now),
            reason_code.clone(),
            reason_code.clone(),
        )
        .await?;
    if let Some(debtor) = store.get_debtor(attempt.debtor_id).await? {
        if debtor.status.may_transition(DebtorStatus::Failed) {
            store
                .set_debtor_status(debtor.id, DebtorStatus::Failed)
                .await?;
        }
    }
    deactivate_profile_for_chargeback(store, &attempt, transaction.amount).await?;
    store
        .insert_chargeback(NewChargeback {
            billing_attempt_id: attempt.id,
            debtor_id: attempt.debtor_id,
            original_transaction_unique_id: transaction.unique_id.clone(),
            cb_type: transaction.transaction_type.clone(),
            reason_code,
            reason_description,
            amount: transaction.amount,
            currency: transaction.currency.clone(),
            post_date: transaction.post_date,
            source: ChargebackSource::ApiSync,
            raw_response: serde_json::json!({
                "unique_id": transaction.unique_id,
                "status": transaction.status,
            }),
        })
        .await?;
    Ok(true)
}

/// Queue job for the bulk refresh, one identity per job id.
pub struct EmpRefreshJob {
    pub store: StoreHandle,
    pub kv: KvHandle,
    pub gateway: GatewayHandle,
    pub config: Arc<RedressConfig>,
    pub job_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[async_trait]
impl Job for EmpRefreshJob {
    fn queue(&self) -> QueueName {
        QueueName::EmpRefresh
    }

    fn name(&self) -> &str {
        "emp-refresh"
    }

    fn identity_key(&self) -> Option<String> {
        Some(format!("emp_refresh_{}", self.job_id))
    }

    async fn run(&self, _ctx: &JobCtx) -> Result<JobOutcome, JobError> {
        let breaker = CircuitBreaker::new(
            self.kv.clone(),
            BILLING_CIRCUIT_KEY,
            self.config.billing.circuit_threshold,
            Duration::from_secs(self.config.billing.circuit_open_secs),
        );
        if breaker.is_open().await {
            return Ok(JobOutcome::Release {
                delay: Duration::from_secs(self.config.circuit.release_delay_secs),
            });
        }
        run_emp_refresh(
            &self.store,
            &self.kv,
            &self.gateway,
            &self.config,
            &self.job_id,
            self.from,
            self.to,
        )
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
