use crate::eligibility::{can_bill, BillRefusal};
use chrono::{Duration, Utc};
use redress_dedup::exclusivity_skip;
use redress_gateway::{idempotency_key, ChargeRequest, GatewayError, GatewayHandle};
use redress_cache::KvHandle;
use redress_store::{
    AttemptStore, BillingTxn as _, DebtorStore, ProfileStore, StoreHandle, StoreResult, TxnStore,
};
use redress_types::{
    AttemptContext, AttemptId, AttemptStatus, BillingModel, DebtorId, DebtorStatus,
    NewBillingAttempt, RedressConfig, UploadId,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Map a gateway error to a store error for callers that must return one
/// (transient errors stay retryable).
pub(crate) fn gateway_to_store_error(error: GatewayError) -> redress_store::StoreError {
    match error {
        GatewayError::Transient(m) => redress_store::StoreError::Backend(m),
        other => redress_store::StoreError::InvariantViolation(other.to_string()),
    }
}

/// Shared handles of the billing hot path.
#[derive(Clone)]
pub struct BillingDeps {
    pub store: StoreHandle,
    pub kv: KvHandle,
    pub gateway: GatewayHandle,
    pub config: Arc<RedressConfig>,
}

/// Outcome of billing one debtor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillResult {
    /// An attempt row was persisted (any mapped status).
    Billed {
        attempt_id: AttemptId,
        status: AttemptStatus,
    },
    /// Pre-checks or under-lock re-checks excluded the debtor.
    Skipped { reason: String },
    /// The gateway failed transiently; nothing was persisted and the
    /// debtor stays eligible for a later run.
    TransientFailure(String),
}

/// Bill a single debtor through the transactional hot path.
///
/// The profile row is locked first; exclusivity and the cycle lock are
/// re-evaluated under that lock before the gateway is called, and the
/// attempt row plus all profile/debtor updates commit atomically.
#[instrument(skip(deps), fields(debtor_id))]
pub async fn bill_one_debtor(
    deps: &BillingDeps,
    debtor_id: DebtorId,
    upload_model: BillingModel,
    upload_id: Option<UploadId>,
    context: AttemptContext,
) -> StoreResult<BillResult> {
    let now = Utc::now();
    let Some(debtor) = deps.store.get_debtor(debtor_id).await? else {
        return Ok(BillResult::Skipped {
            reason: "debtor vanished".to_string(),
        });
    };

    // Re-released chunks re-encounter debtors already billed this batch.
    if context == AttemptContext::BatchUpload && debtor.status != DebtorStatus::Uploaded {
        return Ok(BillResult::Skipped {
            reason: format!("debtor already {}", debtor.status),
        });
    }

    let row_model = deps
        .config
        .billing
        .resolve_row_model(upload_model, debtor.amount);

    let pre_profile = deps.store.get_profile_by_hash(&debtor.iban_hash).await?;
    let precheck_amount = match row_model {
        BillingModel::Legacy => debtor.amount,
        _ => pre_profile
            .as_ref()
            .and_then(|p| p.billing_amount)
            .unwrap_or(debtor.amount),
    };
    if context == AttemptContext::BatchUpload {
        if let Err(refusal) = can_bill(
            &debtor,
            precheck_amount,
            &deps.config.billing,
            pre_profile.as_ref(),
        ) {
            return Ok(BillResult::Skipped {
                reason: format!("{refusal:?}"),
            });
        }
    }

    let mut txn = deps.store.begin_billing().await?;
    let locked_profile = txn.profile_for_update(&debtor.iban_hash).await?;

    if let Some(reason) = exclusivity_skip(row_model, locked_profile.as_ref()) {
        debug!(debtor_id, reason = reason.as_str(), "billing skipped under lock");
        return Ok(BillResult::Skipped {
            reason: reason.as_str().to_string(),
        });
    }

    let mut profile = locked_profile;
    if row_model.is_recurring() {
        let mut p = match profile {
            Some(p) => p,
            None => {
                txn.create_profile(
                    &debtor.iban_hash,
                    &redress_iban::mask(&debtor.iban),
                    row_model,
                    &debtor.currency,
                )
                .await?
            }
        };
        if !p.is_active {
            return Ok(BillResult::Skipped {
                reason: "profile inactive".to_string(),
            });
        }
        if p.cycle_locked(now) {
            let until = p
                .next_bill_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default();
            return Ok(BillResult::Skipped {
                reason: format!("cycle-lock until {until}"),
            });
        }
        if p.billing_amount.is_none() {
            p.billing_amount = Some(debtor.amount);
        }
        p.currency = debtor.currency.clone();
        p.iban_masked = redress_iban::mask(&debtor.iban);
        profile = Some(p);
    }

    let amount_to_bill = match row_model {
        BillingModel::Legacy => debtor.amount,
        _ => profile
            .as_ref()
            .and_then(|p| p.billing_amount)
            .unwrap_or(debtor.amount),
    };

    let attempt_number = txn.next_attempt_number(debtor.id).await?;
    let key = idempotency_key(debtor.id, attempt_number, now);
    let holder = format!("{} {}", debtor.first_name, debtor.last_name);
    let request = ChargeRequest {
        amount: amount_to_bill,
        currency: debtor.currency.clone(),
        iban: debtor.iban.clone(),
        holder_name: holder.trim().to_string(),
        mandate_reference: upload_id
            .map(|id| format!("upload-{id}"))
            .unwrap_or_else(|| format!("profile-{}", debtor.iban_hash)),
        idempotency_key: key.clone(),
    };

    let outcome = match deps.gateway.charge(&request).await {
        Ok(outcome) => outcome,
        Err(GatewayError::Transient(message)) => {
            // Nothing persisted; the transaction rolls back on drop.
            warn!(debtor_id, %message, "transient gateway failure");
            return Ok(BillResult::TransientFailure(message));
        }
        Err(error) => {
            // Permanent refusals persist an errored attempt.
            let attempt = txn
                .insert_attempt(NewBillingAttempt {
                    debtor_id: debtor.id,
                    upload_id,
                    profile_id: profile.as_ref().map(|p| p.id),
                    emp_account_id: None,
                    attempt_number,
                    unique_id: None,
                    amount: amount_to_bill,
                    currency: debtor.currency.clone(),
                    billing_model: row_model,
                    context,
                    status: AttemptStatus::Error,
                    error_code: None,
                    error_message: Some(error.to_string()),
                    meta: serde_json::json!({ "idempotency_key": key }),
                })
                .await?;
            if debtor.status.may_transition(DebtorStatus::Failed) {
                txn.set_debtor_status(debtor.id, DebtorStatus::Failed).await?;
            }
            txn.commit().await?;
            return Ok(BillResult::Billed {
                attempt_id: attempt.id,
                status: AttemptStatus::Error,
            });
        }
    };

    // A unique id we have already recorded means the gateway replayed an
    // earlier submission; the existing attempt is authoritative.
    if let Some(unique_id) = outcome.unique_id.as_deref() {
        if let Some(existing) = deps.store.find_attempt_by_unique_id(unique_id).await? {
            info!(debtor_id, unique_id, "duplicate gateway unique id, reusing attempt");
            return Ok(BillResult::Billed {
                attempt_id: existing.id,
                status: existing.status,
            });
        }
    }

    let (status, error_code, error_message) = match outcome.status.to_attempt_status() {
        Some(status) => (status, outcome.error_code, outcome.error_message),
        None => (
            AttemptStatus::Error,
            Some("unmapped_status".to_string()),
            outcome.error_message,
        ),
    };

    let attempt = txn
        .insert_attempt(NewBillingAttempt {
            debtor_id: debtor.id,
            upload_id,
            profile_id: profile.as_ref().map(|p| p.id),
            emp_account_id: None,
            attempt_number,
            unique_id: outcome.unique_id,
            amount: amount_to_bill,
            currency: debtor.currency.clone(),
            billing_model: row_model,
            context,
            status,
            error_code,
            error_message,
            meta: serde_json::json!({ "idempotency_key": key }),
        })
        .await?;

    let next_debtor_status = match status {
        AttemptStatus::Approved => Some(DebtorStatus::Approved),
        AttemptStatus::Pending => Some(DebtorStatus::Pending),
        AttemptStatus::Declined | AttemptStatus::Error | AttemptStatus::Voided => {
            Some(DebtorStatus::Failed)
        }
        AttemptStatus::Chargebacked => Some(DebtorStatus::Failed),
    };
    if let Some(next) = next_debtor_status {
        if debtor.status.may_transition(next) {
            txn.set_debtor_status(debtor.id, next).await?;
        }
    }

    if let Some(mut p) = profile {
        if row_model.is_recurring()
            && matches!(status, AttemptStatus::Approved | AttemptStatus::Pending)
        {
            if status == AttemptStatus::Approved {
                p.last_success_at = Some(now);
                p.last_billed_at = Some(now);
            }
            if let Some(cycle) = deps.config.billing.cycle_days(row_model) {
                p.next_bill_at = Some(now + Duration::days(cycle));
            }
        }
        txn.save_profile(&p).await?;
        if debtor.profile_id.is_none() {
            txn.link_profile(debtor.id, p.id).await?;
        }
    }

    txn.commit().await?;
    info!(debtor_id, attempt_id = attempt.id, status = status.as_str(), "attempt persisted");
    Ok(BillResult::Billed {
        attempt_id: attempt.id,
        status,
    })
}
