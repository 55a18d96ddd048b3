use chrono::{DateTime, Duration, Utc};
use redress_store::{AttemptStore, DebtorStore, ProfileStore, StoreHandle, StoreResult};
use redress_types::{AttemptStatus, BillingAttempt, DebtorStatus, RedressConfig};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument};

/// Apply a gateway-reported status to an attempt, with identical
/// side-effects whether the status arrived by webhook or by
/// reconciliation poll.
///
/// Returns `false` when the transition was a no-op (unchanged status or
/// an illegal transition on a terminal attempt).
#[instrument(skip(store, config, attempt), fields(attempt_id = attempt.id))]
pub async fn apply_attempt_status(
    store: &StoreHandle,
    config: &RedressConfig,
    attempt: &BillingAttempt,
    new_status: AttemptStatus,
    error_code: Option<String>,
    error_message: Option<String>,
) -> StoreResult<bool> {
    if attempt.status == new_status {
        debug!(status = new_status.as_str(), "status unchanged");
        return Ok(false);
    }
    if !attempt.status.may_transition(new_status) {
        debug!(
            from = attempt.status.as_str(),
            to = new_status.as_str(),
            "illegal attempt transition ignored"
        );
        return Ok(false);
    }

    store
        .update_attempt_status(attempt.id, new_status, error_code, error_message)
        .await?;

    match new_status {
        AttemptStatus::Approved => {
            handle_success(store, config, attempt, Utc::now()).await?;
        }
        AttemptStatus::Chargebacked => {
            // The full chargeback flow (blacklist, profile deactivation,
            // chargeback record) belongs to the webhook handler; status
            // sync only demotes the debtor.
            demote_debtor(store, attempt.debtor_id).await?;
        }
        AttemptStatus::Declined | AttemptStatus::Error | AttemptStatus::Voided => {
            demote_debtor(store, attempt.debtor_id).await?;
        }
        AttemptStatus::Pending => {}
    }
    info!(status = new_status.as_str(), "attempt status applied");
    Ok(true)
}

/// The success handler: credit lifetime revenue, advance the recurring
/// cycle, and promote the debtor to recovered.
pub async fn handle_success(
    store: &StoreHandle,
    config: &RedressConfig,
    attempt: &BillingAttempt,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    if let Some(profile_id) = attempt.profile_id {
        if let Some(mut profile) = store.get_profile(profile_id).await? {
            profile.lifetime_revenue += attempt.amount;
            if profile.billing_model.is_recurring() {
                profile.last_success_at = Some(now);
                profile.last_billed_at = Some(now);
                if let Some(cycle) = config.billing.cycle_days(profile.billing_model) {
                    profile.next_bill_at = Some(now + Duration::days(cycle));
                }
            }
            store.update_profile(&profile).await?;
        }
    }

    if let Some(debtor) = store.get_debtor(attempt.debtor_id).await? {
        if debtor.status != DebtorStatus::Recovered
            && debtor.status.may_transition(DebtorStatus::Recovered)
        {
            store
                .set_debtor_status(debtor.id, DebtorStatus::Recovered)
                .await?;
        }
    }
    Ok(())
}

/// Chargeback side-effect on the profile: deactivate, clear the cycle
/// lock, and deduct the disputed amount from lifetime revenue (clamped
/// at zero).
pub async fn deactivate_profile_for_chargeback(
    store: &StoreHandle,
    attempt: &BillingAttempt,
    disputed_amount: Option<Decimal>,
) -> StoreResult<()> {
    let profile = match attempt.profile_id {
        Some(id) => store.get_profile(id).await?,
        None => {
            match store.get_debtor(attempt.debtor_id).await? {
                Some(debtor) => store.get_profile_by_hash(&debtor.iban_hash).await?,
                None => None,
            }
        }
    };
    let Some(mut profile) = profile else {
        return Ok(());
    };
    profile.is_active = false;
    profile.next_bill_at = None;
    profile.deduct_revenue(disputed_amount.unwrap_or(attempt.amount));
    store.update_profile(&profile).await
}

async fn demote_debtor(store: &StoreHandle, debtor_id: i64) -> StoreResult<()> {
    if let Some(debtor) = store.get_debtor(debtor_id).await? {
        if debtor.status.may_transition(DebtorStatus::Failed) {
            store
                .set_debtor_status(debtor_id, DebtorStatus::Failed)
                .await?;
        }
    }
    Ok(())
}

/// Auto-blacklist rule: chargeback reason codes from the configured set
/// blacklist the IBAN.
pub fn should_auto_blacklist(config: &RedressConfig, reason_code: Option<&str>) -> bool {
    match reason_code {
        Some(code) => config
            .chargeback
            .blacklist_codes
            .iter()
            .any(|c| c == code),
        None => false,
    }
}

/// Reason string recorded on chargeback-sourced blacklist entries.
pub const CHARGEBACK_BLACKLIST_REASON: &str = "chargeback";

/// Operator-initiated cancel of a pending attempt. Returns `false` when
/// the attempt is not voidable (already settled) or the gateway refused.
pub async fn void_attempt(
    store: &StoreHandle,
    gateway: &redress_gateway::GatewayHandle,
    config: &RedressConfig,
    attempt: &BillingAttempt,
) -> StoreResult<bool> {
    if !attempt.status.may_transition(AttemptStatus::Voided) {
        return Ok(false);
    }
    let Some(unique_id) = attempt.unique_id.as_deref() else {
        return Ok(false);
    };
    let accepted = gateway
        .void(unique_id)
        .await
        .map_err(crate::worker::gateway_to_store_error)?;
    if !accepted {
        return Ok(false);
    }
    apply_attempt_status(store, config, attempt, AttemptStatus::Voided, None, None).await
}
