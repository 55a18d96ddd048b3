use crate::payload::{ProcessingType, WebhookPayload};
use chrono::Utc;
use redress_billing::{
    apply_attempt_status, deactivate_profile_for_chargeback, should_auto_blacklist,
    CHARGEBACK_BLACKLIST_REASON,
};
use redress_cache::{Kv as _, KvHandle};
use redress_gateway::GatewayStatus;
use redress_store::{
    AttemptStore, BlacklistStore, ChargebackStore, DebtorStore, StoreHandle, StoreResult,
};
use redress_types::{
    AttemptStatus, BillingAttempt, ChargebackSource, DebtorStatus, NewBlacklistEntry,
    NewChargeback, RedressConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// What the handler did with a delivery (the echo goes out either way).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    Processed,
    /// Second delivery inside the dedup window, or a replay of an
    /// already-applied event.
    Duplicate,
    /// Unknown unique id, unknown type, malformed body. Logged, no-op.
    Ignored(String),
}

/// Ingests gateway notifications with idempotent state transitions.
pub struct WebhookHandler {
    store: StoreHandle,
    kv: KvHandle,
    config: Arc<RedressConfig>,
}

impl WebhookHandler {
    /// Dedup window per (processing type, unique id).
    const DEDUP_TTL: Duration = Duration::from_secs(60 * 60);

    pub fn new(store: StoreHandle, kv: KvHandle, config: Arc<RedressConfig>) -> Self {
        Self { store, kv, config }
    }

    #[instrument(skip(self, payload))]
    pub async fn handle(&self, payload: &WebhookPayload) -> StoreResult<WebhookDisposition> {
        let Some(unique_id) = payload.unique_id.as_deref() else {
            warn!("notification without unique_id");
            return Ok(WebhookDisposition::Ignored("missing unique_id".into()));
        };
        let Some(processing_type) = payload.processing_type() else {
            warn!(unique_id, "notification with unknown processing type");
            return Ok(WebhookDisposition::Ignored("unknown processing type".into()));
        };

        let dedup_key = format!("webhook_{}_{unique_id}", processing_type.as_str());
        if !self.kv.set_nx(&dedup_key, "1", Self::DEDUP_TTL).await {
            info!(unique_id, kind = processing_type.as_str(), "duplicate delivery dropped");
            return Ok(WebhookDisposition::Duplicate);
        }

        let result = self.dispatch(unique_id, processing_type, payload).await;
        if result.is_err() {
            // Give a later retry or the reconciler another chance at the
            // event instead of eating it with the dedup window.
            self.kv.delete(&dedup_key).await;
        }
        result
    }

    async fn dispatch(
        &self,
        unique_id: &str,
        processing_type: ProcessingType,
        payload: &WebhookPayload,
    ) -> StoreResult<WebhookDisposition> {
        let Some(attempt) = self.store.find_attempt_by_unique_id(unique_id).await? else {
            // The authoritative attempt record may simply not have
            // landed yet; the bulk refresh will catch up later.
            info!(unique_id, "notification for an unknown attempt");
            return Ok(WebhookDisposition::Ignored("unknown unique id".into()));
        };

        match processing_type {
            ProcessingType::SddStatusUpdate => self.handle_status_update(&attempt, payload).await,
            ProcessingType::Chargeback => self.handle_chargeback(&attempt, payload).await,
            ProcessingType::RetrievalRequest => {
                self.handle_retrieval_request(&attempt, payload).await
            }
        }
    }

    async fn handle_status_update(
        &self,
        attempt: &BillingAttempt,
        payload: &WebhookPayload,
    ) -> StoreResult<WebhookDisposition> {
        let Some(raw_status) = payload.status.as_deref() else {
            return Ok(WebhookDisposition::Ignored("status update without status".into()));
        };
        let Some(new_status) = GatewayStatus::parse(raw_status).to_attempt_status() else {
            return Ok(WebhookDisposition::Ignored(format!(
                "unmapped gateway status: {raw_status}"
            )));
        };
        let applied = apply_attempt_status(
            &self.store,
            &self.config,
            attempt,
            new_status,
            payload.reason_code.clone(),
            payload.reason.clone(),
        )
        .await?;
        Ok(if applied {
            WebhookDisposition::Processed
        } else {
            WebhookDisposition::Duplicate
        })
    }

    async fn handle_chargeback(
        &self,
        attempt: &BillingAttempt,
        payload: &WebhookPayload,
    ) -> StoreResult<WebhookDisposition> {
        if attempt.status == AttemptStatus::Chargebacked {
            info!(attempt_id = attempt.id, "chargeback replay ignored");
            return Ok(WebhookDisposition::Duplicate);
        }
        let now = Utc::now();

        self.store
            .mark_attempt_chargebacked(
                attempt.id,
                payload.post_date_parsed().unwrap_or(now),
                payload.reason_code.clone(),
                payload.reason_code.clone(),
            )
            .await?;
        if let Some(arn) = payload.arn.as_deref() {
            self.store
                .merge_attempt_meta(attempt.id, serde_json::json!({ "arn": arn }))
                .await?;
        }

        let debtor = self.store.get_debtor(attempt.debtor_id).await?;
        if let Some(debtor) = &debtor {
            if debtor.status.may_transition(DebtorStatus::Failed) {
                self.store
                    .set_debtor_status(debtor.id, DebtorStatus::Failed)
                    .await?;
            }
        }

        if should_auto_blacklist(&self.config, payload.reason_code.as_deref()) {
            if let Some(debtor) = &debtor {
                if !debtor.iban.is_empty() {
                    self.store
                        .add_blacklist_entry(NewBlacklistEntry {
                            iban_hash: debtor.iban_hash.clone(),
                            iban: debtor.iban.clone(),
                            first_name: Some(debtor.first_name.clone()),
                            last_name: Some(debtor.last_name.clone()),
                            email: debtor.email.clone(),
                            reason: CHARGEBACK_BLACKLIST_REASON.to_string(),
                            source: "webhook".to_string(),
                            added_by: None,
                        })
                        .await?;
                }
            }
        }

        deactivate_profile_for_chargeback(&self.store, attempt, payload.amount).await?;

        let unique_id = attempt
            .unique_id
            .clone()
            .unwrap_or_else(|| format!("attempt-{}", attempt.id));
        let (_, created) = self
            .store
            .insert_chargeback(NewChargeback {
                billing_attempt_id: attempt.id,
                debtor_id: attempt.debtor_id,
                original_transaction_unique_id: unique_id,
                cb_type: payload.transaction_type.clone(),
                reason_code: payload.reason_code.clone(),
                reason_description: payload.reason.clone(),
                amount: payload.amount,
                currency: payload.currency.clone(),
                post_date: payload.post_date_parsed(),
                source: ChargebackSource::Webhook,
                raw_response: serde_json::to_value(payload).unwrap_or_default(),
            })
            .await?;
        info!(
            attempt_id = attempt.id,
            created, "chargeback recorded"
        );
        Ok(WebhookDisposition::Processed)
    }

    async fn handle_retrieval_request(
        &self,
        attempt: &BillingAttempt,
        payload: &WebhookPayload,
    ) -> StoreResult<WebhookDisposition> {
        // Append-only note on the attempt; no state change.
        let mut requests = attempt
            .meta
            .get("retrieval_requests")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        requests.push(serde_json::json!({
            "received_at": Utc::now().to_rfc3339(),
            "reason_code": payload.reason_code,
            "reason": payload.reason,
        }));
        self.store
            .merge_attempt_meta(
                attempt.id,
                serde_json::json!({ "retrieval_requests": requests }),
            )
            .await?;
        Ok(WebhookDisposition::Processed)
    }
}
