//! The full chargeback path, exercised twice to prove idempotency.

use redress_billing::{bill_one_debtor, BillingDeps};
use redress_cache::{Kv, KvHandle, MemoryKv};
use redress_gateway::{GatewayHandle, MockGateway};
use redress_store::memory::MemoryStore;
use redress_store::{
    AttemptStore, BlacklistStore, ChargebackStore, DebtorStore, ProfileStore, StoreHandle,
    UploadStore,
};
use redress_types::{
    AttemptContext, AttemptStatus, BillingModel, ChargebackConfig, ChargebackSource, DebtorStatus,
    NewDebtor, NewUpload, RedressConfig, ValidationStatus,
};
use redress_webhook::{WebhookDisposition, WebhookHandler, WebhookPayload};
use rust_decimal_macros::dec;
use std::sync::Arc;

const IBAN: &str = "DE89370400440532013000";

struct Harness {
    store: StoreHandle,
    kv: KvHandle,
    handler: WebhookHandler,
    deps: BillingDeps,
}

fn harness() -> Harness {
    let store: StoreHandle = Arc::new(MemoryStore::new());
    let kv: KvHandle = Arc::new(MemoryKv::new());
    let gateway: GatewayHandle = Arc::new(MockGateway::new());
    let config = Arc::new(RedressConfig {
        chargeback: ChargebackConfig {
            blacklist_codes: vec!["AC04".to_string()],
            excluded_cb_reason_codes: vec![],
        },
        ..RedressConfig::default()
    });
    let deps = BillingDeps {
        store: store.clone(),
        kv: kv.clone(),
        gateway,
        config: config.clone(),
    };
    let handler = WebhookHandler::new(store.clone(), kv.clone(), config);
    Harness {
        store,
        kv,
        handler,
        deps,
    }
}

/// Seed one flywheel debtor and bill it to an approved attempt.
async fn approved_attempt(h: &Harness) -> (i64, String) {
    let upload = h
        .store
        .create_upload(NewUpload {
            original_filename: "cb.csv".into(),
            stored_path: "/tmp/cb.csv".into(),
            size_bytes: 1,
            uploader_id: 1,
            billing_model: BillingModel::Flywheel,
        })
        .await
        .unwrap();
    let debtor_id = h
        .store
        .insert_debtors(vec![NewDebtor {
            upload_id: upload.id,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: Some("ada@example.com".into()),
            iban: IBAN.into(),
            iban_hash: redress_iban::hash(IBAN),
            iban_valid: true,
            country: Some("DE".into()),
            amount: dec!(7.00),
            currency: "EUR".into(),
            raw_row: serde_json::json!({}),
            skip_reason: None,
            profile_id: None,
        }])
        .await
        .unwrap()[0]
        .id;
    h.store
        .update_validation(debtor_id, ValidationStatus::Valid, vec![], chrono::Utc::now())
        .await
        .unwrap();

    let billed = bill_one_debtor(
        &h.deps,
        debtor_id,
        BillingModel::Flywheel,
        Some(upload.id),
        AttemptContext::BatchUpload,
    )
    .await
    .unwrap();
    let redress_billing::BillResult::Billed { attempt_id, .. } = billed else {
        panic!("expected a billed outcome, got {billed:?}");
    };

    let debtor = h.store.get_debtor(debtor_id).await.unwrap().unwrap();
    assert_eq!(debtor.status, DebtorStatus::Approved);
    let profile = h
        .store
        .get_profile_by_hash(&debtor.iban_hash)
        .await
        .unwrap()
        .unwrap();
    assert!(profile.is_active);
    assert!(profile.next_bill_at.is_some());

    // Give the profile some revenue so the deduction is visible.
    let mut profile = profile;
    profile.lifetime_revenue = dec!(5.00);
    h.store.update_profile(&profile).await.unwrap();

    let attempt = h
        .store
        .get_attempt(attempt_id)
        .await
        .unwrap()
        .expect("attempt persisted");
    (debtor_id, attempt.unique_id.expect("gateway unique id"))
}

fn chargeback_payload(unique_id: &str) -> WebhookPayload {
    WebhookPayload {
        unique_id: Some(unique_id.to_string()),
        transaction_type: Some("chargeback".to_string()),
        status: Some("chargebacked".to_string()),
        arn: Some("ARN-555".to_string()),
        reason_code: Some("AC04".to_string()),
        reason: Some("Account closed".to_string()),
        amount: Some(dec!(7.00)),
        currency: Some("EUR".to_string()),
        post_date: Some("2025-06-01".to_string()),
    }
}

#[tokio::test]
async fn chargeback_applies_every_side_effect_exactly_once() {
    let h = harness();
    let (debtor_id, unique_id) = approved_attempt(&h).await;

    let first = h
        .handler
        .handle(&chargeback_payload(&unique_id))
        .await
        .unwrap();
    assert_eq!(first, WebhookDisposition::Processed);

    let attempt = h
        .store
        .find_attempt_by_unique_id(&unique_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Chargebacked);
    assert!(attempt.chargebacked_at.is_some());
    assert_eq!(attempt.chargeback_reason_code.as_deref(), Some("AC04"));
    assert_eq!(attempt.meta["arn"], "ARN-555");

    let debtor = h.store.get_debtor(debtor_id).await.unwrap().unwrap();
    assert_eq!(debtor.status, DebtorStatus::Failed);

    let profile = h
        .store
        .get_profile_by_hash(&debtor.iban_hash)
        .await
        .unwrap()
        .unwrap();
    assert!(!profile.is_active);
    assert_eq!(profile.next_bill_at, None);
    // 5.00 on record minus the 7.00 dispute clamps at zero.
    assert_eq!(profile.lifetime_revenue, dec!(0));

    let blacklisted = h
        .store
        .blacklisted_hashes(&[debtor.iban_hash.clone()])
        .await
        .unwrap();
    assert_eq!(blacklisted.len(), 1);

    let record = h
        .store
        .chargeback_for_transaction(&unique_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.source, ChargebackSource::Webhook);
    assert_eq!(record.reason_code.as_deref(), Some("AC04"));

    // Second identical delivery inside the dedup window: dropped.
    let second = h
        .handler
        .handle(&chargeback_payload(&unique_id))
        .await
        .unwrap();
    assert_eq!(second, WebhookDisposition::Duplicate);

    // And even past the window the handlers themselves are idempotent.
    h.kv.delete(&format!("webhook_chargeback_{unique_id}")).await;
    let third = h
        .handler
        .handle(&chargeback_payload(&unique_id))
        .await
        .unwrap();
    assert_eq!(third, WebhookDisposition::Duplicate);

    let profile_after = h
        .store
        .get_profile_by_hash(&debtor.iban_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile_after.lifetime_revenue, dec!(0));
    assert_eq!(
        h.store
            .blacklisted_hashes(&[debtor.iban_hash.clone()])
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn status_update_to_approved_promotes_the_debtor() {
    let h = harness();
    let (debtor_id, unique_id) = approved_attempt(&h).await;

    // The gateway settles the (already approved) attempt again; the
    // transition is a no-op, the debtor stays put.
    let payload = WebhookPayload {
        unique_id: Some(unique_id.clone()),
        transaction_type: Some("sdd_status_update".to_string()),
        status: Some("approved".to_string()),
        ..WebhookPayload::default()
    };
    let disposition = h.handler.handle(&payload).await.unwrap();
    assert_eq!(disposition, WebhookDisposition::Duplicate);
    let debtor = h.store.get_debtor(debtor_id).await.unwrap().unwrap();
    assert_eq!(debtor.status, DebtorStatus::Approved);
}

#[tokio::test]
async fn retrieval_requests_touch_only_meta() {
    let h = harness();
    let (debtor_id, unique_id) = approved_attempt(&h).await;

    let payload = WebhookPayload {
        unique_id: Some(unique_id.clone()),
        transaction_type: Some("retrieval_request".to_string()),
        reason_code: Some("RR01".to_string()),
        ..WebhookPayload::default()
    };
    assert_eq!(
        h.handler.handle(&payload).await.unwrap(),
        WebhookDisposition::Processed
    );

    let attempt = h
        .store
        .find_attempt_by_unique_id(&unique_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Approved);
    assert_eq!(attempt.meta["retrieval_requests"].as_array().unwrap().len(), 1);
    let debtor = h.store.get_debtor(debtor_id).await.unwrap().unwrap();
    assert_eq!(debtor.status, DebtorStatus::Approved);
}
