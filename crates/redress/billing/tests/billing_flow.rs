//! End-to-end billing scenarios over the memory store and the mock
//! gateway.

use redress_billing::{
    apply_attempt_status, bill_one_debtor, BillResult, BillingDeps, BillingOrchestrator,
    BILLING_CIRCUIT_KEY,
};
use redress_cache::{Kv, KvHandle, MemoryKv};
use redress_gateway::{GatewayHandle, MockGateway};
use redress_jobs::JobRunner;
use redress_store::memory::MemoryStore;
use redress_store::{
    AttemptStore, BillingTarget, DebtorStore, ProfileStore, StoreHandle, UploadStore,
};
use redress_types::{
    AttemptContext, AttemptStatus, BillingModel, DebtorStatus, NewDebtor, NewUpload, PhaseStatus,
    RedressConfig, ValidationStatus,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: StoreHandle,
    kv: KvHandle,
    gateway: Arc<MockGateway>,
    deps: BillingDeps,
    runner: Arc<JobRunner>,
}

fn harness() -> Harness {
    let store: StoreHandle = Arc::new(MemoryStore::new());
    let kv: KvHandle = Arc::new(MemoryKv::new());
    let gateway = Arc::new(MockGateway::new());
    let gateway_handle: GatewayHandle = gateway.clone();
    let deps = BillingDeps {
        store: store.clone(),
        kv: kv.clone(),
        gateway: gateway_handle,
        config: Arc::new(RedressConfig::default()),
    };
    let runner = JobRunner::start(kv.clone(), |_| 2);
    Harness {
        store,
        kv,
        gateway,
        deps,
        runner,
    }
}

async fn seed_upload(store: &StoreHandle, model: BillingModel) -> i64 {
    store
        .create_upload(NewUpload {
            original_filename: "b.csv".into(),
            stored_path: "/tmp/b.csv".into(),
            size_bytes: 1,
            uploader_id: 1,
            billing_model: model,
        })
        .await
        .unwrap()
        .id
}

async fn seed_valid_debtor(
    store: &StoreHandle,
    upload_id: i64,
    iban: &str,
    amount: Decimal,
) -> i64 {
    let id = store
        .insert_debtors(vec![NewDebtor {
            upload_id,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: None,
            iban: iban.into(),
            iban_hash: redress_iban::hash(iban),
            iban_valid: true,
            country: Some("DE".into()),
            amount,
            currency: "EUR".into(),
            raw_row: serde_json::json!({}),
            skip_reason: None,
            profile_id: None,
        }])
        .await
        .unwrap()[0]
        .id;
    store
        .update_validation(id, ValidationStatus::Valid, vec![], chrono::Utc::now())
        .await
        .unwrap();
    id
}

async fn wait_for_phase(store: &StoreHandle, upload_id: i64, wanted: PhaseStatus) {
    for _ in 0..100 {
        let upload = store.get_upload(upload_id).await.unwrap().unwrap();
        if upload.phases.billing == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("billing phase never reached {wanted:?}");
}

const IBANS: [&str; 3] = [
    "DE89370400440532013000",
    "DE02120300000000202051",
    "DE02500105170137075030",
];

#[tokio::test]
async fn legacy_batch_approves_all_rows() {
    let h = harness();
    let upload_id = seed_upload(&h.store, BillingModel::Legacy).await;
    let mut ids = Vec::new();
    for (iban, amount) in IBANS.iter().zip([dec!(20), dec!(30), dec!(40)]) {
        ids.push(seed_valid_debtor(&h.store, upload_id, iban, amount).await);
    }

    let orchestrator = BillingOrchestrator::new(h.deps.clone(), h.runner.clone());
    assert!(orchestrator
        .dispatch(upload_id, BillingTarget::All)
        .await
        .unwrap());
    wait_for_phase(&h.store, upload_id, PhaseStatus::Completed).await;

    assert_eq!(h.gateway.charges_seen().len(), 3);
    for id in ids {
        let debtor = h.store.get_debtor(id).await.unwrap().unwrap();
        assert_eq!(debtor.status, DebtorStatus::Approved);
        // Legacy rows never spawn recurring profiles.
        assert!(debtor.profile_id.is_none());
    }
    h.runner.shutdown().await;
}

#[tokio::test]
async fn second_dispatch_is_short_circuited_while_a_batch_runs() {
    let h = harness();
    let upload_id = seed_upload(&h.store, BillingModel::Legacy).await;
    seed_valid_debtor(&h.store, upload_id, IBANS[0], dec!(20)).await;

    let orchestrator = BillingOrchestrator::new(h.deps.clone(), h.runner.clone());
    // Hold the dispatch lock by hand to model a running batch.
    assert!(h
        .kv
        .set_nx(
            &format!("processbilling_{upload_id}_lock"),
            "1",
            Duration::from_secs(600)
        )
        .await);
    assert!(!orchestrator
        .dispatch(upload_id, BillingTarget::All)
        .await
        .unwrap());
    h.runner.shutdown().await;
}

#[tokio::test]
async fn flywheel_cycle_lock_blocks_the_same_day_rebill() {
    let h = harness();
    let upload_id = seed_upload(&h.store, BillingModel::Flywheel).await;
    let first = seed_valid_debtor(&h.store, upload_id, IBANS[0], dec!(7.00)).await;

    let result = bill_one_debtor(
        &h.deps,
        first,
        BillingModel::Flywheel,
        Some(upload_id),
        AttemptContext::BatchUpload,
    )
    .await
    .unwrap();
    let BillResult::Billed { status, .. } = result else {
        panic!("expected a billed outcome, got {result:?}");
    };
    assert_eq!(status, AttemptStatus::Approved);

    let profile = h
        .store
        .get_profile_by_hash(&redress_iban::hash(IBANS[0]))
        .await
        .unwrap()
        .expect("profile created on first non-legacy billing");
    let next = profile.next_bill_at.expect("cycle lock set");
    let days = (next - chrono::Utc::now()).num_days();
    assert!((89..=90).contains(&days), "cycle is ~90 days, got {days}");
    assert_eq!(profile.billing_amount, Some(dec!(7.00)));

    // Same-day second upload with the same IBAN.
    let upload2 = seed_upload(&h.store, BillingModel::Flywheel).await;
    let second = seed_valid_debtor(&h.store, upload2, IBANS[0], dec!(7.00)).await;
    let result = bill_one_debtor(
        &h.deps,
        second,
        BillingModel::Flywheel,
        Some(upload2),
        AttemptContext::BatchUpload,
    )
    .await
    .unwrap();
    match result {
        BillResult::Skipped { reason } => {
            assert!(reason.starts_with("cycle-lock until "), "{reason}")
        }
        other => panic!("expected a cycle-lock skip, got {other:?}"),
    }
    assert_eq!(h.gateway.charges_seen().len(), 1);
    h.runner.shutdown().await;
}

#[tokio::test]
async fn ten_consecutive_gateway_failures_open_the_circuit() {
    let h = harness();
    let upload_id = seed_upload(&h.store, BillingModel::Legacy).await;
    // Ten debtors, ten scripted transient failures.
    for i in 0..10 {
        let iban = IBANS[i % 3];
        // Distinct hashes so dedup history does not interfere.
        let fake = format!("{}{}", &iban[..iban.len() - 2], 10 + i);
        seed_valid_debtor(&h.store, upload_id, &fake, dec!(20)).await;
    }
    h.gateway.push_transient_failures(10);

    let orchestrator = BillingOrchestrator::new(h.deps.clone(), h.runner.clone());
    orchestrator
        .dispatch(upload_id, BillingTarget::All)
        .await
        .unwrap();
    wait_for_phase(&h.store, upload_id, PhaseStatus::Completed).await;

    assert!(h.kv.get(BILLING_CIRCUIT_KEY).await.is_some(), "circuit open");
    // No attempt rows were persisted for the failed charges.
    for debtor in h.store.list_debtors_for_upload(upload_id).await.unwrap() {
        assert_eq!(debtor.status, DebtorStatus::Uploaded);
    }
    h.runner.shutdown().await;
}

#[tokio::test]
async fn reconciled_approval_reuses_the_webhook_side_effects() {
    let h = harness();
    let upload_id = seed_upload(&h.store, BillingModel::Flywheel).await;
    let debtor_id = seed_valid_debtor(&h.store, upload_id, IBANS[0], dec!(7.00)).await;

    h.gateway.push_charge_outcome(Ok(redress_gateway::GatewayOutcome {
        unique_id: Some("pend-1".into()),
        status: redress_gateway::GatewayStatus::PendingAsync,
        error_code: None,
        error_message: None,
    }));
    bill_one_debtor(
        &h.deps,
        debtor_id,
        BillingModel::Flywheel,
        Some(upload_id),
        AttemptContext::BatchUpload,
    )
    .await
    .unwrap();

    let attempt = h
        .store
        .find_attempt_by_unique_id("pend-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Pending);

    let applied = apply_attempt_status(
        &h.store,
        &h.deps.config,
        &attempt,
        AttemptStatus::Approved,
        None,
        None,
    )
    .await
    .unwrap();
    assert!(applied);

    let debtor = h.store.get_debtor(debtor_id).await.unwrap().unwrap();
    assert_eq!(debtor.status, DebtorStatus::Recovered);
    let profile = h
        .store
        .get_profile_by_hash(&redress_iban::hash(IBANS[0]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.lifetime_revenue, dec!(7.00));
    assert!(profile.last_success_at.is_some());

    // Replaying the same approval is a no-op.
    let attempt = h.store.get_attempt(attempt.id).await.unwrap().unwrap();
    let replay = apply_attempt_status(
        &h.store,
        &h.deps.config,
        &attempt,
        AttemptStatus::Approved,
        None,
        None,
    )
    .await
    .unwrap();
    assert!(!replay);
    h.runner.shutdown().await;
}
