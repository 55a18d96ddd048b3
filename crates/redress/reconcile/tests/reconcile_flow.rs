//! Reconciler and bulk-refresh flows over the memory store and the mock
//! gateway.

use redress_billing::{bill_one_debtor, BillResult, BillingDeps};
use redress_cache::{Kv, KvHandle, MemoryKv};
use redress_gateway::{
    GatewayHandle, GatewayOutcome, GatewayStatus, MockGateway, TransactionPage, TransactionRecord,
};
use redress_reconcile::{run_emp_refresh, run_reconciliation_chunk};
use redress_store::memory::MemoryStore;
use redress_store::{AttemptStore, ChargebackStore, DebtorStore, ProfileStore, StoreHandle, UploadStore};
use redress_types::{
    AttemptContext, AttemptStatus, BillingModel, ChargebackSource, DebtorStatus, NewDebtor,
    NewUpload, ReconcileConfig, RedressConfig, ValidationStatus,
};
use rust_decimal_macros::dec;
use std::sync::Arc;

const IBAN: &str = "DE89370400440532013000";

struct Harness {
    store: StoreHandle,
    kv: KvHandle,
    gateway: Arc<MockGateway>,
    gateway_handle: GatewayHandle,
    config: Arc<RedressConfig>,
}

fn harness() -> Harness {
    let store: StoreHandle = Arc::new(MemoryStore::new());
    let kv: KvHandle = Arc::new(MemoryKv::new());
    let gateway = Arc::new(MockGateway::new());
    let gateway_handle: GatewayHandle = gateway.clone();
    let config = Arc::new(RedressConfig {
        reconcile: ReconcileConfig {
            // Fresh attempts are immediately due in tests.
            min_age_hours: 0,
            ..ReconcileConfig::default()
        },
        ..RedressConfig::default()
    });
    Harness {
        store,
        kv,
        gateway,
        gateway_handle,
        config,
    }
}

async fn pending_attempt(h: &Harness) -> (i64, String) {
    let upload = h
        .store
        .create_upload(NewUpload {
            original_filename: "r.csv".into(),
            stored_path: "/tmp/r.csv".into(),
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
            email: None,
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

    h.gateway.push_charge_outcome(Ok(GatewayOutcome {
        unique_id: Some("pend-9".into()),
        status: GatewayStatus::PendingAsync,
        error_code: None,
        error_message: None,
    }));
    let deps = BillingDeps {
        store: h.store.clone(),
        kv: h.kv.clone(),
        gateway: h.gateway_handle.clone(),
        config: h.config.clone(),
    };
    let billed = bill_one_debtor(
        &deps,
        debtor_id,
        BillingModel::Flywheel,
        Some(upload.id),
        AttemptContext::BatchUpload,
    )
    .await
    .unwrap();
    assert!(matches!(
        billed,
        BillResult::Billed {
            status: AttemptStatus::Pending,
            ..
        }
    ));
    (debtor_id, "pend-9".to_string())
}

#[tokio::test]
async fn pending_attempts_settle_through_the_shared_handlers() {
    let h = harness();
    let (debtor_id, unique_id) = pending_attempt(&h).await;

    h.gateway.set_reconcile_result(
        &unique_id,
        GatewayOutcome {
            unique_id: Some(unique_id.clone()),
            status: GatewayStatus::Approved,
            error_code: None,
            error_message: None,
        },
    );

    let summary =
        run_reconciliation_chunk(&h.store, &h.kv, &h.gateway_handle, &h.config)
            .await
            .unwrap();
    assert_eq!(summary.polled, 1);
    assert_eq!(summary.updated, 1);

    let attempt = h
        .store
        .find_attempt_by_unique_id(&unique_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Approved);
    assert_eq!(attempt.reconciliation_attempts, 1);
    assert!(attempt.last_reconciled_at.is_some());

    // Same side-effects as the webhook path: recovered debtor, credited
    // profile, advanced cycle.
    let debtor = h.store.get_debtor(debtor_id).await.unwrap().unwrap();
    assert_eq!(debtor.status, DebtorStatus::Recovered);
    let profile = h
        .store
        .get_profile_by_hash(&debtor.iban_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile.lifetime_revenue, dec!(7.00));
}

#[tokio::test]
async fn attempts_over_their_poll_budget_drop_out() {
    let h = harness();
    let (_, unique_id) = pending_attempt(&h).await;

    // Leave the mock's default (still pending) so nothing settles.
    for _ in 0..h.config.reconcile.max_attempts {
        run_reconciliation_chunk(&h.store, &h.kv, &h.gateway_handle, &h.config)
            .await
            .unwrap();
    }
    let attempt = h
        .store
        .find_attempt_by_unique_id(&unique_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        attempt.reconciliation_attempts,
        h.config.reconcile.max_attempts
    );

    // The next sweep finds nothing to poll.
    let summary =
        run_reconciliation_chunk(&h.store, &h.kv, &h.gateway_handle, &h.config)
            .await
            .unwrap();
    assert_eq!(summary.polled, 0);
}

#[tokio::test]
async fn bulk_refresh_imports_api_sync_chargebacks() {
    let h = harness();
    let (debtor_id, unique_id) = pending_attempt(&h).await;

    h.gateway.set_pages(vec![TransactionPage {
        transactions: vec![TransactionRecord {
            unique_id: unique_id.clone(),
            status: "chargebacked".into(),
            transaction_type: Some("sdd_chargeback".into()),
            amount: Some(dec!(7.00)),
            currency: Some("EUR".into()),
            post_date: None,
        }],
        has_more: false,
        pages_count: 1,
    }]);

    let now = chrono::Utc::now();
    let applied = run_emp_refresh(
        &h.store,
        &h.kv,
        &h.gateway_handle,
        &h.config,
        "job-1",
        now - chrono::Duration::days(7),
        now,
    )
    .await
    .unwrap();
    assert_eq!(applied, 1);

    let attempt = h
        .store
        .find_attempt_by_unique_id(&unique_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Chargebacked);

    let record = h
        .store
        .chargeback_for_transaction(&unique_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.source, ChargebackSource::ApiSync);
    // The mock's chargeback detail feeds the reason code.
    assert_eq!(record.reason_code.as_deref(), Some("AC04"));

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

    // Progress was tracked under the advertised key.
    assert!(h.kv.get("emp_refresh_job-1").await.is_some());

    // A second refresh over the same page is a no-op.
    let again = run_emp_refresh(
        &h.store,
        &h.kv,
        &h.gateway_handle,
        &h.config,
        "job-2",
        now - chrono::Duration::days(7),
        now,
    )
    .await
    .unwrap();
    assert_eq!(again, 0);
}
