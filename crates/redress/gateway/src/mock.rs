use crate::client::{
    ChargeRequest, ChargebackDetail, EmpGateway, GatewayError, GatewayOutcome, GatewayResult,
    GatewayStatus, TransactionPage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Scriptable in-memory gateway for tests and local runs.
///
/// Queue explicit outcomes with [`MockGateway::push_charge_outcome`];
/// when the queue is empty every charge approves with a generated
/// unique id. All submitted charges are recorded for assertions.
#[derive(Default)]
pub struct MockGateway {
    scripted_charges: Mutex<VecDeque<GatewayResult<GatewayOutcome>>>,
    reconcile_results: Mutex<HashMap<String, GatewayOutcome>>,
    pages: Mutex<Vec<TransactionPage>>,
    charges_seen: Mutex<Vec<ChargeRequest>>,
    voided: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_charge_outcome(&self, outcome: GatewayResult<GatewayOutcome>) {
        self.scripted_charges.lock().unwrap().push_back(outcome);
    }

    /// Queue the same transient failure `n` times.
    pub fn push_transient_failures(&self, n: usize) {
        let mut queue = self.scripted_charges.lock().unwrap();
        for _ in 0..n {
            queue.push_back(Err(GatewayError::Transient("connection reset".into())));
        }
    }

    pub fn set_reconcile_result(&self, unique_id: &str, outcome: GatewayOutcome) {
        self.reconcile_results
            .lock()
            .unwrap()
            .insert(unique_id.to_string(), outcome);
    }

    pub fn set_pages(&self, pages: Vec<TransactionPage>) {
        *self.pages.lock().unwrap() = pages;
    }

    pub fn charges_seen(&self) -> Vec<ChargeRequest> {
        self.charges_seen.lock().unwrap().clone()
    }

    pub fn voided(&self) -> Vec<String> {
        self.voided.lock().unwrap().clone()
    }

    fn next_unique_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("mock-txn-{n}")
    }
}

#[async_trait]
impl EmpGateway for MockGateway {
    async fn charge(&self, request: &ChargeRequest) -> GatewayResult<GatewayOutcome> {
        self.charges_seen.lock().unwrap().push(request.clone());
        if let Some(scripted) = self.scripted_charges.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(GatewayOutcome {
            unique_id: Some(self.next_unique_id()),
            status: GatewayStatus::Approved,
            error_code: None,
            error_message: None,
        })
    }

    async fn reconcile(&self, unique_id: &str) -> GatewayResult<GatewayOutcome> {
        match self.reconcile_results.lock().unwrap().get(unique_id) {
            Some(outcome) => Ok(outcome.clone()),
            None => Ok(GatewayOutcome {
                unique_id: Some(unique_id.to_string()),
                status: GatewayStatus::Pending,
                error_code: None,
                error_message: None,
            }),
        }
    }

    async fn void(&self, unique_id: &str) -> GatewayResult<bool> {
        self.voided.lock().unwrap().push(unique_id.to_string());
        Ok(true)
    }

    async fn page(
        &self,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        page_n: u32,
    ) -> GatewayResult<TransactionPage> {
        let pages = self.pages.lock().unwrap();
        pages
            .get(page_n.saturating_sub(1) as usize)
            .cloned()
            .ok_or_else(|| GatewayError::Permanent(format!("no such page: {page_n}")))
    }

    async fn chargeback_detail(&self, _unique_id: &str) -> GatewayResult<ChargebackDetail> {
        Ok(ChargebackDetail {
            reason_code: Some("AC04".to_string()),
            reason_description: Some("Account closed".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request() -> ChargeRequest {
        ChargeRequest {
            amount: dec!(20.00),
            currency: "EUR".into(),
            iban: "DE89370400440532013000".into(),
            holder_name: "Ada Lovelace".into(),
            mandate_reference: "upload-1".into(),
            idempotency_key: "k".into(),
        }
    }

    #[tokio::test]
    async fn scripted_outcomes_drain_before_default_approval() {
        let gateway = MockGateway::new();
        gateway.push_charge_outcome(Ok(GatewayOutcome {
            unique_id: Some("scripted".into()),
            status: GatewayStatus::Declined,
            error_code: Some("05".into()),
            error_message: None,
        }));
        let first = gateway.charge(&request()).await.unwrap();
        assert_eq!(first.status, GatewayStatus::Declined);
        let second = gateway.charge(&request()).await.unwrap();
        assert_eq!(second.status, GatewayStatus::Approved);
        assert_eq!(gateway.charges_seen().len(), 2);
    }
}
