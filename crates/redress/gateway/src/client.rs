use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redress_types::{AttemptStatus, DebtorId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Result type for gateway calls.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway-layer errors.
///
/// Transient errors are retried with backoff and feed the circuit
/// breaker; permanent errors mark the attempt `error` and are never
/// retried automatically.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient gateway error: {0}")]
    Transient(String),

    #[error("permanent gateway error: {0}")]
    Permanent(String),

    #[error("gateway response decode error: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Raw status vocabulary of the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Approved,
    Declined,
    Error,
    Voided,
    Chargebacked,
    Pending,
    PendingAsync,
    /// Anything the closed table does not know; leaves local state
    /// unchanged.
    Other(String),
}

impl GatewayStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "approved" => Self::Approved,
            "declined" => Self::Declined,
            "error" => Self::Error,
            "voided" => Self::Voided,
            "chargebacked" => Self::Chargebacked,
            "pending" => Self::Pending,
            "pending_async" => Self::PendingAsync,
            other => Self::Other(other.to_string()),
        }
    }

    /// The closed gateway-to-internal mapping. `None` means "unchanged".
    pub fn to_attempt_status(&self) -> Option<AttemptStatus> {
        match self {
            Self::Approved => Some(AttemptStatus::Approved),
            Self::Declined => Some(AttemptStatus::Declined),
            Self::Error => Some(AttemptStatus::Error),
            Self::Voided => Some(AttemptStatus::Voided),
            Self::Chargebacked => Some(AttemptStatus::Chargebacked),
            Self::Pending | Self::PendingAsync => Some(AttemptStatus::Pending),
            Self::Other(_) => None,
        }
    }
}

/// One charge submission.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub amount: Decimal,
    pub currency: String,
    pub iban: String,
    pub holder_name: String,
    /// SEPA mandate context forwarded opaquely.
    pub mandate_reference: String,
    /// Client-side idempotency key; the gateway may or may not honor it.
    pub idempotency_key: String,
}

/// Outcome of `charge` and `reconcile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOutcome {
    pub unique_id: Option<String>,
    pub status: GatewayStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// One transaction in a bulk-refresh page.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRecord {
    pub unique_id: String,
    pub status: String,
    #[serde(default)]
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub post_date: Option<DateTime<Utc>>,
}

/// One page of the bulk-refresh listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionPage {
    pub transactions: Vec<TransactionRecord>,
    pub has_more: bool,
    pub pages_count: u32,
}

/// Chargeback detail lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargebackDetail {
    pub reason_code: Option<String>,
    pub reason_description: Option<String>,
}

/// The essential gateway surface, wrapped.
#[async_trait]
pub trait EmpGateway: Send + Sync {
    async fn charge(&self, request: &ChargeRequest) -> GatewayResult<GatewayOutcome>;

    async fn reconcile(&self, unique_id: &str) -> GatewayResult<GatewayOutcome>;

    /// Cancel a pending transaction; `true` on success.
    async fn void(&self, unique_id: &str) -> GatewayResult<bool>;

    /// Bulk transaction listing for periodic refresh.
    async fn page(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page_n: u32,
    ) -> GatewayResult<TransactionPage>;

    async fn chargeback_detail(&self, unique_id: &str) -> GatewayResult<ChargebackDetail>;
}

/// Client-side idempotency key: stable for the same debtor, attempt
/// number and hour bucket, so a worker retry within the hour replays the
/// same key while a genuine re-bill later produces a fresh one.
pub fn idempotency_key(debtor_id: DebtorId, attempt_number: i32, now: DateTime<Utc>) -> String {
    let bucket = now.timestamp() / 3600;
    let seed = format!("{debtor_id}:{attempt_number}:{bucket}");
    hex::encode(Sha256::digest(seed.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_mapping_is_the_closed_table() {
        assert_eq!(
            GatewayStatus::parse("approved").to_attempt_status(),
            Some(AttemptStatus::Approved)
        );
        assert_eq!(
            GatewayStatus::parse("pending_async").to_attempt_status(),
            Some(AttemptStatus::Pending)
        );
        assert_eq!(
            GatewayStatus::parse("chargebacked").to_attempt_status(),
            Some(AttemptStatus::Chargebacked)
        );
        assert_eq!(GatewayStatus::parse("weird_new_state").to_attempt_status(), None);
    }

    #[test]
    fn idempotency_key_is_stable_within_the_hour() {
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 5, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 55, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2025, 6, 1, 11, 5, 0).unwrap();
        assert_eq!(idempotency_key(7, 2, t1), idempotency_key(7, 2, t2));
        assert_ne!(idempotency_key(7, 2, t1), idempotency_key(7, 2, t3));
        assert_ne!(idempotency_key(7, 2, t1), idempotency_key(7, 3, t1));
        assert_ne!(idempotency_key(8, 2, t1), idempotency_key(7, 2, t1));
    }
}
