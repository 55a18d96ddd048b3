use crate::client::{
    ChargeRequest, ChargebackDetail, EmpGateway, GatewayError, GatewayOutcome, GatewayResult,
    GatewayStatus, TransactionPage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Connection settings for the HTTP gateway client.
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    /// Merchant account identifier sent with every call.
    pub account_id: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl HttpGatewayConfig {
    pub fn new(
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            account_id: account_id.into(),
            api_key: api_key.into(),
            timeout_secs: 30,
        }
    }
}

/// reqwest-backed gateway client.
pub struct HttpEmpGateway {
    client: reqwest::Client,
    config: HttpGatewayConfig,
}

#[derive(Debug, Deserialize)]
struct RawOutcome {
    #[serde(default)]
    unique_id: Option<String>,
    status: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl From<RawOutcome> for GatewayOutcome {
    fn from(raw: RawOutcome) -> Self {
        GatewayOutcome {
            unique_id: raw.unique_id,
            status: GatewayStatus::parse(&raw.status),
            error_code: raw.error_code,
            error_message: raw.error_message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVoid {
    success: bool,
}

impl HttpEmpGateway {
    pub fn new(config: HttpGatewayConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Permanent(format!("client build failed: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// POST a form and decode the shared outcome shape. Network failures
    /// and 5xx/429 are transient; other non-success codes are permanent.
    async fn post_form<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> GatewayResult<T> {
        let response = self
            .client
            .post(self.url(path))
            .basic_auth(&self.config.account_id, Some(&self.config.api_key))
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(GatewayError::Transient(format!(
                "gateway returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Permanent(format!(
                "gateway returned {status}"
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl EmpGateway for HttpEmpGateway {
    #[instrument(skip(self, request), fields(idempotency_key = %request.idempotency_key))]
    async fn charge(&self, request: &ChargeRequest) -> GatewayResult<GatewayOutcome> {
        let form = [
            ("transaction_type", "sale".to_string()),
            ("amount", request.amount.to_string()),
            ("currency", request.currency.clone()),
            ("iban", request.iban.clone()),
            ("holder", request.holder_name.clone()),
            ("mandate_reference", request.mandate_reference.clone()),
            ("idempotency_key", request.idempotency_key.clone()),
        ];
        let raw: RawOutcome = self.post_form("transactions", &form).await?;
        debug!(status = %raw.status, "charge submitted");
        Ok(raw.into())
    }

    #[instrument(skip(self))]
    async fn reconcile(&self, unique_id: &str) -> GatewayResult<GatewayOutcome> {
        let form = [("unique_id", unique_id.to_string())];
        let raw: RawOutcome = self.post_form("reconcile", &form).await?;
        Ok(raw.into())
    }

    #[instrument(skip(self))]
    async fn void(&self, unique_id: &str) -> GatewayResult<bool> {
        let form = [
            ("transaction_type", "void".to_string()),
            ("unique_id", unique_id.to_string()),
        ];
        let raw: RawVoid = self.post_form("transactions", &form).await?;
        Ok(raw.success)
    }

    #[instrument(skip(self))]
    async fn page(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page_n: u32,
    ) -> GatewayResult<TransactionPage> {
        let form = [
            ("start_date", from.to_rfc3339()),
            ("end_date", to.to_rfc3339()),
            ("page", page_n.to_string()),
        ];
        self.post_form("transactions/list", &form).await
    }

    #[instrument(skip(self))]
    async fn chargeback_detail(&self, unique_id: &str) -> GatewayResult<ChargebackDetail> {
        let form = [("unique_id", unique_id.to_string())];
        self.post_form("chargebacks/detail", &form).await
    }
}
