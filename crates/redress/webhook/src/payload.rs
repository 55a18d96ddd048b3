use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What kind of notification arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingType {
    Chargeback,
    RetrievalRequest,
    SddStatusUpdate,
}

impl ProcessingType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "chargeback" => Some(Self::Chargeback),
            "retrieval_request" => Some(Self::RetrievalRequest),
            "sdd_status_update" => Some(Self::SddStatusUpdate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chargeback => "chargeback",
            Self::RetrievalRequest => "retrieval_request",
            Self::SddStatusUpdate => "sdd_status_update",
        }
    }
}

/// Form-encoded notification body.
///
/// The gateway is inconsistent about chargeback field names across
/// notification versions; the aliases fold them onto one shape. Every
/// field is optional so a malformed delivery still reaches the handler
/// (and gets its echo) instead of bouncing at the extractor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default, alias = "processing_type")]
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub arn: Option<String>,
    #[serde(default, alias = "rc_code", alias = "error_code")]
    pub reason_code: Option<String>,
    #[serde(default, alias = "rc_description", alias = "reason_description")]
    pub reason: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub post_date: Option<String>,
}

impl WebhookPayload {
    pub fn processing_type(&self) -> Option<ProcessingType> {
        self.transaction_type
            .as_deref()
            .and_then(ProcessingType::parse)
    }

    pub fn post_date_parsed(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let raw = self.post_date.as_deref()?;
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .ok()
            .or_else(|| {
                chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn chargeback_field_aliases_fold() {
        let body = "unique_id=u1&transaction_type=chargeback&rc_code=AC04&rc_description=Account+closed&amount=20.00";
        let payload: WebhookPayload = serde_urlencoded_from(body);
        assert_eq!(payload.unique_id.as_deref(), Some("u1"));
        assert_eq!(payload.processing_type(), Some(ProcessingType::Chargeback));
        assert_eq!(payload.reason_code.as_deref(), Some("AC04"));
        assert_eq!(payload.reason.as_deref(), Some("Account closed"));
        assert_eq!(payload.amount, Some(dec!(20.00)));
    }

    #[test]
    fn unknown_types_are_none() {
        let payload: WebhookPayload = serde_urlencoded_from("unique_id=u1&transaction_type=party");
        assert_eq!(payload.processing_type(), None);
    }

    #[test]
    fn post_date_formats() {
        let mut p = WebhookPayload::default();
        p.post_date = Some("2025-06-01".into());
        assert!(p.post_date_parsed().is_some());
        p.post_date = Some("2025-06-01T10:00:00Z".into());
        assert!(p.post_date_parsed().is_some());
        p.post_date = Some("yesterday".into());
        assert!(p.post_date_parsed().is_none());
    }

    fn serde_urlencoded_from(body: &str) -> WebhookPayload {
        // The axum Form extractor uses the same urlencoded representation.
        serde_html_form_compat(body)
    }

    fn serde_html_form_compat(body: &str) -> WebhookPayload {
        let pairs: Vec<(String, String)> = body
            .split('&')
            .filter_map(|kv| {
                let (k, v) = kv.split_once('=')?;
                Some((k.to_string(), v.replace('+', " ")))
            })
            .collect();
        let json: serde_json::Map<String, serde_json::Value> = pairs
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        serde_json::from_value(serde_json::Value::Object(json)).unwrap()
    }
}
