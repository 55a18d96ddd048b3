use async_trait::async_trait;
use chrono::Utc;
use redress_cache::{Kv as _, KvHandle};
use redress_types::{BavConfig, NameMatch};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Remote bank-account-verification (name match) service.
#[async_trait]
pub trait BavClient: Send + Sync {
    /// `Unavailable` covers every case where the service could not give
    /// a definitive yes/partial/no.
    async fn verify_name(&self, iban: &str, first_name: &str, last_name: &str) -> NameMatch;
}

/// Scriptable BAV client for tests: answers per IBAN, default
/// `Unavailable`.
#[derive(Default)]
pub struct MockBavClient {
    answers: Mutex<HashMap<String, NameMatch>>,
}

impl MockBavClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_answer(&self, iban: &str, outcome: NameMatch) {
        self.answers
            .lock()
            .unwrap()
            .insert(iban.to_string(), outcome);
    }
}

#[async_trait]
impl BavClient for MockBavClient {
    async fn verify_name(&self, iban: &str, _first: &str, _last: &str) -> NameMatch {
        self.answers
            .lock()
            .unwrap()
            .get(iban)
            .copied()
            .unwrap_or(NameMatch::Unavailable)
    }
}

/// Applies the sampling policy under the global daily quota.
pub struct BavSampler {
    kv: KvHandle,
    config: BavConfig,
}

impl BavSampler {
    /// Daily counters expire on their own well after the day ends.
    const DAILY_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);
    /// Uploads above this size hit the hard sampling cap.
    const LARGE_UPLOAD_ROWS: usize = 1000;

    pub fn new(kv: KvHandle, config: BavConfig) -> Self {
        Self { kv, config }
    }

    fn daily_key() -> String {
        format!("bav_daily_{}", Utc::now().format("%Y-%m-%d"))
    }

    /// How many of `upload_size` debtors to flag, respecting the
    /// percentage, the daily quota and the large-upload cap. Reserves
    /// the returned budget against today's counter.
    pub async fn reserve(&self, upload_size: usize) -> usize {
        if !self.config.enabled || upload_size == 0 {
            return 0;
        }
        let pct = usize::from(self.config.sampling_percentage.min(100));
        let mut wanted = (upload_size * pct).div_ceil(100);
        if upload_size > Self::LARGE_UPLOAD_ROWS {
            wanted = wanted.min(self.config.large_upload_cap as usize);
        }
        if wanted == 0 {
            return 0;
        }

        let key = Self::daily_key();
        let after = self
            .kv
            .incr(&key, wanted as i64, Some(Self::DAILY_TTL))
            .await;
        let limit = i64::from(self.config.daily_limit);
        if after <= limit {
            return wanted;
        }
        // Partially (or fully) over quota: hand back the excess.
        let over = after - limit;
        let granted = (wanted as i64 - over).max(0);
        self.kv.incr(&key, -(wanted as i64 - granted), None).await;
        granted as usize
    }
}
