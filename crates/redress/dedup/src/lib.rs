//! Deduplication engine: classifies incoming rows against blacklist and
//! billing history before they enter the pipeline.
//!
//! Rules run in priority order and the first match wins, so every row
//! carries at most one skip reason. All history lookups are batched: one
//! store query per predicate per batch, never one per row.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use chrono::{DateTime, Duration, Utc};
use redress_store::{AttemptStore, BlacklistStore, DebtorStore, Store, StoreResult};
use redress_types::{
    BillingModel, DebtorProfile, Meta, SkipClassification, SkipReason, UploadId,
};
use std::collections::HashMap;
use tracing::debug;

/// One row as the dedup engine sees it (already normalized and hashed).
#[derive(Debug, Clone)]
pub struct DedupCandidate {
    pub iban_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
}

/// How many skipped-row samples are retained per upload for diagnostics.
pub const SKIP_SAMPLE_CAP: usize = 100;

/// Classifies batches of candidates against history.
pub struct DedupEngine<'a, S: Store + ?Sized> {
    store: &'a S,
    /// Days an in-flight attempt blocks re-import of the same IBAN.
    cooldown_days: i64,
}

impl<'a, S: Store + ?Sized> DedupEngine<'a, S> {
    pub fn new(store: &'a S, cooldown_days: i64) -> Self {
        Self {
            store,
            cooldown_days,
        }
    }

    /// Classify a batch. Returns `row index -> classification` for the
    /// rows that must be skipped; rows absent from the map pass.
    pub async fn classify_batch(
        &self,
        upload_id: UploadId,
        candidates: &[DedupCandidate],
        now: DateTime<Utc>,
    ) -> StoreResult<HashMap<usize, SkipClassification>> {
        if candidates.is_empty() {
            return Ok(HashMap::new());
        }

        let hashes: Vec<String> = {
            let mut seen = std::collections::HashSet::new();
            candidates
                .iter()
                .filter(|c| seen.insert(c.iban_hash.as_str()))
                .map(|c| c.iban_hash.clone())
                .collect()
        };
        let name_pairs: Vec<(String, String)> = candidates
            .iter()
            .map(|c| (fold(&c.first_name), fold(&c.last_name)))
            .collect();
        let emails: Vec<String> = candidates
            .iter()
            .filter_map(|c| c.email.as_deref().map(fold))
            .collect();

        // One query per predicate for the whole batch.
        let blacklisted = self.store.blacklisted_hashes(&hashes).await?;
        let chargebacked = self.store.chargebacked_hashes(&hashes).await?;
        let recovered = self.store.recovered_iban_hashes(&hashes, upload_id).await?;
        let since = now - Duration::days(self.cooldown_days);
        let in_flight = self.store.in_flight_by_hashes(&hashes, since).await?;
        let bad_names = self.store.blacklisted_names(&name_pairs).await?;
        let bad_emails = if emails.is_empty() {
            Default::default()
        } else {
            self.store.blacklisted_emails(&emails).await?
        };

        let mut out = HashMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            let hash = candidate.iban_hash.as_str();
            let classification = if blacklisted.contains(hash) {
                Some(SkipClassification::new(SkipReason::Blacklisted))
            } else if chargebacked.contains(hash) {
                Some(SkipClassification::new(SkipReason::Chargebacked))
            } else if recovered.contains(hash) {
                Some(SkipClassification::new(SkipReason::AlreadyRecovered))
            } else if let Some(attempt) = in_flight.get(hash) {
                let days_ago = (now - attempt.created_at).num_days();
                Some(SkipClassification::recently_attempted(
                    days_ago,
                    attempt.status,
                ))
            } else if bad_names.contains(&(fold(&candidate.first_name), fold(&candidate.last_name)))
            {
                Some(SkipClassification::new(SkipReason::BlacklistedName))
            } else if candidate
                .email
                .as_deref()
                .map(fold)
                .map(|e| bad_emails.contains(&e))
                .unwrap_or(false)
            {
                Some(SkipClassification::new(SkipReason::BlacklistedEmail))
            } else {
                None
            };
            if let Some(classification) = classification {
                out.insert(index, classification);
            }
        }
        debug!(
            upload_id,
            batch = candidates.len(),
            skipped = out.len(),
            "dedup batch classified"
        );
        Ok(out)
    }
}

/// Import-time IBAN-level exclusivity between billing models, applied on
/// top of the history rules.
pub fn exclusivity_skip(
    row_model: BillingModel,
    profile: Option<&DebtorProfile>,
) -> Option<SkipReason> {
    let profile = profile?;
    match (row_model.is_recurring(), profile.billing_model) {
        (true, BillingModel::Legacy) => Some(SkipReason::ExistingLegacyIban),
        (true, existing) if existing != row_model => Some(SkipReason::ModelConflict),
        (false, existing) if existing.is_recurring() => Some(SkipReason::ModelConflict),
        _ => None,
    }
}

fn fold(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Accumulates skip bookkeeping for one processing run: a per-reason
/// histogram plus at most [`SKIP_SAMPLE_CAP`] diagnostic samples.
#[derive(Default)]
pub struct SkipLedger {
    counts: HashMap<SkipReason, i64>,
    samples: Vec<Meta>,
}

impl SkipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, row_number: usize, classification: &SkipClassification) {
        *self.counts.entry(classification.reason).or_insert(0) += 1;
        if self.samples.len() < SKIP_SAMPLE_CAP {
            let mut sample = serde_json::json!({
                "row": row_number,
                "reason": classification.reason.as_str(),
                "permanent": classification.permanent,
            });
            if let Some(days) = classification.days_ago {
                sample["days_ago"] = days.into();
            }
            if let Some(status) = classification.last_status {
                sample["last_status"] = status.as_str().into();
            }
            self.samples.push(sample);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }

    pub fn counts(&self) -> Vec<(SkipReason, i64)> {
        let mut counts: Vec<(SkipReason, i64)> = self
            .counts
            .iter()
            .map(|(reason, n)| (*reason, *n))
            .collect();
        counts.sort_by_key(|(reason, _)| reason.as_str());
        counts
    }

    pub fn samples(&self) -> &[Meta] {
        &self.samples
    }
}
