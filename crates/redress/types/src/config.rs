use crate::status::BillingModel;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Closed amount range for one billing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRange {
    pub min: Decimal,
    pub max: Decimal,
    /// Days between recurring attempts for this model.
    pub cycle_days: i64,
}

impl ModelRange {
    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min && amount <= self.max
    }
}

/// Billing model ranges and cycles.
///
/// The boundaries are deployment configuration, not code; the defaults
/// below are placeholders that real deployments override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub flywheel: ModelRange,
    pub recovery: ModelRange,
    /// Debtors per billing chunk job.
    pub chunk_size: usize,
    /// Gateway requests per second for billing chunks.
    pub rate_per_sec: u32,
    /// Consecutive failures before the billing circuit opens.
    pub circuit_threshold: u32,
    /// Seconds the billing circuit stays open.
    pub circuit_open_secs: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            flywheel: ModelRange {
                min: dec!(1.00),
                max: dec!(9.99),
                cycle_days: 90,
            },
            recovery: ModelRange {
                min: dec!(10.00),
                max: dec!(50.00),
                cycle_days: 30,
            },
            chunk_size: 50,
            rate_per_sec: 50,
            circuit_threshold: 10,
            circuit_open_secs: 300,
        }
    }
}

impl BillingConfig {
    /// Amount range for a model; legacy has none (bills the row amount).
    pub fn range(&self, model: BillingModel) -> Option<&ModelRange> {
        match model {
            BillingModel::Flywheel => Some(&self.flywheel),
            BillingModel::Recovery => Some(&self.recovery),
            BillingModel::Legacy => None,
        }
    }

    /// Cycle length for a model, if it is a recurring one.
    pub fn cycle_days(&self, model: BillingModel) -> Option<i64> {
        self.range(model).map(|r| r.cycle_days)
    }

    /// Resolve the billing model of one row from the upload-level model
    /// and the row amount: the upload's model wins if its range fits,
    /// then the other recurring model, then legacy.
    pub fn resolve_row_model(&self, upload_model: BillingModel, amount: Decimal) -> BillingModel {
        if upload_model == BillingModel::Legacy {
            return BillingModel::Legacy;
        }
        if let Some(range) = self.range(upload_model) {
            if range.contains(amount) {
                return upload_model;
            }
        }
        if let Some(other) = upload_model.counterpart() {
            if let Some(range) = self.range(other) {
                if range.contains(amount) {
                    return other;
                }
            }
        }
        BillingModel::Legacy
    }
}

/// Bank-account-verification (name match) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BavConfig {
    pub enabled: bool,
    /// Percentage of an upload's valid debtors to sample, 0-100.
    pub sampling_percentage: u8,
    /// Global BAV calls allowed per calendar day.
    pub daily_limit: u32,
    /// Hard cap on sampled debtors for uploads above 1000 rows.
    pub large_upload_cap: u32,
}

impl Default for BavConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_percentage: 10,
            daily_limit: 500,
            large_upload_cap: 100,
        }
    }
}

/// Chargeback handling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChargebackConfig {
    /// Gateway reason codes that auto-blacklist the IBAN.
    pub blacklist_codes: Vec<String>,
    /// Reason codes excluded from chargeback-rate statistics.
    pub excluded_cb_reason_codes: Vec<String>,
}

/// Reconciler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Only attempts older than this are polled.
    pub min_age_hours: i64,
    /// Give up after this many reconciliation calls per attempt.
    pub max_attempts: i32,
    pub chunk_size: usize,
    pub rate_per_sec: u32,
    pub circuit_threshold: u32,
    pub circuit_open_secs: u64,
    /// Seconds between scheduler sweeps in the service binary.
    pub sweep_interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            min_age_hours: 6,
            max_attempts: 10,
            chunk_size: 50,
            rate_per_sec: 20,
            circuit_threshold: 5,
            circuit_open_secs: 600,
            sweep_interval_secs: 900,
        }
    }
}

/// Upload ingestion settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Uploads with fewer rows than this are processed inline.
    pub inline_threshold: usize,
    /// Rows per dispatched chunk job.
    pub chunk_size: usize,
    /// Per-file size limit in bytes.
    pub max_file_bytes: u64,
    /// Days an in-flight attempt blocks re-import of the same IBAN.
    pub reattempt_cooldown_days: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 100,
            chunk_size: 500,
            max_file_bytes: 50 * 1024 * 1024,
            reattempt_cooldown_days: 30,
        }
    }
}

/// Worker-pool sizing per named queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default_workers: usize,
    pub high_workers: usize,
    pub vop_workers: usize,
    pub bav_workers: usize,
    pub billing_workers: usize,
    pub reconciliation_workers: usize,
    pub webhooks_workers: usize,
    pub exports_workers: usize,
    pub emp_refresh_workers: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_workers: 4,
            high_workers: 2,
            vop_workers: 4,
            bav_workers: 1,
            billing_workers: 4,
            reconciliation_workers: 2,
            webhooks_workers: 4,
            exports_workers: 1,
            emp_refresh_workers: 1,
        }
    }
}

/// Shared circuit defaults for collaborators without a dedicated section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Delay before a self-released job retries while a circuit is open.
    pub release_delay_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            release_delay_secs: 60,
        }
    }
}

/// Full typed configuration, layered from `Redress.toml` and the
/// `REDRESS_*` environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RedressConfig {
    pub billing: BillingConfig,
    pub bav: BavConfig,
    pub chargeback: ChargebackConfig,
    pub reconcile: ReconcileConfig,
    pub ingest: IngestConfig,
    pub queues: RateLimitConfig,
    pub circuit: CircuitConfig,
}

impl RedressConfig {
    /// Load from an optional TOML file plus `REDRESS_`-prefixed
    /// environment overrides (`REDRESS_BILLING__CHUNK_SIZE=25`).
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("REDRESS").separator("__"))
            .build()?;
        // An empty source set deserializes into the defaults.
        let mut cfg: RedressConfig = settings.try_deserialize()?;
        cfg.bav.sampling_percentage = cfg.bav.sampling_percentage.min(100);
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = RedressConfig::default();
        assert!(cfg.billing.flywheel.max < cfg.billing.recovery.min);
        assert!(cfg.billing.range(BillingModel::Legacy).is_none());
        assert_eq!(cfg.billing.cycle_days(BillingModel::Flywheel), Some(90));
        assert_eq!(cfg.billing.cycle_days(BillingModel::Recovery), Some(30));
        assert_eq!(cfg.ingest.inline_threshold, 100);
        assert_eq!(cfg.ingest.chunk_size, 500);
    }

    #[test]
    fn row_model_resolution_prefers_the_upload_model() {
        let cfg = BillingConfig::default();
        use BillingModel::*;
        assert_eq!(cfg.resolve_row_model(Legacy, dec!(7.00)), Legacy);
        assert_eq!(cfg.resolve_row_model(Flywheel, dec!(7.00)), Flywheel);
        // Out of flywheel range but inside recovery: falls across.
        assert_eq!(cfg.resolve_row_model(Flywheel, dec!(25.00)), Recovery);
        assert_eq!(cfg.resolve_row_model(Recovery, dec!(25.00)), Recovery);
        assert_eq!(cfg.resolve_row_model(Recovery, dec!(7.00)), Flywheel);
        // Outside both ranges: legacy.
        assert_eq!(cfg.resolve_row_model(Flywheel, dec!(500.00)), Legacy);
    }

    #[test]
    fn range_contains_is_inclusive() {
        let cfg = BillingConfig::default();
        assert!(cfg.flywheel.contains(dec!(1.00)));
        assert!(cfg.flywheel.contains(dec!(9.99)));
        assert!(!cfg.flywheel.contains(dec!(10.00)));
        assert!(cfg.recovery.contains(dec!(10.00)));
        assert!(cfg.recovery.contains(dec!(50.00)));
    }
}
