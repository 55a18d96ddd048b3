use crate::kv::Kv;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Cache-backed circuit breaker shared across workers.
///
/// The open state is a boolean key with a TTL; consecutive failures are a
/// counter that any worker may bump. Workers observing an open circuit
/// self-release back to the queue instead of hammering the collaborator.
#[derive(Clone)]
pub struct CircuitBreaker {
    kv: Arc<dyn Kv>,
    /// Key holding the open bit, e.g. `reconciliation_circuit_open`.
    open_key: String,
    threshold: u32,
    open_ttl: Duration,
}

impl CircuitBreaker {
    /// Failure streaks reset on their own if no failure arrives for this
    /// long.
    const FAILURE_WINDOW: Duration = Duration::from_secs(600);

    pub fn new(
        kv: Arc<dyn Kv>,
        open_key: impl Into<String>,
        threshold: u32,
        open_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            open_key: open_key.into(),
            threshold: threshold.max(1),
            open_ttl,
        }
    }

    fn failures_key(&self) -> String {
        format!("{}_failures", self.open_key)
    }

    pub async fn is_open(&self) -> bool {
        self.kv.get(&self.open_key).await.is_some()
    }

    /// Record one failure; opens the circuit when the consecutive streak
    /// reaches the threshold. Returns whether the circuit is now open.
    pub async fn record_failure(&self) -> bool {
        let streak = self
            .kv
            .incr(&self.failures_key(), 1, Some(Self::FAILURE_WINDOW))
            .await;
        if streak >= i64::from(self.threshold) {
            self.trip("consecutive failure threshold reached").await;
            return true;
        }
        false
    }

    /// A success resets the streak.
    pub async fn record_success(&self) {
        self.kv.delete(&self.failures_key()).await;
    }

    /// Force the circuit open for the configured TTL.
    pub async fn trip(&self, reason: &str) {
        warn!(key = %self.open_key, reason, "circuit opened");
        self.kv.set(&self.open_key, "1", Some(self.open_ttl)).await;
        self.kv.delete(&self.failures_key()).await;
    }
}
