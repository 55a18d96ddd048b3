use crate::kv::Kv;
use std::sync::Arc;
use std::time::Duration;

/// Cache-backed token bucket keyed per wall-clock second.
///
/// All workers sharing the same key prefix share the budget. When the
/// current second is exhausted the caller sleeps 100ms and re-checks,
/// which is the suspension point the concurrency model allows for rate
/// limiting.
#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn Kv>,
    key_prefix: String,
    per_sec: u32,
}

impl RateLimiter {
    /// Bucket keys live for 2 seconds; one in flight, one draining.
    const BUCKET_TTL: Duration = Duration::from_secs(2);
    const RETRY_SLEEP: Duration = Duration::from_millis(100);

    pub fn new(kv: Arc<dyn Kv>, key_prefix: impl Into<String>, per_sec: u32) -> Self {
        Self {
            kv,
            key_prefix: key_prefix.into(),
            per_sec: per_sec.max(1),
        }
    }

    /// Block until a token for the current second is granted.
    pub async fn acquire(&self) {
        loop {
            let second = chrono::Utc::now().timestamp();
            let key = format!("{}:{second}", self.key_prefix);
            let taken = self.kv.incr(&key, 1, Some(Self::BUCKET_TTL)).await;
            if taken <= i64::from(self.per_sec) {
                return;
            }
            tokio::time::sleep(Self::RETRY_SLEEP).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn grants_up_to_rate_within_a_second() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = RateLimiter::new(kv.clone(), "rl_test", 3);
        // Three tokens in the same second come back without sleeping.
        let started = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(90));
    }

    #[tokio::test]
    async fn budget_is_shared_through_the_kv() {
        let kv = Arc::new(MemoryKv::new());
        let a = RateLimiter::new(kv.clone(), "rl_shared", 10);
        let b = RateLimiter::new(kv.clone(), "rl_shared", 10);
        a.acquire().await;
        b.acquire().await;
        let second = chrono::Utc::now().timestamp();
        let used: i64 = kv
            .get(&format!("rl_shared:{second}"))
            .await
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        // Unless the second rolled over mid-test, both tokens landed in
        // the same bucket.
        assert!(used <= 2);
    }
}
