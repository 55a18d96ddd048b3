use crate::kv::Kv;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Job-progress records under well-known keys (`bav_progress_{upload}`,
/// `emp_refresh_{job}`, `clean_users_export:{job}`).
#[derive(Clone)]
pub struct ProgressTracker {
    kv: Arc<dyn Kv>,
}

impl ProgressTracker {
    /// Progress entries outlive the job by a couple of hours for the
    /// operator UI, then evaporate.
    const TTL: Duration = Duration::from_secs(2 * 60 * 60);

    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    pub async fn write(&self, key: &str, progress: &Value) {
        self.kv.set(key, &progress.to_string(), Some(Self::TTL)).await;
    }

    pub async fn read(&self, key: &str) -> Option<Value> {
        let raw = self.kv.get(key).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn clear(&self, key: &str) {
        self.kv.delete(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;

    #[tokio::test]
    async fn progress_round_trips() {
        let tracker = ProgressTracker::new(Arc::new(MemoryKv::new()));
        tracker
            .write("emp_refresh_42", &json!({"page": 3, "pages": 9}))
            .await;
        let read = tracker.read("emp_refresh_42").await.unwrap();
        assert_eq!(read["page"], 3);
        tracker.clear("emp_refresh_42").await;
        assert!(tracker.read("emp_refresh_42").await.is_none());
    }
}
